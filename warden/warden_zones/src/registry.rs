//! Zone Registry
//!
//! Process-wide table mapping zone names to their descriptors. The table
//! is populated once during broker startup and then frozen; after the
//! freeze no registration path exists, so the activation surface a client
//! can probe is fixed before the first connection is accepted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use warden_core::error::RegistryError;
use warden_core::zone::{ZoneDescriptor, ZoneListing, ZoneName, ZoneVisibility};

/// The zone registry: name -> immutable descriptor.
#[derive(Default)]
pub struct ZoneRegistry {
    /// Map of zone names to descriptors
    zones: DashMap<ZoneName, Arc<ZoneDescriptor>>,

    /// Set once startup registration is complete; never cleared
    frozen: AtomicBool,
}

impl ZoneRegistry {
    /// Create a new, empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a zone descriptor.
    ///
    /// Fails with `DuplicateZone` if the name is taken and with `Frozen`
    /// once [`freeze`](Self::freeze) has been called. Registration errors
    /// are fatal to broker startup.
    pub fn register(&self, descriptor: ZoneDescriptor) -> Result<(), RegistryError> {
        if self.frozen.load(Ordering::SeqCst) {
            return Err(RegistryError::Frozen);
        }

        let name = descriptor.name().clone();
        match self.zones.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(RegistryError::DuplicateZone(name))
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Arc::new(descriptor));
                info!("Registered zone: {}", name);
                Ok(())
            }
        }
    }

    /// Seal the registry. Idempotent; registration is permanently
    /// disabled afterwards.
    pub fn freeze(&self) {
        if !self.frozen.swap(true, Ordering::SeqCst) {
            info!("Zone registry frozen with {} zones", self.zones.len());
        }
    }

    /// Whether the registry has been sealed.
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    /// Look up a descriptor by name.
    pub fn lookup(&self, name: &ZoneName) -> Option<Arc<ZoneDescriptor>> {
        self.zones.get(name).map(|entry| entry.value().clone())
    }

    /// Enumerate published zones, sorted by name.
    ///
    /// Internal zones never appear here regardless of how the caller
    /// obtained their names.
    pub fn published(&self) -> Vec<ZoneListing> {
        let mut listings: Vec<ZoneListing> = self
            .zones
            .iter()
            .filter(|entry| entry.value().visibility() == ZoneVisibility::Published)
            .map(|entry| entry.value().listing())
            .collect();
        listings.sort_by(|a, b| a.name.cmp(&b.name));
        listings
    }

    /// Number of registered zones (published and internal).
    pub fn len(&self) -> usize {
        self.zones.len()
    }

    /// Whether the registry holds no zones.
    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }
}
