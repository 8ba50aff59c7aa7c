//! # Warden Zones
//!
//! The zone registry and the built-in zone catalogue of the warden
//! broker. A zone is the unit of capability a caller can be granted:
//! a named, versioned, immutable set of elevated operations behind a
//! factory. This crate owns the table those zones live in and ships the
//! zones every broker installation carries.
//!
//! The registry is populated once at startup and then frozen: there is
//! deliberately no way to add a zone while the broker is serving, so the
//! reachable surface is fixed before the first caller connects.

pub mod diagnostics;
pub mod features;
pub mod registry;

pub use registry::ZoneRegistry;

use warden_core::error::Result;

/// Build a registry holding the built-in zone catalogue.
///
/// The registry is returned unfrozen so a host can add
/// installation-specific zones before sealing it.
pub fn builtin_registry() -> Result<ZoneRegistry> {
    let registry = ZoneRegistry::new();
    registry.register(diagnostics::descriptor())?;
    registry.register(features::descriptor())?;
    Ok(registry)
}
