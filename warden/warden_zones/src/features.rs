//! Platform features zone
//!
//! Enabling or disabling optional platform features (virtualization,
//! container support, sandboxing) is a classic elevated operation: the
//! catalogue is world-readable but flipping a feature requires
//! administrator rights. This zone publishes the catalogue and a
//! `set_feature` operation over it.
//!
//! Feature state lives on the zone instance. Because every activation
//! constructs a fresh instance, one session's pending changes are never
//! observable through another session, which also makes this zone the
//! reference test subject for session isolation.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use warden_core::zone::{
    InvokeContext, OperationName, Zone, ZoneDescriptor, ZoneError, ZoneName, ZoneResult,
    ZoneVisibility,
};

/// Stable activation name of the platform features zone.
pub const ZONE_NAME: &str = "warden.platform_features";

/// Contract version.
pub const ZONE_VERSION: u32 = 1;

const OP_LIST_FEATURES: &str = "list_features";
const OP_SET_FEATURE: &str = "set_feature";

/// The fixed feature catalogue: (name, description).
///
/// Names are stable identifiers; the catalogue itself never changes at
/// runtime, only the enabled flags do.
const CATALOGUE: &[(&str, &str)] = &[
    ("containers", "Operating system container support"),
    ("guarded_host", "Host guardian attestation services"),
    ("hypervisor", "Hardware virtualization stack"),
    ("hypervisor_platform", "Third-party virtualization API surface"),
    ("linux_subsystem", "Linux compatibility subsystem"),
    ("sandbox", "Disposable sandboxed desktop environment"),
    ("virtual_machine_platform", "Minimal platform for hosted VMs"),
];

/// One catalogue entry with its current state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureState {
    /// Stable feature identifier
    pub name: String,

    /// Human-readable description
    pub description: String,

    /// Whether the feature is currently enabled
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
struct SetFeatureInput {
    name: String,
    enabled: bool,
}

/// Zone instance holding per-session feature state.
pub struct PlatformFeaturesZone {
    features: Mutex<BTreeMap<String, bool>>,
}

impl PlatformFeaturesZone {
    fn new() -> Self {
        Self {
            features: Mutex::new(
                CATALOGUE
                    .iter()
                    .map(|(name, _)| (name.to_string(), false))
                    .collect(),
            ),
        }
    }

    fn list(&self) -> Vec<FeatureState> {
        let features = self.features.lock();
        CATALOGUE
            .iter()
            .map(|(name, description)| FeatureState {
                name: name.to_string(),
                description: description.to_string(),
                enabled: features.get(*name).copied().unwrap_or(false),
            })
            .collect()
    }

    fn set(&self, input: SetFeatureInput) -> ZoneResult {
        let mut features = self.features.lock();
        match features.get_mut(&input.name) {
            Some(enabled) => {
                *enabled = input.enabled;
                info!(feature = %input.name, enabled = input.enabled, "feature state changed");
                Ok(json!(FeatureState {
                    name: input.name.clone(),
                    description: description_of(&input.name),
                    enabled: input.enabled,
                }))
            }
            None => Err(ZoneError::failed(
                "unknown_feature",
                format!("no such feature: {}", input.name),
            )),
        }
    }
}

fn description_of(name: &str) -> String {
    CATALOGUE
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, d)| d.to_string())
        .unwrap_or_default()
}

#[async_trait]
impl Zone for PlatformFeaturesZone {
    async fn invoke(&self, operation: &OperationName, input: Value, ctx: &InvokeContext) -> ZoneResult {
        debug!(session = %ctx.session(), %operation, "platform features invoke");

        match operation.as_str() {
            OP_LIST_FEATURES => Ok(json!({ "features": self.list() })),
            OP_SET_FEATURE => {
                let input: SetFeatureInput = serde_json::from_value(input)?;
                self.set(input)
            }
            other => Err(ZoneError::failed(
                "unhandled_operation",
                format!("platform features zone has no body for {other}"),
            )),
        }
    }
}

/// Descriptor for registration at broker startup.
pub fn descriptor() -> ZoneDescriptor {
    ZoneDescriptor::new(
        ZoneName::from_str(ZONE_NAME).expect("platform features zone name is valid"),
        ZONE_VERSION,
        ZoneVisibility::Published,
        [
            OperationName::from_str(OP_LIST_FEATURES).expect("operation name is valid"),
            OperationName::from_str(OP_SET_FEATURE).expect("operation name is valid"),
        ],
        Arc::new(|| Ok(Arc::new(PlatformFeaturesZone::new()) as Arc<dyn Zone>)),
    )
}
