//! Diagnostics zone
//!
//! The smallest useful zone: operations that prove the elevated path is
//! alive without touching any privileged state. `elevation_probe` returns
//! a fixed marker value so a caller (or a test) can verify the full
//! activate/invoke/marshal round trip end to end.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use warden_core::zone::{
    InvokeContext, OperationName, Zone, ZoneDescriptor, ZoneError, ZoneName, ZoneResult,
    ZoneVisibility,
};

/// Stable activation name of the diagnostics zone.
pub const ZONE_NAME: &str = "warden.diagnostics";

/// Contract version.
pub const ZONE_VERSION: u32 = 1;

/// Marker value returned by `elevation_probe`.
pub const PROBE_VALUE: u32 = 123;

const OP_ELEVATION_PROBE: &str = "elevation_probe";
const OP_BROKER_PID: &str = "broker_pid";

/// Zone instance. Stateless; a fresh one is still constructed per
/// activation like every other zone.
pub struct DiagnosticsZone;

#[async_trait]
impl Zone for DiagnosticsZone {
    async fn invoke(&self, operation: &OperationName, input: Value, ctx: &InvokeContext) -> ZoneResult {
        debug!(session = %ctx.session(), %operation, "diagnostics invoke");

        match operation.as_str() {
            OP_ELEVATION_PROBE => {
                expect_no_input(&input)?;
                Ok(json!(PROBE_VALUE))
            }
            OP_BROKER_PID => {
                expect_no_input(&input)?;
                Ok(json!(std::process::id()))
            }
            other => Err(ZoneError::failed(
                "unhandled_operation",
                format!("diagnostics zone has no body for {other}"),
            )),
        }
    }
}

fn expect_no_input(input: &Value) -> Result<(), ZoneError> {
    if input.is_null() {
        Ok(())
    } else {
        Err(ZoneError::MalformedInput(
            "operation takes no input".to_string(),
        ))
    }
}

/// Descriptor for registration at broker startup.
pub fn descriptor() -> ZoneDescriptor {
    ZoneDescriptor::new(
        ZoneName::from_str(ZONE_NAME).expect("diagnostics zone name is valid"),
        ZONE_VERSION,
        ZoneVisibility::Published,
        [
            OperationName::from_str(OP_ELEVATION_PROBE).expect("operation name is valid"),
            OperationName::from_str(OP_BROKER_PID).expect("operation name is valid"),
        ],
        Arc::new(|| Ok(Arc::new(DiagnosticsZone) as Arc<dyn Zone>)),
    )
}
