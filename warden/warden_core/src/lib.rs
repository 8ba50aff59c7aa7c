//! # Warden Core
//!
//! `warden_core` provides the shared building blocks for the warden
//! privilege-separation broker: typed identifiers, the error taxonomy,
//! the zone capability model, and the wire protocol spoken across the
//! privilege boundary.
//!
//! ## Security model
//!
//! The broker's entire contract with low-privilege callers is expressed
//! in this crate:
//!
//! 1. **Closed capability surface**: a zone is reachable only through its
//!    immutable [`zone::ZoneDescriptor`], a declared operation set plus a
//!    factory. Membership is checked by table lookup, never by what the
//!    implementation object happens to expose.
//!
//! 2. **One instance per session**: every activation constructs a fresh
//!    zone instance, so no state leaks between unrelated callers.
//!
//! 3. **Closed error surface**: everything a caller can observe on
//!    failure is one of the [`wire::ErrorCode`] variants; internal error
//!    detail never crosses the boundary raw.
//!
//! ## Crate structure
//!
//! - **error**: subsystem error enums and the root `Error`
//! - **id**: strongly-typed identifiers (sessions, connections)
//! - **zone**: the `Zone` trait, names, descriptors, cancellation
//! - **wire**: frame codec and request/reply envelopes

pub mod error;
pub mod id;
pub mod wire;
pub mod zone;

// Re-export key types for convenience
pub use error::{DispatchError, Error, ProtocolError, RegistryError, Result};
pub use id::{ConnectionId, SessionId};
pub use zone::{
    CancelFlag, InvokeContext, OperationName, Zone, ZoneDescriptor, ZoneFactory, ZoneListing,
    ZoneName, ZoneVisibility,
};
