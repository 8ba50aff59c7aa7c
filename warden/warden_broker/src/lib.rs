//! Warden Broker - Elevated server host for the warden system
//!
//! This crate provides the elevated side of the privilege boundary:
//! the activation dispatcher and session table, the Unix-socket boundary
//! transport with peer-credential authentication, the host state machine
//! with two-phase drain, and broker configuration.
//!
//! The flow through the crate mirrors the flow through the system:
//! a caller connects ([`transport`]), is authenticated, activates a zone
//! ([`dispatch`]) which constructs a fresh instance into a [`session`],
//! and invokes declared operations until release, disconnect, or host
//! shutdown ([`host`]).

pub mod config;
pub mod dispatch;
pub mod host;
pub mod session;
pub mod transport;

pub use config::BrokerConfig;
pub use dispatch::ActivationDispatcher;
pub use host::{BrokerHost, HostState};
pub use session::{CallerIdentity, Session};
