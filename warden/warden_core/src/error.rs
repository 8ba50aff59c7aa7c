//! Error types for the warden broker.
//!
//! The errors are organized by subsystem: registration-time errors
//! (`RegistryError`) are fatal to broker startup, per-call dispatch errors
//! (`DispatchError`) are always recovered and returned to the caller as a
//! value, and framing/envelope errors (`ProtocolError`) terminate the
//! offending connection but never the broker.
//!
//! The root `Error` type can wrap any of the subsystem errors, allowing
//! uniform handling at the top level.

use crate::id::SessionId;
use crate::zone::{OperationName, ZoneName};
use thiserror::Error;

/// Root error type for the warden broker.
#[derive(Debug, Error)]
pub enum Error {
    /// Zone registration errors (fatal to startup)
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Per-call activation and invocation errors
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Wire framing and envelope errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// General runtime errors
    #[error("Runtime error: {0}")]
    Runtime(String),
}

/// Errors raised while populating the zone registry.
///
/// All of these abort broker startup: a misconfigured zone table must
/// never go live.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A zone with the same name is already registered
    #[error("Zone already registered: {0}")]
    DuplicateZone(ZoneName),

    /// No zone with the given name is registered
    #[error("Zone not registered: {0}")]
    NotFound(ZoneName),

    /// The registry has been frozen and no longer accepts registrations
    #[error("Registry is frozen; registration is closed")]
    Frozen,

    /// The zone name does not satisfy the naming rules
    #[error("Invalid zone name: {0}")]
    InvalidName(String),

    /// The operation name does not satisfy the naming rules
    #[error("Invalid operation name: {0}")]
    InvalidOperation(String),
}

/// Per-call errors surfaced to the caller as a reply value.
///
/// This is a closed set; every variant maps onto exactly one wire
/// `ErrorCode`. None of these ever propagate as a fault that terminates a
/// session or the broker.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The requested zone is not activatable by this caller.
    ///
    /// Deliberately carries no detail: callers cannot distinguish a name
    /// that does not exist from one that is not published to them.
    #[error("Unknown zone")]
    UnknownZone,

    /// The zone factory failed to construct an instance
    #[error("Zone activation failed: {0}")]
    ActivationFailed(String),

    /// The session handle does not reference a live session
    #[error("Invalid session: {0}")]
    InvalidSession(SessionId),

    /// The operation is not in the zone's declared operation set
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(OperationName),

    /// The input payload did not deserialize to the operation's shape
    #[error("Malformed operation input: {0}")]
    MalformedInput(String),

    /// The operation body executed and reported a failure
    #[error("Operation failed ({code}): {message}")]
    OperationFailed {
        /// Short machine-readable failure code chosen by the zone
        code: String,

        /// Human-readable diagnostic
        message: String,
    },
}

/// Errors in the boundary transport: framing, envelopes, handshake.
///
/// Malformed or truncated frames are rejected with these rather than
/// parsed best-effort.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A frame announced a length above the configured limit
    #[error("Frame of {got} bytes exceeds the {max} byte limit")]
    FrameTooLarge {
        /// Announced frame length
        got: usize,

        /// Configured maximum
        max: usize,
    },

    /// The connection closed in the middle of a frame
    #[error("Connection closed before a complete frame was read")]
    Truncated,

    /// The frame body is not a valid message envelope
    #[error("Frame is not a valid message: {0}")]
    InvalidMessage(String),

    /// A well-formed message arrived at the wrong point in the exchange
    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    /// The peer requested a protocol version this build does not speak
    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u32),

    /// The peer was rejected by connection-level authentication
    #[error("Connection not authenticated")]
    Unauthenticated,

    /// Underlying transport I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type used throughout the warden broker.
pub type Result<T> = std::result::Result<T, Error>;
