//! Wire protocol for the boundary transport.
//!
//! Frames are a 4-byte little-endian length prefix followed by a JSON
//! body. The announced length is checked against a configured limit
//! before any allocation; truncated or oversized frames are rejected with
//! a `ProtocolError` rather than parsed best-effort.
//!
//! The envelopes form a closed request/reply vocabulary. Every request
//! produces exactly one reply on the same connection, in request order.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{DispatchError, ProtocolError};
use crate::id::SessionId;
use crate::zone::{OperationName, ZoneListing, ZoneName};

/// Protocol version spoken by this build.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default cap on a single frame body.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Read one length-prefixed frame.
///
/// Returns `Ok(None)` on a clean close (EOF before any byte of a new
/// frame); a close in the middle of a frame is `ProtocolError::Truncated`.
pub async fn read_frame<R>(reader: &mut R, max_bytes: usize) -> Result<Option<Vec<u8>>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    let mut filled = 0;

    while filled < len_bytes.len() {
        let n = reader.read(&mut len_bytes[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(ProtocolError::Truncated);
        }
        filled += n;
    }

    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > max_bytes {
        return Err(ProtocolError::FrameTooLarge {
            got: len,
            max: max_bytes,
        });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ProtocolError::Truncated
        } else {
            ProtocolError::Io(e)
        }
    })?;

    Ok(Some(body))
}

/// Write one length-prefixed frame and flush.
pub async fn write_frame<W>(writer: &mut W, body: &[u8], max_bytes: usize) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    if body.len() > max_bytes {
        return Err(ProtocolError::FrameTooLarge {
            got: body.len(),
            max: max_bytes,
        });
    }

    let len = body.len() as u32;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;

    Ok(())
}

/// Requests a caller may send across the boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    /// Version negotiation; must be the first frame on a connection.
    Hello {
        /// Protocol version the caller speaks
        version: u32,
    },

    /// Enumerate published zones.
    ListZones,

    /// Activate a zone, yielding a fresh session.
    Activate {
        /// Stable zone name
        zone: ZoneName,
    },

    /// Invoke one declared operation within a session.
    Invoke {
        /// Session handle from a prior activation
        session: SessionId,

        /// Declared operation name
        operation: OperationName,

        /// Operation input payload
        input: Value,
    },

    /// End a session and drop its zone instance.
    Release {
        /// Session handle to release
        session: SessionId,
    },
}

/// Replies the broker sends back. Exactly one per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerReply {
    /// Successful version negotiation.
    Hello {
        /// Protocol version the broker speaks
        version: u32,

        /// Broker identification string
        server: String,
    },

    /// Published zone catalogue.
    Zones {
        /// One entry per published zone
        zones: Vec<ZoneListing>,
    },

    /// A zone was activated into a fresh session.
    Activated {
        /// Opaque session handle for subsequent invokes
        session: SessionId,

        /// Echo of the activated zone name
        zone: ZoneName,

        /// Zone contract version
        version: u32,

        /// Declared operation set
        operations: Vec<OperationName>,
    },

    /// An operation completed successfully.
    Completed {
        /// Operation output payload
        output: Value,
    },

    /// A session was released.
    Released,

    /// The request failed; `code` is the closed error surface.
    Failed {
        /// Error kind
        code: ErrorCode,

        /// Human-readable diagnostic
        message: String,
    },
}

/// Closed enumeration of caller-visible error kinds.
///
/// This is the entire error surface of the boundary: internal errors are
/// always mapped onto one of these before leaving the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Zone does not exist or is not activatable by this caller
    UnknownZone,

    /// Zone construction failed, or activation was refused during drain
    ActivationFailed,

    /// Session handle does not reference a live session
    InvalidSession,

    /// Operation not in the zone's declared set
    UnsupportedOperation,

    /// Input payload did not match the operation's schema
    MalformedInput,

    /// The elevated action itself failed
    OperationFailed,

    /// Framing, envelope, or handshake violation
    ProtocolError,
}

impl ErrorCode {
    /// The wire spelling of this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownZone => "unknown_zone",
            Self::ActivationFailed => "activation_failed",
            Self::InvalidSession => "invalid_session",
            Self::UnsupportedOperation => "unsupported_operation",
            Self::MalformedInput => "malformed_input",
            Self::OperationFailed => "operation_failed",
            Self::ProtocolError => "protocol_error",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<&DispatchError> for ErrorCode {
    fn from(err: &DispatchError) -> Self {
        match err {
            DispatchError::UnknownZone => Self::UnknownZone,
            DispatchError::ActivationFailed(_) => Self::ActivationFailed,
            DispatchError::InvalidSession(_) => Self::InvalidSession,
            DispatchError::UnsupportedOperation(_) => Self::UnsupportedOperation,
            DispatchError::MalformedInput(_) => Self::MalformedInput,
            DispatchError::OperationFailed { .. } => Self::OperationFailed,
        }
    }
}

impl ServerReply {
    /// Build the `Failed` reply for a dispatch error.
    pub fn failed(err: &DispatchError) -> Self {
        Self::Failed {
            code: ErrorCode::from(err),
            message: err.to_string(),
        }
    }

    /// Build the `Failed` reply for a protocol violation.
    pub fn protocol_failure(err: &ProtocolError) -> Self {
        Self::Failed {
            code: ErrorCode::ProtocolError,
            message: err.to_string(),
        }
    }
}

/// Serialize a request for framing.
pub fn encode_request(request: &ClientRequest) -> Result<Vec<u8>, ProtocolError> {
    serde_json::to_vec(request).map_err(|e| ProtocolError::InvalidMessage(e.to_string()))
}

/// Deserialize a framed request body.
pub fn decode_request(body: &[u8]) -> Result<ClientRequest, ProtocolError> {
    serde_json::from_slice(body).map_err(|e| ProtocolError::InvalidMessage(e.to_string()))
}

/// Serialize a reply for framing.
pub fn encode_reply(reply: &ServerReply) -> Result<Vec<u8>, ProtocolError> {
    serde_json::to_vec(reply).map_err(|e| ProtocolError::InvalidMessage(e.to_string()))
}

/// Deserialize a framed reply body.
pub fn decode_reply(body: &[u8]) -> Result<ServerReply, ProtocolError> {
    serde_json::from_slice(body).map_err(|e| ProtocolError::InvalidMessage(e.to_string()))
}
