//! Boundary transport
//!
//! Unix-domain-socket listener for the privilege boundary. The socket
//! lives in a 0700 directory and carries 0600 permissions, set after
//! binding; stale socket files are removed before bind. Every accepted
//! connection is authenticated through `SO_PEERCRED` before a single
//! protocol byte is processed: the peer uid must be the broker's own uid
//! or one of the configured allowed uids, otherwise the connection is
//! dropped without a reply.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use nix::unistd::Uid;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use warden_core::error::ProtocolError;
use warden_core::id::ConnectionId;
use warden_core::wire::{
    decode_request, encode_reply, read_frame, write_frame, ClientRequest, ServerReply,
};

use crate::config::BrokerConfig;
use crate::session::CallerIdentity;

/// Directory permissions (owner only).
const DIRECTORY_MODE: u32 = 0o700;

/// Socket permissions (owner read/write only).
const SOCKET_MODE: u32 = 0o600;

/// One authenticated inbound connection, ready for the handshake.
pub struct InboundConnection {
    /// Server-side identifier tying sessions to this connection
    pub id: ConnectionId,

    /// Peer identity from `SO_PEERCRED`
    pub caller: CallerIdentity,

    /// The framed channel itself
    pub channel: Connection,

    /// Held for the connection's lifetime to bound concurrency
    pub permit: OwnedSemaphorePermit,
}

/// A framed duplex channel over one Unix stream.
pub struct Connection {
    stream: UnixStream,
    max_frame_bytes: usize,
}

impl Connection {
    /// Wrap a connected stream.
    pub fn new(stream: UnixStream, max_frame_bytes: usize) -> Self {
        Self {
            stream,
            max_frame_bytes,
        }
    }

    /// Split into independently owned read and write halves so a reader
    /// task can watch for disconnect while a reply is pending.
    pub fn split(self) -> (RequestStream, ReplySink) {
        let (reader, writer) = self.stream.into_split();
        (
            RequestStream {
                reader,
                max_frame_bytes: self.max_frame_bytes,
            },
            ReplySink {
                writer,
                max_frame_bytes: self.max_frame_bytes,
            },
        )
    }
}

/// Reading side: framed, decoded client requests.
pub struct RequestStream {
    reader: OwnedReadHalf,
    max_frame_bytes: usize,
}

impl RequestStream {
    /// Read the next request. `Ok(None)` is a clean disconnect.
    pub async fn next(&mut self) -> Result<Option<ClientRequest>, ProtocolError> {
        match read_frame(&mut self.reader, self.max_frame_bytes).await? {
            Some(body) => Ok(Some(decode_request(&body)?)),
            None => Ok(None),
        }
    }
}

/// Writing side: framed, encoded server replies.
pub struct ReplySink {
    writer: OwnedWriteHalf,
    max_frame_bytes: usize,
}

impl ReplySink {
    /// Write one reply frame and flush.
    pub async fn send(&mut self, reply: &ServerReply) -> Result<(), ProtocolError> {
        let body = encode_reply(reply)?;
        write_frame(&mut self.writer, &body, self.max_frame_bytes).await
    }
}

/// The broker's listening socket plus its admission checks.
pub struct BrokerListener {
    listener: UnixListener,
    socket_path: PathBuf,
    limiter: Arc<Semaphore>,
    own_uid: u32,
    allowed_uids: Vec<u32>,
    max_frame_bytes: usize,
}

impl BrokerListener {
    /// Bind the broker socket described by the configuration.
    pub fn bind(config: &BrokerConfig) -> Result<Self> {
        let socket_path = config.socket_path.clone();

        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)
                .context(format!("Failed to create socket directory {:?}", parent))?;
            let mut perms = std::fs::metadata(parent)?.permissions();
            perms.set_mode(DIRECTORY_MODE);
            std::fs::set_permissions(parent, perms)
                .context("Failed to restrict socket directory permissions")?;
        }

        // Remove a stale socket from a previous run
        if socket_path.exists() {
            std::fs::remove_file(&socket_path).context("Failed to remove existing socket")?;
        }

        let listener = UnixListener::bind(&socket_path).context("Failed to bind Unix socket")?;

        // Permissions are set after binding so there is no window where a
        // wider mode is observable
        let mut perms = std::fs::metadata(&socket_path)?.permissions();
        perms.set_mode(SOCKET_MODE);
        std::fs::set_permissions(&socket_path, perms)
            .context("Failed to restrict socket permissions")?;

        info!("Broker listening on {}", socket_path.display());

        Ok(Self {
            listener,
            socket_path,
            limiter: Arc::new(Semaphore::new(config.max_connections)),
            own_uid: Uid::effective().as_raw(),
            allowed_uids: config.allowed_uids.clone(),
            max_frame_bytes: config.max_frame_bytes,
        })
    }

    /// The path the listener is bound to.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept and authenticate one connection.
    ///
    /// Returns `Ok(None)` when a connection was refused (over the
    /// concurrency limit or unauthenticated); the caller just keeps
    /// accepting.
    pub async fn accept(&self) -> Result<Option<InboundConnection>> {
        let (stream, _addr) = self
            .listener
            .accept()
            .await
            .context("Failed to accept connection")?;

        let permit = match self.limiter.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!("Connection refused: connection limit reached");
                return Ok(None);
            }
        };

        let creds = stream
            .peer_cred()
            .context("Failed to read peer credentials")?;
        let caller = CallerIdentity {
            uid: creds.uid(),
            gid: creds.gid(),
            pid: creds.pid(),
        };

        if !self.is_authorized(caller.uid) {
            warn!(%caller, "Connection refused: peer uid not authorized");
            return Ok(None);
        }

        debug!(%caller, "connection authenticated");

        Ok(Some(InboundConnection {
            id: ConnectionId::new(),
            caller,
            channel: Connection::new(stream, self.max_frame_bytes),
            permit,
        }))
    }

    fn is_authorized(&self, uid: u32) -> bool {
        uid == self.own_uid || self.allowed_uids.contains(&uid)
    }
}

impl Drop for BrokerListener {
    fn drop(&mut self) {
        // Best effort cleanup
        let _ = std::fs::remove_file(&self.socket_path);
    }
}
