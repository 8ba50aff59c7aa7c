//! Broker client
//!
//! The low-privilege side of the boundary: connects to the broker socket,
//! performs the Hello handshake, and speaks the framed request/reply
//! protocol. Failure replies surface as errors carrying the broker's
//! closed error code plus its diagnostic.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tokio::net::UnixStream;
use tracing::debug;

use warden_core::id::SessionId;
use warden_core::wire::{
    decode_reply, encode_request, read_frame, write_frame, ClientRequest, ServerReply,
    DEFAULT_MAX_FRAME_BYTES, PROTOCOL_VERSION,
};
use warden_core::zone::{OperationName, ZoneListing, ZoneName};

/// A connected, handshaken broker client.
pub struct BrokerClient {
    stream: UnixStream,
    max_frame_bytes: usize,
}

impl BrokerClient {
    /// Connect to the broker socket and negotiate the protocol version.
    pub async fn connect(socket_path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket_path)
            .await
            .context(format!("Failed to connect to broker at {:?}", socket_path))?;

        let mut client = Self {
            stream,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        };

        match client
            .request(&ClientRequest::Hello {
                version: PROTOCOL_VERSION,
            })
            .await?
        {
            ServerReply::Hello { version, server } => {
                debug!(%server, version, "connected to broker");
                Ok(client)
            }
            ServerReply::Failed { code, message } => bail!("broker refused handshake: {code}: {message}"),
            other => bail!("unexpected reply to hello: {other:?}"),
        }
    }

    async fn request(&mut self, request: &ClientRequest) -> Result<ServerReply> {
        let body = encode_request(request)?;
        write_frame(&mut self.stream, &body, self.max_frame_bytes).await?;

        let reply = read_frame(&mut self.stream, self.max_frame_bytes)
            .await?
            .context("broker closed the connection")?;
        Ok(decode_reply(&reply)?)
    }

    /// Enumerate published zones.
    pub async fn zones(&mut self) -> Result<Vec<ZoneListing>> {
        match self.request(&ClientRequest::ListZones).await? {
            ServerReply::Zones { zones } => Ok(zones),
            ServerReply::Failed { code, message } => bail!("{code}: {message}"),
            other => bail!("unexpected reply to list_zones: {other:?}"),
        }
    }

    /// Activate a zone, yielding a fresh session handle.
    pub async fn activate(&mut self, zone: &ZoneName) -> Result<SessionId> {
        match self
            .request(&ClientRequest::Activate { zone: zone.clone() })
            .await?
        {
            ServerReply::Activated { session, .. } => Ok(session),
            ServerReply::Failed { code, message } => bail!("{code}: {message}"),
            other => bail!("unexpected reply to activate: {other:?}"),
        }
    }

    /// Invoke one operation within a session.
    pub async fn invoke(
        &mut self,
        session: SessionId,
        operation: &OperationName,
        input: Value,
    ) -> Result<Value> {
        match self
            .request(&ClientRequest::Invoke {
                session,
                operation: operation.clone(),
                input,
            })
            .await?
        {
            ServerReply::Completed { output } => Ok(output),
            ServerReply::Failed { code, message } => bail!("{code}: {message}"),
            other => bail!("unexpected reply to invoke: {other:?}"),
        }
    }

    /// End a session.
    pub async fn release(&mut self, session: SessionId) -> Result<()> {
        match self.request(&ClientRequest::Release { session }).await? {
            ServerReply::Released => Ok(()),
            ServerReply::Failed { code, message } => bail!("{code}: {message}"),
            other => bail!("unexpected reply to release: {other:?}"),
        }
    }
}
