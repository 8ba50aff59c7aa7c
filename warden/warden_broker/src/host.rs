//! Elevated Server Host
//!
//! The process-level container for the broker: seals the zone registry,
//! binds the boundary transport, runs one task per authenticated
//! connection, and tears everything down through a two-phase drain.
//!
//! State machine: `Stopped -> Starting -> Listening -> Draining ->
//! Stopped`, published through a watch channel. The registry is frozen in
//! `Starting`, before the listener exists, so no registration path is
//! reachable once connections are possible.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use warden_core::error::ProtocolError;
use warden_core::wire::{ClientRequest, ServerReply, PROTOCOL_VERSION};
use warden_zones::ZoneRegistry;

use crate::config::BrokerConfig;
use crate::dispatch::ActivationDispatcher;
use crate::transport::{BrokerListener, InboundConnection};

/// Seconds a connection gets to complete the Hello handshake.
const HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Cap on requests a caller may pipeline behind an in-flight operation.
const REQUEST_BACKLOG: usize = 32;

/// Errors that can occur in host lifecycle operations
#[derive(Debug, Error)]
pub enum HostError {
    #[error("Host is already started")]
    AlreadyStarted,
}

/// Lifecycle state of the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    /// Not running
    Stopped,

    /// Registry being populated and sealed, socket being bound
    Starting,

    /// Accepting connections
    Listening,

    /// No new sessions; existing sessions finishing
    Draining,
}

/// The elevated server host.
pub struct BrokerHost {
    config: BrokerConfig,
    dispatcher: Arc<ActivationDispatcher>,
    state_tx: watch::Sender<HostState>,
    shutdown_tx: broadcast::Sender<()>,
    serve_task: Option<JoinHandle<()>>,
}

impl BrokerHost {
    /// Create a host over a populated (not yet frozen) registry.
    pub fn new(config: BrokerConfig, registry: ZoneRegistry) -> Self {
        let (state_tx, _) = watch::channel(HostState::Stopped);
        let (shutdown_tx, _) = broadcast::channel(4);

        Self {
            config,
            dispatcher: Arc::new(ActivationDispatcher::new(Arc::new(registry))),
            state_tx,
            shutdown_tx,
            serve_task: None,
        }
    }

    /// The host's dispatcher.
    pub fn dispatcher(&self) -> Arc<ActivationDispatcher> {
        self.dispatcher.clone()
    }

    /// Observe host state transitions.
    pub fn state(&self) -> watch::Receiver<HostState> {
        self.state_tx.subscribe()
    }

    /// The host configuration.
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Seal the registry, bind the socket, and start serving.
    pub async fn start(&mut self) -> Result<()> {
        if self.serve_task.is_some() {
            return Err(HostError::AlreadyStarted.into());
        }

        info!("Starting broker host");
        self.state_tx.send_replace(HostState::Starting);

        // The attack surface is fixed here, before the first connection
        // can possibly arrive.
        self.dispatcher.registry().freeze();
        self.dispatcher.open_activations();

        let listener =
            BrokerListener::bind(&self.config).context("Failed to bind broker socket")?;

        self.state_tx.send_replace(HostState::Listening);
        self.serve_task = Some(tokio::spawn(serve(
            listener,
            self.dispatcher.clone(),
            self.shutdown_tx.clone(),
        )));

        info!(
            "Broker host listening on {}",
            self.config.socket_path.display()
        );

        Ok(())
    }

    /// Drain and stop the host.
    ///
    /// Phase A signals every connection to stop and trips session
    /// cancellation flags; phase B waits up to the drain timeout for
    /// connection tasks to finish and then forcibly terminates the rest.
    pub async fn shutdown(&mut self) -> Result<()> {
        let Some(serve_task) = self.serve_task.take() else {
            return Ok(());
        };

        info!("Draining broker host");
        self.state_tx.send_replace(HostState::Draining);

        // Phase A: no new sessions, cancel in-flight work cooperatively
        self.dispatcher.close_activations();
        self.dispatcher.cancel_all().await;
        let _ = self.shutdown_tx.send(());

        // Phase B: bounded wait, then force
        let drain = Duration::from_secs(self.config.drain_timeout_secs);
        let abort = serve_task.abort_handle();
        match timeout(drain, serve_task).await {
            Ok(Ok(())) => {}
            Ok(Err(join_err)) if join_err.is_cancelled() => {}
            Ok(Err(join_err)) => {
                return Err(anyhow::anyhow!("serve loop failed: {join_err}"));
            }
            Err(_) => {
                warn!(
                    "Drain timeout after {}s; terminating remaining connections",
                    self.config.drain_timeout_secs
                );
                abort.abort();
            }
        }

        let leftover = self.dispatcher.clear_sessions().await;
        if leftover > 0 {
            warn!("{} sessions were forcibly terminated", leftover);
        }

        // The listener's Drop removes the socket file; this is a backstop
        // for the forced path.
        let _ = std::fs::remove_file(&self.config.socket_path);

        self.state_tx.send_replace(HostState::Stopped);
        info!("Broker host stopped");

        Ok(())
    }
}

fn server_identity() -> String {
    format!("warden/{}", env!("CARGO_PKG_VERSION"))
}

/// Accept loop: one task per authenticated connection.
async fn serve(
    listener: BrokerListener,
    dispatcher: Arc<ActivationDispatcher>,
    shutdown_tx: broadcast::Sender<()>,
) {
    let mut shutdown_rx = shutdown_tx.subscribe();
    let mut connections: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(Some(inbound)) => {
                    connections.spawn(handle_connection(
                        inbound,
                        dispatcher.clone(),
                        shutdown_tx.subscribe(),
                    ));
                }
                Ok(None) => {}
                Err(e) => warn!("Accept failed: {e}"),
            },
            _ = shutdown_rx.recv() => break,
        }

        // Reap finished connection tasks as we go
        while connections.try_join_next().is_some() {}
    }

    // Draining: close the listener, let existing connections run out.
    // Their own shutdown receivers make that prompt; the host's drain
    // timeout is the backstop.
    drop(listener);
    while let Some(result) = connections.join_next().await {
        if let Err(join_err) = result {
            if join_err.is_panic() {
                error!("Connection task panicked: {join_err}");
            }
        }
    }

    debug!("Serve loop drained");
}

/// One authenticated connection: handshake, then request/reply lockstep
/// with disconnect observation while an operation is in flight.
async fn handle_connection(
    inbound: InboundConnection,
    dispatcher: Arc<ActivationDispatcher>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let InboundConnection {
        id,
        caller,
        channel,
        permit: _permit,
    } = inbound;
    let (mut requests, mut replies) = channel.split();

    // Handshake: the first frame must be a supported Hello.
    match timeout(
        Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
        requests.next(),
    )
    .await
    {
        Err(_) => {
            debug!(%caller, "handshake timeout");
            return;
        }
        Ok(Ok(Some(ClientRequest::Hello { version }))) if version == PROTOCOL_VERSION => {
            let reply = ServerReply::Hello {
                version: PROTOCOL_VERSION,
                server: server_identity(),
            };
            if replies.send(&reply).await.is_err() {
                return;
            }
        }
        Ok(Ok(Some(ClientRequest::Hello { version }))) => {
            let err = ProtocolError::UnsupportedVersion(version);
            let _ = replies.send(&ServerReply::protocol_failure(&err)).await;
            return;
        }
        Ok(Ok(Some(_))) => {
            let err =
                ProtocolError::UnexpectedMessage("expected hello before any request".to_string());
            let _ = replies.send(&ServerReply::protocol_failure(&err)).await;
            return;
        }
        Ok(Ok(None)) => return,
        Ok(Err(e)) => {
            let _ = replies.send(&ServerReply::protocol_failure(&e)).await;
            return;
        }
    }

    info!(%caller, connection = %id, "caller connected");

    // Pump requests through a channel so a disconnect is observable even
    // while an operation is in flight.
    let (tx, mut rx) = mpsc::channel::<Result<ClientRequest, ProtocolError>>(REQUEST_BACKLOG);
    let reader = tokio::spawn(async move {
        loop {
            match requests.next().await {
                Ok(Some(request)) => {
                    if tx.send(Ok(request)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    break;
                }
            }
        }
    });

    let mut backlog: VecDeque<ClientRequest> = VecDeque::new();

    'serve: loop {
        let request = if let Some(request) = backlog.pop_front() {
            request
        } else {
            tokio::select! {
                received = rx.recv() => match received {
                    Some(Ok(request)) => request,
                    Some(Err(e)) => {
                        let _ = replies.send(&ServerReply::protocol_failure(&e)).await;
                        break 'serve;
                    }
                    None => break 'serve,
                },
                _ = shutdown_rx.recv() => break 'serve,
            }
        };

        let reply = match request {
            ClientRequest::Hello { .. } => {
                let err = ProtocolError::UnexpectedMessage(
                    "hello is only valid once per connection".to_string(),
                );
                let _ = replies.send(&ServerReply::protocol_failure(&err)).await;
                break 'serve;
            }
            ClientRequest::ListZones => ServerReply::Zones {
                zones: dispatcher.registry().published(),
            },
            ClientRequest::Activate { zone } => {
                match dispatcher.activate(&zone, caller, id).await {
                    Ok(ticket) => ServerReply::Activated {
                        session: ticket.session,
                        zone: ticket.zone,
                        version: ticket.version,
                        operations: ticket.operations,
                    },
                    Err(e) => ServerReply::failed(&e),
                }
            }
            ClientRequest::Release { session } => match dispatcher.release(session, id).await {
                Ok(()) => ServerReply::Released,
                Err(e) => ServerReply::failed(&e),
            },
            ClientRequest::Invoke {
                session,
                operation,
                input,
            } => {
                let invoke = dispatcher.invoke(session, id, operation, input);
                tokio::pin!(invoke);

                // Keep reading while the operation runs: a disconnect must
                // tear the session down promptly, and the result of an
                // abandoned call is simply discarded.
                let outcome = loop {
                    tokio::select! {
                        result = &mut invoke => break Some(result),
                        received = rx.recv() => match received {
                            Some(Ok(request)) => {
                                if backlog.len() >= REQUEST_BACKLOG {
                                    warn!(connection = %id, "request backlog exceeded mid-call");
                                    break None;
                                }
                                backlog.push_back(request);
                            }
                            Some(Err(_)) | None => break None,
                        },
                    }
                };

                match outcome {
                    Some(Ok(output)) => ServerReply::Completed { output },
                    Some(Err(e)) => ServerReply::failed(&e),
                    None => break 'serve,
                }
            }
        };

        if replies.send(&reply).await.is_err() {
            break 'serve;
        }
    }

    reader.abort();
    let sessions = dispatcher.teardown_connection(id).await;
    debug!(connection = %id, sessions, "connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::net::UnixStream;
    use warden_core::wire::{
        decode_reply, encode_request, read_frame, write_frame, DEFAULT_MAX_FRAME_BYTES, ErrorCode,
    };

    async fn roundtrip(stream: &mut UnixStream, request: &ClientRequest) -> ServerReply {
        let body = encode_request(request).unwrap();
        write_frame(stream, &body, DEFAULT_MAX_FRAME_BYTES).await.unwrap();
        let reply = read_frame(stream, DEFAULT_MAX_FRAME_BYTES)
            .await
            .unwrap()
            .expect("connection closed unexpectedly");
        decode_reply(&reply).unwrap()
    }

    fn test_host(dir: &TempDir) -> BrokerHost {
        let config = BrokerConfig {
            socket_path: dir.path().join("broker.sock"),
            drain_timeout_secs: 2,
            ..BrokerConfig::default()
        };
        BrokerHost::new(config, warden_zones::builtin_registry().unwrap())
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let dir = TempDir::new().unwrap();
        let mut host = test_host(&dir);
        let state = host.state();

        assert_eq!(*state.borrow(), HostState::Stopped);

        host.start().await.unwrap();
        assert_eq!(*state.borrow(), HostState::Listening);
        assert!(host.dispatcher().registry().is_frozen());

        host.shutdown().await.unwrap();
        assert_eq!(*state.borrow(), HostState::Stopped);
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let dir = TempDir::new().unwrap();
        let mut host = test_host(&dir);
        host.start().await.unwrap();

        let err = host.start().await.unwrap_err();
        assert!(err.to_string().contains("already started"));

        host.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_hello_handshake() {
        let dir = TempDir::new().unwrap();
        let mut host = test_host(&dir);
        host.start().await.unwrap();

        let mut stream = UnixStream::connect(&host.config().socket_path).await.unwrap();
        let reply = roundtrip(
            &mut stream,
            &ClientRequest::Hello {
                version: PROTOCOL_VERSION,
            },
        )
        .await;
        assert!(matches!(reply, ServerReply::Hello { version, .. } if version == PROTOCOL_VERSION));

        host.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_request_before_hello_is_protocol_error() {
        let dir = TempDir::new().unwrap();
        let mut host = test_host(&dir);
        host.start().await.unwrap();

        let mut stream = UnixStream::connect(&host.config().socket_path).await.unwrap();
        let reply = roundtrip(&mut stream, &ClientRequest::ListZones).await;
        assert!(
            matches!(reply, ServerReply::Failed { code, .. } if code == ErrorCode::ProtocolError)
        );

        // And the connection is closed afterwards.
        let next = read_frame(&mut stream, DEFAULT_MAX_FRAME_BYTES).await.unwrap();
        assert!(next.is_none());

        host.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unsupported_version_rejected() {
        let dir = TempDir::new().unwrap();
        let mut host = test_host(&dir);
        host.start().await.unwrap();

        let mut stream = UnixStream::connect(&host.config().socket_path).await.unwrap();
        let reply = roundtrip(&mut stream, &ClientRequest::Hello { version: 999 }).await;
        assert!(
            matches!(reply, ServerReply::Failed { code, .. } if code == ErrorCode::ProtocolError)
        );

        host.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_removes_socket() {
        let dir = TempDir::new().unwrap();
        let mut host = test_host(&dir);
        host.start().await.unwrap();
        let path = host.config().socket_path.clone();
        assert!(path.exists());

        host.shutdown().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_shutdown_without_start_is_noop() {
        let dir = TempDir::new().unwrap();
        let mut host = test_host(&dir);
        host.shutdown().await.unwrap();
    }
}
