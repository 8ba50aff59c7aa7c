//! Activation Dispatcher
//!
//! Receives activation requests from the boundary, consults the zone
//! registry, constructs zone instances, and owns the session table. All
//! per-call failures are converted into `DispatchError` values here; no
//! fault from a zone body ever propagates past this module.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use warden_core::error::DispatchError;
use warden_core::id::{ConnectionId, SessionId};
use warden_core::zone::{OperationName, ZoneError, ZoneName, ZoneVisibility};
use warden_zones::ZoneRegistry;

use crate::session::{CallerIdentity, Session};

/// What a successful activation hands back for the `Activated` reply.
#[derive(Debug, Clone)]
pub struct ActivationTicket {
    /// Fresh session handle
    pub session: SessionId,

    /// Echo of the activated zone name
    pub zone: ZoneName,

    /// Zone contract version
    pub version: u32,

    /// Declared operation set
    pub operations: Vec<OperationName>,
}

#[derive(Default)]
struct SessionTable {
    by_id: HashMap<SessionId, Arc<Session>>,
    by_connection: HashMap<ConnectionId, HashSet<SessionId>>,
}

/// The activation dispatcher: registry lookups, session lifecycle, and
/// operation invocation.
pub struct ActivationDispatcher {
    /// Frozen zone table; lookups are lock-free reads
    registry: Arc<ZoneRegistry>,

    /// Live sessions. The lock guards only table mutation; it is never
    /// held across an operation body.
    sessions: RwLock<SessionTable>,

    /// Cleared when the host starts draining; no new sessions afterwards
    accepting: AtomicBool,
}

impl ActivationDispatcher {
    /// Create a dispatcher over the given registry.
    pub fn new(registry: Arc<ZoneRegistry>) -> Self {
        Self {
            registry,
            sessions: RwLock::new(SessionTable::default()),
            accepting: AtomicBool::new(true),
        }
    }

    /// The zone registry backing this dispatcher.
    pub fn registry(&self) -> &ZoneRegistry {
        &self.registry
    }

    /// Stop accepting activations. Called when the host enters Draining;
    /// existing sessions are unaffected.
    pub fn close_activations(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    /// Resume accepting activations. Called when a stopped host starts
    /// listening again.
    pub fn open_activations(&self) {
        self.accepting.store(true, Ordering::SeqCst);
    }

    /// Activate a zone for the given caller, yielding a fresh session.
    ///
    /// Unregistered names and internal zones produce the same
    /// `UnknownZone` error so the registry contents cannot be probed.
    pub async fn activate(
        &self,
        zone: &ZoneName,
        caller: CallerIdentity,
        connection: ConnectionId,
    ) -> Result<ActivationTicket, DispatchError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(DispatchError::ActivationFailed(
                "broker is draining".to_string(),
            ));
        }

        let descriptor = self
            .registry
            .lookup(zone)
            .filter(|d| d.visibility() == ZoneVisibility::Published)
            .ok_or(DispatchError::UnknownZone)?;

        let instance = descriptor.construct().map_err(|e| {
            warn!(%zone, error = %e, "zone construction failed");
            DispatchError::ActivationFailed(e.to_string())
        })?;

        let session = Arc::new(Session::new(descriptor.clone(), instance, caller, connection));
        let ticket = ActivationTicket {
            session: session.id(),
            zone: zone.clone(),
            version: descriptor.version(),
            operations: descriptor.operations().iter().cloned().collect(),
        };

        let mut table = self.sessions.write().await;
        table.by_id.insert(session.id(), session.clone());
        table
            .by_connection
            .entry(connection)
            .or_default()
            .insert(session.id());
        drop(table);

        info!(session = %ticket.session, %zone, %caller, "zone activated");

        Ok(ticket)
    }

    /// Invoke one operation within a session.
    ///
    /// Validation order: live session, declared operation, input shape,
    /// body execution. Each failure mode is distinct, and a panicking
    /// body is contained here rather than crossing the boundary.
    pub async fn invoke(
        &self,
        session_id: SessionId,
        connection: ConnectionId,
        operation: OperationName,
        input: Value,
    ) -> Result<Value, DispatchError> {
        let session = {
            let table = self.sessions.read().await;
            table
                .by_id
                .get(&session_id)
                .cloned()
                .ok_or(DispatchError::InvalidSession(session_id))?
        };

        // A session handle presented over a connection that does not own
        // it is treated exactly like a dead handle.
        if session.connection() != connection {
            return Err(DispatchError::InvalidSession(session_id));
        }

        if !session.descriptor().declares(&operation) {
            return Err(DispatchError::UnsupportedOperation(operation));
        }

        debug!(session = %session_id, %operation, "invoking operation");

        let zone = session.zone();
        let ctx = session.invoke_context();
        let op = operation.clone();
        let body = tokio::spawn(async move { zone.invoke(&op, input, &ctx).await });

        match body.await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(ZoneError::MalformedInput(detail))) => {
                Err(DispatchError::MalformedInput(detail))
            }
            Ok(Err(ZoneError::Failed { code, message })) => {
                Err(DispatchError::OperationFailed { code, message })
            }
            Err(join_err) if join_err.is_panic() => {
                warn!(session = %session_id, %operation, "operation body panicked");
                Err(DispatchError::OperationFailed {
                    code: "panic".to_string(),
                    message: "operation body panicked".to_string(),
                })
            }
            Err(_) => Err(DispatchError::OperationFailed {
                code: "aborted".to_string(),
                message: "operation was aborted".to_string(),
            }),
        }
    }

    /// Explicitly end a session, dropping its zone instance.
    pub async fn release(
        &self,
        session_id: SessionId,
        connection: ConnectionId,
    ) -> Result<(), DispatchError> {
        let mut table = self.sessions.write().await;

        let owned = table
            .by_id
            .get(&session_id)
            .map(|s| s.connection() == connection)
            .unwrap_or(false);
        if !owned {
            return Err(DispatchError::InvalidSession(session_id));
        }

        if let Some(session) = table.by_id.remove(&session_id) {
            session.cancel();
            if let Some(set) = table.by_connection.get_mut(&connection) {
                set.remove(&session_id);
            }
            info!(session = %session_id, zone = %session.zone_name(), "session released");
        }

        Ok(())
    }

    /// Tear down every session owned by a connection, tripping their
    /// cancellation flags. Returns the number of sessions removed.
    pub async fn teardown_connection(&self, connection: ConnectionId) -> usize {
        let mut table = self.sessions.write().await;

        let ids = table.by_connection.remove(&connection).unwrap_or_default();
        let mut removed = 0;
        for id in ids {
            if let Some(session) = table.by_id.remove(&id) {
                session.cancel();
                removed += 1;
            }
        }
        drop(table);

        if removed > 0 {
            info!(%connection, sessions = removed, "connection sessions torn down");
        }

        removed
    }

    /// Trip the cancellation flag of every live session (drain).
    pub async fn cancel_all(&self) {
        let table = self.sessions.read().await;
        for session in table.by_id.values() {
            session.cancel();
        }
    }

    /// Cancel and drop every session. Final step of a forced shutdown,
    /// after the owning connections have been terminated.
    pub async fn clear_sessions(&self) -> usize {
        let mut table = self.sessions.write().await;
        let removed = table.by_id.len();
        for session in table.by_id.values() {
            session.cancel();
        }
        table.by_id.clear();
        table.by_connection.clear();
        removed
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.by_id.len()
    }

    /// Look up a live session by id.
    pub async fn session(&self, session_id: SessionId) -> Option<Arc<Session>> {
        self.sessions.read().await.by_id.get(&session_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::str::FromStr;
    use warden_core::error::Error;
    use warden_core::zone::{
        InvokeContext, Zone, ZoneDescriptor, ZoneResult,
    };

    /// Zone that implements one operation beyond its declared set, to
    /// prove the whitelist check consults the descriptor and not the
    /// implementation.
    struct TrickZone;

    #[async_trait]
    impl Zone for TrickZone {
        async fn invoke(
            &self,
            operation: &OperationName,
            _input: Value,
            _ctx: &InvokeContext,
        ) -> ZoneResult {
            match operation.as_str() {
                "ping" => Ok(json!("pong")),
                // Implemented but never declared; must be unreachable.
                "undeclared_backdoor" => Ok(json!("you should never see this")),
                _ => panic!("unexpected operation"),
            }
        }
    }

    struct PanickyZone;

    #[async_trait]
    impl Zone for PanickyZone {
        async fn invoke(
            &self,
            _operation: &OperationName,
            _input: Value,
            _ctx: &InvokeContext,
        ) -> ZoneResult {
            panic!("zone body exploded");
        }
    }

    fn caller() -> CallerIdentity {
        CallerIdentity {
            uid: 1000,
            gid: 1000,
            pid: Some(1),
        }
    }

    fn test_registry() -> Arc<ZoneRegistry> {
        let registry = warden_zones::builtin_registry().unwrap();

        registry
            .register(ZoneDescriptor::new(
                ZoneName::parse("test.trick").unwrap(),
                1,
                ZoneVisibility::Published,
                [OperationName::parse("ping").unwrap()],
                Arc::new(|| Ok(Arc::new(TrickZone) as Arc<dyn Zone>)),
            ))
            .unwrap();

        registry
            .register(ZoneDescriptor::new(
                ZoneName::parse("test.panicky").unwrap(),
                1,
                ZoneVisibility::Published,
                [OperationName::parse("boom").unwrap()],
                Arc::new(|| Ok(Arc::new(PanickyZone) as Arc<dyn Zone>)),
            ))
            .unwrap();

        registry
            .register(ZoneDescriptor::new(
                ZoneName::parse("test.hidden").unwrap(),
                1,
                ZoneVisibility::Internal,
                [OperationName::parse("noop").unwrap()],
                Arc::new(|| Ok(Arc::new(TrickZone) as Arc<dyn Zone>)),
            ))
            .unwrap();

        registry
            .register(ZoneDescriptor::new(
                ZoneName::parse("test.unbuildable").unwrap(),
                1,
                ZoneVisibility::Published,
                [OperationName::parse("noop").unwrap()],
                Arc::new(|| Err(Error::Runtime("dependency unavailable".to_string()))),
            ))
            .unwrap();

        registry.freeze();
        Arc::new(registry)
    }

    fn dispatcher() -> ActivationDispatcher {
        ActivationDispatcher::new(test_registry())
    }

    #[tokio::test]
    async fn test_activate_unknown_and_internal_are_indistinguishable() {
        let dispatcher = dispatcher();
        let conn = ConnectionId::new();

        let missing = dispatcher
            .activate(&ZoneName::parse("test.missing").unwrap(), caller(), conn)
            .await
            .unwrap_err();
        let hidden = dispatcher
            .activate(&ZoneName::parse("test.hidden").unwrap(), caller(), conn)
            .await
            .unwrap_err();

        assert!(matches!(missing, DispatchError::UnknownZone));
        assert!(matches!(hidden, DispatchError::UnknownZone));
        assert_eq!(missing.to_string(), hidden.to_string());
    }

    #[tokio::test]
    async fn test_activation_yields_fresh_sessions() {
        let dispatcher = dispatcher();
        let zone = ZoneName::from_str(warden_zones::features::ZONE_NAME).unwrap();
        let conn = ConnectionId::new();

        let a = dispatcher.activate(&zone, caller(), conn).await.unwrap();
        let b = dispatcher.activate(&zone, caller(), conn).await.unwrap();
        assert_ne!(a.session, b.session);
        assert_eq!(dispatcher.session_count().await, 2);

        // Mutating one session's zone instance is invisible to the other.
        let set = OperationName::parse("set_feature").unwrap();
        let list = OperationName::parse("list_features").unwrap();
        dispatcher
            .invoke(
                a.session,
                conn,
                set,
                json!({"name": "containers", "enabled": true}),
            )
            .await
            .unwrap();

        let other_view = dispatcher
            .invoke(b.session, conn, list, Value::Null)
            .await
            .unwrap();
        let features = other_view["features"].as_array().unwrap();
        let containers = features
            .iter()
            .find(|f| f["name"] == json!("containers"))
            .unwrap();
        assert_eq!(containers["enabled"], json!(false));
    }

    #[tokio::test]
    async fn test_failed_construction_is_activation_failed() {
        let dispatcher = dispatcher();
        let err = dispatcher
            .activate(
                &ZoneName::parse("test.unbuildable").unwrap(),
                caller(),
                ConnectionId::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::ActivationFailed(_)));
        assert_eq!(dispatcher.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_undeclared_operation_is_unreachable() {
        let dispatcher = dispatcher();
        let conn = ConnectionId::new();
        let ticket = dispatcher
            .activate(&ZoneName::parse("test.trick").unwrap(), caller(), conn)
            .await
            .unwrap();

        // The declared operation works.
        let out = dispatcher
            .invoke(
                ticket.session,
                conn,
                OperationName::parse("ping").unwrap(),
                Value::Null,
            )
            .await
            .unwrap();
        assert_eq!(out, json!("pong"));

        // The implemented-but-undeclared one does not.
        let err = dispatcher
            .invoke(
                ticket.session,
                conn,
                OperationName::parse("undeclared_backdoor").unwrap(),
                Value::Null,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::UnsupportedOperation(_)));
    }

    #[tokio::test]
    async fn test_invoke_on_dead_session_is_invalid() {
        let dispatcher = dispatcher();
        let conn = ConnectionId::new();

        let err = dispatcher
            .invoke(
                SessionId::new(),
                conn,
                OperationName::parse("ping").unwrap(),
                Value::Null,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidSession(_)));
    }

    #[tokio::test]
    async fn test_session_is_bound_to_its_connection() {
        let dispatcher = dispatcher();
        let owner = ConnectionId::new();
        let stranger = ConnectionId::new();

        let ticket = dispatcher
            .activate(&ZoneName::parse("test.trick").unwrap(), caller(), owner)
            .await
            .unwrap();

        let err = dispatcher
            .invoke(
                ticket.session,
                stranger,
                OperationName::parse("ping").unwrap(),
                Value::Null,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidSession(_)));

        let err = dispatcher.release(ticket.session, stranger).await.unwrap_err();
        assert!(matches!(err, DispatchError::InvalidSession(_)));
    }

    #[tokio::test]
    async fn test_malformed_input_is_distinct_failure() {
        let dispatcher = dispatcher();
        let conn = ConnectionId::new();
        let zone = ZoneName::from_str(warden_zones::features::ZONE_NAME).unwrap();
        let ticket = dispatcher.activate(&zone, caller(), conn).await.unwrap();

        let err = dispatcher
            .invoke(
                ticket.session,
                conn,
                OperationName::parse("set_feature").unwrap(),
                json!("not an object"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::MalformedInput(_)));
    }

    #[tokio::test]
    async fn test_panicking_body_is_contained() {
        let dispatcher = dispatcher();
        let conn = ConnectionId::new();
        let ticket = dispatcher
            .activate(&ZoneName::parse("test.panicky").unwrap(), caller(), conn)
            .await
            .unwrap();

        let err = dispatcher
            .invoke(
                ticket.session,
                conn,
                OperationName::parse("boom").unwrap(),
                Value::Null,
            )
            .await
            .unwrap_err();
        assert!(
            matches!(err, DispatchError::OperationFailed { ref code, .. } if code == "panic")
        );

        // The session and the dispatcher survive the panic.
        let out = dispatcher
            .activate(&ZoneName::parse("test.trick").unwrap(), caller(), conn)
            .await;
        assert!(out.is_ok());
    }

    #[tokio::test]
    async fn test_release_then_invoke_is_invalid() {
        let dispatcher = dispatcher();
        let conn = ConnectionId::new();
        let ticket = dispatcher
            .activate(&ZoneName::parse("test.trick").unwrap(), caller(), conn)
            .await
            .unwrap();

        dispatcher.release(ticket.session, conn).await.unwrap();
        assert_eq!(dispatcher.session_count().await, 0);

        let err = dispatcher
            .invoke(
                ticket.session,
                conn,
                OperationName::parse("ping").unwrap(),
                Value::Null,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidSession(_)));
    }

    #[tokio::test]
    async fn test_teardown_connection_cancels_sessions() {
        let dispatcher = dispatcher();
        let conn = ConnectionId::new();
        let other_conn = ConnectionId::new();
        let zone = ZoneName::parse("test.trick").unwrap();

        let doomed = dispatcher.activate(&zone, caller(), conn).await.unwrap();
        let doomed_session = dispatcher.session(doomed.session).await.unwrap();
        let survivor = dispatcher.activate(&zone, caller(), other_conn).await.unwrap();

        let removed = dispatcher.teardown_connection(conn).await;
        assert_eq!(removed, 1);
        assert!(doomed_session.is_cancelled());
        assert_eq!(dispatcher.session_count().await, 1);
        assert!(dispatcher.session(survivor.session).await.is_some());
    }

    #[tokio::test]
    async fn test_no_activation_while_draining() {
        let dispatcher = dispatcher();
        dispatcher.close_activations();

        let err = dispatcher
            .activate(
                &ZoneName::parse("test.trick").unwrap(),
                caller(),
                ConnectionId::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::ActivationFailed(_)));
    }
}
