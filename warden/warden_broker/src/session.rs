//! Session model
//!
//! A session ties one authenticated caller connection to one freshly
//! constructed zone instance. The caller's identity is captured once, at
//! connection time, from socket peer credentials; it is never re-derived
//! per call. A zone instance is owned by exactly one session and dropped
//! with it.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use warden_core::id::{ConnectionId, SessionId};
use warden_core::zone::{CancelFlag, InvokeContext, Zone, ZoneDescriptor, ZoneName};

/// Identity of the caller, established at connection time from
/// `SO_PEERCRED` and trusted for the connection's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallerIdentity {
    /// Effective uid of the peer process
    pub uid: u32,

    /// Effective gid of the peer process
    pub gid: u32,

    /// Peer process id, when the platform reports one
    pub pid: Option<i32>,
}

impl fmt::Display for CallerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pid {
            Some(pid) => write!(f, "uid={} gid={} pid={}", self.uid, self.gid, pid),
            None => write!(f, "uid={} gid={}", self.uid, self.gid),
        }
    }
}

/// One live activation: caller, zone instance, and cancellation state.
pub struct Session {
    /// Opaque handle returned to the caller
    id: SessionId,

    /// The activated zone's stable name
    zone_name: ZoneName,

    /// Descriptor the activation was made against; the operation
    /// whitelist check always consults this, never the instance
    descriptor: Arc<ZoneDescriptor>,

    /// The zone instance exclusively owned by this session
    zone: Arc<dyn Zone>,

    /// Who activated the zone
    caller: CallerIdentity,

    /// Connection that owns this session; requests arriving for this
    /// session over any other connection are rejected
    connection: ConnectionId,

    /// Cooperative cancellation signal for in-flight operations
    cancel: CancelFlag,

    /// When the session was created
    created_at: DateTime<Utc>,
}

impl Session {
    /// Create a session around a freshly constructed zone instance.
    pub fn new(
        descriptor: Arc<ZoneDescriptor>,
        zone: Arc<dyn Zone>,
        caller: CallerIdentity,
        connection: ConnectionId,
    ) -> Self {
        Self {
            id: SessionId::new(),
            zone_name: descriptor.name().clone(),
            descriptor,
            zone,
            caller,
            connection,
            cancel: CancelFlag::new(),
            created_at: Utc::now(),
        }
    }

    /// The caller-visible session handle.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The activated zone's name.
    pub fn zone_name(&self) -> &ZoneName {
        &self.zone_name
    }

    /// The descriptor this session was activated against.
    pub fn descriptor(&self) -> &ZoneDescriptor {
        &self.descriptor
    }

    /// The zone instance owned by this session.
    pub fn zone(&self) -> Arc<dyn Zone> {
        self.zone.clone()
    }

    /// The caller identity captured at connection time.
    pub fn caller(&self) -> CallerIdentity {
        self.caller
    }

    /// The connection that owns this session.
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// When the session was created.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Request cooperative cancellation of in-flight operations.
    pub fn cancel(&self) {
        self.cancel.trip();
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_tripped()
    }

    /// Build the invocation context handed to the zone for one call.
    pub fn invoke_context(&self) -> InvokeContext {
        InvokeContext::new(self.id, self.cancel.clone())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("zone", &self.zone_name)
            .field("caller", &self.caller)
            .field("connection", &self.connection)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}
