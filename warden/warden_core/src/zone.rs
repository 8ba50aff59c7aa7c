//! Zone model: names, descriptors, and the capability trait.
//!
//! A zone is a named, versioned bundle of elevated operations. What a
//! caller may invoke is decided by the zone's *descriptor*, an immutable
//! record of the declared operation set plus a factory, never by what the
//! underlying object happens to implement. Capability membership is a
//! table lookup, not a virtual-dispatch check, so an instance method that
//! is not in the descriptor is unreachable from the boundary.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, RegistryError};
use crate::id::SessionId;

/// Stable, opaque token naming a zone, e.g. `warden.diagnostics`.
///
/// Names are lower-case dot-separated segments and are never reused for a
/// semantically different zone once published; callers may pin to a name
/// across broker versions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ZoneName(String);

impl ZoneName {
    /// Parse and validate a zone name.
    pub fn parse(name: &str) -> Result<Self, RegistryError> {
        let valid = !name.is_empty()
            && name.split('.').all(|segment| {
                !segment.is_empty()
                    && segment
                        .chars()
                        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
            });

        if valid {
            Ok(Self(name.to_string()))
        } else {
            Err(RegistryError::InvalidName(name.to_string()))
        }
    }

    /// The name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ZoneName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ZoneName {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Token naming one operation within a zone, e.g. `elevation_probe`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationName(String);

impl OperationName {
    /// Parse and validate an operation name (snake_case token).
    pub fn parse(name: &str) -> Result<Self, RegistryError> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

        if valid {
            Ok(Self(name.to_string()))
        } else {
            Err(RegistryError::InvalidOperation(name.to_string()))
        }
    }

    /// The name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OperationName {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Whether a zone is activatable from the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneVisibility {
    /// Published: listed in enumeration and activatable by callers.
    Published,

    /// Internal: invisible to enumeration and refused activation from the
    /// boundary with the same reply as an unregistered name.
    Internal,
}

/// Cooperative cancellation flag shared between a session and its
/// in-flight operations.
///
/// Tripped on caller disconnect, explicit release, or broker drain. An
/// operation past its point of no return may ignore it; the result is
/// discarded on the dispatch side.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Create a new, untripped flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the flag. Idempotent.
    pub fn trip(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    pub fn is_tripped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Context handed to an operation body for one invocation.
#[derive(Debug, Clone)]
pub struct InvokeContext {
    session: SessionId,
    cancel: CancelFlag,
}

impl InvokeContext {
    /// Build a context for the given session.
    pub fn new(session: SessionId, cancel: CancelFlag) -> Self {
        Self { session, cancel }
    }

    /// The session this invocation belongs to.
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Whether the session has been cancelled (disconnect, release, or
    /// broker drain). Long-running operations should poll this.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_tripped()
    }
}

/// Failure surface available to an operation body.
#[derive(Debug, thiserror::Error)]
pub enum ZoneError {
    /// The input payload did not match the operation's expected shape
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// The elevated action itself failed
    #[error("{code}: {message}")]
    Failed {
        /// Short machine-readable failure code
        code: String,

        /// Human-readable diagnostic
        message: String,
    },
}

impl ZoneError {
    /// Build a `Failed` error from a code and diagnostic.
    pub fn failed(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for ZoneError {
    fn from(err: serde_json::Error) -> Self {
        Self::MalformedInput(err.to_string())
    }
}

/// Result of one operation body.
pub type ZoneResult = std::result::Result<Value, ZoneError>;

/// A live zone instance: the implementation side of a capability boundary.
///
/// One instance serves exactly one session and is dropped when the session
/// ends. The dispatcher only calls `invoke` with operations the zone's
/// descriptor declared; an implementation may still be defensive, but the
/// whitelist check happens before this trait is reached.
#[async_trait]
pub trait Zone: Send + Sync {
    /// Execute one declared operation with the given input payload.
    async fn invoke(&self, operation: &OperationName, input: Value, ctx: &InvokeContext)
        -> ZoneResult;
}

/// Factory constructing a fresh zone instance per activation.
pub type ZoneFactory = Arc<dyn Fn() -> Result<Arc<dyn Zone>, Error> + Send + Sync>;

/// Immutable record describing one registered zone.
#[derive(Clone)]
pub struct ZoneDescriptor {
    name: ZoneName,
    version: u32,
    visibility: ZoneVisibility,
    operations: BTreeSet<OperationName>,
    factory: ZoneFactory,
}

impl ZoneDescriptor {
    /// Build a descriptor. The operation set and factory are fixed from
    /// this point on.
    pub fn new(
        name: ZoneName,
        version: u32,
        visibility: ZoneVisibility,
        operations: impl IntoIterator<Item = OperationName>,
        factory: ZoneFactory,
    ) -> Self {
        Self {
            name,
            version,
            visibility,
            operations: operations.into_iter().collect(),
            factory,
        }
    }

    /// The zone's stable name.
    pub fn name(&self) -> &ZoneName {
        &self.name
    }

    /// The zone's contract version.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Whether the zone is published or internal.
    pub fn visibility(&self) -> ZoneVisibility {
        self.visibility
    }

    /// The declared operation set.
    pub fn operations(&self) -> &BTreeSet<OperationName> {
        &self.operations
    }

    /// Whether the descriptor declares the given operation.
    pub fn declares(&self, operation: &OperationName) -> bool {
        self.operations.contains(operation)
    }

    /// Construct a fresh instance via the registered factory.
    pub fn construct(&self) -> Result<Arc<dyn Zone>, Error> {
        (self.factory)()
    }

    /// The listing entry for this zone, as exposed by enumeration.
    pub fn listing(&self) -> ZoneListing {
        ZoneListing {
            name: self.name.clone(),
            version: self.version,
            operations: self.operations.iter().cloned().collect(),
        }
    }
}

impl fmt::Debug for ZoneDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZoneDescriptor")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("visibility", &self.visibility)
            .field("operations", &self.operations)
            .finish_non_exhaustive()
    }
}

/// Enumeration entry for one published zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneListing {
    /// Stable activation name
    pub name: ZoneName,

    /// Contract version
    pub version: u32,

    /// Declared operations
    pub operations: Vec<OperationName>,
}
