//! Error types for the cluster metadata and migration subsystem.

use thiserror::Error;

/// Result type alias for cluster metadata operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
///
/// All payloads are strings or scalars so the type is `Clone`: refresh
/// statuses are broadcast to every waiter of a routing-table refresh, and
/// per-migration statuses cross task boundaries.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Timed out waiting for a distributed lock held by someone else.
    #[error("lock busy: {name}: {reason}")]
    LockBusy { name: String, reason: String },

    /// A conditional lock-document update matched no document (another
    /// process holds the lock, or won the race for it).
    #[error("lock state change failed: {0}")]
    LockStateChangeFailed(String),

    /// No lock document exists for the given resource name.
    #[error("lock not found: {0}")]
    LockNotFound(String),

    /// Network error contacting the config store or a shard.
    #[error("network error: {0}")]
    Network(String),

    /// A concurrent catalog operation (e.g. drop/recreate) raced the read.
    #[error("conflicting operation in progress: {0}")]
    ConflictingOperationInProgress(String),

    /// The chunk is too large to migrate; the caller should split it.
    #[error("chunk too big: {0}")]
    ChunkTooBig(String),

    /// The balancer (or migration manager) was interrupted; retry on the
    /// next round.
    #[error("balancer interrupted")]
    BalancerInterrupted,

    /// Stepdown-class error from a remote node (primary changed, operation
    /// killed during failover).
    #[error("interrupted: {0}")]
    Interrupted(String),

    /// A remote command failed terminally.
    #[error("operation failed: {0}")]
    OperationFailed(String),

    /// Database does not exist in the authoritative catalog.
    #[error("database not found: {0}")]
    DatabaseNotFound(String),

    /// Collection does not exist (or is no longer sharded).
    #[error("namespace not found: {0}")]
    NamespaceNotFound(String),

    /// Collection exists but has no routing table.
    #[error("namespace not sharded: {0}")]
    NamespaceNotSharded(String),

    /// A namespace string could not be parsed as "db.collection".
    #[error("invalid namespace: {0}")]
    InvalidNamespace(String),

    /// A chunk range with min >= max.
    #[error("invalid chunk range: {0}")]
    InvalidChunkRange(String),

    /// A set of chunks does not form a contiguous, non-overlapping cover of
    /// the key space.
    #[error("invalid routing table: {0}")]
    InvalidRoutingTable(String),

    /// A persisted document could not be parsed.
    #[error("invalid document: {0}")]
    InvalidDocument(String),

    /// I/O error against durable storage.
    #[error("io error: {0}")]
    Io(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this is a transient network error, retryable with a bounded
    /// budget.
    pub fn is_network(&self) -> bool {
        matches!(self, Error::Network(_))
    }

    /// Whether this is a stepdown-class error: expected under topology
    /// churn, never fatal to the process.
    pub fn is_stepdown_class(&self) -> bool {
        matches!(self, Error::Interrupted(_) | Error::BalancerInterrupted)
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}
