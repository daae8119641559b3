//! Chunk migration scheduling, durable migration records, and crash
//! recovery.

pub mod manager;
pub mod runner;
pub mod store;

pub use manager::{MigrationManager, MigrationManagerState, MigrationManagerStatsSnapshot};
pub use runner::{MoveChunkRequest, MoveChunkSettings, RecordingShardRunner, ShardCommandRunner};
pub use store::{FileMigrationStore, InMemoryMigrationStore, MigrationRecord, MigrationStore};

use crate::catalog::chunk::ChunkRange;
use crate::catalog::version::ChunkVersion;
use crate::types::{Namespace, ShardId};
use std::fmt;

/// A planned chunk movement, selected by the balancer or requested
/// manually.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrateInfo {
    /// Namespace the chunk belongs to.
    pub nss: Namespace,
    /// Range of the chunk being moved.
    pub range: ChunkRange,
    /// Shard currently owning the chunk.
    pub from: ShardId,
    /// Destination shard.
    pub to: ShardId,
    /// The chunk's version at selection time.
    pub version: ChunkVersion,
}

impl MigrateInfo {
    /// Create a migration plan.
    pub fn new(
        nss: Namespace,
        range: ChunkRange,
        from: ShardId,
        to: ShardId,
        version: ChunkVersion,
    ) -> Self {
        Self {
            nss,
            range,
            from,
            to,
            version,
        }
    }

    /// Deterministic identity derived from `(namespace, min key)`; also
    /// the key of the durable migration record.
    pub fn name(&self) -> String {
        format!("{}-{}", self.nss, self.range.min())
    }
}

impl fmt::Display for MigrateInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} from {} to {}",
            self.nss, self.range, self.from, self.to
        )
    }
}
