//! Remote command surface towards the shards.
//!
//! The migration manager and the balancer drive shards through
//! [`ShardCommandRunner`]: `move_chunk` against the donor shard and
//! `split_chunk` for corrective splits. The trait is the process boundary;
//! everything behind it (connection pooling, command encoding) is an
//! external collaborator.

use crate::catalog::chunk::{ChunkRange, KeyBound};
use crate::catalog::loader::InMemoryConfigCatalog;
use crate::catalog::version::ChunkVersion;
use crate::error::{Error, Result};
use crate::types::{Namespace, ShardId};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Move-level knobs shared by every migration of one balancer round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveChunkSettings {
    /// Size above which the donor refuses with ChunkTooBig.
    pub max_chunk_size_bytes: u64,
    /// Whether secondaries throttle the cloning phase.
    pub secondary_throttle: bool,
    /// Whether the command waits for the donor's range deletion.
    pub wait_for_delete: bool,
}

impl Default for MoveChunkSettings {
    fn default() -> Self {
        Self {
            max_chunk_size_bytes: 64 * 1024 * 1024,
            secondary_throttle: true,
            wait_for_delete: false,
        }
    }
}

/// The `moveChunk` command executed against the donor shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveChunkRequest {
    /// Namespace of the chunk.
    pub nss: Namespace,
    /// Range being moved.
    pub range: ChunkRange,
    /// Donor shard.
    pub from: ShardId,
    /// Recipient shard.
    pub to: ShardId,
    /// Expected chunk version; the donor refuses on mismatch.
    pub version: ChunkVersion,
    /// Connection string of the config server the donor commits to.
    pub config_connection: String,
    /// Move-level settings.
    pub settings: MoveChunkSettings,
}

impl fmt::Display for MoveChunkRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "moveChunk {} {} {} -> {}",
            self.nss, self.range, self.from, self.to
        )
    }
}

/// Command dispatch towards the shards.
#[async_trait]
pub trait ShardCommandRunner: Send + Sync + fmt::Debug {
    /// Execute `moveChunk` against the donor shard. Distinguished
    /// outcomes: `Ok`, [`Error::ChunkTooBig`], stepdown-class
    /// [`Error::Interrupted`], or any other failure.
    async fn move_chunk(&self, request: &MoveChunkRequest) -> Result<()>;

    /// Split a chunk at the given points; with no points the shard picks
    /// its own.
    async fn split_chunk(
        &self,
        nss: &Namespace,
        range: &ChunkRange,
        split_points: &[KeyBound],
    ) -> Result<()>;
}

type ChunkKey = (Namespace, KeyBound);

#[derive(Debug, Default)]
struct ScriptedResponses {
    /// Scripted failures for moves, consumed once per entry.
    move_failures: HashMap<ChunkKey, Vec<Error>>,
    /// Scripted failures for splits, consumed once per entry.
    split_failures: HashMap<ChunkKey, Vec<Error>>,
    /// Split points the "shard" picks when the caller provides none.
    auto_split_points: HashMap<ChunkKey, Vec<KeyBound>>,
}

/// Scripted runner for tests and embedded simulation.
///
/// Successful commands are optionally committed to an
/// [`InMemoryConfigCatalog`], modeling the metadata commit a donor shard
/// performs against the config server.
#[derive(Debug, Default)]
pub struct RecordingShardRunner {
    catalog: Option<Arc<InMemoryConfigCatalog>>,
    responses: Mutex<ScriptedResponses>,
    dispatched_moves: Mutex<Vec<MoveChunkRequest>>,
    dispatched_splits: Mutex<Vec<(Namespace, ChunkRange, Vec<KeyBound>)>>,
}

impl RecordingShardRunner {
    /// Runner that records commands without touching any catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runner committing successful commands to the given catalog.
    pub fn with_catalog(catalog: Arc<InMemoryConfigCatalog>) -> Self {
        Self {
            catalog: Some(catalog),
            ..Default::default()
        }
    }

    /// Script the next `move_chunk` of the given chunk to fail.
    pub fn fail_next_move(&self, nss: &Namespace, min: KeyBound, error: Error) {
        self.responses
            .lock()
            .move_failures
            .entry((nss.clone(), min))
            .or_default()
            .push(error);
    }

    /// Script the next `split_chunk` of the given chunk to fail.
    pub fn fail_next_split(&self, nss: &Namespace, min: KeyBound, error: Error) {
        self.responses
            .lock()
            .split_failures
            .entry((nss.clone(), min))
            .or_default()
            .push(error);
    }

    /// Choose the split points the shard picks when asked to split with
    /// none provided.
    pub fn set_auto_split_points(&self, nss: &Namespace, min: KeyBound, points: Vec<KeyBound>) {
        self.responses
            .lock()
            .auto_split_points
            .insert((nss.clone(), min), points);
    }

    /// Every `move_chunk` dispatched so far.
    pub fn dispatched_moves(&self) -> Vec<MoveChunkRequest> {
        self.dispatched_moves.lock().clone()
    }

    /// Every `split_chunk` dispatched so far.
    pub fn dispatched_splits(&self) -> Vec<(Namespace, ChunkRange, Vec<KeyBound>)> {
        self.dispatched_splits.lock().clone()
    }

    fn take_failure(
        map: &mut HashMap<ChunkKey, Vec<Error>>,
        key: &ChunkKey,
    ) -> Option<Error> {
        let failures = map.get_mut(key)?;
        let error = if failures.is_empty() {
            None
        } else {
            Some(failures.remove(0))
        };
        if failures.is_empty() {
            map.remove(key);
        }
        error
    }
}

#[async_trait]
impl ShardCommandRunner for RecordingShardRunner {
    async fn move_chunk(&self, request: &MoveChunkRequest) -> Result<()> {
        self.dispatched_moves.lock().push(request.clone());

        let key = (request.nss.clone(), request.range.min().clone());
        if let Some(error) = Self::take_failure(&mut self.responses.lock().move_failures, &key) {
            return Err(error);
        }

        if let Some(catalog) = &self.catalog {
            catalog.commit_move(&request.nss, request.range.min(), request.to.clone())?;
        }
        Ok(())
    }

    async fn split_chunk(
        &self,
        nss: &Namespace,
        range: &ChunkRange,
        split_points: &[KeyBound],
    ) -> Result<()> {
        self.dispatched_splits
            .lock()
            .push((nss.clone(), range.clone(), split_points.to_vec()));

        let key = (nss.clone(), range.min().clone());
        let (failure, auto_points) = {
            let mut responses = self.responses.lock();
            let failure = Self::take_failure(&mut responses.split_failures, &key);
            let auto_points = responses.auto_split_points.get(&key).cloned();
            (failure, auto_points)
        };
        if let Some(error) = failure {
            return Err(error);
        }

        if let Some(catalog) = &self.catalog {
            let points = if split_points.is_empty() {
                auto_points.ok_or_else(|| {
                    Error::OperationFailed(format!(
                        "{}: no split points found for chunk {}",
                        nss, range
                    ))
                })?
            } else {
                split_points.to_vec()
            };
            catalog.commit_split(nss, range.min(), &points)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn request(nss: &Namespace) -> MoveChunkRequest {
        MoveChunkRequest {
            nss: nss.clone(),
            range: ChunkRange::new(KeyBound::Min, KeyBound::key("m")).unwrap(),
            from: ShardId::from("shard1"),
            to: ShardId::from("shard3"),
            version: ChunkVersion::new(1, 0, Uuid::new_v4()),
            config_connection: "config/cfg1,cfg2,cfg3".to_string(),
            settings: MoveChunkSettings::default(),
        }
    }

    #[tokio::test]
    async fn test_scripted_failure_consumed_once() {
        let runner = RecordingShardRunner::new();
        let nss = Namespace::new("app", "users");
        runner.fail_next_move(&nss, KeyBound::Min, Error::ChunkTooBig("95 MiB".into()));

        let result = runner.move_chunk(&request(&nss)).await;
        assert!(matches!(result, Err(Error::ChunkTooBig(_))));

        runner.move_chunk(&request(&nss)).await.unwrap();
        assert_eq!(runner.dispatched_moves().len(), 2);
    }

    #[tokio::test]
    async fn test_move_commits_to_catalog() {
        let catalog = Arc::new(InMemoryConfigCatalog::new());
        let nss = Namespace::new("app", "users");
        catalog
            .shard_collection(
                nss.clone(),
                "{ user_id: 1 }",
                vec![
                    (
                        ChunkRange::new(KeyBound::Min, KeyBound::key("m")).unwrap(),
                        ShardId::from("shard1"),
                    ),
                    (
                        ChunkRange::new(KeyBound::key("m"), KeyBound::Max).unwrap(),
                        ShardId::from("shard2"),
                    ),
                ],
            )
            .unwrap();
        let before = catalog.collection_version(&nss).unwrap();

        let runner = RecordingShardRunner::with_catalog(catalog.clone());
        runner.move_chunk(&request(&nss)).await.unwrap();

        let after = catalog.collection_version(&nss).unwrap();
        assert!(before.is_older_than(&after));
        assert_eq!(after.major(), before.major() + 1);
    }
}
