//! Loader interface to the authoritative catalog.
//!
//! The catalog cache never talks to the config store directly; it consults
//! a [`CatalogCacheLoader`], which can serve either an incremental chunk
//! diff (same epoch, chunks newer than the requested version) or a full
//! reload (all chunks, when asked with an unset version or after an epoch
//! change).
//!
//! [`InMemoryConfigCatalog`] is the in-process implementation: it doubles
//! as the authoritative chunk store for tests and embedded deployments,
//! with mutators that model the commits a donor shard would make against
//! the config store (`commit_move`, `commit_split`).

use crate::catalog::chunk::{Chunk, ChunkRange, KeyBound};
use crate::catalog::version::ChunkVersion;
use crate::error::{Error, Result};
use crate::types::{Namespace, ShardId};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// A database's entry in the authoritative catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseType {
    /// Database name.
    pub name: String,
    /// Shard holding the database's unsharded collections.
    pub primary_shard: ShardId,
    /// Whether collections in this database may be sharded.
    pub sharding_enabled: bool,
}

/// Result of a loader fetch: collection identity plus the chunks that
/// changed since the requested version (or all chunks, for a full reload).
#[derive(Debug, Clone)]
pub struct CollectionAndChangedChunks {
    /// Collection epoch at the time of the read.
    pub epoch: Uuid,
    /// Stable collection identity.
    pub uuid: Uuid,
    /// Shard-key pattern, opaque to the cache.
    pub shard_key_pattern: String,
    /// Changed chunks in version order.
    pub changed_chunks: Vec<Chunk>,
}

/// Interface the catalog cache uses to fetch routing metadata.
#[async_trait]
pub trait CatalogCacheLoader: Send + Sync + fmt::Debug {
    /// Fetch the database entry.
    async fn get_database(&self, db_name: &str) -> Result<DatabaseType>;

    /// Fetch chunks changed since `since`. An unset `since` (or one from a
    /// different epoch than the current collection) yields a full reload.
    async fn get_chunks_since(
        &self,
        nss: &Namespace,
        since: ChunkVersion,
    ) -> Result<CollectionAndChangedChunks>;

    /// Enumerate the currently sharded namespaces.
    async fn get_sharded_namespaces(&self) -> Result<Vec<Namespace>>;
}

/// Authoritative state of one sharded collection.
#[derive(Debug, Clone)]
struct CollectionState {
    epoch: Uuid,
    uuid: Uuid,
    shard_key_pattern: String,
    /// Chunks in key order; invariantly a full cover of the key space.
    chunks: Vec<Chunk>,
}

impl CollectionState {
    fn collection_version(&self) -> ChunkVersion {
        let mut version = ChunkVersion::new(0, 0, self.epoch);
        for chunk in &self.chunks {
            if version.is_older_than(&chunk.version()) {
                version = chunk.version();
            }
        }
        version
    }

    fn position_of_min(&self, min: &KeyBound) -> Result<usize> {
        self.chunks
            .iter()
            .position(|c| c.min() == min)
            .ok_or_else(|| {
                Error::ConflictingOperationInProgress(format!(
                    "no chunk with lower bound {}",
                    min
                ))
            })
    }
}

/// In-memory authoritative catalog.
///
/// Serves loader reads and accepts the metadata commits that conclude chunk
/// migrations and splits. The loader-call counter exists for tests that
/// assert single-flight refresh behavior.
#[derive(Debug, Default)]
pub struct InMemoryConfigCatalog {
    databases: RwLock<HashMap<String, DatabaseType>>,
    collections: RwLock<HashMap<Namespace, CollectionState>>,
    chunk_load_calls: AtomicU64,
}

impl InMemoryConfigCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a database.
    pub fn add_database(&self, name: &str, primary_shard: ShardId, sharding_enabled: bool) {
        self.databases.write().insert(
            name.to_string(),
            DatabaseType {
                name: name.to_string(),
                primary_shard,
                sharding_enabled,
            },
        );
    }

    /// Shard a collection with the given initial chunk layout. Assigns a
    /// fresh epoch.
    pub fn shard_collection(
        &self,
        nss: Namespace,
        shard_key_pattern: &str,
        chunks: Vec<(ChunkRange, ShardId)>,
    ) -> Result<Uuid> {
        if chunks.is_empty() {
            return Err(Error::InvalidRoutingTable(format!("{}: no chunks", nss)));
        }
        let epoch = Uuid::new_v4();
        let mut minor = 0;
        let chunks = chunks
            .into_iter()
            .map(|(range, shard)| {
                minor += 1;
                Chunk::new(range, shard, ChunkVersion::new(1, minor, epoch))
            })
            .collect();
        self.collections.write().insert(
            nss,
            CollectionState {
                epoch,
                uuid: Uuid::new_v4(),
                shard_key_pattern: shard_key_pattern.to_string(),
                chunks,
            },
        );
        Ok(epoch)
    }

    /// Drop and re-shard a collection under a new epoch, keeping the chunk
    /// layout. Models drop/recreate invalidating every cached version.
    pub fn bump_epoch(&self, nss: &Namespace) -> Result<Uuid> {
        let mut collections = self.collections.write();
        let state = collections
            .get_mut(nss)
            .ok_or_else(|| Error::NamespaceNotFound(nss.to_string()))?;
        let epoch = Uuid::new_v4();
        let mut minor = 0;
        state.chunks = state
            .chunks
            .iter()
            .map(|c| {
                minor += 1;
                let mut chunk = Chunk::new(
                    c.range().clone(),
                    c.shard().clone(),
                    ChunkVersion::new(1, minor, epoch),
                );
                chunk.set_jumbo(c.is_jumbo());
                chunk
            })
            .collect();
        state.epoch = epoch;
        state.uuid = Uuid::new_v4();
        Ok(epoch)
    }

    /// Commit a completed chunk migration: reassign the chunk starting at
    /// `min` to `to` and bump the collection major version.
    pub fn commit_move(&self, nss: &Namespace, min: &KeyBound, to: ShardId) -> Result<ChunkVersion> {
        let mut collections = self.collections.write();
        let state = collections
            .get_mut(nss)
            .ok_or_else(|| Error::NamespaceNotFound(nss.to_string()))?;
        let position = state.position_of_min(min)?;
        let version = state.collection_version().inc_major();
        let moved = state.chunks[position].with_owner(to, version);
        state.chunks[position] = moved;
        Ok(version)
    }

    /// Commit a chunk split: replace the chunk starting at `min` with one
    /// piece per split point, each getting a minor version bump.
    pub fn commit_split(
        &self,
        nss: &Namespace,
        min: &KeyBound,
        split_points: &[KeyBound],
    ) -> Result<()> {
        if split_points.is_empty() {
            return Err(Error::OperationFailed(format!(
                "{}: split of {} requested without split points",
                nss, min
            )));
        }
        let mut collections = self.collections.write();
        let state = collections
            .get_mut(nss)
            .ok_or_else(|| Error::NamespaceNotFound(nss.to_string()))?;
        let position = state.position_of_min(min)?;
        let original = state.chunks[position].clone();

        for point in split_points {
            if !original.range().contains(point) || point == original.min() {
                return Err(Error::OperationFailed(format!(
                    "{}: split point {} outside chunk {}",
                    nss, point, original
                )));
            }
        }

        let mut bounds = Vec::with_capacity(split_points.len() + 2);
        bounds.push(original.min().clone());
        bounds.extend(split_points.iter().cloned());
        bounds.push(original.max().clone());
        bounds.sort();

        let mut version = state.collection_version();
        let mut pieces = Vec::with_capacity(bounds.len() - 1);
        for window in bounds.windows(2) {
            version = version.inc_minor();
            pieces.push(Chunk::new(
                ChunkRange::new(window[0].clone(), window[1].clone())?,
                original.shard().clone(),
                version,
            ));
        }

        state.chunks.splice(position..=position, pieces);
        Ok(())
    }

    /// Persist the jumbo flag on a chunk.
    pub fn set_jumbo(&self, nss: &Namespace, min: &KeyBound) -> Result<()> {
        let mut collections = self.collections.write();
        let state = collections
            .get_mut(nss)
            .ok_or_else(|| Error::NamespaceNotFound(nss.to_string()))?;
        let position = state.position_of_min(min)?;
        state.chunks[position].set_jumbo(true);
        Ok(())
    }

    /// Number of `get_chunks_since` calls served so far.
    pub fn chunk_load_calls(&self) -> u64 {
        self.chunk_load_calls.load(Ordering::Relaxed)
    }

    /// Current collection version, straight from the authoritative chunks.
    pub fn collection_version(&self, nss: &Namespace) -> Result<ChunkVersion> {
        let collections = self.collections.read();
        let state = collections
            .get(nss)
            .ok_or_else(|| Error::NamespaceNotFound(nss.to_string()))?;
        Ok(state.collection_version())
    }
}

#[async_trait]
impl CatalogCacheLoader for InMemoryConfigCatalog {
    async fn get_database(&self, db_name: &str) -> Result<DatabaseType> {
        self.databases
            .read()
            .get(db_name)
            .cloned()
            .ok_or_else(|| Error::DatabaseNotFound(db_name.to_string()))
    }

    async fn get_chunks_since(
        &self,
        nss: &Namespace,
        since: ChunkVersion,
    ) -> Result<CollectionAndChangedChunks> {
        self.chunk_load_calls.fetch_add(1, Ordering::Relaxed);

        let collections = self.collections.read();
        let state = collections
            .get(nss)
            .ok_or_else(|| Error::NamespaceNotFound(nss.to_string()))?;

        let full_reload = !since.is_set() || since.epoch() != state.epoch;
        let changed_chunks = state
            .chunks
            .iter()
            .filter(|c| full_reload || since.is_older_than(&c.version()))
            .cloned()
            .collect();

        Ok(CollectionAndChangedChunks {
            epoch: state.epoch,
            uuid: state.uuid,
            shard_key_pattern: state.shard_key_pattern.clone(),
            changed_chunks,
        })
    }

    async fn get_sharded_namespaces(&self) -> Result<Vec<Namespace>> {
        let mut namespaces: Vec<Namespace> = self.collections.read().keys().cloned().collect();
        namespaces.sort();
        Ok(namespaces)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_catalog() -> (InMemoryConfigCatalog, Namespace) {
        let catalog = InMemoryConfigCatalog::new();
        catalog.add_database("app", ShardId::from("shard1"), true);
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
        (catalog, nss)
    }

    #[tokio::test]
    async fn test_full_reload_and_diff() {
        let (catalog, nss) = seeded_catalog();

        let full = catalog
            .get_chunks_since(&nss, ChunkVersion::unset())
            .await
            .unwrap();
        assert_eq!(full.changed_chunks.len(), 2);

        let since = catalog.collection_version(&nss).unwrap();
        let empty = catalog.get_chunks_since(&nss, since).await.unwrap();
        assert!(empty.changed_chunks.is_empty());

        catalog
            .commit_move(&nss, &KeyBound::Min, ShardId::from("shard3"))
            .unwrap();
        let diff = catalog.get_chunks_since(&nss, since).await.unwrap();
        assert_eq!(diff.changed_chunks.len(), 1);
        assert_eq!(*diff.changed_chunks[0].shard(), ShardId::from("shard3"));
    }

    #[tokio::test]
    async fn test_epoch_change_forces_full_reload() {
        let (catalog, nss) = seeded_catalog();
        let since = catalog.collection_version(&nss).unwrap();

        catalog.bump_epoch(&nss).unwrap();
        let reload = catalog.get_chunks_since(&nss, since).await.unwrap();
        assert_eq!(reload.changed_chunks.len(), 2);
        assert_ne!(reload.epoch, since.epoch());
    }

    #[tokio::test]
    async fn test_commit_split() {
        let (catalog, nss) = seeded_catalog();
        let before = catalog.collection_version(&nss).unwrap();

        catalog
            .commit_split(&nss, &KeyBound::Min, &[KeyBound::key("f")])
            .unwrap();

        let full = catalog
            .get_chunks_since(&nss, ChunkVersion::unset())
            .await
            .unwrap();
        assert_eq!(full.changed_chunks.len(), 3);
        let after = catalog.collection_version(&nss).unwrap();
        assert_eq!(after.major(), before.major());
        assert!(before.is_older_than(&after));
    }

    #[tokio::test]
    async fn test_commit_split_rejects_out_of_range_point() {
        let (catalog, nss) = seeded_catalog();
        let result = catalog.commit_split(&nss, &KeyBound::Min, &[KeyBound::key("z")]);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_unknown_namespace() {
        let catalog = InMemoryConfigCatalog::new();
        let nss = Namespace::new("app", "ghost");
        let result = catalog.get_chunks_since(&nss, ChunkVersion::unset()).await;
        assert!(matches!(result, Err(Error::NamespaceNotFound(_))));
    }
}
