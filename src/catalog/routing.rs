//! Immutable routing table for one sharded collection.
//!
//! A [`RoutingTable`] is a snapshot of the chunk layout of one namespace at
//! one epoch. Snapshots are never mutated in place: an incremental diff
//! produces a new table via [`RoutingTable::make_updated`], sharing the
//! unchanged [`Chunk`] allocations with its predecessor, and an epoch
//! change discards the table entirely for a full rebuild.

use crate::catalog::chunk::{Chunk, KeyBound};
use crate::catalog::version::ChunkVersion;
use crate::error::{Error, Result};
use crate::types::{Namespace, ShardId};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use uuid::Uuid;

/// Routing table: ordered chunk ranges covering the full shard-key space of
/// one namespace, each owned by one shard.
///
/// Invariant: the ranges are contiguous, non-overlapping, and cover
/// `[MinKey, MaxKey)` exactly.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    nss: Namespace,
    epoch: Uuid,
    collection_uuid: Uuid,
    shard_key_pattern: String,
    /// Chunks keyed by the lower bound of their range.
    chunk_map: BTreeMap<KeyBound, Arc<Chunk>>,
    /// Max chunk version across the collection.
    collection_version: ChunkVersion,
    /// Max chunk version per owning shard.
    shard_versions: HashMap<ShardId, ChunkVersion>,
}

impl RoutingTable {
    /// Build a table from a full set of chunks, validating the coverage
    /// invariant.
    pub fn new(
        nss: Namespace,
        epoch: Uuid,
        collection_uuid: Uuid,
        shard_key_pattern: impl Into<String>,
        chunks: Vec<Chunk>,
    ) -> Result<Self> {
        let mut chunk_map = BTreeMap::new();
        for chunk in chunks {
            if chunk.version().epoch() != epoch {
                return Err(Error::InvalidRoutingTable(format!(
                    "{}: chunk {} carries epoch {}, table epoch is {}",
                    nss,
                    chunk,
                    chunk.version().epoch(),
                    epoch
                )));
            }
            if chunk_map
                .insert(chunk.min().clone(), Arc::new(chunk))
                .is_some()
            {
                return Err(Error::InvalidRoutingTable(format!(
                    "{}: two chunks share a lower bound",
                    nss
                )));
            }
        }

        let (collection_version, shard_versions) =
            Self::validate_and_version(&nss, epoch, &chunk_map)?;

        Ok(Self {
            nss,
            epoch,
            collection_uuid,
            shard_key_pattern: shard_key_pattern.into(),
            chunk_map,
            collection_version,
            shard_versions,
        })
    }

    /// Derive a new table by applying an incremental diff of changed
    /// chunks. Each changed chunk replaces whatever ranges it overlaps.
    ///
    /// The diff must carry the table's epoch. A diff that leaves a gap or
    /// an overlap surfaces [`Error::ConflictingOperationInProgress`]: the
    /// read raced a concurrent catalog operation and the caller should
    /// retry with a full reload.
    pub fn make_updated(&self, changed_chunks: &[Chunk]) -> Result<Self> {
        let mut chunk_map = self.chunk_map.clone();

        for chunk in changed_chunks {
            if chunk.version().epoch() != self.epoch {
                return Err(Error::ConflictingOperationInProgress(format!(
                    "{}: diff chunk {} belongs to epoch {}, cache has {}",
                    self.nss,
                    chunk,
                    chunk.version().epoch(),
                    self.epoch
                )));
            }

            // Remove every existing range the changed chunk overlaps. The
            // map is ordered by range start, so walking down from just
            // below the changed range's upper bound finds them all.
            let overlapping: Vec<KeyBound> = chunk_map
                .range(..chunk.max().clone())
                .rev()
                .take_while(|(_, existing)| *existing.max() > *chunk.min())
                .map(|(start, _)| start.clone())
                .collect();
            for start in overlapping {
                chunk_map.remove(&start);
            }

            chunk_map.insert(chunk.min().clone(), Arc::new(chunk.clone()));
        }

        let (collection_version, shard_versions) =
            Self::validate_and_version(&self.nss, self.epoch, &chunk_map).map_err(|e| {
                Error::ConflictingOperationInProgress(format!(
                    "incremental chunk diff for {} is inconsistent: {}",
                    self.nss, e
                ))
            })?;

        Ok(Self {
            nss: self.nss.clone(),
            epoch: self.epoch,
            collection_uuid: self.collection_uuid,
            shard_key_pattern: self.shard_key_pattern.clone(),
            chunk_map,
            collection_version,
            shard_versions,
        })
    }

    /// Walk the map once: check contiguity and full coverage, and compute
    /// the collection and per-shard max versions.
    fn validate_and_version(
        nss: &Namespace,
        epoch: Uuid,
        chunk_map: &BTreeMap<KeyBound, Arc<Chunk>>,
    ) -> Result<(ChunkVersion, HashMap<ShardId, ChunkVersion>)> {
        if chunk_map.is_empty() {
            return Err(Error::InvalidRoutingTable(format!("{}: no chunks", nss)));
        }

        let mut collection_version = ChunkVersion::new(0, 0, epoch);
        let mut shard_versions: HashMap<ShardId, ChunkVersion> = HashMap::new();
        let mut expected_min = KeyBound::Min;

        for (start, chunk) in chunk_map {
            if *start != expected_min {
                return Err(Error::InvalidRoutingTable(format!(
                    "{}: gap or overlap before {}, expected lower bound {}",
                    nss, chunk, expected_min
                )));
            }
            expected_min = chunk.max().clone();

            if collection_version.is_older_than(&chunk.version()) {
                collection_version = chunk.version();
            }
            let shard_entry = shard_versions
                .entry(chunk.shard().clone())
                .or_insert_with(|| ChunkVersion::new(0, 0, epoch));
            if shard_entry.is_older_than(&chunk.version()) {
                *shard_entry = chunk.version();
            }
        }

        if expected_min != KeyBound::Max {
            return Err(Error::InvalidRoutingTable(format!(
                "{}: key space not covered past {}",
                nss, expected_min
            )));
        }

        Ok((collection_version, shard_versions))
    }

    /// The namespace this table routes.
    pub fn nss(&self) -> &Namespace {
        &self.nss
    }

    /// The collection epoch the table was built for.
    pub fn epoch(&self) -> Uuid {
        self.epoch
    }

    /// Stable identity of the collection.
    pub fn collection_uuid(&self) -> Uuid {
        self.collection_uuid
    }

    /// The shard-key pattern, opaque to this subsystem.
    pub fn shard_key_pattern(&self) -> &str {
        &self.shard_key_pattern
    }

    /// Max chunk version across the collection.
    pub fn version(&self) -> ChunkVersion {
        self.collection_version
    }

    /// Max chunk version on the given shard; `(0, 0, epoch)` if the shard
    /// owns no chunks.
    pub fn shard_version(&self, shard: &ShardId) -> ChunkVersion {
        self.shard_versions
            .get(shard)
            .copied()
            .unwrap_or_else(|| ChunkVersion::new(0, 0, self.epoch))
    }

    /// Number of chunks.
    pub fn num_chunks(&self) -> usize {
        self.chunk_map.len()
    }

    /// Iterate chunks in key order.
    pub fn chunks(&self) -> impl Iterator<Item = &Arc<Chunk>> {
        self.chunk_map.values()
    }

    /// All chunks owned by the given shard, in key order.
    pub fn chunks_on_shard(&self, shard: &ShardId) -> Vec<Arc<Chunk>> {
        self.chunk_map
            .values()
            .filter(|c| c.shard() == shard)
            .cloned()
            .collect()
    }

    /// Shards owning at least one chunk.
    pub fn shard_ids(&self) -> Vec<ShardId> {
        self.shard_versions.keys().cloned().collect()
    }

    /// The chunk whose range contains the given key.
    pub fn chunk_for_key(&self, key: &[u8]) -> Result<Arc<Chunk>> {
        let point = KeyBound::key(key);
        self.chunk_map
            .range(..=point)
            .next_back()
            .map(|(_, chunk)| chunk.clone())
            .filter(|chunk| chunk.range().contains_key(key))
            .ok_or_else(|| {
                Error::Internal(format!(
                    "{}: no chunk covers key {}",
                    self.nss,
                    String::from_utf8_lossy(key)
                ))
            })
    }

    /// The shard owning the chunk that contains the given key.
    pub fn shard_for_key(&self, key: &[u8]) -> Result<ShardId> {
        Ok(self.chunk_for_key(key)?.shard().clone())
    }

    /// Whether two tables describe the identical chunk layout.
    pub fn same_layout(&self, other: &RoutingTable) -> bool {
        self.epoch == other.epoch
            && self.chunk_map.len() == other.chunk_map.len()
            && self
                .chunk_map
                .values()
                .zip(other.chunk_map.values())
                .all(|(a, b)| a.as_ref() == b.as_ref())
    }
}
