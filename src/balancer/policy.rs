//! Chunk selection policy.
//!
//! Decides, from the routing tables and the shard topology, which chunks
//! must be split (zone-boundary straddlers) and which should move. Move
//! candidates are selected in priority order: chunks leaving draining
//! shards, then zone violations, then chunk-count imbalance. A shard
//! participates in at most one migration per round, and jumbo chunks are
//! never selected.

use crate::catalog::cache::CatalogCache;
use crate::catalog::chunk::{Chunk, ChunkRange, KeyBound};
use crate::catalog::loader::CatalogCacheLoader;
use crate::catalog::routing::RoutingTable;
use crate::error::{Error, Result};
use crate::migration::MigrateInfo;
use crate::topology::{ShardDescription, ShardRegistry};
use crate::types::{Namespace, ShardId};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// A zone (tag) range constraining chunk placement.
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneRange {
    /// Key range the zone covers.
    pub range: ChunkRange,
    /// Zone name; only shards assigned to it may own chunks in the range.
    pub zone: String,
}

/// A chunk that must be split before it can be balanced.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitCandidate {
    /// Namespace of the chunk.
    pub nss: Namespace,
    /// The chunk's full range.
    pub range: ChunkRange,
    /// Points to split at (zone boundaries falling inside the chunk).
    pub split_points: Vec<KeyBound>,
}

/// Chunk selection interface consumed by the balancer.
#[async_trait]
pub trait ChunkSelectionPolicy: Send + Sync + fmt::Debug {
    /// Chunks that straddle a zone boundary and need splitting first.
    async fn select_chunks_to_split(&self) -> Result<Vec<SplitCandidate>>;

    /// Candidate migrations for this round.
    async fn select_chunks_to_move(&self) -> Result<Vec<MigrateInfo>>;

    /// Record that a chunk proved unsplittable so selection skips it.
    fn mark_jumbo(&self, nss: &Namespace, min: KeyBound);
}

/// Migration threshold by collection size: small collections balance on a
/// difference of 2 chunks, large ones tolerate more skew before moving.
fn imbalance_threshold(total_chunks: usize) -> usize {
    if total_chunks < 20 {
        2
    } else if total_chunks < 80 {
        4
    } else {
        8
    }
}

/// Default policy over the catalog cache and the shard registry.
#[derive(Debug)]
pub struct DefaultChunkSelectionPolicy {
    catalog: CatalogCache,
    loader: Arc<dyn CatalogCacheLoader>,
    registry: Arc<ShardRegistry>,
    /// Zone ranges per collection, set administratively.
    zones: RwLock<HashMap<Namespace, Vec<ZoneRange>>>,
    /// Chunks marked jumbo since the last authoritative refresh.
    jumbo: Mutex<HashSet<(Namespace, KeyBound)>>,
}

impl DefaultChunkSelectionPolicy {
    /// Create a policy.
    pub fn new(
        catalog: CatalogCache,
        loader: Arc<dyn CatalogCacheLoader>,
        registry: Arc<ShardRegistry>,
    ) -> Self {
        Self {
            catalog,
            loader,
            registry,
            zones: RwLock::new(HashMap::new()),
            jumbo: Mutex::new(HashSet::new()),
        }
    }

    /// Replace the zone ranges of a collection.
    pub fn set_zone_ranges(&self, nss: &Namespace, ranges: Vec<ZoneRange>) {
        self.zones.write().insert(nss.clone(), ranges);
    }

    fn is_jumbo(&self, nss: &Namespace, chunk: &Chunk) -> bool {
        chunk.is_jumbo() || self.jumbo.lock().contains(&(nss.clone(), chunk.min().clone()))
    }

    /// The zone a chunk belongs to, if its range lies entirely within one
    /// zone range. Straddlers return `None`; they are split candidates,
    /// not move candidates.
    fn zone_of<'a>(zones: &'a [ZoneRange], chunk: &Chunk) -> Option<&'a str> {
        zones
            .iter()
            .find(|z| chunk.range().is_within(&z.range))
            .map(|z| z.zone.as_str())
    }

    /// Least-loaded eligible destination: not the source, not draining,
    /// not already used this round, and in `zone` when one applies.
    fn pick_destination(
        shards: &[ShardDescription],
        counts: &HashMap<ShardId, usize>,
        used: &HashSet<ShardId>,
        source: &ShardId,
        zone: Option<&str>,
    ) -> Option<ShardId> {
        shards
            .iter()
            .filter(|s| &s.id != source && !s.draining && !used.contains(&s.id))
            .filter(|s| zone.map_or(true, |z| s.has_zone(z)))
            .min_by_key(|s| counts.get(&s.id).copied().unwrap_or(0))
            .map(|s| s.id.clone())
    }

    /// Move candidates for one collection, honoring the per-round
    /// used-shards set shared across collections.
    fn select_moves_for_collection(
        &self,
        nss: &Namespace,
        table: &RoutingTable,
        shards: &[ShardDescription],
        used: &mut HashSet<ShardId>,
    ) -> Vec<MigrateInfo> {
        let zones = self.zones.read().get(nss).cloned().unwrap_or_default();
        let mut candidates = Vec::new();

        // Chunk counts per shard, including shards owning nothing.
        let mut counts: HashMap<ShardId, usize> = shards
            .iter()
            .map(|s| (s.id.clone(), 0))
            .collect();
        for chunk in table.chunks() {
            *counts.entry(chunk.shard().clone()).or_insert(0) += 1;
        }

        let descriptions: HashMap<ShardId, &ShardDescription> =
            shards.iter().map(|s| (s.id.clone(), s)).collect();

        let mut propose = |chunk: &Arc<Chunk>,
                           to: ShardId,
                           counts: &mut HashMap<ShardId, usize>,
                           used: &mut HashSet<ShardId>| {
            let from = chunk.shard().clone();
            *counts.entry(from.clone()).or_insert(1) -= 1;
            *counts.entry(to.clone()).or_insert(0) += 1;
            used.insert(from.clone());
            used.insert(to.clone());
            candidates.push(MigrateInfo::new(
                nss.clone(),
                chunk.range().clone(),
                from,
                to,
                chunk.version(),
            ));
        };

        // 1. Drain: every chunk on a draining shard wants off, one per
        //    round per shard.
        for chunk in table.chunks() {
            let draining = descriptions
                .get(chunk.shard())
                .map(|s| s.draining)
                .unwrap_or(false);
            if !draining || used.contains(chunk.shard()) || self.is_jumbo(nss, chunk) {
                continue;
            }
            let zone = Self::zone_of(&zones, chunk);
            if let Some(to) = Self::pick_destination(shards, &counts, used, chunk.shard(), zone) {
                propose(chunk, to, &mut counts, used);
            } else {
                warn!(
                    namespace = %nss,
                    chunk = %chunk,
                    "No eligible destination for chunk on draining shard"
                );
            }
        }

        // 2. Zone violations: a chunk fully inside a zone owned by a shard
        //    outside that zone.
        for chunk in table.chunks() {
            if used.contains(chunk.shard()) || self.is_jumbo(nss, chunk) {
                continue;
            }
            let Some(zone) = Self::zone_of(&zones, chunk) else {
                continue;
            };
            let owner_in_zone = descriptions
                .get(chunk.shard())
                .map(|s| s.has_zone(zone))
                .unwrap_or(false);
            if owner_in_zone {
                continue;
            }
            if let Some(to) =
                Self::pick_destination(shards, &counts, used, chunk.shard(), Some(zone))
            {
                propose(chunk, to, &mut counts, used);
            } else {
                warn!(
                    namespace = %nss,
                    chunk = %chunk,
                    zone,
                    "Zone violation with no eligible destination"
                );
            }
        }

        // 3. Chunk-count imbalance between eligible shards.
        let threshold = imbalance_threshold(table.num_chunks());
        loop {
            let eligible: Vec<&ShardDescription> = shards
                .iter()
                .filter(|s| !used.contains(&s.id) && !s.draining)
                .collect();
            let Some(most) = eligible
                .iter()
                .max_by_key(|s| counts.get(&s.id).copied().unwrap_or(0))
            else {
                break;
            };
            let Some(least) = eligible
                .iter()
                .min_by_key(|s| counts.get(&s.id).copied().unwrap_or(0))
            else {
                break;
            };
            let most_count = counts.get(&most.id).copied().unwrap_or(0);
            let least_count = counts.get(&least.id).copied().unwrap_or(0);
            if most.id == least.id || most_count - least_count < threshold {
                break;
            }

            let source = most.id.clone();
            let dest = least.id.clone();
            let candidate = table.chunks().find(|c| {
                *c.shard() == source
                    && !self.is_jumbo(nss, c)
                    && Self::zone_of(&zones, c).map_or(true, |z| {
                        descriptions.get(&dest).map(|s| s.has_zone(z)).unwrap_or(false)
                    })
            });
            match candidate {
                Some(chunk) => {
                    let chunk = chunk.clone();
                    propose(&chunk, dest, &mut counts, used);
                }
                None => break,
            }
        }

        candidates
    }
}

#[async_trait]
impl ChunkSelectionPolicy for DefaultChunkSelectionPolicy {
    async fn select_chunks_to_split(&self) -> Result<Vec<SplitCandidate>> {
        let mut candidates = Vec::new();

        for nss in self.loader.get_sharded_namespaces().await? {
            let zones = self.zones.read().get(&nss).cloned().unwrap_or_default();
            if zones.is_empty() {
                continue;
            }
            let table = match self.catalog.get_sharded_routing_table(&nss).await {
                Ok(table) => table,
                Err(Error::NamespaceNotSharded(_)) => continue,
                Err(e) => return Err(e),
            };

            for chunk in table.chunks() {
                let mut split_points: Vec<KeyBound> = Vec::new();
                for zone in &zones {
                    for boundary in [zone.range.min(), zone.range.max()] {
                        // A boundary strictly inside the chunk splits it.
                        if *boundary > *chunk.min() && *boundary < *chunk.max() {
                            split_points.push(boundary.clone());
                        }
                    }
                }
                if !split_points.is_empty() {
                    split_points.sort();
                    split_points.dedup();
                    debug!(
                        namespace = %nss,
                        chunk = %chunk,
                        points = split_points.len(),
                        "Chunk straddles a zone boundary"
                    );
                    candidates.push(SplitCandidate {
                        nss: nss.clone(),
                        range: chunk.range().clone(),
                        split_points,
                    });
                }
            }
        }

        Ok(candidates)
    }

    async fn select_chunks_to_move(&self) -> Result<Vec<MigrateInfo>> {
        let shards = self.registry.all();
        if shards.len() < 2 {
            return Ok(Vec::new());
        }

        let mut used: HashSet<ShardId> = HashSet::new();
        let mut candidates = Vec::new();

        for nss in self.loader.get_sharded_namespaces().await? {
            let table = match self.catalog.get_sharded_routing_table(&nss).await {
                Ok(table) => table,
                Err(Error::NamespaceNotSharded(_)) => continue,
                Err(e) => return Err(e),
            };
            candidates.extend(self.select_moves_for_collection(&nss, &table, &shards, &mut used));
        }

        Ok(candidates)
    }

    fn mark_jumbo(&self, nss: &Namespace, min: KeyBound) {
        self.jumbo.lock().insert((nss.clone(), min));
    }
}
