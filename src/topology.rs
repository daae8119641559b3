//! Cluster shard topology.
//!
//! The registry tracks which shards exist, their zone memberships, and
//! whether they are draining. Shard entries are stable: they change only
//! through explicit administrative operations, never as a side effect of
//! balancing.

use crate::types::ShardId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Descriptor of one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardDescription {
    /// Shard identifier.
    pub id: ShardId,
    /// Zones this shard is assigned to.
    pub zones: Vec<String>,
    /// A draining shard takes no new chunks and sheds its existing ones.
    pub draining: bool,
}

impl ShardDescription {
    /// Create a shard descriptor with no zones.
    pub fn new(id: ShardId) -> Self {
        Self {
            id,
            zones: Vec::new(),
            draining: false,
        }
    }

    /// Whether the shard belongs to the given zone.
    pub fn has_zone(&self, zone: &str) -> bool {
        self.zones.iter().any(|z| z == zone)
    }
}

/// Registry of the cluster's shards.
#[derive(Debug, Default)]
pub struct ShardRegistry {
    shards: RwLock<HashMap<ShardId, ShardDescription>>,
    /// Incremented on any change; lets callers detect topology churn.
    version: AtomicU64,
}

impl ShardRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry version; changes whenever the topology does.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    fn bump(&self) {
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    /// Add or replace a shard.
    pub fn add_shard(&self, description: ShardDescription) {
        self.shards
            .write()
            .insert(description.id.clone(), description);
        self.bump();
    }

    /// Remove a shard.
    pub fn remove_shard(&self, id: &ShardId) -> Option<ShardDescription> {
        let removed = self.shards.write().remove(id);
        if removed.is_some() {
            self.bump();
        }
        removed
    }

    /// Mark or unmark a shard as draining.
    pub fn set_draining(&self, id: &ShardId, draining: bool) -> bool {
        let mut shards = self.shards.write();
        match shards.get_mut(id) {
            Some(shard) => {
                shard.draining = draining;
                drop(shards);
                self.bump();
                true
            }
            None => false,
        }
    }

    /// Add a shard to a zone.
    pub fn add_shard_to_zone(&self, id: &ShardId, zone: &str) -> bool {
        let mut shards = self.shards.write();
        match shards.get_mut(id) {
            Some(shard) => {
                if !shard.has_zone(zone) {
                    shard.zones.push(zone.to_string());
                }
                drop(shards);
                self.bump();
                true
            }
            None => false,
        }
    }

    /// Remove a shard from a zone.
    pub fn remove_shard_from_zone(&self, id: &ShardId, zone: &str) -> bool {
        let mut shards = self.shards.write();
        match shards.get_mut(id) {
            Some(shard) => {
                shard.zones.retain(|z| z != zone);
                drop(shards);
                self.bump();
                true
            }
            None => false,
        }
    }

    /// Fetch one shard's descriptor.
    pub fn get(&self, id: &ShardId) -> Option<ShardDescription> {
        self.shards.read().get(id).cloned()
    }

    /// All shards, sorted by id for deterministic iteration.
    pub fn all(&self) -> Vec<ShardDescription> {
        let mut shards: Vec<ShardDescription> = self.shards.read().values().cloned().collect();
        shards.sort_by(|a, b| a.id.cmp(&b.id));
        shards
    }

    /// Number of registered shards.
    pub fn num_shards(&self) -> usize {
        self.shards.read().len()
    }
}
