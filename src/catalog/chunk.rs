//! Chunks and shard-key ranges.

use crate::catalog::version::ChunkVersion;
use crate::error::{Error, Result};
use crate::types::ShardId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A point in shard-key space.
///
/// Keys are opaque byte strings ordered lexicographically; `Min` and `Max`
/// bound the space from below and above. The derived ordering relies on the
/// variant order: `Min < Key(_) < Max`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KeyBound {
    /// Below every key.
    Min,
    /// A concrete shard-key value.
    Key(Vec<u8>),
    /// Above every key.
    Max,
}

impl KeyBound {
    /// Create a concrete key bound.
    pub fn key(bytes: impl Into<Vec<u8>>) -> Self {
        KeyBound::Key(bytes.into())
    }

    /// Whether this is the global minimum.
    pub fn is_min(&self) -> bool {
        matches!(self, KeyBound::Min)
    }

    /// Whether this is the global maximum.
    pub fn is_max(&self) -> bool {
        matches!(self, KeyBound::Max)
    }
}

// Key bytes are rendered lossily; they are opaque to this subsystem and the
// rendering is only for logs and errors.
impl fmt::Display for KeyBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyBound::Min => f.write_str("MinKey"),
            KeyBound::Key(bytes) => write!(f, "{}", String::from_utf8_lossy(bytes)),
            KeyBound::Max => f.write_str("MaxKey"),
        }
    }
}

/// A half-open range `[min, max)` of shard-key space.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkRange {
    min: KeyBound,
    max: KeyBound,
}

impl ChunkRange {
    /// Create a range. Fails unless `min < max`.
    pub fn new(min: KeyBound, max: KeyBound) -> Result<Self> {
        if min >= max {
            return Err(Error::InvalidChunkRange(format!(
                "[{}, {}) is empty or inverted",
                min, max
            )));
        }
        Ok(Self { min, max })
    }

    /// The full key space `[MinKey, MaxKey)`.
    pub fn full() -> Self {
        Self {
            min: KeyBound::Min,
            max: KeyBound::Max,
        }
    }

    /// Lower bound (inclusive).
    pub fn min(&self) -> &KeyBound {
        &self.min
    }

    /// Upper bound (exclusive).
    pub fn max(&self) -> &KeyBound {
        &self.max
    }

    /// Whether the range contains the given point.
    pub fn contains(&self, point: &KeyBound) -> bool {
        *point >= self.min && *point < self.max
    }

    /// Whether the range contains the given concrete key.
    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.contains(&KeyBound::key(key))
    }

    /// Whether two ranges overlap.
    pub fn overlaps(&self, other: &ChunkRange) -> bool {
        self.min < other.max && other.min < self.max
    }

    /// Whether this range lies entirely within `other`.
    pub fn is_within(&self, other: &ChunkRange) -> bool {
        self.min >= other.min && self.max <= other.max
    }
}

impl fmt::Display for ChunkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.min, self.max)
    }
}

/// One chunk: a contiguous range of shard-key space owned by one shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    range: ChunkRange,
    shard: ShardId,
    version: ChunkVersion,
    jumbo: bool,
}

impl Chunk {
    /// Create a chunk.
    pub fn new(range: ChunkRange, shard: ShardId, version: ChunkVersion) -> Self {
        Self {
            range,
            shard,
            version,
            jumbo: false,
        }
    }

    /// The key range this chunk covers.
    pub fn range(&self) -> &ChunkRange {
        &self.range
    }

    /// Lower bound of the chunk's range.
    pub fn min(&self) -> &KeyBound {
        self.range.min()
    }

    /// Upper bound of the chunk's range.
    pub fn max(&self) -> &KeyBound {
        self.range.max()
    }

    /// The shard that owns this chunk.
    pub fn shard(&self) -> &ShardId {
        &self.shard
    }

    /// The chunk's version.
    pub fn version(&self) -> ChunkVersion {
        self.version
    }

    /// Whether the chunk is too large to migrate or split further.
    pub fn is_jumbo(&self) -> bool {
        self.jumbo
    }

    /// Mark or clear the jumbo flag.
    pub fn set_jumbo(&mut self, jumbo: bool) {
        self.jumbo = jumbo;
    }

    /// Copy of this chunk reassigned to a different shard with a new version.
    pub fn with_owner(&self, shard: ShardId, version: ChunkVersion) -> Self {
        Self {
            range: self.range.clone(),
            shard,
            version,
            jumbo: self.jumbo,
        }
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {} v{}", self.range, self.shard, self.version)
    }
}
