//! Chunk versioning.
//!
//! A [`ChunkVersion`] is a `(major, minor, epoch)` tuple. Major and minor
//! give a total order *within* one epoch; the epoch changes whenever the
//! collection is dropped, recreated, or resharded, which invalidates every
//! previously issued version regardless of major/minor.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Version of a chunk (and, by max over chunks, of a collection).
///
/// There is deliberately no `Ord` impl: versions from different epochs are
/// incomparable, and [`ChunkVersion::is_older_than`] encodes the rule that
/// an epoch mismatch always reads as stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkVersion {
    major: u32,
    minor: u32,
    epoch: Uuid,
}

impl ChunkVersion {
    /// Create a new version.
    pub fn new(major: u32, minor: u32, epoch: Uuid) -> Self {
        Self {
            major,
            minor,
            epoch,
        }
    }

    /// The "never seen anything" version: zero counters, nil epoch. A
    /// loader asked for chunks since this version returns a full reload.
    pub fn unset() -> Self {
        Self {
            major: 0,
            minor: 0,
            epoch: Uuid::nil(),
        }
    }

    /// Whether this version carries a real epoch.
    pub fn is_set(&self) -> bool {
        !self.epoch.is_nil()
    }

    /// Major component. Bumped when a chunk moves between shards.
    pub fn major(&self) -> u32 {
        self.major
    }

    /// Minor component. Bumped when a chunk is split in place.
    pub fn minor(&self) -> u32 {
        self.minor
    }

    /// Collection epoch this version belongs to.
    pub fn epoch(&self) -> Uuid {
        self.epoch
    }

    /// Whether two versions belong to the same collection incarnation.
    pub fn same_epoch(&self, other: &ChunkVersion) -> bool {
        self.epoch == other.epoch
    }

    /// Whether this version is older than `other`. An epoch mismatch always
    /// counts as older: the holder cannot trust anything it cached.
    pub fn is_older_than(&self, other: &ChunkVersion) -> bool {
        if !self.same_epoch(other) {
            return true;
        }
        (self.major, self.minor) < (other.major, other.minor)
    }

    /// The next major version (minor resets to zero).
    pub fn inc_major(&self) -> Self {
        Self {
            major: self.major + 1,
            minor: 0,
            epoch: self.epoch,
        }
    }

    /// The next minor version.
    pub fn inc_minor(&self) -> Self {
        Self {
            major: self.major,
            minor: self.minor + 1,
            epoch: self.epoch,
        }
    }
}

impl fmt::Display for ChunkVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}||{}", self.major, self.minor, self.epoch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_within_epoch() {
        let epoch = Uuid::new_v4();
        let v1 = ChunkVersion::new(1, 0, epoch);
        let v2 = ChunkVersion::new(1, 5, epoch);
        let v3 = ChunkVersion::new(2, 0, epoch);

        assert!(v1.is_older_than(&v2));
        assert!(v2.is_older_than(&v3));
        assert!(!v3.is_older_than(&v1));
        assert!(!v1.is_older_than(&v1));
    }

    #[test]
    fn test_epoch_mismatch_is_always_older() {
        let v_old = ChunkVersion::new(100, 0, Uuid::new_v4());
        let v_new = ChunkVersion::new(1, 0, Uuid::new_v4());

        // Both directions read as stale: there is no order across epochs.
        assert!(v_old.is_older_than(&v_new));
        assert!(v_new.is_older_than(&v_old));
    }

    #[test]
    fn test_increment() {
        let epoch = Uuid::new_v4();
        let v = ChunkVersion::new(3, 7, epoch);

        let major = v.inc_major();
        assert_eq!(major.major(), 4);
        assert_eq!(major.minor(), 0);
        assert_eq!(major.epoch(), epoch);

        let minor = v.inc_minor();
        assert_eq!(minor.major(), 3);
        assert_eq!(minor.minor(), 8);
    }

    #[test]
    fn test_unset() {
        let v = ChunkVersion::unset();
        assert!(!v.is_set());
        assert!(ChunkVersion::new(1, 0, Uuid::new_v4()).is_set());
    }
}
