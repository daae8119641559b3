//! Durable migration records.
//!
//! Every migration is written to the store *before* it is dispatched to a
//! shard; the store is therefore the crash-recovery log. Records are
//! removed when the remote command completes (success or terminal
//! failure) and retained across interruptions so the next recovery pass
//! re-discovers them.

use crate::catalog::chunk::KeyBound;
use crate::catalog::version::ChunkVersion;
use crate::error::{Error, Result};
use crate::migration::MigrateInfo;
use crate::types::{Namespace, ShardId};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::error;

/// One persisted migration, keyed by a deterministic id derived from
/// `(namespace, min key)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRecord {
    /// Record id; also the store key.
    pub id: String,
    /// Namespace of the chunk.
    pub nss: Namespace,
    /// Lower bound of the chunk's range.
    pub min: KeyBound,
    /// Upper bound of the chunk's range.
    pub max: KeyBound,
    /// Donor shard.
    pub from_shard: ShardId,
    /// Recipient shard.
    pub to_shard: ShardId,
    /// Chunk version at scheduling time.
    pub chunk_version: ChunkVersion,
    /// Whether the move waits for the donor's range deletion.
    pub wait_for_delete: bool,
}

impl MigrationRecord {
    /// Build the record for a planned migration.
    pub fn from_migrate_info(info: &MigrateInfo, wait_for_delete: bool) -> Self {
        Self {
            id: info.name(),
            nss: info.nss.clone(),
            min: info.range.min().clone(),
            max: info.range.max().clone(),
            from_shard: info.from.clone(),
            to_shard: info.to.clone(),
            chunk_version: info.version,
            wait_for_delete,
        }
    }

    /// Reconstruct the in-memory migration plan from the record.
    pub fn to_migrate_info(&self) -> Result<MigrateInfo> {
        let range = crate::catalog::chunk::ChunkRange::new(self.min.clone(), self.max.clone())
            .map_err(|e| Error::InvalidDocument(format!("migration record {}: {}", self.id, e)))?;
        Ok(MigrateInfo::new(
            self.nss.clone(),
            range,
            self.from_shard.clone(),
            self.to_shard.clone(),
            self.chunk_version,
        ))
    }
}

/// Durable storage for migration records.
#[async_trait]
pub trait MigrationStore: Send + Sync + fmt::Debug {
    /// Insert or overwrite a record. Writing the same id twice is
    /// idempotent by design: a re-dispatched recovery record keeps its key.
    async fn insert(&self, record: &MigrationRecord) -> Result<()>;

    /// Remove a record by id. Removing an absent id is not an error.
    async fn remove(&self, id: &str) -> Result<()>;

    /// Load every record.
    async fn load_all(&self) -> Result<Vec<MigrationRecord>>;
}

/// In-memory store for tests and embedded use.
#[derive(Debug, Default)]
pub struct InMemoryMigrationStore {
    records: Mutex<HashMap<String, MigrationRecord>>,
}

impl InMemoryMigrationStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently stored.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl MigrationStore for InMemoryMigrationStore {
    async fn insert(&self, record: &MigrationRecord) -> Result<()> {
        self.records
            .lock()
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.records.lock().remove(id);
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<MigrationRecord>> {
        let mut records: Vec<MigrationRecord> =
            self.records.lock().values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }
}

/// File-backed store: one bincode file per record, written to a temp file
/// and renamed for atomicity.
#[derive(Debug)]
pub struct FileMigrationStore {
    dir: PathBuf,
}

impl FileMigrationStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub async fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::Io(format!("failed to create {}: {}", dir.display(), e)))?;
        Ok(Self { dir })
    }

    fn record_path(&self, id: &str) -> PathBuf {
        // Record ids contain key bytes; encode to a filesystem-safe name.
        let mut name = String::with_capacity(id.len() * 2);
        for byte in id.as_bytes() {
            name.push_str(&format!("{:02x}", byte));
        }
        self.dir.join(format!("{}.bin", name))
    }
}

#[async_trait]
impl MigrationStore for FileMigrationStore {
    async fn insert(&self, record: &MigrationRecord) -> Result<()> {
        let path = self.record_path(&record.id);
        let tmp = path.with_extension("tmp");
        let bytes = bincode::serialize(record)?;

        let mut file = fs::File::create(&tmp)
            .await
            .map_err(|e| Error::Io(format!("create {}: {}", tmp.display(), e)))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| Error::Io(format!("write {}: {}", tmp.display(), e)))?;
        file.sync_all()
            .await
            .map_err(|e| Error::Io(format!("sync {}: {}", tmp.display(), e)))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| Error::Io(format!("rename {}: {}", path.display(), e)))?;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let path = self.record_path(id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(format!("remove {}: {}", path.display(), e))),
        }
    }

    async fn load_all(&self) -> Result<Vec<MigrationRecord>> {
        let mut records = Vec::new();
        let mut entries = fs::read_dir(&self.dir)
            .await
            .map_err(|e| Error::Io(format!("read {}: {}", self.dir.display(), e)))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::Io(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("bin") {
                continue;
            }
            let bytes = fs::read(&path)
                .await
                .map_err(|e| Error::Io(format!("read {}: {}", path.display(), e)))?;
            match bincode::deserialize::<MigrationRecord>(&bytes) {
                Ok(record) => records.push(record),
                Err(e) => {
                    // A malformed record aborts only that migration's
                    // recovery; the rest of the log still loads.
                    error!(
                        path = %path.display(),
                        error = %e,
                        "Skipping unparsable migration record"
                    );
                }
            }
        }

        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::chunk::ChunkRange;
    use uuid::Uuid;

    fn sample_record(coll: &str, min: &str) -> MigrationRecord {
        let info = MigrateInfo::new(
            Namespace::new("app", coll),
            ChunkRange::new(KeyBound::key(min), KeyBound::Max).unwrap(),
            ShardId::from("shard1"),
            ShardId::from("shard2"),
            ChunkVersion::new(1, 0, Uuid::new_v4()),
        );
        MigrationRecord::from_migrate_info(&info, false)
    }

    #[tokio::test]
    async fn test_in_memory_insert_is_idempotent() {
        let store = InMemoryMigrationStore::new();
        let record = sample_record("users", "a");
        store.insert(&record).await.unwrap();
        store.insert(&record).await.unwrap();
        assert_eq!(store.load_all().await.unwrap().len(), 1);

        store.remove(&record.id).await.unwrap();
        store.remove(&record.id).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileMigrationStore::new(dir.path()).await.unwrap();

        let a = sample_record("users", "a");
        let b = sample_record("orders", "k");
        store.insert(&a).await.unwrap();
        store.insert(&b).await.unwrap();

        // A fresh store over the same directory sees both records.
        let reopened = FileMigrationStore::new(dir.path()).await.unwrap();
        let loaded = reopened.load_all().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded.contains(&a));
        assert!(loaded.contains(&b));

        reopened.remove(&a.id).await.unwrap();
        assert_eq!(reopened.load_all().await.unwrap(), vec![b]);
    }

    #[tokio::test]
    async fn test_file_store_skips_corrupt_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileMigrationStore::new(dir.path()).await.unwrap();
        let record = sample_record("users", "a");
        store.insert(&record).await.unwrap();

        tokio::fs::write(dir.path().join("deadbeef.bin"), b"not bincode")
            .await
            .unwrap();

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded, vec![record]);
    }

    #[test]
    fn test_record_reconstructs_migrate_info() {
        let record = sample_record("users", "a");
        let info = record.to_migrate_info().unwrap();
        assert_eq!(info.name(), record.id);
        assert_eq!(info.from, record.from_shard);
    }

    #[test]
    fn test_inverted_record_is_invalid() {
        let mut record = sample_record("users", "a");
        record.min = KeyBound::Max;
        record.max = KeyBound::key("a");
        assert!(matches!(
            record.to_migrate_info(),
            Err(Error::InvalidDocument(_))
        ));
    }
}
