//! Lock and ping documents, and the CRUD interface to the config store's
//! `locks` and `lockpings` collections.
//!
//! The catalog carries no locking logic; it is pure request/response
//! mapping. Everything lease-related lives in the manager.

use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// State of a lock document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockState {
    /// Nobody holds the lock.
    Unlocked,
    /// Held by the session in `lock_session_id`.
    Locked,
}

/// One row of the `locks` collection, keyed by resource name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockDocument {
    /// Resource name.
    pub name: String,
    /// Current state.
    pub state: LockState,
    /// Session that owns the LOCKED row.
    pub lock_session_id: Uuid,
    /// Human-readable holder identity.
    pub who: String,
    /// Process id of the holder.
    pub process: String,
    /// Config-server time when the lock was taken.
    pub when: SystemTime,
    /// Why the lock was taken.
    pub why: String,
}

/// One row of the `lockpings` collection, keyed by process id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingDocument {
    /// Process id.
    pub process: String,
    /// Config-server time of the last heartbeat.
    pub ping: SystemTime,
}

/// Config server identity and clock reading.
///
/// Both fields come from the config server itself: lease arithmetic
/// compares two of these readings, never a local clock.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigServerInfo {
    /// The config server's current time.
    pub server_time: SystemTime,
    /// Changes whenever the config server's primary changes.
    pub election_id: Uuid,
}

/// CRUD operations against the lock collections of the config store.
#[async_trait]
pub trait DistLockCatalog: Send + Sync + fmt::Debug {
    /// Conditional update UNLOCKED → LOCKED tagged with `session`.
    /// Fails with [`Error::LockStateChangeFailed`] when the row is held.
    async fn grab_lock(
        &self,
        name: &str,
        session: Uuid,
        who: &str,
        process: &str,
        why: &str,
    ) -> Result<LockDocument>;

    /// Conditional update matching either UNLOCKED or the `current_holder`
    /// session. Fails with [`Error::LockStateChangeFailed`] if a third
    /// party took the row in the meantime.
    async fn overtake_lock(
        &self,
        name: &str,
        session: Uuid,
        current_holder: Uuid,
        who: &str,
        process: &str,
        why: &str,
    ) -> Result<LockDocument>;

    /// Release the row if `session` still owns it; a no-op otherwise.
    async fn unlock(&self, session: Uuid, name: &str) -> Result<()>;

    /// Fetch the lock document for a resource.
    async fn get_lock_by_name(&self, name: &str) -> Result<LockDocument>;

    /// Fetch a process's ping document, if it ever pinged.
    async fn get_ping(&self, process: &str) -> Result<Option<PingDocument>>;

    /// Upsert the process's ping document, stamped with the config
    /// server's clock.
    async fn ping(&self, process: &str) -> Result<()>;

    /// Remove the process's ping document on clean shutdown.
    async fn stop_ping(&self, process: &str) -> Result<()>;

    /// The config server's current time and election id.
    async fn get_server_info(&self) -> Result<ConfigServerInfo>;
}

#[derive(Debug)]
struct CatalogDocuments {
    locks: HashMap<String, LockDocument>,
    pings: HashMap<String, SystemTime>,
    server_time: SystemTime,
    election_id: Uuid,
}

/// In-memory lock catalog with an explicit simulated server clock.
///
/// The clock only moves via [`advance_clock`](Self::advance_clock), so
/// lease-expiry behavior is fully deterministic in tests. A scriptable
/// failure counter models transient network errors on `grab_lock`.
#[derive(Debug)]
pub struct InMemoryDistLockCatalog {
    documents: Mutex<CatalogDocuments>,
    failing_grab_attempts: AtomicU32,
}

impl InMemoryDistLockCatalog {
    /// Create a catalog with the clock at a fixed base time.
    pub fn new() -> Self {
        Self {
            documents: Mutex::new(CatalogDocuments {
                locks: HashMap::new(),
                pings: HashMap::new(),
                // Arbitrary fixed base; only differences matter.
                server_time: UNIX_EPOCH + Duration::from_secs(1_000_000),
                election_id: Uuid::new_v4(),
            }),
            failing_grab_attempts: AtomicU32::new(0),
        }
    }

    /// Advance the simulated config server clock.
    pub fn advance_clock(&self, delta: Duration) {
        let mut documents = self.documents.lock();
        documents.server_time += delta;
    }

    /// Current simulated server time.
    pub fn server_time(&self) -> SystemTime {
        self.documents.lock().server_time
    }

    /// Simulate a config server election.
    pub fn set_election_id(&self, election_id: Uuid) {
        self.documents.lock().election_id = election_id;
    }

    /// Make the next `attempts` grab attempts fail with a network error.
    pub fn fail_next_grab_attempts(&self, attempts: u32) {
        self.failing_grab_attempts.store(attempts, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_grab_attempts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for InMemoryDistLockCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DistLockCatalog for InMemoryDistLockCatalog {
    async fn grab_lock(
        &self,
        name: &str,
        session: Uuid,
        who: &str,
        process: &str,
        why: &str,
    ) -> Result<LockDocument> {
        if self.take_injected_failure() {
            return Err(Error::Network("injected grab_lock failure".into()));
        }

        let mut documents = self.documents.lock();
        let when = documents.server_time;
        match documents.locks.get(name) {
            Some(existing) if existing.state == LockState::Locked => {
                Err(Error::LockStateChangeFailed(format!(
                    "{} is held by session {}",
                    name, existing.lock_session_id
                )))
            }
            _ => {
                let document = LockDocument {
                    name: name.to_string(),
                    state: LockState::Locked,
                    lock_session_id: session,
                    who: who.to_string(),
                    process: process.to_string(),
                    when,
                    why: why.to_string(),
                };
                documents.locks.insert(name.to_string(), document.clone());
                Ok(document)
            }
        }
    }

    async fn overtake_lock(
        &self,
        name: &str,
        session: Uuid,
        current_holder: Uuid,
        who: &str,
        process: &str,
        why: &str,
    ) -> Result<LockDocument> {
        let mut documents = self.documents.lock();
        let when = documents.server_time;
        let matches = match documents.locks.get(name) {
            None => true,
            Some(existing) => {
                existing.state == LockState::Unlocked
                    || existing.lock_session_id == current_holder
            }
        };
        if !matches {
            return Err(Error::LockStateChangeFailed(format!(
                "{}: holder changed since expiry was observed",
                name
            )));
        }

        let document = LockDocument {
            name: name.to_string(),
            state: LockState::Locked,
            lock_session_id: session,
            who: who.to_string(),
            process: process.to_string(),
            when,
            why: why.to_string(),
        };
        documents.locks.insert(name.to_string(), document.clone());
        Ok(document)
    }

    async fn unlock(&self, session: Uuid, name: &str) -> Result<()> {
        let mut documents = self.documents.lock();
        if let Some(existing) = documents.locks.get_mut(name) {
            if existing.state == LockState::Locked && existing.lock_session_id == session {
                existing.state = LockState::Unlocked;
            }
        }
        Ok(())
    }

    async fn get_lock_by_name(&self, name: &str) -> Result<LockDocument> {
        self.documents
            .lock()
            .locks
            .get(name)
            .cloned()
            .ok_or_else(|| Error::LockNotFound(name.to_string()))
    }

    async fn get_ping(&self, process: &str) -> Result<Option<PingDocument>> {
        Ok(self
            .documents
            .lock()
            .pings
            .get(process)
            .map(|ping| PingDocument {
                process: process.to_string(),
                ping: *ping,
            }))
    }

    async fn ping(&self, process: &str) -> Result<()> {
        let mut documents = self.documents.lock();
        let now = documents.server_time;
        documents.pings.insert(process.to_string(), now);
        Ok(())
    }

    async fn stop_ping(&self, process: &str) -> Result<()> {
        self.documents.lock().pings.remove(process);
        Ok(())
    }

    async fn get_server_info(&self) -> Result<ConfigServerInfo> {
        let documents = self.documents.lock();
        Ok(ConfigServerInfo {
            server_time: documents.server_time,
            election_id: documents.election_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_grab_and_unlock() {
        let catalog = InMemoryDistLockCatalog::new();
        let session = Uuid::new_v4();

        let doc = catalog
            .grab_lock("app.users", session, "proc-1:balancer", "proc-1", "testing")
            .await
            .unwrap();
        assert_eq!(doc.state, LockState::Locked);
        assert_eq!(doc.lock_session_id, session);

        // A second grab loses.
        let other = Uuid::new_v4();
        let result = catalog
            .grab_lock("app.users", other, "proc-2:balancer", "proc-2", "testing")
            .await;
        assert!(matches!(result, Err(Error::LockStateChangeFailed(_))));

        catalog.unlock(session, "app.users").await.unwrap();
        catalog
            .grab_lock("app.users", other, "proc-2:balancer", "proc-2", "testing")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unlock_with_wrong_session_is_noop() {
        let catalog = InMemoryDistLockCatalog::new();
        let session = Uuid::new_v4();
        catalog
            .grab_lock("app.users", session, "proc-1", "proc-1", "testing")
            .await
            .unwrap();

        catalog.unlock(Uuid::new_v4(), "app.users").await.unwrap();
        let doc = catalog.get_lock_by_name("app.users").await.unwrap();
        assert_eq!(doc.state, LockState::Locked);
        assert_eq!(doc.lock_session_id, session);
    }

    #[tokio::test]
    async fn test_overtake_requires_unchanged_holder() {
        let catalog = InMemoryDistLockCatalog::new();
        let holder = Uuid::new_v4();
        catalog
            .grab_lock("app.users", holder, "proc-1", "proc-1", "testing")
            .await
            .unwrap();

        // Overtake naming the observed holder succeeds.
        let taker = Uuid::new_v4();
        let doc = catalog
            .overtake_lock("app.users", taker, holder, "proc-2", "proc-2", "testing")
            .await
            .unwrap();
        assert_eq!(doc.lock_session_id, taker);

        // A second overtake still naming the original holder fails: the
        // row changed underneath it.
        let third = Uuid::new_v4();
        let result = catalog
            .overtake_lock("app.users", third, holder, "proc-3", "proc-3", "testing")
            .await;
        assert!(matches!(result, Err(Error::LockStateChangeFailed(_))));
    }

    #[tokio::test]
    async fn test_ping_uses_server_clock() {
        let catalog = InMemoryDistLockCatalog::new();
        catalog.ping("proc-1").await.unwrap();
        let first = catalog.get_ping("proc-1").await.unwrap().unwrap();

        catalog.advance_clock(Duration::from_secs(30));
        catalog.ping("proc-1").await.unwrap();
        let second = catalog.get_ping("proc-1").await.unwrap().unwrap();

        assert_eq!(
            second.ping.duration_since(first.ping).unwrap(),
            Duration::from_secs(30)
        );
    }

    #[tokio::test]
    async fn test_injected_network_failures() {
        let catalog = InMemoryDistLockCatalog::new();
        catalog.fail_next_grab_attempts(2);

        let session = Uuid::new_v4();
        for _ in 0..2 {
            let result = catalog
                .grab_lock("app.users", session, "proc-1", "proc-1", "testing")
                .await;
            assert!(matches!(result, Err(Error::Network(_))));
        }
        catalog
            .grab_lock("app.users", session, "proc-1", "proc-1", "testing")
            .await
            .unwrap();
    }
}
