//! Lease-based distributed lock manager.
//!
//! Provides mutual exclusion on a named resource across processes, backed
//! by the durable lock catalog, without assuming synchronized clocks:
//!
//! - Acquisition retries with a fixed backoff until the caller's wait
//!   budget elapses; network failures get their own bounded retry budget.
//! - A holder that stops heartbeating can be overtaken once a full lease
//!   elapses with its ping value, session id, and the config server's
//!   election id all unchanged. Both timestamps in the lease arithmetic
//!   come from the config server's own clock.
//! - Unlocks that fail are queued and retried by the heartbeat task, never
//!   blocking the caller.

use crate::config::DistLockConfig;
use crate::distlock::catalog::{DistLockCatalog, LockDocument, LockState};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Cached observation of a lock holder's liveness signals.
///
/// Expiry is only ever declared by comparing a *later* observation against
/// this one: same ping value, same owning session, same election id, and a
/// config-server time difference of at least one lease. Any discontinuity
/// resets the window instead.
#[derive(Debug, Clone)]
struct DistLockPingInfo {
    process_id: String,
    last_ping: SystemTime,
    /// Config server clock at the time of this observation.
    config_local_time: SystemTime,
    lock_session_id: Uuid,
    election_id: Uuid,
}

#[derive(Debug)]
struct UnlockRequest {
    session: Uuid,
    name: String,
}

type UnlockQueue = Arc<Mutex<Vec<UnlockRequest>>>;

/// Guard representing one held distributed lock.
///
/// Dropping the guard enqueues a deferred unlock serviced by the heartbeat
/// task; [`ReplSetDistLockManager::unlock`] releases immediately instead.
#[derive(Debug)]
pub struct ScopedDistLock {
    name: String,
    session_id: Uuid,
    released: bool,
    queue: UnlockQueue,
}

impl ScopedDistLock {
    /// Resource name this lock covers.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Session id that owns the lock.
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }
}

impl Drop for ScopedDistLock {
    fn drop(&mut self) {
        if !self.released {
            debug!(name = %self.name, "Queueing deferred unlock for dropped lock guard");
            self.queue.lock().push(UnlockRequest {
                session: self.session_id,
                name: self.name.clone(),
            });
        }
    }
}

/// The replica-set distributed lock manager.
#[derive(Debug)]
pub struct ReplSetDistLockManager {
    process_id: String,
    config: DistLockConfig,
    catalog: Arc<dyn DistLockCatalog>,
    /// Liveness observations keyed by lock name.
    ping_history: Mutex<HashMap<String, DistLockPingInfo>>,
    unlock_queue: UnlockQueue,
    shutdown: CancellationToken,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl ReplSetDistLockManager {
    /// Create a manager for this process. Call [`start`](Self::start) to
    /// begin heartbeating.
    pub fn new(
        process_id: impl Into<String>,
        catalog: Arc<dyn DistLockCatalog>,
        config: DistLockConfig,
    ) -> Self {
        Self {
            process_id: process_id.into(),
            config,
            catalog,
            ping_history: Mutex::new(HashMap::new()),
            unlock_queue: Arc::new(Mutex::new(Vec::new())),
            shutdown: CancellationToken::new(),
            heartbeat: Mutex::new(None),
        }
    }

    /// This process's id as written into lock and ping documents.
    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    /// Spawn the heartbeat task: refreshes this process's ping document
    /// every ping interval and drains the deferred unlock queue.
    pub fn start(&self) {
        let catalog = Arc::clone(&self.catalog);
        let process_id = self.process_id.clone();
        let queue = Arc::clone(&self.unlock_queue);
        let token = self.shutdown.clone();
        let interval = self.config.ping_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = catalog.ping(&process_id).await {
                            warn!(process = %process_id, error = %e,
                                  "Failed to refresh lock ping document");
                        }
                        Self::drain_unlock_queue(&catalog, &queue).await;
                    }
                }
            }
        });
        *self.heartbeat.lock() = Some(handle);
    }

    /// Stop heartbeating, attempt the pending deferred unlocks one final
    /// time, and remove this process's ping document.
    pub async fn shut_down(&self) {
        self.shutdown.cancel();
        let handle = self.heartbeat.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        Self::drain_unlock_queue(&self.catalog, &self.unlock_queue).await;
        if let Err(e) = self.catalog.stop_ping(&self.process_id).await {
            warn!(process = %self.process_id, error = %e,
                  "Failed to remove ping document on shutdown");
        }
    }

    async fn drain_unlock_queue(catalog: &Arc<dyn DistLockCatalog>, queue: &UnlockQueue) {
        let pending: Vec<UnlockRequest> = std::mem::take(&mut *queue.lock());
        for request in pending {
            match catalog.unlock(request.session, &request.name).await {
                Ok(()) => {
                    info!(name = %request.name, "Deferred unlock completed");
                }
                Err(e) => {
                    warn!(name = %request.name, error = %e,
                          "Deferred unlock failed, will retry");
                    queue.lock().push(request);
                }
            }
        }
    }

    /// Acquire a lock with a freshly generated session id.
    pub async fn lock(
        &self,
        name: &str,
        why: &str,
        wait_for: Duration,
    ) -> Result<ScopedDistLock> {
        self.lock_with_session_id(name, why, Uuid::new_v4(), wait_for)
            .await
    }

    /// Acquire a lock under a caller-chosen session id.
    ///
    /// Retries with a fixed backoff until `wait_for` elapses. Network
    /// failures consume a separate bounded budget; lock-busy outcomes
    /// retry for as long as the caller is willing to wait. A `wait_for`
    /// of zero performs exactly one attempt (including, if the holder's
    /// lease has lapsed, one overtake attempt).
    pub async fn lock_with_session_id(
        &self,
        name: &str,
        why: &str,
        session: Uuid,
        wait_for: Duration,
    ) -> Result<ScopedDistLock> {
        let started = Instant::now();
        let who = format!("{}:{}", self.process_id, why);
        let mut network_attempts: u32 = 0;

        loop {
            let attempt = self
                .catalog
                .grab_lock(name, session, &who, &self.process_id, why)
                .await;

            match attempt {
                Ok(document) => {
                    info!(name, session = %session, why, "Acquired distributed lock");
                    return Ok(self.guard(document));
                }
                Err(Error::LockStateChangeFailed(_)) => {
                    // Held by someone else; see whether the holder's lease
                    // has lapsed and, if so, take the lock over.
                    match self.try_overtake(name, session, &who, why).await {
                        Ok(Some(document)) => {
                            info!(name, session = %session,
                                  "Overtook expired distributed lock");
                            return Ok(self.guard(document));
                        }
                        Ok(None) => {}
                        Err(e) if e.is_network() => {
                            network_attempts += 1;
                            if network_attempts >= self.config.max_network_attempts {
                                return Err(e);
                            }
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(e) if e.is_network() => {
                    network_attempts += 1;
                    if network_attempts >= self.config.max_network_attempts {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }

            let elapsed = started.elapsed();
            if elapsed >= wait_for {
                return Err(Error::LockBusy {
                    name: name.to_string(),
                    reason: format!("timed out after {:?} waiting for {}", elapsed, why),
                });
            }
            let remaining = wait_for - elapsed;
            tokio::time::sleep(self.config.lock_retry_interval.min(remaining)).await;
        }
    }

    /// Release a lock immediately. Falls back to the deferred queue when
    /// the catalog write fails.
    pub async fn unlock(&self, mut lock: ScopedDistLock) {
        lock.released = true;
        match self.catalog.unlock(lock.session_id, &lock.name).await {
            Ok(()) => {
                info!(name = %lock.name, "Released distributed lock");
            }
            Err(e) => {
                warn!(name = %lock.name, error = %e,
                      "Unlock failed, queueing for deferred retry");
                self.unlock_queue.lock().push(UnlockRequest {
                    session: lock.session_id,
                    name: lock.name.clone(),
                });
            }
        }
    }

    fn guard(&self, document: LockDocument) -> ScopedDistLock {
        ScopedDistLock {
            name: document.name,
            session_id: document.lock_session_id,
            released: false,
            queue: Arc::clone(&self.unlock_queue),
        }
    }

    /// If the current holder's lease has lapsed, attempt an overtake.
    /// `Ok(None)` means the lock is legitimately held (or a racer won).
    async fn try_overtake(
        &self,
        name: &str,
        session: Uuid,
        who: &str,
        why: &str,
    ) -> Result<Option<LockDocument>> {
        let current = match self.catalog.get_lock_by_name(name).await {
            Ok(document) => document,
            // The row vanished or was released; the next grab decides.
            Err(Error::LockNotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        if current.state == LockState::Unlocked {
            return Ok(None);
        }
        if !self.is_lock_expired(&current).await? {
            return Ok(None);
        }

        match self
            .catalog
            .overtake_lock(name, session, current.lock_session_id, who, &self.process_id, why)
            .await
        {
            Ok(document) => Ok(Some(document)),
            // Someone else grabbed or overtook it first.
            Err(Error::LockStateChangeFailed(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Decide whether the holder of `lock` has exceeded its lease.
    ///
    /// Uses only config-server clock readings, compared across two
    /// observations of identical (ping value, session id, election id).
    async fn is_lock_expired(&self, lock: &LockDocument) -> Result<bool> {
        let ping = self.catalog.get_ping(&lock.process).await?;
        // A holder that never pinged observes as a stable epoch value, so
        // it becomes overtakeable after one full lease window.
        let ping_value = ping.map(|p| p.ping).unwrap_or(UNIX_EPOCH);
        let server = self.catalog.get_server_info().await?;

        let mut history = self.ping_history.lock();
        let entry = history.get(&lock.name);

        let unchanged = entry.is_some_and(|info| {
            info.process_id == lock.process
                && info.last_ping == ping_value
                && info.lock_session_id == lock.lock_session_id
                && info.election_id == server.election_id
        });

        if !unchanged {
            // First observation of this holder, or a discontinuity (ping
            // advanced, owner changed, or the config primary changed):
            // restart the observation window.
            history.insert(
                lock.name.clone(),
                DistLockPingInfo {
                    process_id: lock.process.clone(),
                    last_ping: ping_value,
                    config_local_time: server.server_time,
                    lock_session_id: lock.lock_session_id,
                    election_id: server.election_id,
                },
            );
            return Ok(false);
        }

        let observed_at = history
            .get(&lock.name)
            .map(|info| info.config_local_time)
            .unwrap_or(server.server_time);
        let elapsed = server
            .server_time
            .duration_since(observed_at)
            .unwrap_or(Duration::ZERO);

        if elapsed >= self.config.lock_expiration {
            info!(
                name = %lock.name,
                holder = %lock.process,
                elapsed_secs = elapsed.as_secs(),
                "Lock holder exceeded its lease"
            );
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distlock::catalog::InMemoryDistLockCatalog;

    fn test_config() -> DistLockConfig {
        DistLockConfig::default()
            .with_ping_interval(Duration::from_millis(20))
            .with_lock_retry_interval(Duration::from_millis(10))
            .with_lock_expiration(Duration::from_secs(60))
    }

    fn manager(
        process: &str,
        catalog: &Arc<InMemoryDistLockCatalog>,
    ) -> Arc<ReplSetDistLockManager> {
        Arc::new(ReplSetDistLockManager::new(
            process,
            Arc::clone(catalog) as Arc<dyn DistLockCatalog>,
            test_config(),
        ))
    }

    #[tokio::test]
    async fn test_lock_and_unlock() {
        let catalog = Arc::new(InMemoryDistLockCatalog::new());
        let mgr = manager("proc-1", &catalog);

        let lock = mgr
            .lock("app.users", "migrating chunk(s)", Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(lock.name(), "app.users");

        mgr.unlock(lock).await;
        let doc = catalog.get_lock_by_name("app.users").await.unwrap();
        assert_eq!(doc.state, LockState::Unlocked);
    }

    #[tokio::test]
    async fn test_mutual_exclusion() {
        let catalog = Arc::new(InMemoryDistLockCatalog::new());
        let mgr_a = manager("proc-a", &catalog);
        let mgr_b = manager("proc-b", &catalog);

        let session_a = Uuid::new_v4();
        let session_b = Uuid::new_v4();

        let (result_a, result_b) = tokio::join!(
            mgr_a.lock_with_session_id("app.users", "balance", session_a, Duration::from_millis(50)),
            mgr_b.lock_with_session_id("app.users", "balance", session_b, Duration::from_millis(50)),
        );

        // Exactly one side wins; the loser times out busy.
        let winners = [result_a.is_ok(), result_b.is_ok()]
            .iter()
            .filter(|&&ok| ok)
            .count();
        assert_eq!(winners, 1);

        let held = catalog.get_lock_by_name("app.users").await.unwrap();
        let winner_session = if result_a.is_ok() { session_a } else { session_b };
        assert_eq!(held.lock_session_id, winner_session);

        let loser = if result_a.is_ok() { result_b } else { result_a };
        assert!(matches!(loser, Err(Error::LockBusy { .. })));
    }

    #[tokio::test]
    async fn test_busy_lock_acquired_after_release() {
        let catalog = Arc::new(InMemoryDistLockCatalog::new());
        let mgr = manager("proc-1", &catalog);

        let held = mgr.lock("app.users", "first", Duration::ZERO).await.unwrap();

        let mgr2 = manager("proc-2", &catalog);
        let waiter = {
            let mgr2 = Arc::clone(&mgr2);
            tokio::spawn(async move {
                mgr2.lock("app.users", "second", Duration::from_secs(5)).await
            })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        mgr.unlock(held).await;

        let lock = waiter.await.unwrap().unwrap();
        assert_eq!(lock.name(), "app.users");
    }

    #[tokio::test]
    async fn test_network_failures_have_bounded_retries() {
        let catalog = Arc::new(InMemoryDistLockCatalog::new());
        let mgr = manager("proc-1", &catalog);

        // More consecutive failures than the retry budget.
        catalog.fail_next_grab_attempts(10);
        let result = mgr.lock("app.users", "testing", Duration::from_secs(5)).await;
        assert!(matches!(result, Err(Error::Network(_))));

        // Fewer than the budget: the call rides through them.
        catalog.fail_next_grab_attempts(2);
        let lock = mgr.lock("app.users", "testing", Duration::from_secs(5)).await;
        assert!(lock.is_ok());
    }

    #[tokio::test]
    async fn test_lease_expiry_overtake() {
        let catalog = Arc::new(InMemoryDistLockCatalog::new());
        let dead = manager("proc-dead", &catalog);
        catalog.ping("proc-dead").await.unwrap();
        let _held = dead
            .lock("app.users", "crashed holder", Duration::ZERO)
            .await
            .unwrap();

        let taker = manager("proc-live", &catalog);

        // First attempt records the observation window and fails busy.
        let first = taker.lock("app.users", "takeover", Duration::ZERO).await;
        assert!(matches!(first, Err(Error::LockBusy { .. })));

        // The holder never pings again; one full lease elapses on the
        // config server's clock.
        catalog.advance_clock(Duration::from_secs(61));

        let lock = taker
            .lock("app.users", "takeover", Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(lock.name(), "app.users");
    }

    #[tokio::test]
    async fn test_ping_discontinuity_resets_observation() {
        let catalog = Arc::new(InMemoryDistLockCatalog::new());
        let holder = manager("proc-holder", &catalog);
        catalog.ping("proc-holder").await.unwrap();
        let _held = holder
            .lock("app.users", "alive holder", Duration::ZERO)
            .await
            .unwrap();

        let taker = manager("proc-taker", &catalog);
        let first = taker.lock("app.users", "takeover", Duration::ZERO).await;
        assert!(first.is_err());

        // The holder pings again before the lease elapses: the window
        // restarts, so a full lease after the *new* ping still denies the
        // overtake.
        catalog.advance_clock(Duration::from_secs(30));
        catalog.ping("proc-holder").await.unwrap();
        catalog.advance_clock(Duration::from_secs(31));

        let second = taker.lock("app.users", "takeover", Duration::ZERO).await;
        assert!(matches!(second, Err(Error::LockBusy { .. })));

        // Only after a full lease with no further pings does it succeed.
        catalog.advance_clock(Duration::from_secs(61));
        let third = taker.lock("app.users", "takeover", Duration::ZERO).await;
        assert!(third.is_ok());
    }

    #[tokio::test]
    async fn test_election_change_resets_observation() {
        let catalog = Arc::new(InMemoryDistLockCatalog::new());
        let holder = manager("proc-holder", &catalog);
        catalog.ping("proc-holder").await.unwrap();
        let _held = holder
            .lock("app.users", "holder", Duration::ZERO)
            .await
            .unwrap();

        let taker = manager("proc-taker", &catalog);
        assert!(taker.lock("app.users", "takeover", Duration::ZERO).await.is_err());

        // A config-server election invalidates the elapsed window even
        // though the ping value never changed.
        catalog.advance_clock(Duration::from_secs(61));
        catalog.set_election_id(Uuid::new_v4());
        assert!(taker.lock("app.users", "takeover", Duration::ZERO).await.is_err());

        // Stable election across the next full lease: overtake succeeds.
        catalog.advance_clock(Duration::from_secs(61));
        assert!(taker.lock("app.users", "takeover", Duration::ZERO).await.is_ok());
    }

    #[tokio::test]
    async fn test_overtake_loses_to_concurrent_grab() {
        let catalog = Arc::new(InMemoryDistLockCatalog::new());
        let dead = manager("proc-dead", &catalog);
        let _held = dead
            .lock("app.users", "crashed", Duration::ZERO)
            .await
            .unwrap();

        let taker = manager("proc-taker", &catalog);
        assert!(taker.lock("app.users", "takeover", Duration::ZERO).await.is_err());
        catalog.advance_clock(Duration::from_secs(61));

        // A third party takes the row between the expiry observation and
        // the overtake: the conditional update no longer matches.
        let racer_session = Uuid::new_v4();
        catalog
            .overtake_lock(
                "app.users",
                racer_session,
                _held.session_id(),
                "proc-racer",
                "proc-racer",
                "raced",
            )
            .await
            .unwrap();

        let result = taker.lock("app.users", "takeover", Duration::ZERO).await;
        assert!(matches!(result, Err(Error::LockBusy { .. })));
        let doc = catalog.get_lock_by_name("app.users").await.unwrap();
        assert_eq!(doc.lock_session_id, racer_session);
    }

    #[tokio::test]
    async fn test_heartbeat_pings_and_drains_deferred_unlocks() {
        let catalog = Arc::new(InMemoryDistLockCatalog::new());
        let mgr = manager("proc-1", &catalog);
        mgr.start();

        let lock = mgr.lock("app.users", "scoped", Duration::ZERO).await.unwrap();
        drop(lock); // deferred unlock via the queue

        tokio::time::sleep(Duration::from_millis(100)).await;

        let ping = catalog.get_ping("proc-1").await.unwrap();
        assert!(ping.is_some());
        let doc = catalog.get_lock_by_name("app.users").await.unwrap();
        assert_eq!(doc.state, LockState::Unlocked);

        mgr.shut_down().await;
        assert!(catalog.get_ping("proc-1").await.unwrap().is_none());
    }
}
