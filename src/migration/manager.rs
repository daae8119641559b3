//! Migration manager: schedules, tracks, and recovers chunk migrations.
//!
//! Guarantees:
//!
//! - Every migration is durably recorded before its `moveChunk` is
//!   dispatched; the record store is the crash-recovery log.
//! - All concurrent migrations of one namespace share a single
//!   distributed lock, acquired before the first and released when the
//!   namespace's active set empties. Migrations of unrelated namespaces
//!   proceed fully in parallel.
//! - Interrupting cancels pending dispatches (never in-progress remote
//!   commits); draining blocks until the active set is empty.

use crate::config::MigrationConfig;
use crate::distlock::manager::{ReplSetDistLockManager, ScopedDistLock};
use crate::error::{Error, Result};
use crate::migration::runner::{MoveChunkRequest, MoveChunkSettings, ShardCommandRunner};
use crate::migration::store::{MigrationRecord, MigrationStore};
use crate::migration::MigrateInfo;
use crate::types::Namespace;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Lifecycle of the migration manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationManagerState {
    /// Not accepting migrations.
    Stopped,
    /// Reading the recovery log and re-acquiring collection locks.
    Recovering,
    /// Accepting and dispatching migrations.
    Enabled,
    /// Interrupted; waiting for the active set to drain.
    Stopping,
}

/// Counters for migration activity.
#[derive(Debug, Default)]
struct ManagerStats {
    scheduled: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    recovered: AtomicU64,
}

/// Point-in-time copy of the manager's counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationManagerStatsSnapshot {
    /// Migrations handed to the dispatcher.
    pub scheduled: u64,
    /// Migrations whose remote command succeeded.
    pub succeeded: u64,
    /// Migrations that ended in a terminal failure.
    pub failed: u64,
    /// Migrations re-discovered from the recovery log.
    pub recovered: u64,
}

/// Per-namespace active set: one distributed lock shared by `count`
/// in-flight migrations.
#[derive(Debug)]
struct ActiveMigrations {
    lock: ScopedDistLock,
    count: usize,
}

#[derive(Debug)]
struct ManagerInner {
    dist_lock: Arc<ReplSetDistLockManager>,
    store: Arc<dyn MigrationStore>,
    runner: Arc<dyn ShardCommandRunner>,
    config: MigrationConfig,
    /// Config connection string stamped into every moveChunk request.
    config_connection: String,
    /// One session id for the manager's lifetime, so recovery after an
    /// election re-acquires the same lock sessions.
    lock_session_id: Uuid,
    state: Mutex<MigrationManagerState>,
    active: Mutex<HashMap<Namespace, ActiveMigrations>>,
    /// Serializes per-namespace lock acquisition across schedulers.
    schedule_lock: tokio::sync::Mutex<()>,
    cancel: Mutex<CancellationToken>,
    /// Total in-flight migration tasks; drain waits for zero.
    inflight: watch::Sender<usize>,
    /// Locks re-acquired by `start_recovery`, consumed by `finish_recovery`.
    recovery_locks: Mutex<HashMap<Namespace, ScopedDistLock>>,
    /// Records awaiting re-dispatch by `finish_recovery`.
    recovery_records: Mutex<Vec<MigrationRecord>>,
    stats: ManagerStats,
}

/// The migration manager.
#[derive(Debug, Clone)]
pub struct MigrationManager {
    inner: Arc<ManagerInner>,
}

impl MigrationManager {
    /// Create a stopped manager. Run
    /// [`start_recovery`](Self::start_recovery) and
    /// [`finish_recovery`](Self::finish_recovery) to enable it.
    pub fn new(
        dist_lock: Arc<ReplSetDistLockManager>,
        store: Arc<dyn MigrationStore>,
        runner: Arc<dyn ShardCommandRunner>,
        config_connection: impl Into<String>,
        config: MigrationConfig,
    ) -> Self {
        let (inflight, _) = watch::channel(0);
        Self {
            inner: Arc::new(ManagerInner {
                dist_lock,
                store,
                runner,
                config,
                config_connection: config_connection.into(),
                lock_session_id: Uuid::new_v4(),
                state: Mutex::new(MigrationManagerState::Stopped),
                active: Mutex::new(HashMap::new()),
                schedule_lock: tokio::sync::Mutex::new(()),
                cancel: Mutex::new(CancellationToken::new()),
                inflight,
                recovery_locks: Mutex::new(HashMap::new()),
                recovery_records: Mutex::new(Vec::new()),
                stats: ManagerStats::default(),
            }),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> MigrationManagerState {
        *self.inner.state.lock()
    }

    /// Current counters.
    pub fn stats(&self) -> MigrationManagerStatsSnapshot {
        MigrationManagerStatsSnapshot {
            scheduled: self.inner.stats.scheduled.load(Ordering::Relaxed),
            succeeded: self.inner.stats.succeeded.load(Ordering::Relaxed),
            failed: self.inner.stats.failed.load(Ordering::Relaxed),
            recovered: self.inner.stats.recovered.load(Ordering::Relaxed),
        }
    }

    /// Read the recovery log and re-acquire the collection locks of every
    /// namespace with outstanding records.
    ///
    /// A namespace whose lock cannot be re-acquired is skipped (its
    /// records stay in the log for the next recovery pass); a store read
    /// failure aborts the whole pass and leaves the manager stopped.
    pub async fn start_recovery(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if *state != MigrationManagerState::Stopped {
                return Err(Error::ConflictingOperationInProgress(format!(
                    "migration manager is {:?}, expected Stopped",
                    *state
                )));
            }
            *state = MigrationManagerState::Recovering;
        }

        let records = match self.inner.store.load_all().await {
            Ok(records) => records,
            Err(e) => {
                *self.inner.state.lock() = MigrationManagerState::Stopped;
                return Err(e);
            }
        };

        let mut by_namespace: HashMap<Namespace, Vec<MigrationRecord>> = HashMap::new();
        for record in records {
            by_namespace.entry(record.nss.clone()).or_default().push(record);
        }

        for (nss, group) in by_namespace {
            info!(
                namespace = %nss,
                migrations = group.len(),
                "Recovery: re-acquiring collection lock for outstanding migrations"
            );
            let lock = self
                .inner
                .dist_lock
                .lock_with_session_id(
                    &nss.to_string(),
                    "Migrating chunk(s) in collection",
                    self.inner.lock_session_id,
                    self.inner.config.recovery_lock_timeout,
                )
                .await;
            match lock {
                Ok(lock) => {
                    self.inner.recovery_locks.lock().insert(nss, lock);
                    self.inner.recovery_records.lock().extend(group);
                }
                Err(e) => {
                    // Leave the records in the log; the next recovery
                    // pass (next election or restart) retries them.
                    error!(
                        namespace = %nss,
                        error = %e,
                        "Recovery: could not re-acquire collection lock, skipping namespace"
                    );
                }
            }
        }

        Ok(())
    }

    /// Enable the manager and re-dispatch every recovered migration using
    /// the locks already held by [`start_recovery`](Self::start_recovery).
    pub async fn finish_recovery(&self, settings: &MoveChunkSettings) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if *state != MigrationManagerState::Recovering {
                return Err(Error::ConflictingOperationInProgress(format!(
                    "migration manager is {:?}, expected Recovering",
                    *state
                )));
            }
            *state = MigrationManagerState::Enabled;
        }

        let records: Vec<MigrationRecord> =
            std::mem::take(&mut *self.inner.recovery_records.lock());
        let mut locks: HashMap<Namespace, ScopedDistLock> =
            std::mem::take(&mut *self.inner.recovery_locks.lock());

        let mut by_namespace: HashMap<Namespace, Vec<MigrationRecord>> = HashMap::new();
        for record in records {
            by_namespace.entry(record.nss.clone()).or_default().push(record);
        }

        for (nss, group) in by_namespace {
            let Some(lock) = locks.remove(&nss) else {
                continue;
            };

            let mut infos = Vec::new();
            for record in group {
                match record.to_migrate_info() {
                    Ok(info) => infos.push(info),
                    Err(e) => {
                        // The record stays in the log for the next pass.
                        error!(
                            record = %record.id,
                            error = %e,
                            "Recovery: unparsable migration record, skipping"
                        );
                    }
                }
            }

            if infos.is_empty() {
                self.inner.dist_lock.unlock(lock).await;
                continue;
            }

            self.inner.active.lock().insert(
                nss.clone(),
                ActiveMigrations {
                    lock,
                    count: infos.len(),
                },
            );

            for info in infos {
                info!(migration = %info, "Recovery: re-dispatching migration");
                self.inner.stats.recovered.fetch_add(1, Ordering::Relaxed);
                self.inner.inflight.send_modify(|n| *n += 1);
                let inner = Arc::clone(&self.inner);
                let settings = settings.clone();
                tokio::spawn(async move {
                    let name = info.name();
                    let status =
                        Self::run_migration(Arc::clone(&inner), info, settings, true).await;
                    if let Err(e) = &status {
                        warn!(migration = %name, error = %e, "Recovered migration failed");
                    }
                    Self::finish_one(&inner, status.is_ok());
                });
            }
        }

        // Any lock without a dispatchable record is released.
        for (_, lock) in locks {
            self.inner.dist_lock.unlock(lock).await;
        }

        Ok(())
    }

    /// Schedule every given migration and wait for all of them.
    ///
    /// Different namespaces run fully in parallel; migrations of the same
    /// namespace share one collection lock. Returns a per-migration
    /// status keyed by [`MigrateInfo::name`]; a sibling's failure never
    /// aborts the others.
    pub async fn execute_migrations_for_auto_balance(
        &self,
        migrations: Vec<MigrateInfo>,
        settings: &MoveChunkSettings,
    ) -> HashMap<String, Result<()>> {
        let mut results = HashMap::new();

        if self.state() != MigrationManagerState::Enabled {
            for info in migrations {
                results.insert(info.name(), Err(Error::BalancerInterrupted));
            }
            return results;
        }

        let mut tasks: JoinSet<(String, Result<()>)> = JoinSet::new();
        for info in migrations {
            self.inner.stats.scheduled.fetch_add(1, Ordering::Relaxed);
            self.inner.inflight.send_modify(|n| *n += 1);
            let inner = Arc::clone(&self.inner);
            let settings = settings.clone();
            tasks.spawn(async move {
                let name = info.name();
                let status = Self::run_migration(Arc::clone(&inner), info, settings, false).await;
                Self::finish_one(&inner, status.is_ok());
                (name, status)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, status)) => {
                    results.insert(name, status);
                }
                Err(e) => {
                    error!(error = %e, "Migration task panicked");
                }
            }
        }
        results
    }

    /// Dispatch a single migration and block until the remote command
    /// fully completes, including its wait-for-delete phase.
    pub async fn execute_manual_migration(
        &self,
        info: MigrateInfo,
        settings: &MoveChunkSettings,
    ) -> Result<()> {
        if self.state() != MigrationManagerState::Enabled {
            return Err(Error::BalancerInterrupted);
        }
        self.inner.stats.scheduled.fetch_add(1, Ordering::Relaxed);
        self.inner.inflight.send_modify(|n| *n += 1);
        let status =
            Self::run_migration(Arc::clone(&self.inner), info, settings.clone(), false).await;
        Self::finish_one(&self.inner, status.is_ok());
        status
    }

    /// Stop accepting migrations and cancel every dispatch that has not
    /// reached its remote command's point of commit.
    pub fn interrupt_and_disable_migrations(&self) {
        let mut state = self.inner.state.lock();
        match *state {
            MigrationManagerState::Enabled | MigrationManagerState::Recovering => {
                info!("Interrupting migration manager");
                *state = MigrationManagerState::Stopping;
                self.inner.cancel.lock().cancel();
            }
            _ => {}
        }
    }

    /// Block until the active migration set is empty, then declare the
    /// manager stopped. Guarantees no orphaned in-flight state remains.
    pub async fn drain_active_migrations(&self) {
        let mut inflight = self.inner.inflight.subscribe();
        let _ = inflight.wait_for(|&n| n == 0).await;

        // Recovery-held locks that were never consumed are released here.
        let leftover: Vec<ScopedDistLock> = {
            let mut locks = self.inner.recovery_locks.lock();
            self.inner.recovery_records.lock().clear();
            locks.drain().map(|(_, lock)| lock).collect()
        };
        for lock in leftover {
            self.inner.dist_lock.unlock(lock).await;
        }

        *self.inner.state.lock() = MigrationManagerState::Stopped;
        *self.inner.cancel.lock() = CancellationToken::new();
        info!("Migration manager drained and stopped");
    }

    fn finish_one(inner: &Arc<ManagerInner>, succeeded: bool) {
        if succeeded {
            inner.stats.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            inner.stats.failed.fetch_add(1, Ordering::Relaxed);
        }
        inner.inflight.send_modify(|n| *n -= 1);
    }

    /// The full life of one migration: collection lock, durable record,
    /// remote dispatch, record cleanup, lock release.
    async fn run_migration(
        inner: Arc<ManagerInner>,
        info: MigrateInfo,
        settings: MoveChunkSettings,
        preacquired: bool,
    ) -> Result<()> {
        if !preacquired {
            if let Err(e) = Self::join_collection_lock(&inner, &info.nss).await {
                return Err(e);
            }
        }

        let record = MigrationRecord::from_migrate_info(&info, settings.wait_for_delete);
        let status = Self::record_and_dispatch(&inner, &info, &record, settings, preacquired).await;

        Self::leave_collection_lock(&inner, &info.nss).await;
        status
    }

    async fn record_and_dispatch(
        inner: &Arc<ManagerInner>,
        info: &MigrateInfo,
        record: &MigrationRecord,
        settings: MoveChunkSettings,
        already_recorded: bool,
    ) -> Result<()> {
        // The durable record precedes the dispatch: a crash after this
        // point leaves a log entry for recovery to re-issue.
        if !already_recorded {
            inner.store.insert(record).await.map_err(|e| {
                Error::OperationFailed(format!(
                    "could not persist migration record for {}: {}",
                    info, e
                ))
            })?;
        }

        let request = MoveChunkRequest {
            nss: info.nss.clone(),
            range: info.range.clone(),
            from: info.from.clone(),
            to: info.to.clone(),
            version: info.version,
            config_connection: inner.config_connection.clone(),
            settings,
        };

        let cancel = inner.cancel.lock().clone();
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(Error::BalancerInterrupted),
            result = tokio::time::timeout(inner.config.move_timeout, inner.runner.move_chunk(&request)) => {
                match result {
                    Ok(result) => result,
                    Err(_) => Err(Error::OperationFailed(format!(
                        "moveChunk for {} timed out after {:?}",
                        info, inner.config.move_timeout
                    ))),
                }
            }
        };

        let status = Self::classify(info, outcome);

        // The record outlives an interruption so the next recovery pass
        // re-discovers the migration; any terminal outcome retires it.
        if !matches!(status, Err(Error::BalancerInterrupted)) {
            if let Err(e) = inner.store.remove(&record.id).await {
                warn!(
                    record = %record.id,
                    error = %e,
                    "Failed to remove completed migration record"
                );
            }
        }

        match &status {
            Ok(()) => info!(migration = %info, "Migration completed"),
            Err(e) => warn!(migration = %info, error = %e, "Migration did not complete"),
        }
        status
    }

    /// Classify the remote response per the error taxonomy: ChunkTooBig
    /// stays distinct (the caller splits and retries), stepdown-class
    /// errors become BalancerInterrupted, everything else is a terminal
    /// OperationFailed.
    fn classify(info: &MigrateInfo, outcome: Result<()>) -> Result<()> {
        match outcome {
            Ok(()) => Ok(()),
            Err(e @ Error::ChunkTooBig(_)) => Err(e),
            Err(Error::BalancerInterrupted) | Err(Error::Interrupted(_)) => {
                Err(Error::BalancerInterrupted)
            }
            Err(e) => Err(Error::OperationFailed(format!("{}: {}", info, e))),
        }
    }

    /// Join the namespace's active set, acquiring its collection lock if
    /// this is the first migration. Acquisition is a single attempt: if
    /// another process holds the collection, this migration fails rather
    /// than stalling the scheduler.
    async fn join_collection_lock(inner: &Arc<ManagerInner>, nss: &Namespace) -> Result<()> {
        let _serialize = inner.schedule_lock.lock().await;

        if let Some(entry) = inner.active.lock().get_mut(nss) {
            entry.count += 1;
            return Ok(());
        }

        let lock = inner
            .dist_lock
            .lock_with_session_id(
                &nss.to_string(),
                "Migrating chunk(s) in collection",
                inner.lock_session_id,
                Duration::ZERO,
            )
            .await
            .map_err(|e| {
                Error::OperationFailed(format!(
                    "could not acquire collection lock for {} to migrate chunks: {}",
                    nss, e
                ))
            })?;

        inner
            .active
            .lock()
            .insert(nss.clone(), ActiveMigrations { lock, count: 1 });
        Ok(())
    }

    /// Leave the namespace's active set; the last one out releases the
    /// collection lock.
    async fn leave_collection_lock(inner: &Arc<ManagerInner>, nss: &Namespace) {
        let released = {
            let mut active = inner.active.lock();
            match active.get_mut(nss) {
                Some(entry) if entry.count <= 1 => active.remove(nss),
                Some(entry) => {
                    entry.count -= 1;
                    None
                }
                None => None,
            }
        };
        if let Some(entry) = released {
            inner.dist_lock.unlock(entry.lock).await;
        }
    }
}
