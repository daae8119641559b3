//! Balancer: the control loop correcting chunk imbalance.
//!
//! Lifecycle: `Stopped → Running → Stopping → Stopped`. One round =
//! refresh settings → should-balance check → enforce zone-boundary splits
//! → select candidate chunks → dispatch through the migration manager →
//! classify results. A productive round is followed by a short sleep to
//! keep rebalancing momentum; an idle round by the default interval.
//!
//! A `ChunkTooBig` response is progress, not failure: the balancer issues
//! a corrective split so future rounds can move the pieces, and only if
//! the split itself fails is the chunk marked jumbo and excluded from
//! selection.

pub mod policy;
pub mod settings;

pub use policy::{
    ChunkSelectionPolicy, DefaultChunkSelectionPolicy, SplitCandidate, ZoneRange,
};
pub use settings::{
    BalancerConfiguration, BalancerMode, BalancerSettings, BalancerSettingsSource,
    InMemorySettingsSource,
};

use crate::catalog::cache::CatalogCache;
use crate::config::BalancerConfig;
use crate::error::{Error, Result};
use crate::migration::manager::MigrationManager;
use crate::migration::runner::ShardCommandRunner;
use crate::migration::MigrateInfo;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle of the balancer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalancerState {
    /// No background round loop.
    Stopped,
    /// Round loop running.
    Running,
    /// Interrupted; waiting for the loop and the migration manager to
    /// wind down.
    Stopping,
}

/// Administrative report of balancer activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalancerRoundReport {
    /// Mode under the currently cached settings.
    pub mode: BalancerMode,
    /// Whether a round is executing right now.
    pub in_balancer_round: bool,
    /// Rounds completed since the balancer started.
    pub num_balancer_rounds: u64,
}

#[derive(Debug)]
struct BalancerInner {
    config: BalancerConfig,
    configuration: Arc<BalancerConfiguration>,
    catalog: CatalogCache,
    policy: Arc<dyn ChunkSelectionPolicy>,
    migration_manager: MigrationManager,
    runner: Arc<dyn ShardCommandRunner>,
    state: Mutex<BalancerState>,
    cancel: Mutex<CancellationToken>,
    main_task: Mutex<Option<JoinHandle<()>>>,
    interrupt_task: Mutex<Option<JoinHandle<()>>>,
    in_round: AtomicBool,
    rounds: AtomicU64,
}

/// The balancer.
#[derive(Debug, Clone)]
pub struct Balancer {
    inner: Arc<BalancerInner>,
}

impl Balancer {
    /// Create a stopped balancer. The balancer owns its migration
    /// manager; the catalog cache and runner handles are shared with it.
    pub fn new(
        config: BalancerConfig,
        configuration: Arc<BalancerConfiguration>,
        catalog: CatalogCache,
        policy: Arc<dyn ChunkSelectionPolicy>,
        migration_manager: MigrationManager,
        runner: Arc<dyn ShardCommandRunner>,
    ) -> Self {
        Self {
            inner: Arc::new(BalancerInner {
                config,
                configuration,
                catalog,
                policy,
                migration_manager,
                runner,
                state: Mutex::new(BalancerState::Stopped),
                cancel: Mutex::new(CancellationToken::new()),
                main_task: Mutex::new(None),
                interrupt_task: Mutex::new(None),
                in_round: AtomicBool::new(false),
                rounds: AtomicU64::new(0),
            }),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> BalancerState {
        *self.inner.state.lock()
    }

    /// Current round report.
    pub fn report(&self) -> BalancerRoundReport {
        BalancerRoundReport {
            mode: self.inner.configuration.settings().mode,
            in_balancer_round: self.inner.in_round.load(Ordering::Acquire),
            num_balancer_rounds: self.inner.rounds.load(Ordering::Acquire),
        }
    }

    /// Run migration-manager recovery and start the background round
    /// loop.
    pub async fn initiate(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if *state != BalancerState::Stopped {
                return Err(Error::ConflictingOperationInProgress(format!(
                    "balancer is {:?}, expected Stopped",
                    *state
                )));
            }
            *state = BalancerState::Running;
            *self.inner.cancel.lock() = CancellationToken::new();
        }

        if let Err(e) = self.inner.configuration.refresh().await {
            warn!(error = %e, "Could not refresh balancer settings at startup");
        }
        let settings = self.inner.configuration.settings();

        let recovery = async {
            self.inner.migration_manager.start_recovery().await?;
            self.inner
                .migration_manager
                .finish_recovery(&settings.move_settings())
                .await
        };
        if let Err(e) = recovery.await {
            *self.inner.state.lock() = BalancerState::Stopped;
            return Err(e);
        }

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(Self::main_loop(inner));
        *self.inner.main_task.lock() = Some(handle);
        Ok(())
    }

    /// Interrupt the balancer. Cancels the round loop and spawns a
    /// separate task to interrupt and drain the migration manager, so the
    /// caller (which may be blocked on the same locks during a step-down)
    /// never waits on the drain itself.
    pub fn interrupt(&self) {
        {
            let mut state = self.inner.state.lock();
            if *state != BalancerState::Running {
                return;
            }
            *state = BalancerState::Stopping;
        }
        info!("Interrupting balancer");
        self.inner.cancel.lock().cancel();

        let migration_manager = self.inner.migration_manager.clone();
        let handle = tokio::spawn(async move {
            migration_manager.interrupt_and_disable_migrations();
            migration_manager.drain_active_migrations().await;
        });
        *self.inner.interrupt_task.lock() = Some(handle);
    }

    /// Wait for the round loop and the migration-manager drain to finish,
    /// then declare the balancer stopped.
    pub async fn await_stopped(&self) {
        let main = self.inner.main_task.lock().take();
        if let Some(handle) = main {
            let _ = handle.await;
        }
        let interrupt = self.inner.interrupt_task.lock().take();
        if let Some(handle) = interrupt {
            let _ = handle.await;
        }
        *self.inner.state.lock() = BalancerState::Stopped;
        info!("Balancer stopped");
    }

    /// Execute an administrator-requested chunk move. Blocks until the
    /// remote command fully completes, including its wait-for-delete
    /// phase.
    pub async fn request_manual_migration(&self, info: MigrateInfo) -> Result<()> {
        let mut settings = self.inner.configuration.settings().move_settings();
        settings.wait_for_delete = true;

        let nss = info.nss.clone();
        let result = self
            .inner
            .migration_manager
            .execute_manual_migration(info, &settings)
            .await;
        if result.is_ok() {
            self.inner.catalog.invalidate_sharded_collection(&nss);
        }
        result
    }

    async fn main_loop(inner: Arc<BalancerInner>) {
        info!("Balancer round loop started");
        let cancel = inner.cancel.lock().clone();

        loop {
            if cancel.is_cancelled() {
                break;
            }

            inner.in_round.store(true, Ordering::Release);
            let did_work = match Self::balance_round(&inner).await {
                Ok(actions) => actions > 0,
                Err(e) if e.is_stepdown_class() => {
                    debug!(error = %e, "Balancer round interrupted");
                    false
                }
                Err(e) => {
                    warn!(error = %e, "Balancer round failed");
                    false
                }
            };
            inner.in_round.store(false, Ordering::Release);
            inner.rounds.fetch_add(1, Ordering::AcqRel);

            let pause = if did_work {
                inner.config.short_round_interval
            } else {
                inner.config.round_interval
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
        info!("Balancer round loop exiting");
    }

    /// One balancer round. Returns the number of effective actions
    /// (successful moves and splits).
    async fn balance_round(inner: &Arc<BalancerInner>) -> Result<usize> {
        inner.configuration.refresh().await?;
        if !inner.configuration.should_balance() {
            debug!("Balancing is disabled; skipping round");
            return Ok(0);
        }
        let settings = inner.configuration.settings();
        let mut actions = 0;

        // Chunks straddling a zone boundary must be split before any of
        // their pieces can be placed correctly.
        for candidate in inner.policy.select_chunks_to_split().await? {
            match inner
                .runner
                .split_chunk(&candidate.nss, &candidate.range, &candidate.split_points)
                .await
            {
                Ok(()) => {
                    info!(
                        namespace = %candidate.nss,
                        range = %candidate.range,
                        "Split chunk at zone boundary"
                    );
                    inner.catalog.invalidate_sharded_collection(&candidate.nss);
                    actions += 1;
                }
                Err(e) => {
                    warn!(
                        namespace = %candidate.nss,
                        range = %candidate.range,
                        error = %e,
                        "Zone-boundary split failed"
                    );
                }
            }
        }

        let candidates = inner.policy.select_chunks_to_move().await?;
        if candidates.is_empty() {
            return Ok(actions);
        }
        info!(count = candidates.len(), "Balancer selected chunks to move");

        let by_name: HashMap<String, MigrateInfo> = candidates
            .iter()
            .map(|c| (c.name(), c.clone()))
            .collect();
        let results = inner
            .migration_manager
            .execute_migrations_for_auto_balance(candidates, &settings.move_settings())
            .await;

        for (name, status) in results {
            let Some(info) = by_name.get(&name) else {
                continue;
            };
            match status {
                Ok(()) => {
                    inner.catalog.invalidate_sharded_collection(&info.nss);
                    actions += 1;
                }
                Err(Error::ChunkTooBig(_)) => {
                    // Not an error for the control loop: split so future
                    // rounds can migrate the pieces.
                    actions += Self::split_oversized_chunk(inner, info).await;
                }
                Err(Error::BalancerInterrupted) => {
                    debug!(migration = %info, "Migration interrupted; retrying next round");
                }
                Err(e) => {
                    warn!(migration = %info, error = %e, "Migration failed");
                }
            }
        }

        Ok(actions)
    }

    /// Corrective split after a ChunkTooBig response. The shard picks the
    /// split points. If even the split fails the chunk is genuinely
    /// indivisible: mark it jumbo so selection stops proposing it.
    async fn split_oversized_chunk(inner: &Arc<BalancerInner>, info: &MigrateInfo) -> usize {
        match inner.runner.split_chunk(&info.nss, &info.range, &[]).await {
            Ok(()) => {
                info!(
                    namespace = %info.nss,
                    range = %info.range,
                    "Split chunk that was too big to move"
                );
                inner.catalog.invalidate_sharded_collection(&info.nss);
                1
            }
            Err(e) => {
                warn!(
                    namespace = %info.nss,
                    range = %info.range,
                    error = %e,
                    "Chunk is indivisible; marking jumbo"
                );
                inner
                    .policy
                    .mark_jumbo(&info.nss, info.range.min().clone());
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::chunk::{ChunkRange, KeyBound};
    use crate::catalog::loader::{CatalogCacheLoader, InMemoryConfigCatalog};
    use crate::config::{CatalogCacheConfig, DistLockConfig, MigrationConfig};
    use crate::distlock::catalog::{DistLockCatalog, InMemoryDistLockCatalog, LockState};
    use crate::distlock::manager::ReplSetDistLockManager;
    use crate::migration::runner::RecordingShardRunner;
    use crate::migration::store::{InMemoryMigrationStore, MigrationStore};
    use crate::topology::{ShardDescription, ShardRegistry};
    use crate::types::{Namespace, ShardId};
    use std::time::Duration;

    struct Fixture {
        config_catalog: Arc<InMemoryConfigCatalog>,
        lock_catalog: Arc<InMemoryDistLockCatalog>,
        store: Arc<InMemoryMigrationStore>,
        runner: Arc<RecordingShardRunner>,
        settings_source: Arc<InMemorySettingsSource>,
        catalog: CatalogCache,
        policy: Arc<DefaultChunkSelectionPolicy>,
        registry: Arc<ShardRegistry>,
        balancer: Balancer,
        nss: Namespace,
    }

    /// Three shards; four chunks skewed 3-1-0 onto shard1/shard2.
    fn fixture() -> Fixture {
        let config_catalog = Arc::new(InMemoryConfigCatalog::new());
        config_catalog.add_database("app", ShardId::from("shard1"), true);
        let nss = Namespace::new("app", "users");
        config_catalog
            .shard_collection(
                nss.clone(),
                "{ user_id: 1 }",
                vec![
                    (
                        ChunkRange::new(KeyBound::Min, KeyBound::key("g")).unwrap(),
                        ShardId::from("shard1"),
                    ),
                    (
                        ChunkRange::new(KeyBound::key("g"), KeyBound::key("m")).unwrap(),
                        ShardId::from("shard1"),
                    ),
                    (
                        ChunkRange::new(KeyBound::key("m"), KeyBound::key("t")).unwrap(),
                        ShardId::from("shard1"),
                    ),
                    (
                        ChunkRange::new(KeyBound::key("t"), KeyBound::Max).unwrap(),
                        ShardId::from("shard2"),
                    ),
                ],
            )
            .unwrap();

        let registry = Arc::new(ShardRegistry::new());
        for shard in ["shard1", "shard2", "shard3"] {
            registry.add_shard(ShardDescription::new(ShardId::from(shard)));
        }

        let lock_catalog = Arc::new(InMemoryDistLockCatalog::new());
        let dist_lock = Arc::new(ReplSetDistLockManager::new(
            "config-primary",
            Arc::clone(&lock_catalog) as Arc<dyn DistLockCatalog>,
            DistLockConfig::default().with_lock_retry_interval(Duration::from_millis(10)),
        ));

        let store = Arc::new(InMemoryMigrationStore::new());
        let runner = Arc::new(RecordingShardRunner::with_catalog(Arc::clone(
            &config_catalog,
        )));
        let migration_manager = MigrationManager::new(
            dist_lock,
            Arc::clone(&store) as Arc<dyn MigrationStore>,
            Arc::clone(&runner) as Arc<dyn ShardCommandRunner>,
            "config/cfg1,cfg2,cfg3",
            MigrationConfig::default(),
        );

        let catalog = CatalogCache::new(
            Arc::clone(&config_catalog) as Arc<dyn CatalogCacheLoader>,
            CatalogCacheConfig::default(),
        );
        let policy = Arc::new(DefaultChunkSelectionPolicy::new(
            catalog.clone(),
            Arc::clone(&config_catalog) as Arc<dyn CatalogCacheLoader>,
            Arc::clone(&registry),
        ));

        let settings_source = Arc::new(InMemorySettingsSource::new());
        let configuration = Arc::new(BalancerConfiguration::new(
            Arc::clone(&settings_source) as Arc<dyn BalancerSettingsSource>,
        ));

        let balancer = Balancer::new(
            BalancerConfig::default()
                .with_round_interval(Duration::from_millis(50))
                .with_short_round_interval(Duration::from_millis(10)),
            configuration,
            catalog.clone(),
            Arc::clone(&policy) as Arc<dyn ChunkSelectionPolicy>,
            migration_manager,
            Arc::clone(&runner) as Arc<dyn ShardCommandRunner>,
        );

        Fixture {
            config_catalog,
            lock_catalog,
            store,
            runner,
            settings_source,
            catalog,
            policy,
            registry,
            balancer,
            nss,
        }
    }

    /// Enable the migration manager without starting the round loop.
    async fn enable_manager(fx: &Fixture) {
        fx.balancer.inner.configuration.refresh().await.unwrap();
        fx.balancer.inner.migration_manager.start_recovery().await.unwrap();
        fx.balancer
            .inner
            .migration_manager
            .finish_recovery(&fx.balancer.inner.configuration.settings().move_settings())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_round_moves_chunk_off_overloaded_shard() {
        let fx = fixture();
        enable_manager(&fx).await;

        let before = fx.catalog.get_sharded_routing_table(&fx.nss).await.unwrap();
        let actions = Balancer::balance_round(&fx.balancer.inner).await.unwrap();
        assert_eq!(actions, 1);

        // One moveChunk dispatched from the overloaded shard to the empty
        // one; the record is retired and the collection lock is released.
        let moves = fx.runner.dispatched_moves();
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].from, ShardId::from("shard1"));
        assert_eq!(moves[0].to, ShardId::from("shard3"));
        assert!(fx.store.is_empty());
        let lock = fx.lock_catalog.get_lock_by_name("app.users").await.unwrap();
        assert_eq!(lock.state, LockState::Unlocked);

        // The cache observes the new owner with a bumped version.
        let after = fx.catalog.get_sharded_routing_table(&fx.nss).await.unwrap();
        let moved_min = moves[0].range.min().clone();
        let owner = after
            .chunks()
            .find(|c| *c.min() == moved_min)
            .unwrap()
            .shard()
            .clone();
        assert_eq!(owner, ShardId::from("shard3"));
        assert!(before.version().is_older_than(&after.version()));
        assert_eq!(after.epoch(), before.epoch());
    }

    #[tokio::test]
    async fn test_rounds_converge_to_balance() {
        let fx = fixture();
        enable_manager(&fx).await;

        for _ in 0..6 {
            Balancer::balance_round(&fx.balancer.inner).await.unwrap();
        }

        let table = fx.catalog.get_sharded_routing_table(&fx.nss).await.unwrap();
        let counts: Vec<usize> = ["shard1", "shard2", "shard3"]
            .iter()
            .map(|s| table.chunks_on_shard(&ShardId::from(*s)).len())
            .collect();
        let max = counts.iter().max().unwrap();
        let min = counts.iter().min().unwrap();
        assert!(max - min < 2, "still skewed: {:?}", counts);
    }

    #[tokio::test]
    async fn test_disabled_mode_skips_round() {
        let fx = fixture();
        enable_manager(&fx).await;

        fx.settings_source.set_mode(BalancerMode::Off);
        let actions = Balancer::balance_round(&fx.balancer.inner).await.unwrap();
        assert_eq!(actions, 0);
        assert!(fx.runner.dispatched_moves().is_empty());
    }

    #[tokio::test]
    async fn test_chunk_too_big_triggers_corrective_split() {
        let fx = fixture();
        enable_manager(&fx).await;

        fx.runner
            .fail_next_move(&fx.nss, KeyBound::Min, Error::ChunkTooBig("90 MiB".into()));
        fx.runner
            .set_auto_split_points(&fx.nss, KeyBound::Min, vec![KeyBound::key("c")]);

        let actions = Balancer::balance_round(&fx.balancer.inner).await.unwrap();
        assert_eq!(actions, 1);

        // The split was issued for the oversized chunk and committed, so
        // the next table has five chunks and nothing is jumbo.
        let splits = fx.runner.dispatched_splits();
        assert_eq!(splits.len(), 1);
        assert_eq!(*splits[0].1.min(), KeyBound::Min);
        let table = fx.catalog.get_sharded_routing_table(&fx.nss).await.unwrap();
        assert_eq!(table.num_chunks(), 5);

        // The pieces remain movable in later rounds.
        let moves = fx.policy.select_chunks_to_move().await.unwrap();
        assert!(!moves.is_empty());
    }

    #[tokio::test]
    async fn test_failed_split_marks_chunk_jumbo() {
        let fx = fixture();
        enable_manager(&fx).await;

        fx.runner
            .fail_next_move(&fx.nss, KeyBound::Min, Error::ChunkTooBig("90 MiB".into()));
        fx.runner.fail_next_split(
            &fx.nss,
            KeyBound::Min,
            Error::OperationFailed("single-key chunk".into()),
        );

        let actions = Balancer::balance_round(&fx.balancer.inner).await.unwrap();
        assert_eq!(actions, 0);

        // The next round selects a different chunk; the jumbo one is
        // excluded.
        let moves = fx.policy.select_chunks_to_move().await.unwrap();
        assert_eq!(moves.len(), 1);
        assert_ne!(*moves[0].range.min(), KeyBound::Min);
    }

    #[tokio::test]
    async fn test_zone_boundary_split_enforced_before_moves() {
        let fx = fixture();
        enable_manager(&fx).await;

        fx.registry.add_shard_to_zone(&ShardId::from("shard3"), "eu");
        fx.policy.set_zone_ranges(
            &fx.nss,
            vec![ZoneRange {
                range: ChunkRange::new(KeyBound::Min, KeyBound::key("c")).unwrap(),
                zone: "eu".to_string(),
            }],
        );

        Balancer::balance_round(&fx.balancer.inner).await.unwrap();

        let splits = fx.runner.dispatched_splits();
        assert_eq!(splits.len(), 1);
        assert_eq!(splits[0].2, vec![KeyBound::key("c")]);
        let table = fx.catalog.get_sharded_routing_table(&fx.nss).await.unwrap();
        assert_eq!(table.num_chunks(), 5);
    }

    #[tokio::test]
    async fn test_lifecycle_initiate_interrupt_stop() {
        let fx = fixture();

        assert_eq!(fx.balancer.state(), BalancerState::Stopped);
        fx.balancer.initiate().await.unwrap();
        assert_eq!(fx.balancer.state(), BalancerState::Running);

        // A second initiate while running is refused.
        assert!(matches!(
            fx.balancer.initiate().await,
            Err(Error::ConflictingOperationInProgress(_))
        ));

        // Let a couple of rounds happen.
        tokio::time::sleep(Duration::from_millis(120)).await;
        let report = fx.balancer.report();
        assert!(report.num_balancer_rounds >= 1);
        assert_eq!(report.mode, BalancerMode::Full);

        fx.balancer.interrupt();
        fx.balancer.await_stopped().await;
        assert_eq!(fx.balancer.state(), BalancerState::Stopped);
        assert_eq!(
            fx.balancer.inner.migration_manager.state(),
            crate::migration::manager::MigrationManagerState::Stopped
        );

        // The balancer can be started again after a full stop.
        fx.balancer.initiate().await.unwrap();
        fx.balancer.interrupt();
        fx.balancer.await_stopped().await;
    }

    #[tokio::test]
    async fn test_manual_migration_via_balancer() {
        let fx = fixture();
        enable_manager(&fx).await;

        let table = fx.catalog.get_sharded_routing_table(&fx.nss).await.unwrap();
        let chunk = table.chunk_for_key(b"a").unwrap();
        let info = MigrateInfo::new(
            fx.nss.clone(),
            chunk.range().clone(),
            chunk.shard().clone(),
            ShardId::from("shard3"),
            chunk.version(),
        );

        fx.balancer.request_manual_migration(info).await.unwrap();

        let moves = fx.runner.dispatched_moves();
        assert_eq!(moves.len(), 1);
        // Manual moves always wait for the donor's range deletion.
        assert!(moves[0].settings.wait_for_delete);

        let after = fx.catalog.get_sharded_routing_table(&fx.nss).await.unwrap();
        assert_eq!(after.shard_for_key(b"a").unwrap(), ShardId::from("shard3"));
    }

    #[tokio::test]
    async fn test_initiate_recovers_logged_migrations() {
        let fx = fixture();

        // A prior incarnation crashed with one migration in its log.
        let table_version = fx.config_catalog.collection_version(&fx.nss).unwrap();
        let info = MigrateInfo::new(
            fx.nss.clone(),
            ChunkRange::new(KeyBound::Min, KeyBound::key("g")).unwrap(),
            ShardId::from("shard1"),
            ShardId::from("shard3"),
            table_version,
        );
        let record = crate::migration::store::MigrationRecord::from_migrate_info(&info, false);
        fx.store.insert(&record).await.unwrap();

        fx.balancer.initiate().await.unwrap();

        // The recovered migration is re-dispatched and retired.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !fx.store.is_empty() && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(fx.store.is_empty());
        assert!(fx
            .runner
            .dispatched_moves()
            .iter()
            .any(|m| *m.range.min() == KeyBound::Min && m.to == ShardId::from("shard3")));

        fx.balancer.interrupt();
        fx.balancer.await_stopped().await;
    }
}
