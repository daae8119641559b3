//! Sharded cluster metadata cache, distributed locking, and chunk
//! balancing.
//!
//! This crate implements the control plane that keeps per-process routing
//! caches consistent with a single authoritative catalog while chunks
//! migrate between shards:
//!
//! - **Catalog cache** with single-flight, refresh-on-demand routing
//!   tables and bounded staleness
//! - **Lease-based distributed locks** tolerant of holder crashes via
//!   expiry and overtake, with no cross-machine clock comparisons
//! - **Migration manager** with a durable recovery log and one collection
//!   lock per namespace
//! - **Balancer** control loop that selects imbalanced chunks, splits
//!   zone straddlers, and handles oversized chunks
//!
//! # Example
//!
//! ```rust,no_run
//! use shardpilot::balancer::{
//!     Balancer, BalancerConfiguration, BalancerSettingsSource, ChunkSelectionPolicy,
//!     DefaultChunkSelectionPolicy, InMemorySettingsSource,
//! };
//! use shardpilot::catalog::{CatalogCache, CatalogCacheLoader, InMemoryConfigCatalog};
//! use shardpilot::config::{
//!     BalancerConfig, CatalogCacheConfig, DistLockConfig, MigrationConfig,
//! };
//! use shardpilot::distlock::{DistLockCatalog, InMemoryDistLockCatalog, ReplSetDistLockManager};
//! use shardpilot::migration::{
//!     InMemoryMigrationStore, MigrationManager, MigrationStore, RecordingShardRunner,
//!     ShardCommandRunner,
//! };
//! use shardpilot::topology::ShardRegistry;
//! use std::sync::Arc;
//!
//! # async fn run() -> shardpilot::Result<()> {
//! let config_catalog = Arc::new(InMemoryConfigCatalog::new());
//! let catalog = CatalogCache::new(
//!     config_catalog.clone() as Arc<dyn CatalogCacheLoader>,
//!     CatalogCacheConfig::default(),
//! );
//!
//! let dist_lock = Arc::new(ReplSetDistLockManager::new(
//!     "config-primary",
//!     Arc::new(InMemoryDistLockCatalog::new()) as Arc<dyn DistLockCatalog>,
//!     DistLockConfig::default(),
//! ));
//! dist_lock.start();
//!
//! let runner = Arc::new(RecordingShardRunner::with_catalog(config_catalog.clone()));
//! let migration_manager = MigrationManager::new(
//!     dist_lock,
//!     Arc::new(InMemoryMigrationStore::new()) as Arc<dyn MigrationStore>,
//!     runner.clone() as Arc<dyn ShardCommandRunner>,
//!     "config/cfg1,cfg2,cfg3",
//!     MigrationConfig::default(),
//! );
//!
//! let registry = Arc::new(ShardRegistry::new());
//! let policy = Arc::new(DefaultChunkSelectionPolicy::new(
//!     catalog.clone(),
//!     config_catalog as Arc<dyn CatalogCacheLoader>,
//!     registry,
//! ));
//! let configuration = Arc::new(BalancerConfiguration::new(
//!     Arc::new(InMemorySettingsSource::new()) as Arc<dyn BalancerSettingsSource>,
//! ));
//!
//! let balancer = Balancer::new(
//!     BalancerConfig::default(),
//!     configuration,
//!     catalog,
//!     policy as Arc<dyn ChunkSelectionPolicy>,
//!     migration_manager,
//!     runner as Arc<dyn ShardCommandRunner>,
//! );
//! balancer.initiate().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                    Balancer                      │
//! │  round loop · zone split enforcement · reports   │
//! └──────────────────────────────────────────────────┘
//!        │ selects via               │ dispatches via
//!        ▼                           ▼
//! ┌─────────────────┐       ┌──────────────────────┐
//! │ ChunkSelection  │       │   MigrationManager   │
//! │ Policy          │       │ recovery log · locks │
//! └─────────────────┘       └──────────────────────┘
//!        │ reads                     │ locks via
//!        ▼                           ▼
//! ┌─────────────────┐       ┌──────────────────────┐
//! │  CatalogCache   │       │ ReplSetDistLock      │
//! │ routing tables  │       │ Manager              │
//! └─────────────────┘       └──────────────────────┘
//!        │ loads from                │ CRUD via
//!        ▼                           ▼
//! ┌──────────────────────────────────────────────────┐
//! │        authoritative config store (external)     │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! # Concurrency model
//!
//! Each component runs its control logic on its own background task;
//! synchronous-looking APIs block only the calling task. Shared maps are
//! guarded by a single mutex each and never held across a suspension
//! point: callers copy out reference-counted snapshots and operate on the
//! copy unlocked.

pub mod balancer;
pub mod catalog;
pub mod config;
pub mod distlock;
pub mod error;
pub mod migration;
pub mod topology;
pub mod types;

// Re-export the main types for convenience.
pub use balancer::{
    Balancer, BalancerConfiguration, BalancerMode, BalancerRoundReport, BalancerSettings,
    BalancerSettingsSource, BalancerState, ChunkSelectionPolicy, DefaultChunkSelectionPolicy,
    InMemorySettingsSource, SplitCandidate, ZoneRange,
};
pub use catalog::{
    CatalogCache, CatalogCacheLoader, Chunk, ChunkRange, ChunkVersion,
    CollectionAndChangedChunks, CollectionRoutingInfo, DatabaseType, InMemoryConfigCatalog,
    KeyBound, RoutingTable,
};
pub use config::{BalancerConfig, CatalogCacheConfig, DistLockConfig, MigrationConfig};
pub use distlock::{
    ConfigServerInfo, DistLockCatalog, InMemoryDistLockCatalog, LockDocument, LockState,
    PingDocument, ReplSetDistLockManager, ScopedDistLock,
};
pub use error::{Error, Result};
pub use migration::{
    FileMigrationStore, InMemoryMigrationStore, MigrateInfo, MigrationManager,
    MigrationManagerState, MigrationRecord, MigrationStore, MoveChunkRequest, MoveChunkSettings,
    RecordingShardRunner, ShardCommandRunner,
};
pub use topology::{ShardDescription, ShardRegistry};
pub use types::{Namespace, ShardId};
