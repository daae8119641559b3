//! Per-process cache of database and collection routing metadata.
//!
//! The cache serves the best-known routing table for a namespace and
//! transparently reloads it when marked stale. Guarantees:
//!
//! - At most one refresh is in flight per namespace; concurrent callers
//!   join the existing refresh's notification instead of issuing a
//!   duplicate load.
//! - Waiters re-read the cache after the notification fires; a result is
//!   never returned from state observed before the wait.
//! - Invalidation is non-blocking and conditional on the caller's observed
//!   version, so a stale-config signal cannot clobber a refresh that
//!   already superseded it.

use crate::catalog::loader::{CatalogCacheLoader, DatabaseType};
use crate::catalog::routing::RoutingTable;
use crate::catalog::version::ChunkVersion;
use crate::config::CatalogCacheConfig;
use crate::error::{Error, Result};
use crate::types::Namespace;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Read-only routing snapshot handed to callers.
#[derive(Debug, Clone)]
pub struct CollectionRoutingInfo {
    /// Database entry owning the namespace.
    pub database: DatabaseType,
    /// Routing table, if the collection is sharded.
    pub table: Option<Arc<RoutingTable>>,
}

/// Counters for cache activity.
#[derive(Debug, Default)]
pub struct CatalogCacheStats {
    refreshes_started: AtomicU64,
    refreshes_failed: AtomicU64,
    stale_config_signals: AtomicU64,
}

/// Point-in-time copy of [`CatalogCacheStats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogCacheStatsSnapshot {
    /// Refresh tasks spawned.
    pub refreshes_started: u64,
    /// Refresh tasks that surfaced an error to their waiters.
    pub refreshes_failed: u64,
    /// Stale-config signals received (whether or not they marked an entry).
    pub stale_config_signals: u64,
}

/// One-shot status broadcast completing a refresh. All waiters of a
/// namespace's in-flight refresh hold a clone.
#[derive(Debug, Clone)]
struct RefreshNotification {
    rx: watch::Receiver<Option<Result<()>>>,
}

impl RefreshNotification {
    fn new() -> (watch::Sender<Option<Result<()>>>, Self) {
        let (tx, rx) = watch::channel(None);
        (tx, Self { rx })
    }

    async fn wait(mut self) -> Result<()> {
        loop {
            if let Some(status) = self.rx.borrow_and_update().clone() {
                return status;
            }
            self.rx
                .changed()
                .await
                .map_err(|_| Error::Internal("refresh task dropped without completing".into()))?;
        }
    }
}

/// Per-collection cache slot.
#[derive(Debug, Default)]
struct CollectionEntry {
    needs_refresh: bool,
    refresh_notification: Option<RefreshNotification>,
    routing: Option<Arc<RoutingTable>>,
}

/// Per-database cache slot; owns all collection entries for the database.
#[derive(Debug)]
struct DatabaseEntry {
    info: DatabaseType,
    collections: HashMap<Namespace, CollectionEntry>,
}

#[derive(Debug)]
struct CacheInner {
    loader: Arc<dyn CatalogCacheLoader>,
    config: CatalogCacheConfig,
    databases: Mutex<HashMap<String, DatabaseEntry>>,
    stats: CatalogCacheStats,
}

/// The catalog cache.
#[derive(Debug, Clone)]
pub struct CatalogCache {
    inner: Arc<CacheInner>,
}

impl CatalogCache {
    /// Create a cache backed by the given loader.
    pub fn new(loader: Arc<dyn CatalogCacheLoader>, config: CatalogCacheConfig) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                loader,
                config,
                databases: Mutex::new(HashMap::new()),
                stats: CatalogCacheStats::default(),
            }),
        }
    }

    /// Get the database entry, loading and caching it on first access.
    pub async fn get_database(&self, db_name: &str) -> Result<DatabaseType> {
        if let Some(entry) = self.inner.databases.lock().get(db_name) {
            return Ok(entry.info.clone());
        }

        // Load outside the lock; on a race the first insert wins.
        let info = self.inner.loader.get_database(db_name).await?;
        let mut databases = self.inner.databases.lock();
        let entry = databases
            .entry(db_name.to_string())
            .or_insert_with(|| DatabaseEntry {
                info,
                collections: HashMap::new(),
            });
        Ok(entry.info.clone())
    }

    /// Get routing info for a namespace, refreshing it if stale.
    ///
    /// Blocks the caller while a refresh is in flight, then loops to
    /// re-read the updated cache state.
    pub async fn get_collection_routing_info(
        &self,
        nss: &Namespace,
    ) -> Result<CollectionRoutingInfo> {
        loop {
            let database = self.get_database(nss.db()).await?;

            enum Outcome {
                Ready(Option<Arc<RoutingTable>>),
                Wait(RefreshNotification),
            }

            let outcome = {
                let mut databases = self.inner.databases.lock();
                let db_entry = match databases.get_mut(nss.db()) {
                    Some(entry) => entry,
                    // Purged between the load above and here; start over.
                    None => continue,
                };
                let entry = db_entry.collections.entry(nss.clone()).or_insert_with(|| {
                    CollectionEntry {
                        needs_refresh: true,
                        ..Default::default()
                    }
                });

                if !entry.needs_refresh {
                    Outcome::Ready(entry.routing.clone())
                } else if let Some(notification) = &entry.refresh_notification {
                    Outcome::Wait(notification.clone())
                } else {
                    let (tx, notification) = RefreshNotification::new();
                    entry.refresh_notification = Some(notification.clone());
                    let existing = entry.routing.clone();
                    self.inner.stats.refreshes_started.fetch_add(1, Ordering::Relaxed);
                    tokio::spawn(Self::refresh_task(
                        Arc::clone(&self.inner),
                        nss.clone(),
                        existing,
                        tx,
                    ));
                    Outcome::Wait(notification)
                }
            };

            match outcome {
                Outcome::Ready(table) => {
                    return Ok(CollectionRoutingInfo { database, table });
                }
                Outcome::Wait(notification) => {
                    notification.wait().await?;
                    // Loop to re-read the now-updated entry.
                }
            }
        }
    }

    /// Routing table for a namespace known to be sharded.
    pub async fn get_sharded_routing_table(&self, nss: &Namespace) -> Result<Arc<RoutingTable>> {
        self.get_collection_routing_info(nss)
            .await?
            .table
            .ok_or_else(|| Error::NamespaceNotSharded(nss.to_string()))
    }

    /// Invalidate and re-fetch the routing table for a namespace.
    pub async fn get_sharded_routing_table_with_refresh(
        &self,
        nss: &Namespace,
    ) -> Result<Arc<RoutingTable>> {
        self.invalidate_sharded_collection(nss);
        self.get_sharded_routing_table(nss).await
    }

    /// Non-blocking stale-config signal.
    ///
    /// Marks the entry for refresh only if the cached version still equals
    /// the version the caller observed as stale; a refresh that already
    /// replaced it is left alone.
    pub fn on_stale_config_error(&self, nss: &Namespace, seen_version: Option<ChunkVersion>) {
        self.inner
            .stats
            .stale_config_signals
            .fetch_add(1, Ordering::Relaxed);

        let mut databases = self.inner.databases.lock();
        let Some(db_entry) = databases.get_mut(nss.db()) else {
            return;
        };
        let Some(entry) = db_entry.collections.get_mut(nss) else {
            return;
        };

        if let (Some(seen), Some(cached)) = (seen_version, &entry.routing) {
            if cached.version() != seen {
                debug!(
                    namespace = %nss,
                    seen = %seen,
                    cached = %cached.version(),
                    "Ignoring stale-config signal for an already-refreshed table"
                );
                return;
            }
        }
        entry.needs_refresh = true;
    }

    /// Unconditionally mark a namespace for refresh.
    pub fn invalidate_sharded_collection(&self, nss: &Namespace) {
        let mut databases = self.inner.databases.lock();
        if let Some(db_entry) = databases.get_mut(nss.db()) {
            db_entry
                .collections
                .entry(nss.clone())
                .or_default()
                .needs_refresh = true;
        }
    }

    /// Evict a database and every collection entry it owns.
    pub fn purge_database(&self, db_name: &str) {
        self.inner.databases.lock().remove(db_name);
    }

    /// Evict everything; used on topology changes.
    pub fn purge_all_databases(&self) {
        self.inner.databases.lock().clear();
    }

    /// Current cache counters.
    pub fn stats(&self) -> CatalogCacheStatsSnapshot {
        CatalogCacheStatsSnapshot {
            refreshes_started: self.inner.stats.refreshes_started.load(Ordering::Relaxed),
            refreshes_failed: self.inner.stats.refreshes_failed.load(Ordering::Relaxed),
            stale_config_signals: self
                .inner
                .stats
                .stale_config_signals
                .load(Ordering::Relaxed),
        }
    }

    /// Background refresh for one namespace. Publishes the outcome into
    /// the cache entry and then broadcasts it to every waiter.
    async fn refresh_task(
        inner: Arc<CacheInner>,
        nss: Namespace,
        existing: Option<Arc<RoutingTable>>,
        tx: watch::Sender<Option<Result<()>>>,
    ) {
        let outcome = Self::fetch_routing_table(&inner, &nss, existing).await;

        let status = {
            let mut databases = inner.databases.lock();
            let entry = databases
                .get_mut(nss.db())
                .and_then(|db| db.collections.get_mut(&nss));

            match (&outcome, entry) {
                (Ok(table), Some(entry)) => {
                    entry.routing = table.clone();
                    entry.needs_refresh = false;
                    entry.refresh_notification = None;
                    Ok(())
                }
                (Ok(_), None) => {
                    // Entry purged mid-refresh; nothing to publish.
                    Ok(())
                }
                (Err(e), entry) => {
                    if let Some(entry) = entry {
                        // Leave needs_refresh set so the next caller retries.
                        entry.refresh_notification = None;
                    }
                    inner.stats.refreshes_failed.fetch_add(1, Ordering::Relaxed);
                    Err(e.clone())
                }
            }
        };

        if let Err(e) = &status {
            warn!(namespace = %nss, error = %e, "Routing table refresh failed");
        } else {
            debug!(namespace = %nss, "Routing table refresh complete");
        }
        let _ = tx.send(Some(status));
    }

    /// Fetch and build the new routing table, retrying inconsistent diffs
    /// with a full reload.
    async fn fetch_routing_table(
        inner: &Arc<CacheInner>,
        nss: &Namespace,
        mut existing: Option<Arc<RoutingTable>>,
    ) -> Result<Option<Arc<RoutingTable>>> {
        let max_attempts = inner.config.max_refresh_attempts.max(1);

        for attempt in 1..=max_attempts {
            let since = existing
                .as_ref()
                .map(|t| t.version())
                .unwrap_or_else(ChunkVersion::unset);

            let collection = match inner.loader.get_chunks_since(nss, since).await {
                Ok(collection) => collection,
                // The collection was dropped or was never sharded: an
                // empty slot is the correct cache content, not an error.
                Err(Error::NamespaceNotFound(_)) => return Ok(None),
                Err(e @ Error::ConflictingOperationInProgress(_)) if attempt < max_attempts => {
                    warn!(
                        namespace = %nss,
                        attempt,
                        error = %e,
                        "Routing metadata read raced a catalog operation; retrying"
                    );
                    existing = None;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let built = match &existing {
                Some(base) if base.epoch() == collection.epoch => {
                    base.make_updated(&collection.changed_chunks)
                }
                _ => RoutingTable::new(
                    nss.clone(),
                    collection.epoch,
                    collection.uuid,
                    collection.shard_key_pattern.clone(),
                    collection.changed_chunks,
                ),
            };

            match built {
                Ok(table) => return Ok(Some(Arc::new(table))),
                Err(e @ Error::ConflictingOperationInProgress(_)) if attempt < max_attempts => {
                    warn!(
                        namespace = %nss,
                        attempt,
                        error = %e,
                        "Inconsistent chunk diff; retrying with a full reload"
                    );
                    existing = None;
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::ConflictingOperationInProgress(format!(
            "exhausted {} routing refresh attempts for {}",
            max_attempts, nss
        )))
    }
}
