//! Configuration types for the metadata and migration subsystem.

use std::time::Duration;

/// Configuration for the replica-set distributed lock manager.
#[derive(Debug, Clone)]
pub struct DistLockConfig {
    /// How often the heartbeat task refreshes this process's ping document.
    pub ping_interval: Duration,

    /// Lease duration: a lock whose holder has not pinged for this long
    /// (measured on the config server's clock) may be overtaken.
    pub lock_expiration: Duration,

    /// Fixed backoff between lock acquisition attempts while the lock is
    /// held by someone else.
    pub lock_retry_interval: Duration,

    /// Maximum consecutive retries for network-only failures. Lock-busy
    /// failures are bounded only by the caller's wait budget.
    pub max_network_attempts: u32,
}

impl Default for DistLockConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            lock_expiration: Duration::from_secs(15 * 60),
            lock_retry_interval: Duration::from_millis(500),
            max_network_attempts: 3,
        }
    }
}

impl DistLockConfig {
    /// Set the heartbeat ping interval.
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Set the lock lease duration.
    pub fn with_lock_expiration(mut self, expiration: Duration) -> Self {
        self.lock_expiration = expiration;
        self
    }

    /// Set the backoff between acquisition attempts.
    pub fn with_lock_retry_interval(mut self, interval: Duration) -> Self {
        self.lock_retry_interval = interval;
        self
    }

    /// Set the network-failure retry budget.
    pub fn with_max_network_attempts(mut self, attempts: u32) -> Self {
        self.max_network_attempts = attempts;
        self
    }
}

/// Configuration for the catalog cache.
#[derive(Debug, Clone)]
pub struct CatalogCacheConfig {
    /// How many times a refresh retries an inconsistent incremental diff
    /// before surfacing the error to all waiters.
    pub max_refresh_attempts: u32,
}

impl Default for CatalogCacheConfig {
    fn default() -> Self {
        Self {
            max_refresh_attempts: 3,
        }
    }
}

impl CatalogCacheConfig {
    /// Set the refresh retry budget.
    pub fn with_max_refresh_attempts(mut self, attempts: u32) -> Self {
        self.max_refresh_attempts = attempts;
        self
    }
}

/// Configuration for the migration manager.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Upper bound on the duration of a single remote moveChunk, including
    /// its wait-for-delete phase.
    pub move_timeout: Duration,

    /// Wait budget for the per-collection distributed lock during crash
    /// recovery. Normal scheduling uses a single attempt instead.
    pub recovery_lock_timeout: Duration,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            move_timeout: Duration::from_secs(600),
            recovery_lock_timeout: Duration::from_secs(15),
        }
    }
}

impl MigrationConfig {
    /// Set the per-move timeout.
    pub fn with_move_timeout(mut self, timeout: Duration) -> Self {
        self.move_timeout = timeout;
        self
    }

    /// Set the recovery lock wait budget.
    pub fn with_recovery_lock_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_lock_timeout = timeout;
        self
    }
}

/// Configuration for the balancer control loop.
#[derive(Debug, Clone)]
pub struct BalancerConfig {
    /// Sleep between rounds when the previous round had nothing to do.
    pub round_interval: Duration,

    /// Sleep between rounds when the previous round moved or split chunks,
    /// to keep rebalancing momentum.
    pub short_round_interval: Duration,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            round_interval: Duration::from_secs(10),
            short_round_interval: Duration::from_secs(1),
        }
    }
}

impl BalancerConfig {
    /// Set the idle round interval.
    pub fn with_round_interval(mut self, interval: Duration) -> Self {
        self.round_interval = interval;
        self
    }

    /// Set the post-activity round interval.
    pub fn with_short_round_interval(mut self, interval: Duration) -> Self {
        self.short_round_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dist_lock_defaults() {
        let config = DistLockConfig::default();
        assert_eq!(config.ping_interval, Duration::from_secs(30));
        assert_eq!(config.lock_expiration, Duration::from_secs(900));
        assert_eq!(config.lock_retry_interval, Duration::from_millis(500));
    }

    #[test]
    fn test_builder_chaining() {
        let config = DistLockConfig::default()
            .with_ping_interval(Duration::from_millis(50))
            .with_lock_expiration(Duration::from_secs(1));
        assert_eq!(config.ping_interval, Duration::from_millis(50));
        assert_eq!(config.lock_expiration, Duration::from_secs(1));
    }
}
