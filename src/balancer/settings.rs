//! Balancer settings: the dynamic knobs re-read at the start of every
//! round.

use crate::error::Result;
use crate::migration::runner::MoveChunkSettings;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::fmt;

/// Balancing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalancerMode {
    /// Balance whenever an imbalance is detected.
    Full,
    /// Balancing disabled.
    Off,
}

impl fmt::Display for BalancerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BalancerMode::Full => f.write_str("full"),
            BalancerMode::Off => f.write_str("off"),
        }
    }
}

/// Dynamic balancer settings.
#[derive(Debug, Clone, PartialEq)]
pub struct BalancerSettings {
    /// Current mode.
    pub mode: BalancerMode,
    /// Size above which a donor refuses to move a chunk.
    pub max_chunk_size_bytes: u64,
    /// Whether secondaries throttle chunk cloning.
    pub secondary_throttle: bool,
    /// Whether balancer-driven moves wait for the donor's range deletion.
    pub wait_for_delete: bool,
}

impl Default for BalancerSettings {
    fn default() -> Self {
        Self {
            mode: BalancerMode::Full,
            max_chunk_size_bytes: 64 * 1024 * 1024,
            secondary_throttle: true,
            wait_for_delete: false,
        }
    }
}

impl BalancerSettings {
    /// The move-level settings derived from this round's configuration.
    pub fn move_settings(&self) -> MoveChunkSettings {
        MoveChunkSettings {
            max_chunk_size_bytes: self.max_chunk_size_bytes,
            secondary_throttle: self.secondary_throttle,
            wait_for_delete: self.wait_for_delete,
        }
    }
}

/// Where the balancer reads its settings from. In the full deployment this
/// is a config-store collection; tests and embedded use provide the
/// in-memory source.
#[async_trait]
pub trait BalancerSettingsSource: Send + Sync + fmt::Debug {
    /// Fetch the current settings.
    async fn fetch(&self) -> Result<BalancerSettings>;
}

/// In-memory settings source with an administrative surface.
#[derive(Debug, Default)]
pub struct InMemorySettingsSource {
    settings: RwLock<BalancerSettings>,
}

impl InMemorySettingsSource {
    /// Create a source with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable balancing.
    pub fn set_mode(&self, mode: BalancerMode) {
        self.settings.write().mode = mode;
    }

    /// Replace the settings wholesale.
    pub fn set(&self, settings: BalancerSettings) {
        *self.settings.write() = settings;
    }
}

#[async_trait]
impl BalancerSettingsSource for InMemorySettingsSource {
    async fn fetch(&self) -> Result<BalancerSettings> {
        Ok(self.settings.read().clone())
    }
}

/// Fetch-and-cache wrapper the balancer consults each round.
#[derive(Debug)]
pub struct BalancerConfiguration {
    source: std::sync::Arc<dyn BalancerSettingsSource>,
    cached: RwLock<BalancerSettings>,
}

impl BalancerConfiguration {
    /// Create a configuration over the given source.
    pub fn new(source: std::sync::Arc<dyn BalancerSettingsSource>) -> Self {
        Self {
            source,
            cached: RwLock::new(BalancerSettings::default()),
        }
    }

    /// Re-fetch the settings from the source. On failure the previous
    /// cached settings remain in effect and the error is surfaced.
    pub async fn refresh(&self) -> Result<()> {
        let settings = self.source.fetch().await?;
        *self.cached.write() = settings;
        Ok(())
    }

    /// Whether balancing should run under the cached settings.
    pub fn should_balance(&self) -> bool {
        self.cached.read().mode == BalancerMode::Full
    }

    /// Copy of the cached settings.
    pub fn settings(&self) -> BalancerSettings {
        self.cached.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_refresh_picks_up_mode_change() {
        let source = Arc::new(InMemorySettingsSource::new());
        let configuration = BalancerConfiguration::new(source.clone());

        configuration.refresh().await.unwrap();
        assert!(configuration.should_balance());

        source.set_mode(BalancerMode::Off);
        // Stale until the next refresh.
        assert!(configuration.should_balance());
        configuration.refresh().await.unwrap();
        assert!(!configuration.should_balance());
    }

    #[test]
    fn test_move_settings_derivation() {
        let settings = BalancerSettings {
            wait_for_delete: true,
            ..Default::default()
        };
        assert!(settings.move_settings().wait_for_delete);
    }
}
