//! Watch service configuration
//!
//! Loaded from TOML. Every field has a default, so an empty file (or no file)
//! gives a working native-backend configuration:
//!
//! ```toml
//! backend = "poll"
//! poll_interval_ms = 500
//! batch_window_ms = 10
//! max_batch_events = 1024
//! delivery_queue_capacity = 4096
//! ```

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Which native mechanism backs the watch service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// The platform's notification API (inotify, ReadDirectoryChangesW, FSEvents)
    #[default]
    Native,
    /// Periodic directory scans
    Poll,
}

impl BackendKind {
    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Native => "native",
            BackendKind::Poll => "poll",
        }
    }

    /// Whether watches on this backend can cover a subtree. Both backends
    /// watch directory by directory, so recursion is built from the tree walk.
    pub fn supports_recursive(self) -> bool {
        match self {
            BackendKind::Native | BackendKind::Poll => true,
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "native" => Ok(BackendKind::Native),
            "poll" => Ok(BackendKind::Poll),
            other => Err(ConfigError::Invalid {
                key: "backend",
                message: format!("expected 'native' or 'poll', got '{}'", other),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub backend: BackendKind,

    /// Scan interval for the poll backend
    pub poll_interval_ms: u64,

    /// How long to keep collecting raw events after the first one of a batch
    pub batch_window_ms: u64,

    /// Upper bound on raw events per batch
    pub max_batch_events: usize,

    /// Changes queued per watcher before new ones are dropped in favour of
    /// a single `Unknown` change
    pub delivery_queue_capacity: usize,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Native,
            poll_interval_ms: 500,
            batch_window_ms: 10,
            max_batch_events: 1024,
            delivery_queue_capacity: 4096,
        }
    }
}

impl WatcherConfig {
    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: WatcherConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every field against its valid range
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(10..=60_000).contains(&self.poll_interval_ms) {
            return Err(ConfigError::Invalid {
                key: "poll_interval_ms",
                message: format!("{} is outside 10-60000", self.poll_interval_ms),
            });
        }
        if self.batch_window_ms > 1_000 {
            return Err(ConfigError::Invalid {
                key: "batch_window_ms",
                message: format!("{} is outside 0-1000", self.batch_window_ms),
            });
        }
        if !(1..=1_000_000).contains(&self.max_batch_events) {
            return Err(ConfigError::Invalid {
                key: "max_batch_events",
                message: format!("{} is outside 1-1,000,000", self.max_batch_events),
            });
        }
        if !(1..=10_000_000).contains(&self.delivery_queue_capacity) {
            return Err(ConfigError::Invalid {
                key: "delivery_queue_capacity",
                message: format!("{} is outside 1-10,000,000", self.delivery_queue_capacity),
            });
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }
}
