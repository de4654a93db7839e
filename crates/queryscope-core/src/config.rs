//! config.toml loading and validation
//!
//! Every section is optional; missing keys fall back to defaults and unknown
//! keys are ignored.
//!
//! ```toml
//! [profiling]
//! level = "all"
//! slow_ms = 100
//!
//! [[databases]]
//! id = "orders-prod"
//! uri = "mongodb://localhost:27017"
//! database = "shop"
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ProfilerError, ProfilerResult};
use crate::profiler::{FanoutConfig, SessionSettings};
use crate::types::{DatabaseId, ProfileLevel};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilerConfig {
    /// `[profiling]` section.
    pub profiling: ProfilingSection,
    /// `[fanout]` section.
    pub fanout: FanoutSection,
    /// `[history]` section.
    pub history: HistorySection,
    /// `[cursor]` section.
    pub cursor: CursorSection,
    /// `[[databases]]` entries.
    pub databases: Vec<DatabaseTarget>,
}

/// Level names accepted in `[profiling] level`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LevelName {
    Off,
    Slow,
    All,
}

/// `[profiling]` config section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilingSection {
    /// Level enabled when a session starts.
    pub level: LevelName,
    /// Slow-operation threshold in milliseconds.
    pub slow_ms: u64,
}

impl Default for ProfilingSection {
    fn default() -> Self {
        Self {
            level: LevelName::All,
            slow_ms: 100,
        }
    }
}

impl ProfilingSection {
    /// Level to enable on session start
    pub fn profile_level(&self) -> ProfileLevel {
        match self.level {
            LevelName::Off => ProfileLevel::Off,
            LevelName::Slow => ProfileLevel::SlowOnly {
                threshold_ms: self.slow_ms,
            },
            LevelName::All => ProfileLevel::All,
        }
    }

    /// Session settings derived from this section
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            level: self.profile_level(),
            slow_ms: Some(self.slow_ms),
        }
    }
}

/// `[fanout]` config section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FanoutSection {
    /// Events buffered per listener.
    pub listener_capacity: usize,
    /// Per-listener delivery timeout in milliseconds.
    pub delivery_timeout_ms: u64,
    /// Consecutive missed deliveries before a listener is evicted.
    pub max_missed_deliveries: u32,
}

impl Default for FanoutSection {
    fn default() -> Self {
        let defaults = FanoutConfig::default();
        Self {
            listener_capacity: defaults.listener_capacity,
            delivery_timeout_ms: defaults.delivery_timeout.as_millis() as u64,
            max_missed_deliveries: defaults.max_missed_deliveries,
        }
    }
}

impl FanoutSection {
    /// Runtime fanout configuration
    pub fn fanout_config(&self) -> FanoutConfig {
        FanoutConfig {
            listener_capacity: self.listener_capacity,
            delivery_timeout: Duration::from_millis(self.delivery_timeout_ms),
            max_missed_deliveries: self.max_missed_deliveries,
        }
    }
}

/// `[history]` config section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistorySection {
    /// Entries listed when no limit is given.
    pub default_limit: usize,
    /// Upper bound on any requested limit.
    pub max_limit: usize,
}

impl Default for HistorySection {
    fn default() -> Self {
        Self {
            default_limit: 50,
            max_limit: 1000,
        }
    }
}

/// `[cursor]` config section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CursorSection {
    /// Pause before reopening an exhausted tail, in milliseconds.
    pub reopen_delay_ms: u64,
    /// Server-side await time per getMore, in milliseconds.
    pub max_await_ms: u64,
}

impl Default for CursorSection {
    fn default() -> Self {
        Self {
            reopen_delay_ms: 500,
            max_await_ms: 1000,
        }
    }
}

/// One monitored database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseTarget {
    /// Id used to start and stop sessions.
    pub id: DatabaseId,
    /// MongoDB connection string.
    pub uri: String,
    /// Database to profile.
    pub database: String,
}

impl ProfilerConfig {
    /// Default location: `~/.queryscope/config.toml`
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".queryscope")
            .join("config.toml")
    }

    /// Load `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> ProfilerResult<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "No config file; using defaults");
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&contents)
            .map_err(|e| ProfilerError::Config(format!("{}: {}", path.display(), e)))?;
        debug!(path = %path.display(), databases = config.databases.len(), "Loaded config");
        Ok(config)
    }

    /// Parse and validate TOML text
    pub fn from_toml_str(contents: &str) -> ProfilerResult<Self> {
        let config: Self =
            toml::from_str(contents).map_err(|e| ProfilerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the profiler cannot run with
    pub fn validate(&self) -> ProfilerResult<()> {
        if self.fanout.listener_capacity == 0 {
            return Err(ProfilerError::Config(
                "fanout.listener_capacity must be at least 1".to_string(),
            ));
        }
        if self.fanout.delivery_timeout_ms == 0 {
            return Err(ProfilerError::Config(
                "fanout.delivery_timeout_ms must be at least 1".to_string(),
            ));
        }
        if self.fanout.max_missed_deliveries == 0 {
            return Err(ProfilerError::Config(
                "fanout.max_missed_deliveries must be at least 1".to_string(),
            ));
        }
        if self.history.default_limit > self.history.max_limit {
            return Err(ProfilerError::Config(format!(
                "history.default_limit ({}) exceeds history.max_limit ({})",
                self.history.default_limit, self.history.max_limit
            )));
        }

        let mut seen = HashSet::new();
        for target in &self.databases {
            if target.database.trim().is_empty() {
                return Err(ProfilerError::Config(format!(
                    "database name for {} must not be empty",
                    target.id
                )));
            }
            if !seen.insert(&target.id) {
                return Err(ProfilerError::Config(format!(
                    "duplicate database id: {}",
                    target.id
                )));
            }
        }
        Ok(())
    }

    /// Look up a configured database
    pub fn target(&self, id: &DatabaseId) -> Option<&DatabaseTarget> {
        self.databases.iter().find(|target| &target.id == id)
    }
}
