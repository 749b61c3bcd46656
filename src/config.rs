use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{clog_debug, Error, Result};

pub const DEFAULT_STALL_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_EXPECTED_DURATION_SECS: u64 = 300;
pub const DEFAULT_GRACE_PERIOD_SECS: u64 = 60;
/// One week.
pub const MAX_GRACE_PERIOD_SECS: u64 = 7 * 24 * 60 * 60;
pub const DEFAULT_NEAR_LIMIT_RATIO: f64 = 0.8;
pub const DEFAULT_MAX_WORKERS: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Path of the file store used by the CLI.
    pub store_path: Option<String>,
    pub log_level: Option<String>,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
}

/// Stall detection thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// A task is stalled after this multiple of its expected duration without progress.
    pub stall_multiplier: f64,
    /// Expected duration for tasks that do not declare one.
    pub default_expected_secs: u64,
    /// Time the owner of a stalled task gets to respond to a clarifying message.
    pub grace_period_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            stall_multiplier: DEFAULT_STALL_MULTIPLIER,
            default_expected_secs: DEFAULT_EXPECTED_DURATION_SECS,
            grace_period_secs: DEFAULT_GRACE_PERIOD_SECS,
        }
    }
}

impl MonitorConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    /// The grace period as a timestamp offset.
    pub fn grace_period_delta(&self) -> Result<chrono::Duration> {
        i64::try_from(self.grace_period_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .ok_or_else(|| {
                Error::Validation(format!(
                    "monitor.grace_period_secs {} is out of range",
                    self.grace_period_secs
                ))
            })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Ceiling in cost units. Without one the governor never refuses work.
    pub ceiling: Option<u64>,
    pub near_limit_ratio: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            ceiling: None,
            near_limit_ratio: DEFAULT_NEAR_LIMIT_RATIO,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub max_workers: usize,
    pub poll_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            poll_interval_ms: 500,
            heartbeat_interval_ms: 5_000,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

impl Config {
    pub fn concord_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".concord"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::concord_dir()?.join("concord.toml"))
    }

    /// Store path from the config, or `~/.concord/store.json`.
    pub fn store_path(&self) -> Result<PathBuf> {
        match &self.store_path {
            Some(path) => Ok(expand_tilde(path)),
            None => Ok(Self::concord_dir()?.join("store.json")),
        }
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        clog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            clog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        clog_debug!(
            "Config loaded: stall_multiplier={}, ceiling={:?}, max_workers={}",
            config.monitor.stall_multiplier,
            config.budget.ceiling,
            config.workers.max_workers
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::concord_dir()?;
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        clog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.monitor.stall_multiplier > 0.0) {
            return Err(Error::Validation(
                "monitor.stall_multiplier must be positive".to_string(),
            ));
        }
        if self.monitor.default_expected_secs == 0 {
            return Err(Error::Validation(
                "monitor.default_expected_secs must be at least 1".to_string(),
            ));
        }
        if self.monitor.grace_period_secs > MAX_GRACE_PERIOD_SECS {
            return Err(Error::Validation(format!(
                "monitor.grace_period_secs must be at most {}",
                MAX_GRACE_PERIOD_SECS
            )));
        }
        let ratio = self.budget.near_limit_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(Error::Validation(
                "budget.near_limit_ratio must be in (0, 1]".to_string(),
            ));
        }
        if self.workers.max_workers == 0 {
            return Err(Error::Validation(
                "workers.max_workers must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
