//! Configuration management.
//!
//! Settings live in `~/.config/gridcache/config.json`. Durations are stored
//! as signed millisecond counts, so a hand-edited negative value is caught by
//! `validate` rather than wrapping silently.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::cache::engine::DEFAULT_SWEEP_INTERVAL;
use crate::cache::QueryOptions;
use crate::context::GridDefaults;
use crate::error::ConfigurationError;
use crate::trend::DEFAULT_TREND_INTERVAL;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "gridcache";

/// Config file name
const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridCacheConfig {
    /// Record service root; demo data is used when unset
    pub base_url: Option<String>,
    pub resource: String,
    pub page_size: usize,
    pub prefetch_threshold: usize,
    pub overscan: usize,
    pub stale_time_ms: i64,
    pub cache_time_ms: i64,
    pub max_retries: u32,
    pub refetch_interval_ms: Option<i64>,
    pub trend_interval_ms: i64,
    pub sweep_interval_ms: i64,
}

impl Default for GridCacheConfig {
    fn default() -> Self {
        let grid = GridDefaults::default();
        Self {
            base_url: None,
            resource: "users".to_string(),
            page_size: grid.page_size,
            prefetch_threshold: grid.prefetch_threshold,
            overscan: grid.overscan,
            stale_time_ms: 30_000,
            cache_time_ms: 300_000,
            max_retries: 3,
            refetch_interval_ms: None,
            trend_interval_ms: DEFAULT_TREND_INTERVAL.as_millis() as i64,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL.as_millis() as i64,
        }
    }
}

/// Validated, typed form of `GridCacheConfig`.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub query_options: QueryOptions,
    pub grid: GridDefaults,
    pub trend_interval: Duration,
    pub sweep_interval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            query_options: QueryOptions::default(),
            grid: GridDefaults::default(),
            trend_interval: DEFAULT_TREND_INTERVAL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

fn positive_ms(field: &'static str, value: i64) -> Result<Duration, ConfigurationError> {
    match value {
        v if v < 0 => Err(ConfigurationError::Negative { field, value }),
        0 => Err(ConfigurationError::Zero { field }),
        v => Ok(Duration::from_millis(v as u64)),
    }
}

impl GridCacheConfig {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            Ok(serde_json::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory for log files
    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn validate(&self) -> Result<Settings, ConfigurationError> {
        if self.page_size == 0 {
            return Err(ConfigurationError::Zero { field: "page_size" });
        }
        let query_options = QueryOptions::from_millis(
            self.stale_time_ms,
            self.cache_time_ms,
            self.max_retries,
            self.refetch_interval_ms,
        )?;

        Ok(Settings {
            query_options,
            grid: GridDefaults {
                page_size: self.page_size,
                prefetch_threshold: self.prefetch_threshold,
                overscan: self.overscan,
            },
            trend_interval: positive_ms("trend_interval", self.trend_interval_ms)?,
            sweep_interval: positive_ms("sweep_interval", self.sweep_interval_ms)?,
        })
    }
}
