use std::path::PathBuf;
use std::time::Duration;

use tracing::trace;

use crate::series::retention::{self, RetentionPolicy};

/// Storage backend configuration
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (no persistence)
    #[serde(rename = "none")]
    None,

    /// SQLite database (default for most deployments)
    Sqlite {
        /// Path to the SQLite database file
        #[serde(default = "default_sqlite_path")]
        path: PathBuf,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Sqlite {
            path: default_sqlite_path(),
        }
    }
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("./alarms.db")
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct AlarmsConfig {
    /// Global tick and minimum re-evaluation interval, in seconds
    #[serde(default = "crate::util::get_default_interval")]
    pub interval: u64,

    /// Sleep after a recovered panic, in seconds
    #[serde(default = "default_cooldown")]
    pub cooldown: u64,
}

impl AlarmsConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown)
    }
}

impl Default for AlarmsConfig {
    fn default() -> Self {
        Self {
            interval: crate::util::get_default_interval(),
            cooldown: default_cooldown(),
        }
    }
}

fn default_cooldown() -> u64 {
    15
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    #[serde(default)]
    pub alarms: AlarmsConfig,

    /// Storage configuration (optional - defaults to in-memory)
    pub storage: Option<StorageConfig>,

    #[serde(default = "retention::default_retentions")]
    pub retentions: Vec<RetentionPolicy>,

    #[serde(default = "default_max_points")]
    pub max_points: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            alarms: AlarmsConfig::default(),
            storage: None,
            retentions: retention::default_retentions(),
            max_points: default_max_points(),
        }
    }
}

fn default_max_points() -> usize {
    retention::MAX_POINTS
}

pub fn read_config_file(path: &str) -> anyhow::Result<Config> {
    let file_content = std::fs::read_to_string(path)?;
    parse_config(&file_content).inspect(|config| trace!("loaded config: {config:?}"))
}

pub fn parse_config(content: &str) -> anyhow::Result<Config> {
    let config: Config = serde_json::from_str(content)
        .map_err(|e| anyhow::anyhow!("Invalid configuration file provided! {e}"))?;

    retention::validate_order(&config.retentions)?;
    if config.max_points == 0 || config.max_points > retention::MAX_POINTS {
        anyhow::bail!(
            "max_points must be between 1 and {}, got {}",
            retention::MAX_POINTS,
            config.max_points
        );
    }

    Ok(config)
}
