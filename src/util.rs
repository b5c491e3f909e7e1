use std::path::PathBuf;
use std::time::Duration;

const ALARM_CONFIG: &str = "ALARM_CONFIG";

const DEFAULT_CONFIG: &str = "./config.json";

pub fn get_config_path() -> String {
    std::env::var(ALARM_CONFIG).unwrap_or_else(|_| DEFAULT_CONFIG.to_string())
}

const ALARM_INTERVAL: &str = "ALARM_INTERVAL";

const DEFAULT_INTERVAL: u64 = 15;

pub fn get_default_interval() -> u64 {
    DEFAULT_INTERVAL
}

/// Global tick override in seconds, if set and valid
pub fn get_interval() -> Option<u64> {
    let interval_from_env = std::env::var(ALARM_INTERVAL);
    interval_from_env.ok().and_then(|res| res.parse().ok())
}

const ALARM_DB: &str = "ALARM_DB";

pub fn get_database_path() -> Option<PathBuf> {
    let path_from_env = std::env::var(ALARM_DB);
    path_from_env.ok().map(PathBuf::from)
}

/// Serialize a [`Duration`] as whole seconds
pub mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// `chrono` arithmetic on a std duration, saturating on overflow
pub fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
