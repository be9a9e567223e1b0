use serde::Deserialize;
use std::path::Path;

use crate::models::LineFilter;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// STIB open-data API credentials
    pub client_id: String,
    pub client_secret: String,
    /// Language for destinations and service messages ("fr" or "nl")
    #[serde(default = "Config::default_lang")]
    pub lang: String,
    /// Allowed CORS origins. Required unless cors_permissive is true.
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Explicitly allow all origins (development only). Defaults to false.
    #[serde(default)]
    pub cors_permissive: bool,
    /// Refresh scheduling configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Monitored stops
    pub stops: Vec<StopConfig>,
}

impl Config {
    fn default_lang() -> String {
        "fr".to_string()
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::ReadError(e.to_string()))?;

        let config: Config =
            serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stops.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one stop must be configured".to_string(),
            ));
        }
        if self.scheduler.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_secs must be greater than zero".to_string(),
            ));
        }
        if !matches!(self.lang.as_str(), "fr" | "nl") {
            return Err(ConfigError::Invalid(format!(
                "unsupported lang '{}' (expected fr or nl)",
                self.lang
            )));
        }
        for stop in &self.stops {
            if stop.max_passages == 0 {
                return Err(ConfigError::Invalid(format!(
                    "stop '{}': max_passages must be greater than zero",
                    stop.stop_name
                )));
            }
        }
        Ok(())
    }
}

/// Configuration for the refresh scheduler
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Interval in seconds between poll ticks (default: 60)
    #[serde(default = "SchedulerConfig::default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Upper bound in seconds on the per-stop refresh interval (default: 60,
    /// the current upstream rate-limit guidance). Per-stop overrides allowed.
    #[serde(default = "SchedulerConfig::default_refresh_ceiling_secs")]
    pub refresh_ceiling_secs: u64,
    /// Maximum concurrent requests to the STIB API (default: 10)
    #[serde(default = "SchedulerConfig::default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    /// How many times to retry the initial poll before giving up (default: 5)
    #[serde(default = "SchedulerConfig::default_startup_retries")]
    pub startup_retries: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: Self::default_poll_interval_secs(),
            refresh_ceiling_secs: Self::default_refresh_ceiling_secs(),
            max_concurrent_requests: Self::default_max_concurrent_requests(),
            startup_retries: Self::default_startup_retries(),
        }
    }
}

impl SchedulerConfig {
    fn default_poll_interval_secs() -> u64 {
        60
    }
    fn default_refresh_ceiling_secs() -> u64 {
        60
    }
    fn default_max_concurrent_requests() -> usize {
        10
    }
    fn default_startup_retries() -> u32 {
        5
    }
}

/// One monitored stop
#[derive(Debug, Clone, Deserialize)]
pub struct StopConfig {
    pub stop_name: String,
    /// Allow-list of (line, destination) pairs; empty means unfiltered
    #[serde(default)]
    pub filter: Vec<LineFilter>,
    /// Cap on how many passages are requested and retained (default: 3)
    #[serde(default = "StopConfig::default_max_passages")]
    pub max_passages: usize,
    /// Per-stop override of the refresh ceiling
    pub refresh_ceiling_secs: Option<u64>,
}

impl StopConfig {
    fn default_max_passages() -> usize {
        3
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),
    #[error("Failed to parse config: {0}")]
    ParseError(String),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
client_id: "id"
client_secret: "secret"
stops:
  - stop_name: "De Brouckère"
"#;

    #[test]
    fn test_minimal_config_applies_defaults() {
        let config: Config = serde_yaml::from_str(MINIMAL).unwrap();
        config.validate().unwrap();
        assert_eq!(config.lang, "fr");
        assert_eq!(config.scheduler.poll_interval_secs, 60);
        assert_eq!(config.scheduler.refresh_ceiling_secs, 60);
        assert_eq!(config.stops.len(), 1);
        assert_eq!(config.stops[0].max_passages, 3);
        assert!(config.stops[0].filter.is_empty());
        assert!(config.stops[0].refresh_ceiling_secs.is_none());
    }

    #[test]
    fn test_full_stop_entry() {
        let yaml = r#"
client_id: "id"
client_secret: "secret"
lang: nl
scheduler:
  poll_interval_secs: 30
stops:
  - stop_name: "Diamant"
    max_passages: 5
    refresh_ceiling_secs: 90
    filter:
      - line: "7"
        destination: "Vanderkindere"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.lang, "nl");
        assert_eq!(config.scheduler.poll_interval_secs, 30);
        let stop = &config.stops[0];
        assert_eq!(stop.max_passages, 5);
        assert_eq!(stop.refresh_ceiling_secs, Some(90));
        assert_eq!(stop.filter[0].line, "7");
    }

    #[test]
    fn test_rejects_empty_stops() {
        let yaml = r#"
client_id: "id"
client_secret: "secret"
stops: []
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_unknown_lang() {
        let yaml = r#"
client_id: "id"
client_secret: "secret"
lang: de
stops:
  - stop_name: "Diamant"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
