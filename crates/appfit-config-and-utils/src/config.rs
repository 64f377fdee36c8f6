//! Configuration management for the outbox.

use crate::{CoreError, CoreResult, Paths};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Default collector URL (can be overridden at compile time via APPFIT_API_URL env var).
pub const DEFAULT_API_BASE_URL: &str = match option_env!("APPFIT_API_URL") {
    Some(url) => url,
    None => "https://api.appfit.io",
};

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Default interval between disk checkpoints.
pub const DEFAULT_CHECKPOINT_INTERVAL_SECS: u64 = 5 * 60;

/// Default interval between retry drains.
pub const DEFAULT_RETRY_INTERVAL_SECS: u64 = 15 * 60;

/// Default caller-imposed timeout for a single transport call.
pub const DEFAULT_SEND_TIMEOUT_SECS: u64 = 30;

/// Outbox configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutboxConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Collector base URL.
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    /// Seconds between checkpoints of the event store to disk.
    #[serde(default = "default_checkpoint_interval_secs")]
    pub checkpoint_interval_secs: u64,
    /// Seconds between retry drains of the event store.
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,
    /// Seconds before a transport call is treated as failed.
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_api_base_url() -> String {
    DEFAULT_API_BASE_URL.to_string()
}

fn default_checkpoint_interval_secs() -> u64 {
    DEFAULT_CHECKPOINT_INTERVAL_SECS
}

fn default_retry_interval_secs() -> u64 {
    DEFAULT_RETRY_INTERVAL_SECS
}

fn default_send_timeout_secs() -> u64 {
    DEFAULT_SEND_TIMEOUT_SECS
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            api_base_url: default_api_base_url(),
            checkpoint_interval_secs: DEFAULT_CHECKPOINT_INTERVAL_SECS,
            retry_interval_secs: DEFAULT_RETRY_INTERVAL_SECS,
            send_timeout_secs: DEFAULT_SEND_TIMEOUT_SECS,
        }
    }
}

impl OutboxConfig {
    /// Create a new config with default values, then override from environment.
    pub fn new() -> CoreResult<Self> {
        let mut config = Self::default();
        config.load_from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the config file, falling back to defaults.
    ///
    /// Environment variables take precedence over the file.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.load_from_env()?;
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: OutboxConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to the config file.
    pub fn save(&self, paths: &Paths) -> CoreResult<()> {
        paths.ensure_dirs()?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(paths.config_file(), content)?;
        Ok(())
    }

    /// Reject values the scheduler cannot honor.
    pub fn validate(&self) -> CoreResult<()> {
        if self.checkpoint_interval_secs == 0 {
            return Err(CoreError::Config(
                "checkpoint_interval_secs must be positive".to_string(),
            ));
        }
        if self.retry_interval_secs == 0 {
            return Err(CoreError::Config(
                "retry_interval_secs must be positive".to_string(),
            ));
        }
        if self.send_timeout_secs == 0 {
            return Err(CoreError::Config(
                "send_timeout_secs must be positive".to_string(),
            ));
        }
        self.api_base_url()?;
        Ok(())
    }

    /// Checkpoint interval as a duration.
    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs)
    }

    /// Retry drain interval as a duration.
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    /// Transport timeout as a duration.
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    /// Get the collector URL as a parsed URL.
    pub fn api_base_url(&self) -> CoreResult<Url> {
        Url::parse(&self.api_base_url).map_err(CoreError::from)
    }

    fn load_from_env(&mut self) -> CoreResult<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `APPFIT_*` overrides read through `lookup`.
    fn apply_overrides<F>(&mut self, lookup: F) -> CoreResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(log_level) = lookup("APPFIT_LOG_LEVEL") {
            self.log_level = log_level;
        }
        if let Some(raw) = lookup("APPFIT_CHECKPOINT_INTERVAL_SECS") {
            self.checkpoint_interval_secs = parse_secs("APPFIT_CHECKPOINT_INTERVAL_SECS", &raw)?;
        }
        if let Some(raw) = lookup("APPFIT_RETRY_INTERVAL_SECS") {
            self.retry_interval_secs = parse_secs("APPFIT_RETRY_INTERVAL_SECS", &raw)?;
        }
        Ok(())
    }
}

fn parse_secs(name: &str, raw: &str) -> CoreResult<u64> {
    raw.trim()
        .parse::<u64>()
        .map_err(|e| CoreError::Config(format!("{} is not a number of seconds: {}", name, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = OutboxConfig::default();
        assert_eq!(config.log_level, DEFAULT_LOG_LEVEL);
        assert_eq!(config.api_base_url, DEFAULT_API_BASE_URL);
        assert_eq!(config.checkpoint_interval(), Duration::from_secs(300));
        assert_eq!(config.retry_interval(), Duration::from_secs(900));
        assert_eq!(config.send_timeout(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_load_from_file_partial() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.json");

        std::fs::write(&config_path, r#"{ "retry_interval_secs": 60 }"#).unwrap();

        let config = OutboxConfig::load_from_file(&config_path).unwrap();
        assert_eq!(config.retry_interval_secs, 60);
        assert_eq!(config.checkpoint_interval_secs, DEFAULT_CHECKPOINT_INTERVAL_SECS);
        assert_eq!(config.log_level, DEFAULT_LOG_LEVEL);
    }

    #[test]
    fn test_config_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());

        let config = OutboxConfig {
            checkpoint_interval_secs: 42,
            ..Default::default()
        };
        config.save(&paths).unwrap();

        let loaded = OutboxConfig::load_from_file(&paths.config_file()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_config_load_nonexistent_uses_defaults() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());

        let config = OutboxConfig::load(&paths).unwrap();
        assert_eq!(config.api_base_url, DEFAULT_API_BASE_URL);
    }

    #[test]
    fn test_zero_intervals_rejected() {
        let config = OutboxConfig {
            checkpoint_interval_secs: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(CoreError::Config(_))));

        let config = OutboxConfig {
            retry_interval_secs: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(CoreError::Config(_))));
    }

    #[test]
    fn test_invalid_url_rejected() {
        let config = OutboxConfig {
            api_base_url: "not a valid url".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(CoreError::InvalidUrl(_))));
    }

    #[test]
    fn test_overrides_apply() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("APPFIT_LOG_LEVEL", "debug"),
            ("APPFIT_RETRY_INTERVAL_SECS", " 120 "),
        ]);
        let mut config = OutboxConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.log_level, "debug");
        assert_eq!(config.retry_interval_secs, 120);
        assert_eq!(config.checkpoint_interval_secs, DEFAULT_CHECKPOINT_INTERVAL_SECS);
    }

    #[test]
    fn test_override_not_a_number() {
        let mut config = OutboxConfig::default();
        let result = config.apply_overrides(|key| {
            (key == "APPFIT_CHECKPOINT_INTERVAL_SECS").then(|| "soon".to_string())
        });
        assert!(matches!(result, Err(CoreError::Config(_))));
    }
}
