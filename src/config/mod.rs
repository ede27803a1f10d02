//! Application configuration.
//!
//! A single `BridgeConfig` loaded once at startup from YAML files and
//! environment variables, then validated before anything connects.

mod broker;

pub use broker::{AmqpConfig, BrokerConfig, BrokerType, SqsConfig};

use std::time::Duration;

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "fault-bridge.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "FAULT_BRIDGE_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "FAULT_BRIDGE";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "FAULT_BRIDGE_LOG";

/// Suffix appended to the return queue to form the poison queue.
pub const POISON_QUEUE_SUFFIX: &str = ".poison";

/// Longest accepted interval for periodic tasks.
pub const MAX_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Missing required setting '{0}'")]
    Missing(&'static str),

    #[error("Invalid setting '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Bridge configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// ServiceControl error queue that receives forwarded faults.
    pub error_queue: String,
    /// Queue ServiceControl sends retries to.
    pub return_queue: String,
    /// ServiceControl status queue for heartbeats and custom checks.
    pub control_queue: String,
    /// Seconds between queue discovery runs.
    pub queue_scan_interval_secs: f64,
    /// Seconds between heartbeats.
    pub heartbeat_interval_secs: f64,
    /// Seconds between poison queue checks.
    pub custom_checks_interval_secs: f64,
    /// Immediate retries before a message is moved to the poison queue.
    pub max_retries: u32,
    /// First retry delay in milliseconds.
    pub retry_base_delay_ms: u64,
    /// Retry delay ceiling in milliseconds (before jitter).
    pub retry_max_delay_ms: u64,
    /// Regular expression selecting error queues. Replaces the
    /// `_error`/`_skipped` naming convention when set.
    pub queue_filter: Option<String>,
    pub broker: BrokerConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            error_queue: "error".to_string(),
            return_queue: String::new(),
            control_queue: "Particular.ServiceControl".to_string(),
            queue_scan_interval_secs: 60.0,
            heartbeat_interval_secs: 60.0,
            custom_checks_interval_secs: 60.0,
            max_retries: 15,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 60_000,
            queue_filter: None,
            broker: BrokerConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// Defaults with the given return queue.
    pub fn new(return_queue: impl Into<String>) -> Self {
        Self {
            return_queue: return_queue.into(),
            ..Self::default()
        }
    }

    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `fault-bridge.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    ///
    /// The result is validated before it is returned.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config: BridgeConfig = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Check required settings and value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.return_queue.trim().is_empty() {
            return Err(ConfigError::Missing("return_queue"));
        }
        if self.error_queue.trim().is_empty() {
            return Err(ConfigError::Missing("error_queue"));
        }
        if self.control_queue.trim().is_empty() {
            return Err(ConfigError::Missing("control_queue"));
        }
        if self.return_queue == self.error_queue {
            return Err(ConfigError::Invalid {
                field: "return_queue",
                reason: "must differ from error_queue".to_string(),
            });
        }

        for (field, secs) in [
            ("queue_scan_interval_secs", self.queue_scan_interval_secs),
            ("heartbeat_interval_secs", self.heartbeat_interval_secs),
            ("custom_checks_interval_secs", self.custom_checks_interval_secs),
        ] {
            match Duration::try_from_secs_f64(secs) {
                Ok(interval) if !interval.is_zero() && interval <= MAX_INTERVAL => {}
                _ => {
                    return Err(ConfigError::Invalid {
                        field,
                        reason: format!(
                            "must be between 0 and {} seconds, got {}",
                            MAX_INTERVAL.as_secs(),
                            secs
                        ),
                    })
                }
            }
        }

        if u128::from(self.retry_max_delay_ms) > MAX_INTERVAL.as_millis() {
            return Err(ConfigError::Invalid {
                field: "retry_max_delay_ms",
                reason: format!("must not exceed {} ms", MAX_INTERVAL.as_millis()),
            });
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(ConfigError::Invalid {
                field: "retry_base_delay_ms",
                reason: "must not exceed retry_max_delay_ms".to_string(),
            });
        }

        if let Some(filter) = &self.queue_filter {
            regex::Regex::new(filter).map_err(|e| ConfigError::Invalid {
                field: "queue_filter",
                reason: e.to_string(),
            })?;
        }

        self.broker.validate()
    }

    /// Queue for messages that cannot be forwarded or returned.
    pub fn poison_queue(&self) -> String {
        format!("{}{}", self.return_queue, POISON_QUEUE_SUFFIX)
    }

    pub fn queue_scan_interval(&self) -> Duration {
        interval(self.queue_scan_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        interval(self.heartbeat_interval_secs)
    }

    pub fn custom_checks_interval(&self) -> Duration {
        interval(self.custom_checks_interval_secs)
    }
}

/// Seconds as a duration, clamped to `MAX_INTERVAL` for unvalidated values.
fn interval(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs)
        .map(|interval| interval.min(MAX_INTERVAL))
        .unwrap_or(MAX_INTERVAL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_config_default() {
        let config = BridgeConfig::default();
        assert_eq!(config.error_queue, "error");
        assert_eq!(config.control_queue, "Particular.ServiceControl");
        assert_eq!(config.max_retries, 15);
        assert_eq!(config.queue_scan_interval(), Duration::from_secs(60));
        assert!(config.queue_filter.is_none());
    }

    #[test]
    fn test_poison_queue_is_derived() {
        let config = BridgeConfig::new("Retry.Return");
        assert_eq!(config.poison_queue(), "Retry.Return.poison");
    }

    #[test]
    fn test_validate_requires_return_queue() {
        let config = BridgeConfig::default();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing("return_queue"))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_filter() {
        let config = BridgeConfig {
            queue_filter: Some("([unclosed".to_string()),
            ..BridgeConfig::new("Retry.Return")
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "queue_filter",
                ..
            })
        ));
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let config = BridgeConfig {
            heartbeat_interval_secs: 0.0,
            ..BridgeConfig::new("Retry.Return")
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_out_of_range_interval() {
        for secs in [1e300, f64::INFINITY, f64::NAN, -1.0, 86_401.0] {
            let config = BridgeConfig {
                queue_scan_interval_secs: secs,
                ..BridgeConfig::new("Retry.Return")
            };
            assert!(matches!(
                config.validate(),
                Err(ConfigError::Invalid {
                    field: "queue_scan_interval_secs",
                    ..
                })
            ));
            assert_eq!(config.queue_scan_interval(), MAX_INTERVAL);
        }
    }

    #[test]
    fn test_validate_rejects_unbounded_retry_delay() {
        let config = BridgeConfig {
            retry_max_delay_ms: u64::MAX,
            ..BridgeConfig::new("Retry.Return")
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "retry_max_delay_ms",
                ..
            })
        ));
    }

    #[test]
    fn test_validate_accepts_one_day_interval() {
        let config = BridgeConfig {
            heartbeat_interval_secs: 86_400.0,
            ..BridgeConfig::new("Retry.Return")
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.heartbeat_interval(), MAX_INTERVAL);
    }

    #[test]
    fn test_validate_rejects_same_queue() {
        let config = BridgeConfig::new("error");
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_load_from_file_and_env() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "return_queue: Retry.Return\nqueue_scan_interval_secs: 5\nbroker:\n  type: channel"
        )
        .unwrap();

        std::env::set_var("FAULT_BRIDGE__MAX_RETRIES", "3");
        let config = BridgeConfig::load(file.path().to_str());
        std::env::remove_var("FAULT_BRIDGE__MAX_RETRIES");

        let config = config.unwrap();
        assert_eq!(config.return_queue, "Retry.Return");
        assert_eq!(config.queue_scan_interval(), Duration::from_secs(5));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.broker.broker_type, BrokerType::Channel);
    }

    #[test]
    #[serial]
    fn test_load_without_return_queue_fails() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "error_queue: error").unwrap();

        let result = BridgeConfig::load(file.path().to_str());
        assert!(matches!(result, Err(ConfigError::Missing("return_queue"))));
    }
}
