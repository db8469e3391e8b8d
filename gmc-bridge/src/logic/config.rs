use crate::logic::validation::is_valid_topic;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;
use url::Url;

pub const DEFAULT_BROKER: &str = "tcp://localhost:1883";
pub const DEFAULT_TOPIC: &str = "params";
pub const DEFAULT_OFFLINE_THRESHOLD_MINUTES: u64 = 30;
pub const DEFAULT_CHECK_FREQUENCY_MINUTES: u64 = 5;
/// Upper bound for both presence durations (one year)
pub const MAX_MINUTES: u64 = 365 * 24 * 60;

/// Default MQTT port per scheme
const TCP_PORT: u16 = 1883;
const SSL_PORT: u16 = 8883;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid broker protocol - must start with tcp:// or ssl://")]
    BrokerScheme,

    #[error("invalid broker address '{0}': {1}")]
    BrokerAddress(String, String),

    #[error("invalid topic format - only alphanumeric, underscore, hyphen, and slash allowed")]
    Topic,

    #[error("{0} must be at least one minute")]
    ZeroDuration(&'static str),

    #[error("{0} must not exceed {MAX_MINUTES} minutes")]
    DurationTooLong(&'static str),

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// Bridge configuration, immutable once loaded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Broker URI, `tcp://host:port` or `ssl://host:port`
    pub broker: String,
    /// Base topic every device topic hangs under
    pub topic: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Minutes without a report before a device is marked offline (default: 30)
    pub offline_threshold_minutes: u64,
    /// Minutes between presence sweeps (default: 5)
    pub check_frequency_minutes: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            broker: DEFAULT_BROKER.to_string(),
            topic: DEFAULT_TOPIC.to_string(),
            username: None,
            password: None,
            offline_threshold_minutes: DEFAULT_OFFLINE_THRESHOLD_MINUTES,
            check_frequency_minutes: DEFAULT_CHECK_FREQUENCY_MINUTES,
        }
    }
}

/// Values given on the command line or through the environment
///
/// Thresholds arrive as raw strings so a malformed environment value can fall
/// back to its default instead of aborting startup.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub broker: Option<String>,
    pub topic: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub offline_threshold: Option<String>,
    pub check_frequency: Option<String>,
}

/// Where the broker lives and how to reach it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl BridgeConfig {
    /// Load configuration from a TOML file (supports `~`)
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let expanded = shellexpand::tilde(path).into_owned();
        let content =
            std::fs::read_to_string(Path::new(&expanded)).map_err(|source| ConfigError::Read {
                path: expanded.clone(),
                source,
            })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: expanded,
            source,
        })
    }

    /// Layer command line / environment values over `self`
    pub fn with_overrides(mut self, overrides: ConfigOverrides) -> Self {
        if let Some(broker) = overrides.broker.filter(|b| !b.is_empty()) {
            self.broker = broker;
        }
        if let Some(topic) = overrides.topic.filter(|t| !t.is_empty()) {
            self.topic = topic;
        }
        if let Some(username) = overrides.username.filter(|u| !u.is_empty()) {
            self.username = Some(username);
        }
        if let Some(password) = overrides.password.filter(|p| !p.is_empty()) {
            self.password = Some(password);
        }
        if let Some(raw) = overrides.offline_threshold {
            self.offline_threshold_minutes = parse_minutes(
                "OFFLINE_THRESHOLD_MINUTES",
                &raw,
                DEFAULT_OFFLINE_THRESHOLD_MINUTES,
            );
        }
        if let Some(raw) = overrides.check_frequency {
            self.check_frequency_minutes = parse_minutes(
                "CHECK_FREQUENCY_MINUTES",
                &raw,
                DEFAULT_CHECK_FREQUENCY_MINUTES,
            );
        }
        self
    }

    /// Reject configurations the bridge must not start with
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.broker_address()?;
        if !is_valid_topic(&self.topic) {
            return Err(ConfigError::Topic);
        }
        check_minutes("offline threshold", self.offline_threshold_minutes)?;
        check_minutes("check frequency", self.check_frequency_minutes)?;
        Ok(())
    }

    pub fn broker_address(&self) -> Result<BrokerAddress, ConfigError> {
        let tls = if self.broker.starts_with("tcp://") {
            false
        } else if self.broker.starts_with("ssl://") {
            true
        } else {
            return Err(ConfigError::BrokerScheme);
        };

        let url = Url::parse(&self.broker)
            .map_err(|e| ConfigError::BrokerAddress(self.broker.clone(), e.to_string()))?;
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ConfigError::BrokerAddress(self.broker.clone(), "missing host".into()))?
            .to_string();
        let port = url.port().unwrap_or(if tls { SSL_PORT } else { TCP_PORT });

        Ok(BrokerAddress { host, port, tls })
    }

    /// Credentials are only used when a username is set
    pub fn credentials(&self) -> Option<(String, String)> {
        self.username
            .as_ref()
            .map(|u| (u.clone(), self.password.clone().unwrap_or_default()))
    }

    pub fn offline_threshold(&self) -> Duration {
        minutes(self.offline_threshold_minutes)
    }

    pub fn check_frequency(&self) -> Duration {
        minutes(self.check_frequency_minutes)
    }
}

fn minutes(value: u64) -> Duration {
    Duration::from_secs(value.saturating_mul(60))
}

fn check_minutes(name: &'static str, value: u64) -> Result<(), ConfigError> {
    match value {
        0 => Err(ConfigError::ZeroDuration(name)),
        v if v > MAX_MINUTES => Err(ConfigError::DurationTooLong(name)),
        _ => Ok(()),
    }
}

fn parse_minutes(name: &str, raw: &str, default: u64) -> u64 {
    match raw.trim().parse::<u64>() {
        Ok(minutes) => minutes,
        Err(_) => {
            warn!("Invalid {} '{}', using default {} minutes", name, raw, default);
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = BridgeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.offline_threshold(), Duration::from_secs(30 * 60));
        assert_eq!(config.check_frequency(), Duration::from_secs(5 * 60));
        assert_eq!(
            config.broker_address().unwrap(),
            BrokerAddress {
                host: "localhost".into(),
                port: 1883,
                tls: false
            }
        );
    }

    #[test]
    fn test_broker_scheme_restricted() {
        let config = BridgeConfig {
            broker: "mqtt://localhost:1883".into(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::BrokerScheme)));

        let config = BridgeConfig {
            broker: "localhost:1883".into(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::BrokerScheme)));
    }

    #[test]
    fn test_ssl_broker_uses_tls() {
        let config = BridgeConfig {
            broker: "ssl://broker.example.com".into(),
            ..Default::default()
        };
        let address = config.broker_address().unwrap();
        assert!(address.tls);
        assert_eq!(address.port, 8883);
        assert_eq!(address.host, "broker.example.com");
    }

    #[test]
    fn test_invalid_base_topic_rejected() {
        let config = BridgeConfig {
            topic: "params/#".into(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Topic)));
    }

    #[test]
    fn test_overrides_and_fallbacks() {
        let config = BridgeConfig::default().with_overrides(ConfigOverrides {
            broker: Some("ssl://mqtt.local:8884".into()),
            topic: Some("home/geiger".into()),
            username: Some("bridge".into()),
            password: None,
            offline_threshold: Some("ten".into()),
            check_frequency: Some("2".into()),
        });
        assert_eq!(config.broker, "ssl://mqtt.local:8884");
        assert_eq!(config.topic, "home/geiger");
        assert_eq!(config.offline_threshold_minutes, DEFAULT_OFFLINE_THRESHOLD_MINUTES);
        assert_eq!(config.check_frequency_minutes, 2);
        assert_eq!(config.credentials(), Some(("bridge".into(), String::new())));
    }

    #[test]
    fn test_password_without_username_ignored() {
        let config = BridgeConfig {
            password: Some("secret".into()),
            ..Default::default()
        };
        assert_eq!(config.credentials(), None);
    }

    #[test]
    fn test_zero_durations_rejected() {
        let config = BridgeConfig {
            check_frequency_minutes: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::ZeroDuration(_))));
    }

    #[test]
    fn test_huge_durations_rejected_without_overflow() {
        let config = BridgeConfig::default().with_overrides(ConfigOverrides {
            offline_threshold: Some(u64::MAX.to_string()),
            ..Default::default()
        });
        assert_eq!(config.offline_threshold_minutes, u64::MAX);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DurationTooLong("offline threshold"))
        ));
        assert_eq!(config.offline_threshold(), Duration::from_secs(u64::MAX));

        let config = BridgeConfig {
            check_frequency_minutes: MAX_MINUTES,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_file() {
        let config: BridgeConfig = toml::from_str(
            r#"
            topic = "radiation"
            offline_threshold_minutes = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.topic, "radiation");
        assert_eq!(config.offline_threshold_minutes, 10);
        assert_eq!(config.broker, DEFAULT_BROKER);
    }
}
