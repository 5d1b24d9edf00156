//! `relaymq.toml` loading.
//!
//! File values provide defaults and `RELAYMQ_*` environment variables
//! override them. Every key is optional.

use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use thiserror::Error;

use crate::broker::BrokerConfig;
use crate::client::{ClientOptions, ConsumerOptions, MIN_ACK_TIMEOUT};
use crate::core::subscription::SubscriptionType;

pub const DEFAULT_SERVICE_URL: &str = "pulsar://localhost:6650";
pub const DEFAULT_TOPIC: &str = "persistent://public/default/some_partition_topic";
pub const DEFAULT_SUBSCRIPTION: &str = "subName";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("config parse error: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub sample: SampleSettings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SampleSettings {
    pub service_url: String,
    pub topic: String,
    pub subscription: String,
    pub subscription_type: SubscriptionType,
    pub ack_timeout: Option<Duration>,
    pub message_count: u32,
    pub auth_token: Option<String>,
    pub connection_timeout: Duration,
    pub operation_timeout: Duration,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    broker: BrokerConfig,
    sample: Option<FileSample>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
struct FileSample {
    service_url: Option<String>,
    topic: Option<String>,
    subscription: Option<String>,
    subscription_type: Option<SubscriptionType>,
    /// 0 disables ack timeouts.
    ack_timeout_ms: Option<u64>,
    message_count: Option<u32>,
    auth_token: Option<String>,
    connection_timeout_ms: Option<u64>,
    operation_timeout_ms: Option<u64>,
}

impl Default for SampleSettings {
    fn default() -> Self {
        Self {
            service_url: DEFAULT_SERVICE_URL.to_string(),
            topic: DEFAULT_TOPIC.to_string(),
            subscription: DEFAULT_SUBSCRIPTION.to_string(),
            subscription_type: SubscriptionType::Shared,
            ack_timeout: Some(Duration::from_secs(60)),
            message_count: 5,
            auth_token: None,
            connection_timeout: crate::client::DEFAULT_CONNECTION_TIMEOUT,
            operation_timeout: crate::client::DEFAULT_OPERATION_TIMEOUT,
        }
    }
}

impl Config {
    /// Load configuration from an optional file path and environment variables.
    ///
    /// Precedence: file values provide defaults, environment variables override.
    /// Without a path, `RELAYMQ_CONFIG` names the file; without either only
    /// built-in defaults and the environment apply.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let env_path = env::var("RELAYMQ_CONFIG").ok();
        let file_cfg = match (path, env_path) {
            (Some(p), _) => read_file(p)?,
            (None, Some(p)) => read_file(Path::new(&p))?,
            (None, None) => FileConfig::default(),
        };

        let mut config = Self::from_file_config(file_cfg)?;
        config.apply_overrides(|key| env::var(key).ok())?;
        Ok(config)
    }

    /// Parses a TOML document without consulting the environment.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let file_cfg: FileConfig = toml::from_str(raw)?;
        Self::from_file_config(file_cfg)
    }

    fn from_file_config(file_cfg: FileConfig) -> Result<Self, ConfigError> {
        let defaults = SampleSettings::default();
        let broker = file_cfg.broker;
        let sample = file_cfg.sample.unwrap_or_default();

        if broker.ack_check_interval.is_zero() {
            return Err(ConfigError::Parse(
                "broker.ack_check_interval_ms must be greater than 0".into(),
            ));
        }

        let ack_timeout = match sample.ack_timeout_ms {
            Some(ms) => ack_timeout_from_ms("sample.ack_timeout_ms", ms)?,
            None => defaults.ack_timeout,
        };
        let connection_timeout = sample
            .connection_timeout_ms
            .map(|ms| non_zero_ms("sample.connection_timeout_ms", ms))
            .transpose()?
            .unwrap_or(defaults.connection_timeout);
        let operation_timeout = sample
            .operation_timeout_ms
            .map(|ms| non_zero_ms("sample.operation_timeout_ms", ms))
            .transpose()?
            .unwrap_or(defaults.operation_timeout);

        Ok(Self {
            broker,
            sample: SampleSettings {
                service_url: sample.service_url.unwrap_or(defaults.service_url),
                topic: sample.topic.unwrap_or(defaults.topic),
                subscription: sample.subscription.unwrap_or(defaults.subscription),
                subscription_type: sample
                    .subscription_type
                    .unwrap_or(defaults.subscription_type),
                ack_timeout,
                message_count: sample.message_count.unwrap_or(defaults.message_count),
                auth_token: sample.auth_token.or(defaults.auth_token),
                connection_timeout,
                operation_timeout,
            },
        })
    }

    /// Applies `RELAYMQ_*` overrides from `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("RELAYMQ_BIND_ADDR") {
            self.broker.bind_addr = parse_addr("RELAYMQ_BIND_ADDR", &v)?;
        }
        if let Some(v) = lookup("RELAYMQ_ALLOWED_TOKENS") {
            self.broker.allowed_tokens = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = lookup("RELAYMQ_SERVICE_URL") {
            self.sample.service_url = v;
        }
        if let Some(v) = lookup("RELAYMQ_TOPIC") {
            self.sample.topic = v;
        }
        if let Some(v) = lookup("RELAYMQ_SUBSCRIPTION") {
            self.sample.subscription = v;
        }
        if let Some(v) = lookup("RELAYMQ_AUTH_TOKEN") {
            self.sample.auth_token = (!v.is_empty()).then_some(v);
        }
        Ok(())
    }
}

impl SampleSettings {
    pub fn client_options(&self) -> ClientOptions {
        let mut options = ClientOptions::new(self.service_url.clone())
            .connection_timeout(self.connection_timeout)
            .operation_timeout(self.operation_timeout);
        if let Some(token) = &self.auth_token {
            options = options.auth_token(token.clone());
        }
        options
    }

    pub fn consumer_options(&self) -> ConsumerOptions {
        let mut options = ConsumerOptions::new(self.topic.clone(), self.subscription.clone())
            .subscription_type(self.subscription_type);
        if let Some(timeout) = self.ack_timeout {
            options = options.ack_timeout(timeout);
        }
        options
    }
}

/// Reads `path` and applies environment overrides.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    Config::load(Some(path.as_ref()))
}

/// Reads a millisecond count into a `Duration`.
pub(crate) fn duration_from_ms<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}

fn read_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let raw = fs::read_to_string(path)?;
    Ok(toml::from_str(&raw)?)
}

fn parse_addr(field: &str, raw: &str) -> Result<SocketAddr, ConfigError> {
    raw.parse()
        .map_err(|e| ConfigError::Parse(format!("{field}: `{raw}`: {e}")))
}

fn non_zero_ms(field: &str, ms: u64) -> Result<Duration, ConfigError> {
    if ms == 0 {
        return Err(ConfigError::Parse(format!("{field} must be greater than 0")));
    }
    Ok(Duration::from_millis(ms))
}

fn ack_timeout_from_ms(field: &str, ms: u64) -> Result<Option<Duration>, ConfigError> {
    if ms == 0 {
        return Ok(None);
    }
    let timeout = Duration::from_millis(ms);
    if timeout < MIN_ACK_TIMEOUT {
        return Err(ConfigError::Parse(format!(
            "{field} must be 0 or at least {}",
            MIN_ACK_TIMEOUT.as_millis()
        )));
    }
    Ok(Some(timeout))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn empty_document_uses_sample_defaults() {
        let cfg = Config::from_toml_str("").unwrap();
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.sample.subscription_type, SubscriptionType::Shared);
        assert_eq!(cfg.sample.ack_timeout, Some(Duration::from_secs(60)));
        assert_eq!(cfg.sample.message_count, 5);
    }

    #[test]
    fn zero_ack_timeout_disables_it() {
        let cfg = Config::from_toml_str("[sample]\nack_timeout_ms = 0\n").unwrap();
        assert_eq!(cfg.sample.ack_timeout, None);
    }

    #[test]
    fn rejects_sub_second_ack_timeout_and_zero_interval() {
        assert!(matches!(
            Config::from_toml_str("[sample]\nack_timeout_ms = 10\n"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            Config::from_toml_str("[broker]\nack_check_interval_ms = 0\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn broker_section_deserializes_into_broker_config() {
        let cfg = Config::from_toml_str(
            "[broker]\nbind_addr = \"0.0.0.0:7001\"\nack_check_interval_ms = 250\n",
        )
        .unwrap();
        assert_eq!(
            cfg.broker,
            BrokerConfig {
                bind_addr: "0.0.0.0:7001".parse().unwrap(),
                allowed_tokens: Vec::new(),
                ack_check_interval: Duration::from_millis(250),
            }
        );
        assert!(matches!(
            Config::from_toml_str("[broker]\nbind_addr = \"nowhere\"\n"),
            Err(ConfigError::Toml(_))
        ));
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(matches!(
            Config::from_toml_str("[sample]\ntopik = \"x\"\n"),
            Err(ConfigError::Toml(_))
        ));
        assert!(matches!(
            Config::from_toml_str("[broker]\nport = 1\n"),
            Err(ConfigError::Toml(_))
        ));
    }

    #[test]
    fn env_overrides_win() {
        let mut cfg = Config::from_toml_str("[sample]\ntopic = \"from-file\"\n").unwrap();
        let env: HashMap<&str, &str> = HashMap::from([
            ("RELAYMQ_TOPIC", "from-env"),
            ("RELAYMQ_ALLOWED_TOKENS", "a, b,,"),
            ("RELAYMQ_BIND_ADDR", "0.0.0.0:7000"),
        ]);
        cfg.apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(cfg.sample.topic, "from-env");
        assert_eq!(cfg.broker.allowed_tokens, vec!["a", "b"]);
        assert_eq!(cfg.broker.bind_addr, "0.0.0.0:7000".parse().unwrap());
    }

    #[test]
    fn bad_bind_addr_is_a_parse_error() {
        let mut cfg = Config::default();
        let err = cfg
            .apply_overrides(|k| (k == "RELAYMQ_BIND_ADDR").then(|| "nope".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
