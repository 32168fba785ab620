//! Application configuration.
//!
//! Loaded from optional YAML files, then `STICKER_AWARD__*` environment
//! variables, then the deployment variables injected by the infrastructure
//! stacks (`EVENT_BUS_NAME`, `USER_REGISTERED_QUEUE_URL`, `AWS_REGION`,
//! `KAFKA_BROKERS`).

mod awards;
mod messaging;

pub use awards::AwardsConfig;
pub use messaging::{
    AwsConfig, KafkaConfig, MessagingConfig, MessagingProvider, DEFAULT_MAX_CONCURRENCY,
    DEFAULT_VISIBILITY_TIMEOUT_SECS, DEFAULT_WAIT_TIME_SECS,
};

use std::time::Duration;

use serde::Deserialize;

/// Default config file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable holding an explicit config file path.
pub const CONFIG_ENV_VAR: &str = "STICKER_AWARD_CONFIG";
/// Prefix for structured environment overrides (`STICKER_AWARD__KAFKA__GROUP_ID`).
pub const CONFIG_ENV_PREFIX: &str = "STICKER_AWARD";
/// Log filter environment variable.
pub const LOG_ENV_VAR: &str = "STICKER_AWARD_LOG";

pub const EVENT_BUS_NAME_ENV_VAR: &str = "EVENT_BUS_NAME";
pub const USER_REGISTERED_QUEUE_URL_ENV_VAR: &str = "USER_REGISTERED_QUEUE_URL";
pub const AWS_REGION_ENV_VAR: &str = "AWS_REGION";
pub const KAFKA_BROKERS_ENV_VAR: &str = "KAFKA_BROKERS";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `STICKER_AWARD_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service_name: String,
    pub messaging_provider: MessagingProvider,
    pub kafka: KafkaConfig,
    pub aws: AwsConfig,
    pub awards: AwardsConfig,
    pub logging: LoggingConfig,
    /// Upper bound on draining in-flight messages at shutdown.
    pub shutdown_grace_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "award-service".to_string(),
            messaging_provider: MessagingProvider::default(),
            kafka: KafkaConfig::default(),
            aws: AwsConfig::default(),
            awards: AwardsConfig::default(),
            logging: LoggingConfig::default(),
            shutdown_grace_secs: 30,
        }
    }
}

impl Config {
    /// Load configuration from files and environment.
    ///
    /// Later sources win: `config.yaml`, `path`, `$STICKER_AWARD_CONFIG`,
    /// `STICKER_AWARD__*` variables, deployment variables.
    pub fn load(path: Option<&str>) -> Result<Self, Box<dyn std::error::Error>> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let brokers = env_non_empty(KAFKA_BROKERS_ENV_VAR).map(|value| {
            value
                .split(',')
                .map(|b| b.trim().to_string())
                .filter(|b| !b.is_empty())
                .collect::<Vec<_>>()
        });

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("kafka.brokers")
                    .try_parsing(true),
            )
            .set_override_option("aws.event_bus_name", env_non_empty(EVENT_BUS_NAME_ENV_VAR))?
            .set_override_option(
                "aws.user_registered_queue_url",
                env_non_empty(USER_REGISTERED_QUEUE_URL_ENV_VAR),
            )?
            .set_override_option("aws.region", env_non_empty(AWS_REGION_ENV_VAR))?
            .set_override_option("kafka.brokers", brokers)?
            .build()?;

        let config: Config = config.try_deserialize()?;
        Ok(config)
    }

    /// The subset consumed by the provider factory.
    pub fn messaging(&self) -> MessagingConfig {
        MessagingConfig {
            provider: self.messaging_provider,
            kafka: self.kafka.clone(),
            aws: self.aws.clone(),
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.service_name, "award-service");
        assert_eq!(config.messaging_provider, MessagingProvider::Kafka);
        assert_eq!(config.awards.welcome_sticker_id, "sticker-001");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.shutdown_grace(), Duration::from_secs(30));
    }

    #[test]
    fn test_messaging_view() {
        let mut config = Config::default();
        config.messaging_provider = MessagingProvider::Aws;
        config.aws.event_bus_name = "bus".to_string();

        let messaging = config.messaging();
        assert_eq!(messaging.provider, MessagingProvider::Aws);
        assert_eq!(messaging.aws.event_bus_name, "bus");
    }
}
