//! Link configuration.
//!
//! Every field has a default so an empty file (or no file at all) yields a
//! working configuration. Values come from an optional TOML file and are
//! overridden by `LINK__*` environment variables, e.g.
//! `LINK__CLOSE_TIMEOUT_SECS=30` or `LINK__RETRY__MAX_RETRIES=5`.

use crate::receiver::ReceiverOptions;
use crate::retry::RetryOptions;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Upper bound for the close acknowledgment wait
pub const MAX_CLOSE_TIMEOUT_SECS: u64 = 600;

/// Upper bound for the dispatcher queue
pub const MAX_DISPATCHER_QUEUE_CAPACITY: usize = 65_536;

const ENV_PREFIX: &str = "LINK";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// How long a local close waits for the peer to acknowledge
    pub close_timeout_secs: u64,
    /// Work items the dispatcher queue holds before rejecting
    pub dispatcher_queue_capacity: usize,
    /// Credits granted when the link opens
    pub prefetch: u32,
    pub retry: RetryOptions,
    pub token: TokenRenewalConfig,
    pub logging: LoggingConfig,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            close_timeout_secs: 60,
            dispatcher_queue_capacity: 1024,
            prefetch: 500,
            retry: RetryOptions::default(),
            token: TokenRenewalConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl LinkConfig {
    /// Load from an optional TOML file plus `LINK__*` environment overrides,
    /// then validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigLoadError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let link_config = config.try_deserialize::<LinkConfig>()?;
        link_config
            .validate()
            .map_err(ConfigLoadError::Validation)?;

        log::debug!("Loaded link configuration: {link_config:?}");
        Ok(link_config)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.close_timeout_secs)
    }

    pub fn receiver_options(&self) -> ReceiverOptions {
        ReceiverOptions {
            close_timeout: self.close_timeout(),
        }
    }

    pub fn validate(&self) -> Result<(), Vec<ConfigValidationError>> {
        let mut errors = Vec::new();

        if self.close_timeout_secs == 0 || self.close_timeout_secs > MAX_CLOSE_TIMEOUT_SECS {
            errors.push(ConfigValidationError::CloseTimeout {
                configured: self.close_timeout_secs,
                limit: MAX_CLOSE_TIMEOUT_SECS,
            });
        }

        if self.dispatcher_queue_capacity == 0
            || self.dispatcher_queue_capacity > MAX_DISPATCHER_QUEUE_CAPACITY
        {
            errors.push(ConfigValidationError::QueueCapacity {
                configured: self.dispatcher_queue_capacity,
                limit: MAX_DISPATCHER_QUEUE_CAPACITY,
            });
        }

        if self.retry.delay_ms > self.retry.max_delay_ms {
            errors.push(ConfigValidationError::RetryDelay {
                delay_ms: self.retry.delay_ms,
                max_delay_ms: self.retry.max_delay_ms,
            });
        }

        if self.retry.try_timeout_secs == 0 {
            errors.push(ConfigValidationError::TryTimeout);
        }

        if self.token.min_refresh_interval_secs == 0 {
            errors.push(ConfigValidationError::RefreshInterval);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Token renewal settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TokenRenewalConfig {
    /// Renew this long before the current token expires
    pub refresh_before_secs: u64,
    /// Never renew more often than this
    pub min_refresh_interval_secs: u64,
}

impl Default for TokenRenewalConfig {
    fn default() -> Self {
        Self {
            refresh_before_secs: 300,
            min_refresh_interval_secs: 30,
        }
    }
}

impl TokenRenewalConfig {
    pub fn refresh_before(&self) -> Duration {
        Duration::from_secs(self.refresh_before_secs)
    }

    pub fn min_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.min_refresh_interval_secs)
    }
}

/// Logging configuration consumed by binaries that install a logger
#[derive(Debug, Deserialize, Default, Clone, PartialEq)]
pub struct LoggingConfig {
    level: Option<String>,
    file: Option<String>,
}

impl LoggingConfig {
    pub fn level(&self) -> &str {
        self.level.as_deref().unwrap_or("info")
    }

    pub fn file(&self) -> Option<&str> {
        self.file.as_deref()
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigValidationError {
    #[error("Invalid close_timeout_secs: {configured} (must be 1..={limit})")]
    CloseTimeout { configured: u64, limit: u64 },
    #[error("Invalid dispatcher_queue_capacity: {configured} (must be 1..={limit})")]
    QueueCapacity { configured: usize, limit: usize },
    #[error("Invalid retry delay: delay_ms {delay_ms} exceeds max_delay_ms {max_delay_ms}")]
    RetryDelay { delay_ms: u64, max_delay_ms: u64 },
    #[error("Invalid retry.try_timeout_secs: must be greater than zero")]
    TryTimeout,
    #[error("Invalid token.min_refresh_interval_secs: must be greater than zero")]
    RefreshInterval,
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] config::ConfigError),
    #[error("Configuration validation failed: {}", format_errors(.0))]
    Validation(Vec<ConfigValidationError>),
}

fn format_errors(errors: &[ConfigValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
