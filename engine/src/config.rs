//! Engine configuration.
//!
//! Loaded from TOML, from the environment, or built in code; always checked
//! with [`EngineConfig::validate`] before use.
//!
//! # Example
//!
//! ```
//! use mediator_engine::config::EngineConfig;
//!
//! let config = EngineConfig::from_toml_str(r#"
//!     mediator_urn = "urn:mediator:patients"
//!     default_concurrency = 4
//!
//!     [http]
//!     timeout_secs = 10
//! "#).unwrap();
//!
//! assert_eq!(config.http.timeout_secs, 10);
//! assert_eq!(config.correlation_header, "x-openhim-transactionid");
//! ```

use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default mediator URN reported in response envelopes.
pub const DEFAULT_MEDIATOR_URN: &str = "urn:mediator:lookup-mediator";

/// Default correlation header; its presence switches auditing on.
pub const DEFAULT_CORRELATION_HEADER: &str = "x-openhim-transactionid";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read
    #[error("Failed to read configuration file {path}: {source}")]
    Read {
        /// File path
        path: String,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// The configuration text is not valid TOML for this schema
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// An environment override could not be parsed
    #[error("Invalid value for {var}: {value}")]
    InvalidEnv {
        /// Variable name
        var: &'static str,
        /// Offending value
        value: String,
    },

    /// A value is out of range
    #[error("Configuration validation failed: {0}")]
    Validation(String),
}

/// Outbound HTTP settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Per-call timeout in seconds
    pub timeout_secs: u64,
    /// Largest accepted response body
    pub max_response_bytes: usize,
    /// `User-Agent` header sent downstream
    pub user_agent: String,
}

impl HttpConfig {
    /// Per-call timeout as a Duration
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_response_bytes: mediator_http::DEFAULT_MAX_RESPONSE_BYTES,
            user_agent: concat!("lookup-mediator/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Redpanda/Kafka producer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    /// Comma-separated broker addresses
    pub brokers: String,
    /// `"0"`, `"1"` or `"all"`
    pub acks: String,
    /// Compression codec
    pub compression: String,
    /// Delivery timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            acks: "1".to_string(),
            compression: "none".to_string(),
            timeout_ms: 5000,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error); `RUST_LOG` wins when set
    pub log_level: String,
    /// Emit JSON log lines
    pub json_logs: bool,
}

impl ObservabilityConfig {
    /// Validate observability configuration
    ///
    /// # Errors
    ///
    /// Returns error if the log level is unknown
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !LOG_LEVELS.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::Validation(format!(
                "invalid log_level: {}. Must be one of: {}",
                self.log_level,
                LOG_LEVELS.join(", ")
            )));
        }
        Ok(())
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// URN reported as `x-mediator-urn` in response envelopes
    pub mediator_urn: String,
    /// Header whose presence switches auditing on; propagated downstream
    pub correlation_header: String,
    /// Outbound HTTP settings
    pub http: HttpConfig,
    /// Producer settings; publish requests fail without them
    pub kafka: Option<KafkaConfig>,
    /// Fan-out concurrency when `forEach.concurrency` is omitted
    pub default_concurrency: usize,
    /// Logging settings
    pub observability: ObservabilityConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mediator_urn: DEFAULT_MEDIATOR_URN.to_string(),
            correlation_header: DEFAULT_CORRELATION_HEADER.to_string(),
            http: HttpConfig::default(),
            kafka: None,
            default_concurrency: 1,
            observability: ObservabilityConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parse and validate TOML text. Missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] or [`ConfigError::Validation`].
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] when the file cannot be read, otherwise
    /// as [`EngineConfig::from_toml_str`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Load from `MEDIATOR_CONFIG` (if set) and apply environment overrides.
    ///
    /// Overrides: `MEDIATOR_URN`, `MEDIATOR_CORRELATION_HEADER`,
    /// `MEDIATOR_HTTP_TIMEOUT_SECS`, `MEDIATOR_KAFKA_BROKERS`, `MEDIATOR_LOG_LEVEL`.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be loaded, an override cannot be
    /// parsed, or the result is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// [`EngineConfig::from_env`] over an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// As [`EngineConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = match lookup("MEDIATOR_CONFIG") {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        if let Some(urn) = lookup("MEDIATOR_URN") {
            config.mediator_urn = urn;
        }
        if let Some(header) = lookup("MEDIATOR_CORRELATION_HEADER") {
            config.correlation_header = header;
        }
        if let Some(value) = lookup("MEDIATOR_HTTP_TIMEOUT_SECS") {
            config.http.timeout_secs = value.parse().map_err(|_| ConfigError::InvalidEnv {
                var: "MEDIATOR_HTTP_TIMEOUT_SECS",
                value,
            })?;
        }
        if let Some(brokers) = lookup("MEDIATOR_KAFKA_BROKERS") {
            config.kafka.get_or_insert_with(KafkaConfig::default).brokers = brokers;
        }
        if let Some(level) = lookup("MEDIATOR_LOG_LEVEL") {
            config.observability.log_level = level;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate entire configuration
    ///
    /// # Errors
    ///
    /// Returns error if any section is invalid
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mediator_urn.trim().is_empty() {
            return Err(ConfigError::Validation("mediator_urn must not be empty".to_string()));
        }
        if self.correlation_header.trim().is_empty() {
            return Err(ConfigError::Validation(
                "correlation_header must not be empty".to_string(),
            ));
        }
        if self.http.timeout_secs == 0 {
            return Err(ConfigError::Validation("http.timeout_secs must be > 0".to_string()));
        }
        if self.http.max_response_bytes == 0 {
            return Err(ConfigError::Validation(
                "http.max_response_bytes must be > 0".to_string(),
            ));
        }
        if self.default_concurrency == 0 {
            return Err(ConfigError::Validation("default_concurrency must be > 0".to_string()));
        }
        if let Some(kafka) = &self.kafka {
            if kafka.brokers.trim().is_empty() {
                return Err(ConfigError::Validation("kafka.brokers must not be empty".to_string()));
            }
        }
        self.observability.validate()
    }

    /// Default fan-out concurrency, clamped to at least one.
    #[must_use]
    pub fn default_concurrency(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.default_concurrency).unwrap_or(NonZeroUsize::MIN)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.mediator_urn, DEFAULT_MEDIATOR_URN);
        assert_eq!(config.http.timeout(), Duration::from_secs(30));
        assert_eq!(config.default_concurrency().get(), 1);
        assert!(config.kafka.is_none());
    }

    #[test]
    fn toml_sections_override_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            correlation_header = "X-Correlation-Id"

            [kafka]
            brokers = "redpanda:9092"
            acks = "all"

            [observability]
            json_logs = true
            "#,
        )
        .unwrap();

        let kafka = config.kafka.as_ref().unwrap();
        assert_eq!(kafka.brokers, "redpanda:9092");
        assert_eq!(kafka.acks, "all");
        assert_eq!(kafka.timeout_ms, 5000);
        assert!(config.observability.json_logs);
        assert_eq!(config.correlation_header, "X-Correlation-Id");
    }

    #[test]
    fn validation_rejects_out_of_range_values() {
        for text in [
            "default_concurrency = 0",
            "mediator_urn = ''",
            "[http]\ntimeout_secs = 0",
            "[observability]\nlog_level = 'loud'",
        ] {
            let err = EngineConfig::from_toml_str(text).unwrap_err();
            assert!(matches!(err, ConfigError::Validation(_)), "{text}: {err}");
        }
        assert!(matches!(
            EngineConfig::from_toml_str("default_concurrency = 'many'"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn environment_overrides_apply() {
        let vars = HashMap::from([
            ("MEDIATOR_URN", "urn:mediator:env"),
            ("MEDIATOR_HTTP_TIMEOUT_SECS", "7"),
            ("MEDIATOR_KAFKA_BROKERS", "broker:9092"),
            ("MEDIATOR_LOG_LEVEL", "debug"),
        ]);
        let config = EngineConfig::from_lookup(|var| vars.get(var).map(ToString::to_string)).unwrap();

        assert_eq!(config.mediator_urn, "urn:mediator:env");
        assert_eq!(config.http.timeout_secs, 7);
        assert_eq!(config.kafka.unwrap().brokers, "broker:9092");
        assert_eq!(config.observability.log_level, "debug");
    }

    #[test]
    fn unparsable_override_is_reported() {
        let err = EngineConfig::from_lookup(|var| {
            (var == "MEDIATOR_HTTP_TIMEOUT_SECS").then(|| "soon".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { var: "MEDIATOR_HTTP_TIMEOUT_SECS", .. }));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = EngineConfig::from_file("/nonexistent/mediator.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
