//! # Configuration
//!
//! Layered configuration loaded with the `config` crate. Sources, lowest
//! priority first:
//!
//! 1. built-in defaults ([`TrunkConfig::default`])
//! 2. a file: `$TRUNK_CONFIG` when set, otherwise `config/trunk.{toml,yaml,json}` if present
//! 3. environment variables prefixed `TRUNK_`, nested keys joined with `__`
//!    (`TRUNK_CONNECTION__READONLY_ATTEMPTS=5`)
//!
//! `DATABASE_URL` is honoured when `TRUNK_DATABASE_URL` is not set.
//!
//! ```rust,no_run
//! use trunk::config::TrunkConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TrunkConfig::load()?;
//! println!("reconnect attempts: {}", config.connection.reconnect_attempts);
//! # Ok(())
//! # }
//! ```

use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnectOptions;
use tracing::debug;

use crate::connection::ConnectionSettings;
use crate::dsn::ConnectionDescriptor;
use crate::error::{Result, TrunkError};
use crate::retry::RetryPolicy;

const ENV_PREFIX: &str = "TRUNK";
const DEFAULT_CONFIG_FILE: &str = "config/trunk";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrunkConfig {
    pub database_url: String,
    pub connection: ConnectionConfig,
    pub transport: TransportConfig,
    pub logging: LoggingConfig,
}

impl Default for TrunkConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost:5432/trunk".to_string(),
            connection: ConnectionConfig::default(),
            transport: TransportConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Session establishment and recovery
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Sessions opened per connect before a read-only server is given up on
    pub readonly_attempts: u32,
    pub reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub connect_timeout_ms: u64,
    pub autocommit: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            readonly_attempts: 3,
            reconnect_attempts: 3,
            reconnect_delay_ms: 1000,
            connect_timeout_ms: 10_000,
            autocommit: true,
        }
    }
}

impl From<&ConnectionConfig> for ConnectionSettings {
    fn from(config: &ConnectionConfig) -> Self {
        Self {
            readonly_attempts: config.readonly_attempts,
            reconnect: RetryPolicy::fixed(
                config.reconnect_attempts,
                Duration::from_millis(config.reconnect_delay_ms),
            ),
            autocommit: config.autocommit,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
        }
    }
}

/// Retry behaviour of the framework-facing transport
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_delay_ms: 1000,
        }
    }
}

impl TransportConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.retry_attempts, Duration::from_millis(self.retry_delay_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is not set
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl TrunkConfig {
    /// Load from defaults, the config file and the environment
    pub fn load() -> Result<Self> {
        let explicit = env::var(format!("{ENV_PREFIX}_CONFIG")).ok();
        let file = match explicit.as_deref() {
            Some(path) => File::from(Path::new(path)).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let mut config: TrunkConfig = Config::builder()
            .add_source(Config::try_from(&TrunkConfig::default())?)
            .add_source(file)
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        if env::var(format!("{ENV_PREFIX}_DATABASE_URL")).is_err() {
            if let Ok(url) = env::var("DATABASE_URL") {
                config.database_url = url;
            }
        }

        config.validate()?;
        debug!(
            database = %config.masked_database_url(),
            readonly_attempts = config.connection.readonly_attempts,
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Load from defaults and one file only, ignoring the environment
    pub fn from_file(path: &Path) -> Result<Self> {
        let config: TrunkConfig = Config::builder()
            .add_source(Config::try_from(&TrunkConfig::default())?)
            .add_source(File::from(path).required(true))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database_url.trim().is_empty() {
            return Err(TrunkError::config("database_url must not be empty"));
        }
        if self.connection.readonly_attempts == 0 {
            return Err(TrunkError::config("connection.readonly_attempts must be at least 1"));
        }
        if self.connection.reconnect_attempts == 0 {
            return Err(TrunkError::config("connection.reconnect_attempts must be at least 1"));
        }
        if self.transport.retry_attempts == 0 {
            return Err(TrunkError::config("transport.retry_attempts must be at least 1"));
        }
        Ok(())
    }

    pub fn connect_options(&self) -> Result<PgConnectOptions> {
        PgConnectOptions::from_str(&self.database_url)
            .map_err(|e| TrunkError::invalid_descriptor(self.masked_database_url(), e.to_string()))
    }

    /// Database URL with any password masked
    pub fn masked_database_url(&self) -> String {
        ConnectionDescriptor::parse(&self.database_url)
            .map(|d| d.to_string())
            .unwrap_or_else(|_| "[unparseable database_url]".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(extension: &str, contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(extension)
            .tempfile()
            .expect("temp file");
        file.write_all(contents.as_bytes()).expect("write config");
        file
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = TrunkConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.connection.readonly_attempts, 3);
        assert!(config.connection.autocommit);
        assert_eq!(config.transport.retry_policy(), RetryPolicy::default());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let file = write_config(
            ".toml",
            r#"
database_url = "postgres://app@db:5432/orders"

[connection]
readonly_attempts = 5
reconnect_delay_ms = 250
"#,
        );

        let config = TrunkConfig::from_file(file.path()).unwrap();
        assert_eq!(config.database_url, "postgres://app@db:5432/orders");
        assert_eq!(config.connection.readonly_attempts, 5);
        assert_eq!(config.connection.reconnect_delay_ms, 250);
        assert_eq!(config.connection.reconnect_attempts, 3);
        assert_eq!(config.transport, TransportConfig::default());
    }

    #[test]
    fn test_yaml_file_supported() {
        let file = write_config(".yaml", "logging:\n  level: debug\n  json: true\n");
        let config = TrunkConfig::from_file(file.path()).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);
    }

    #[test]
    fn test_validation_rejects_zero_attempts() {
        let file = write_config(".toml", "[transport]\nretry_attempts = 0\n");
        let err = TrunkConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, TrunkError::Configuration { .. }), "{err:?}");
    }

    #[test]
    fn test_settings_conversion() {
        let settings = ConnectionSettings::from(&ConnectionConfig {
            reconnect_attempts: 4,
            reconnect_delay_ms: 20,
            autocommit: false,
            ..ConnectionConfig::default()
        });
        assert_eq!(settings.reconnect.attempts(), 4);
        assert_eq!(settings.reconnect.delay(), Duration::from_millis(20));
        assert!(!settings.autocommit);
    }

    #[test]
    fn test_masked_database_url_hides_password() {
        let config = TrunkConfig {
            database_url: "postgres://app:topsecret@db:5432/trunk".to_string(),
            ..TrunkConfig::default()
        };
        let masked = config.masked_database_url();
        assert!(!masked.contains("topsecret"));
        assert!(masked.contains("app:***@db"));
    }

    #[test]
    fn test_connect_options_from_url() {
        let config = TrunkConfig {
            database_url: "postgres://app@db:6000/trunk".to_string(),
            ..TrunkConfig::default()
        };
        let options = config.connect_options().unwrap();
        assert_eq!(options.get_port(), 6000);
        assert_eq!(options.get_database(), Some("trunk"));
    }
}
