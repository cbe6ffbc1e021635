//! Herdlock Configuration
//!
//! Configuration structures for the herdlock leader-election service.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Main herdlock configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Coordination store connection configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Node-specific configuration
    #[serde(default)]
    pub node: NodeConfig,

    /// Election retry tuning
    #[serde(default)]
    pub election: ElectionConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Coordination store connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Coordination store server addresses (host:port)
    #[serde(default)]
    pub servers: Vec<String>,

    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,

    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeConfig {
    /// Identity published when this host becomes leader.
    /// Defaults to the machine hostname when unset.
    #[serde(default)]
    pub identity: Option<String>,
}

/// Election retry tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionConfig {
    /// Maximum attempts for a transient store failure
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    /// Base retry backoff in milliseconds
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Maximum retry backoff in milliseconds
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_session_timeout_ms() -> u64 {
    5000
}

fn default_connect_timeout_ms() -> u64 {
    10000
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    250
}

fn default_retry_max_delay_ms() -> u64 {
    2000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            session_timeout_ms: default_session_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            retry_max_attempts: default_retry_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.election.retry_max_attempts == 0 {
            return Err(crate::Error::Config(
                "election.retry_max_attempts must be at least 1".into(),
            ));
        }

        if self.store.session_timeout_ms == 0 {
            return Err(crate::Error::Config(
                "store.session_timeout_ms must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Get session timeout as Duration
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.store.session_timeout_ms)
    }

    /// Get connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.store.connect_timeout_ms)
    }

    /// Build the retry policy for election round trips
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.election.retry_max_attempts,
            base_delay: Duration::from_millis(self.election.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.election.retry_max_delay_ms),
        }
    }

    /// Resolve the identity this node publishes when it becomes leader.
    ///
    /// Uses the configured identity when present, otherwise the machine
    /// hostname. Tests inject explicit identities instead of relying on
    /// process-wide hostname state.
    pub fn resolve_identity(&self) -> crate::Result<String> {
        if let Some(identity) = &self.node.identity {
            if identity.is_empty() {
                return Err(crate::Error::Config(
                    "node.identity cannot be empty when set".into(),
                ));
            }
            return Ok(identity.clone());
        }

        let hostname = nix::unistd::gethostname()
            .map_err(|e| crate::Error::Identity(e.to_string()))?;
        hostname
            .into_string()
            .map_err(|_| crate::Error::Identity("hostname is not valid UTF-8".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[store]
servers = ["zk-1:2181", "zk-2:2181"]
session_timeout_ms = 4000

[node]
identity = "host-a"

[election]
retry_max_attempts = 5

[logging]
level = "debug"
"#;

        let config = Config::from_str(toml).unwrap();
        assert_eq!(config.store.servers.len(), 2);
        assert_eq!(config.session_timeout(), Duration::from_millis(4000));
        assert_eq!(config.election.retry_max_attempts, 5);
        assert_eq!(config.node.identity.as_deref(), Some("host-a"));
        assert_eq!(config.logging.level, "debug");
        // Unset sections fall back to defaults
        assert_eq!(config.election.retry_base_delay_ms, 250);
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.session_timeout(), Duration::from_millis(5000));
        assert_eq!(config.retry_policy().max_attempts, 3);
    }

    #[test]
    fn test_rejects_zero_retry_budget() {
        let toml = r#"
[election]
retry_max_attempts = 0
"#;
        assert!(Config::from_str(toml).is_err());
    }

    #[test]
    fn test_configured_identity_wins() {
        let mut config = Config::default();
        config.node.identity = Some("host-b".into());
        assert_eq!(config.resolve_identity().unwrap(), "host-b");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[store]\nservers = [\"zk-1:2181\"]").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.store.servers, vec!["zk-1:2181".to_string()]);
    }
}
