//! Server configuration.
//!
//! Configuration can be loaded from:
//! - TOML configuration file
//! - Environment variables (RELAY_*), layered over the file

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Broadcast engine configuration.
    #[serde(default)]
    pub broadcast: BroadcastConfig,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Broadcast engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    /// Number of connections written to concurrently per publish.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Publish deadline in milliseconds. `0` disables it.
    #[serde(default = "default_publish_timeout")]
    pub publish_timeout_ms: u64,

    /// How long each subscriber may take to close on shutdown, in milliseconds.
    #[serde(default = "default_close_timeout")]
    pub close_timeout_ms: u64,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for the WebSocket subscribe endpoint.
    #[serde(default = "default_subscribe_path")]
    pub subscribe_path: String,

    /// Path for the publish endpoint.
    #[serde(default = "default_publish_path")]
    pub publish_path: String,

    /// Bytes accepted per write when assembling an outbound message.
    #[serde(default = "default_write_chunk_size")]
    pub write_chunk_size: usize,

    /// Maximum publish body size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_concurrency() -> usize {
    10
}

fn default_publish_timeout() -> u64 {
    30_000 // 30 seconds
}

fn default_close_timeout() -> u64 {
    5_000 // 5 seconds
}

fn default_subscribe_path() -> String {
    "/subscribe".to_string()
}

fn default_publish_path() -> String {
    "/publish".to_string()
}

fn default_write_chunk_size() -> usize {
    1024
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            broadcast: BroadcastConfig::default(),
            transport: TransportConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            publish_timeout_ms: default_publish_timeout(),
            close_timeout_ms: default_close_timeout(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            subscribe_path: default_subscribe_path(),
            publish_path: default_publish_path(),
            write_chunk_size: default_write_chunk_size(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from the first config file found, with
    /// `RELAY_*` environment overrides.
    ///
    /// `RELAY_CONFIG` names the file explicitly. Nested keys use a double
    /// underscore, e.g. `RELAY_BROADCAST__CONCURRENCY=32`.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed, or if
    /// the resulting configuration is invalid.
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = Self::find_file() {
            tracing::debug!("Loading config from {}", path.display());
            builder = builder.add_source(config::File::from(path));
        }

        let config: Config = builder
            .add_source(
                config::Environment::with_prefix("RELAY")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// First existing config file, if any.
    fn find_file() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("RELAY_CONFIG") {
            return Some(PathBuf::from(shellexpand::tilde(&path).as_ref()));
        }

        let config_paths = [
            "relay.toml",
            "/etc/relay/relay.toml",
            "~/.config/relay/relay.toml",
        ];

        config_paths
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists())
    }

    /// Load configuration from a specific file, without environment
    /// overrides. Used for `relay --config <path>`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Check values serde cannot.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.broadcast.concurrency == 0 {
            bail!("broadcast.concurrency must be greater than 0");
        }
        if self.broadcast.close_timeout_ms == 0 {
            bail!("broadcast.close_timeout_ms must be greater than 0");
        }
        if self.transport.write_chunk_size == 0 {
            bail!("transport.write_chunk_size must be greater than 0");
        }
        self.bind_addr()?;
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.broadcast.concurrency, 10);
        assert_eq!(config.transport.subscribe_path, "/subscribe");
        assert_eq!(config.transport.publish_path, "/publish");
        assert_eq!(config.transport.write_chunk_size, 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        let addr = config.bind_addr().unwrap();
        assert_eq!(addr.port(), 8080);

        let config = Config {
            host: "not a host".into(),
            ..Config::default()
        };
        assert!(config.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [broadcast]
            concurrency = 32
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.broadcast.concurrency, 32);
        assert_eq!(config.broadcast.publish_timeout_ms, 30_000);
        assert_eq!(config.broadcast.close_timeout_ms, 5_000);
        assert_eq!(config.transport.max_message_size, 64 * 1024);
    }

    #[test]
    fn test_negative_concurrency_does_not_parse() {
        let toml_str = r#"
            [broadcast]
            concurrency = -1
        "#;
        assert!(toml::from_str::<Config>(toml_str).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let mut config = Config::default();
        config.broadcast.concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.transport.write_chunk_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.broadcast.close_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("relay-test-{}.toml", std::process::id()));
        std::fs::write(&path, "port = 7000\n[metrics]\nenabled = false\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.port, 7000);
        assert!(!config.metrics.enabled);
    }
}
