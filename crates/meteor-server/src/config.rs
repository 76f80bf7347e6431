//! Server configuration.
//!
//! Configuration is layered from:
//! - Defaults (with `METEOR_HOST` / `METEOR_PORT` overrides)
//! - The first TOML file found in the default paths
//! - Environment variables (`METEOR__PORT`, `METEOR__TRANSPORT__MAX_INTERVAL_MS`, ...)

use anyhow::{Context, Result};
use meteor_core::{RequestContext, DEFAULT_MESSAGE_QUEUE_SIZE};
use meteor_protocol::{Version, MINIMUM_VERSION, PROTOCOL_VERSION};
use meteor_transport::{LocalConfig, WebSocketConfig, WEBSOCKET_TRANSPORT};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::processors::ProcessorConfig;

/// Files read by [`Config::load`], in order.
const CONFIG_PATHS: [&str; 3] = [
    "meteor.toml",
    "/etc/meteor/meteor.toml",
    "~/.config/meteor/meteor.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// WebSocket transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// In-process transport configuration.
    #[serde(default)]
    pub local: LocalTransportConfig,

    /// Protocol settings advertised to clients.
    #[serde(default)]
    pub bayeux: BayeuxConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// WebSocket transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Default session idle timeout; negative means platform default.
    #[serde(default = "default_negative")]
    pub max_interval_ms: i64,

    /// Upper bound for a single write; 0 disables the bound.
    #[serde(default)]
    pub async_send_timeout_ms: u64,

    /// Largest accepted inbound text frame in bytes.
    #[serde(default = "default_max_text_message_buffer_size")]
    pub max_text_message_buffer_size: usize,

    /// Deliveries queued per session before new ones are dropped.
    #[serde(default = "default_max_message_queue_size")]
    pub max_message_queue_size: usize,
}

/// In-process transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalTransportConfig {
    #[serde(default = "default_local_max_interval")]
    pub max_interval_ms: u64,

    #[serde(default = "default_check_cycle")]
    pub idle_check_cycle_ms: u64,

    #[serde(default = "default_check_cycle")]
    pub connect_check_cycle_ms: u64,
}

/// Protocol settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BayeuxConfig {
    #[serde(default = "default_version")]
    pub version: Version,

    #[serde(default = "default_minimum_version")]
    pub minimum_version: Version,

    /// Advised pause between connects.
    #[serde(default)]
    pub interval_ms: u64,

    /// Advised connect timeout.
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
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

fn default_host() -> String {
    std::env::var("METEOR_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("METEOR_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_true() -> bool {
    true
}

fn default_negative() -> i64 {
    -1
}

fn default_ws_path() -> String {
    "/cometd".to_string()
}

fn default_max_text_message_buffer_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_max_message_queue_size() -> usize {
    DEFAULT_MESSAGE_QUEUE_SIZE
}

fn default_local_max_interval() -> u64 {
    10_000
}

fn default_check_cycle() -> u64 {
    1_000
}

fn default_version() -> Version {
    PROTOCOL_VERSION
}

fn default_minimum_version() -> Version {
    MINIMUM_VERSION
}

fn default_timeout() -> u64 {
    30_000
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            local: LocalTransportConfig::default(),
            bayeux: BayeuxConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            max_interval_ms: default_negative(),
            async_send_timeout_ms: 0,
            max_text_message_buffer_size: default_max_text_message_buffer_size(),
            max_message_queue_size: default_max_message_queue_size(),
        }
    }
}

impl Default for LocalTransportConfig {
    fn default() -> Self {
        Self {
            max_interval_ms: default_local_max_interval(),
            idle_check_cycle_ms: default_check_cycle(),
            connect_check_cycle_ms: default_check_cycle(),
        }
    }
}

impl Default for BayeuxConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            minimum_version: default_minimum_version(),
            interval_ms: 0,
            timeout_ms: default_timeout(),
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
    /// Load configuration from the default paths and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// environment override has the wrong type.
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();

        for path in &CONFIG_PATHS {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                builder = builder.add_source(config::File::new(
                    expanded.as_ref(),
                    config::FileFormat::Toml,
                ));
                break;
            }
        }

        builder
            .add_source(config::Environment::with_prefix("METEOR").separator("__"))
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")
    }

    /// Load configuration from a specific file.
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

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    #[must_use]
    pub fn websocket(&self) -> WebSocketConfig {
        WebSocketConfig {
            max_interval_ms: self.transport.max_interval_ms,
            async_send_timeout: match self.transport.async_send_timeout_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            max_text_message_buffer_size: self.transport.max_text_message_buffer_size,
            transports: vec![WEBSOCKET_TRANSPORT.to_string()],
            max_message_queue_size: self.transport.max_message_queue_size.max(1),
        }
    }

    #[must_use]
    pub fn local(&self) -> LocalConfig {
        // Check cycles drive tokio intervals, which reject a zero period.
        LocalConfig {
            max_interval: Duration::from_millis(self.local.max_interval_ms),
            idle_check_cycle: Duration::from_millis(self.local.idle_check_cycle_ms.max(1)),
            connect_check_cycle: Duration::from_millis(self.local.connect_check_cycle_ms.max(1)),
            max_message_queue_size: self.transport.max_message_queue_size.max(1),
        }
    }

    #[must_use]
    pub fn processors(&self) -> ProcessorConfig {
        ProcessorConfig {
            version: self.bayeux.version,
            minimum_version: self.bayeux.minimum_version,
            interval_ms: self.bayeux.interval_ms,
            timeout_ms: self.bayeux.timeout_ms,
        }
    }
}

/// Connection metadata for a WebSocket upgrade.
#[must_use]
pub fn request_context(remote_addr: SocketAddr, user_agent: Option<String>) -> RequestContext {
    RequestContext {
        remote_addr: Some(remote_addr),
        user_agent,
        local: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.transport.websocket_path, "/cometd");
        assert_eq!(config.bayeux.version, PROTOCOL_VERSION);
        assert!(config.metrics.enabled);
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        let addr = config.bind_addr().unwrap();
        assert_eq!(addr.port(), 8080);

        let bad = Config {
            host: "not a host".to_string(),
            ..Config::default()
        };
        assert!(bad.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [transport]
            websocket_path = "/bayeux"
            async_send_timeout_ms = 250

            [bayeux]
            version = "1.0"
            interval_ms = 500
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.transport.websocket_path, "/bayeux");
        assert_eq!(config.transport.max_text_message_buffer_size, 64 * 1024);
        assert_eq!(config.bayeux.interval_ms, 500);
        assert_eq!(config.local.max_interval_ms, 10_000);
    }

    #[test]
    fn test_transport_conversions() {
        let mut config = Config::default();
        assert!(config.websocket().async_send_timeout.is_none());

        config.transport.async_send_timeout_ms = 250;
        config.local.idle_check_cycle_ms = 50;
        let websocket = config.websocket();
        assert_eq!(websocket.async_send_timeout, Some(Duration::from_millis(250)));
        assert_eq!(websocket.transports, vec![WEBSOCKET_TRANSPORT.to_string()]);
        assert_eq!(config.local().idle_check_cycle, Duration::from_millis(50));
        assert_eq!(websocket.max_message_queue_size, DEFAULT_MESSAGE_QUEUE_SIZE);
    }

    #[test]
    fn test_message_queue_size() {
        let config: Config = toml::from_str("[transport]\nmax_message_queue_size = 16\n").unwrap();
        assert_eq!(config.websocket().max_message_queue_size, 16);
        assert_eq!(config.local().max_message_queue_size, 16);

        let config: Config = toml::from_str("[transport]\nmax_message_queue_size = 0\n").unwrap();
        assert_eq!(config.websocket().max_message_queue_size, 1);
    }

    #[test]
    fn test_invalid_version_rejected() {
        let result: Result<Config, _> = toml::from_str("[bayeux]\nversion = \"x.y\"\n");
        assert!(result.is_err());
    }
}
