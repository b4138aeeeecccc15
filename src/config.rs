//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and `NFC_RELAY_*` environment overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub relay: RelayConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub cors_origins: Vec<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8888
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: Vec::new(),
        }
    }
}

const DEFAULT_PONG_WAIT_SECS: u64 = 60;
const DEFAULT_MAX_MESSAGE_BYTES: usize = 2048;
const DEFAULT_WRITE_WAIT_SECS: u64 = 10;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 300;
const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 256;
const FALLBACK_PING_PERIOD: Duration = Duration::from_secs(54);

/// Relay hub and connection tuning
///
/// A zero value in any field means "use the default".
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_pong_wait")]
    pub pong_wait_secs: u64,

    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,

    #[serde(default = "default_write_wait")]
    pub write_wait_secs: u64,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,

    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,
}

fn default_pong_wait() -> u64 {
    DEFAULT_PONG_WAIT_SECS
}

fn default_max_message_bytes() -> usize {
    DEFAULT_MAX_MESSAGE_BYTES
}

fn default_write_wait() -> u64 {
    DEFAULT_WRITE_WAIT_SECS
}

fn default_sweep_interval() -> u64 {
    DEFAULT_SWEEP_INTERVAL_SECS
}

fn default_session_timeout() -> u64 {
    DEFAULT_SESSION_TIMEOUT_SECS
}

fn default_outbound_queue_capacity() -> usize {
    DEFAULT_OUTBOUND_QUEUE_CAPACITY
}

fn secs_or(value: u64, fallback: u64) -> Duration {
    Duration::from_secs(if value == 0 { fallback } else { value })
}

impl RelayConfig {
    /// Read deadline, reset by every pong
    pub fn pong_wait(&self) -> Duration {
        secs_or(self.pong_wait_secs, DEFAULT_PONG_WAIT_SECS)
    }

    /// Interval between server pings: 90% of the pong wait
    pub fn ping_period(&self) -> Duration {
        let period = self.pong_wait().mul_f64(0.9);
        if period.is_zero() {
            FALLBACK_PING_PERIOD
        } else {
            period
        }
    }

    pub fn write_wait(&self) -> Duration {
        secs_or(self.write_wait_secs, DEFAULT_WRITE_WAIT_SECS)
    }

    pub fn sweep_interval(&self) -> Duration {
        secs_or(self.sweep_interval_secs, DEFAULT_SWEEP_INTERVAL_SECS)
    }

    /// Idle time after which a paired session is swept
    pub fn session_timeout(&self) -> Duration {
        secs_or(self.session_timeout_secs, DEFAULT_SESSION_TIMEOUT_SECS)
    }

    pub fn max_message_bytes(&self) -> usize {
        if self.max_message_bytes == 0 {
            DEFAULT_MAX_MESSAGE_BYTES
        } else {
            self.max_message_bytes
        }
    }

    pub fn outbound_queue_capacity(&self) -> usize {
        if self.outbound_queue_capacity == 0 {
            DEFAULT_OUTBOUND_QUEUE_CAPACITY
        } else {
            self.outbound_queue_capacity
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            pong_wait_secs: default_pong_wait(),
            max_message_bytes: default_max_message_bytes(),
            write_wait_secs: default_write_wait(),
            sweep_interval_secs: default_sweep_interval(),
            session_timeout_secs: default_session_timeout(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
        }
    }
}

/// Token validation configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// HS256 shared secret for client tokens
    #[serde(default)]
    pub jwt_secret: String,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
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
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Self::parse(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("nfc-relay").join("config.toml")),
            Some(PathBuf::from("/etc/nfc-relay/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path_opt in config_paths.iter().flatten() {
            if path_opt.exists() {
                match Self::load_with_env(path_opt) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path_opt);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path_opt, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply `NFC_RELAY_*` overrides from an arbitrary lookup
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("NFC_RELAY_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("NFC_RELAY_PORT") {
            if let Ok(p) = port.parse() {
                self.server.port = p;
            }
        }

        if let Some(secret) = lookup("NFC_RELAY_JWT_SECRET") {
            self.auth.jwt_secret = secret;
        }

        if let Some(timeout) = lookup("NFC_RELAY_SESSION_TIMEOUT_SECS") {
            if let Ok(t) = timeout.parse() {
                self.relay.session_timeout_secs = t;
            }
        }

        if let Some(level) = lookup("NFC_RELAY_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("NFC_RELAY_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# NFC Relay Configuration
#
# Environment variables override these settings:
# - NFC_RELAY_HOST
# - NFC_RELAY_PORT
# - NFC_RELAY_JWT_SECRET
# - NFC_RELAY_SESSION_TIMEOUT_SECS
# - NFC_RELAY_LOG_LEVEL
# - NFC_RELAY_LOG_FORMAT

[server]
# Listen address
host = "0.0.0.0"
port = 8888

# Allowed CORS origins (empty allows any)
cors_origins = []

[relay]
# Seconds to wait for a pong before dropping a connection.
# Pings are sent at 90% of this interval.
pong_wait_secs = 60

# Largest accepted inbound frame (bytes)
max_message_bytes = 2048

# Deadline for each outbound write (seconds)
write_wait_secs = 10

# How often idle sessions are swept (seconds)
sweep_interval_secs = 60

# Paired sessions idle longer than this are terminated (seconds)
session_timeout_secs = 300

# Per-connection outbound queue length
outbound_queue_capacity = 256

[auth]
# HS256 secret used to verify client tokens
jwt_secret = ""

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}
