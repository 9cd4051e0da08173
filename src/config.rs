//! Configuration loading and constants.
//!
//! Loads application configuration from TOML files and defines constants for
//! listener defaults, buffer caps, the dispatcher timeout, and logging.
//! `AppConfig` is the root configuration struct containing all settings.

use serde::Deserialize;
use std::path::Path;

// =============================================================================
// Listener Defaults
// =============================================================================

/// Default public TCP port for the front door
pub const DEFAULT_HTTP_PORT: u16 = 6110;

/// Default filesystem path backing the internal relay channel
pub const DEFAULT_RELAY_PATH: &str = ".https-sock";

// =============================================================================
// Dispatch and Buffer Constants
// =============================================================================

/// Milliseconds an exchange may stay unanswered before the dispatcher
/// writes the default 500 response and closes the connection
pub const DISPATCH_TIMEOUT_MS: u64 = 5000;

/// Bytes read from a plaintext connection when classifying/redirecting;
/// only the request line and the Host line are ever consulted
pub const FRONT_READ_BUFFER: usize = 2048;

/// Cap on a decoded request head (request line + headers)
pub const MAX_HEAD_BYTES: usize = 16 * 1024;

/// Cap on a buffered request body (larger Content-Length values are
/// truncated to this many bytes)
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Capacity of the process-wide notification broadcast channel
pub const EVENT_BUS_CAPACITY: usize = 16;

/// Milliseconds to wait before retrying after a failed accept; transient
/// accept errors (e.g. fd exhaustion) must not end a listener
pub const ACCEPT_RETRY_DELAY_MS: u64 = 100;

// =============================================================================
// Default Paths and Strings
// =============================================================================

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Default log filter when RUST_LOG is not set
pub const DEFAULT_LOG_FILTER: &str = "narthex=debug";

/// Default log format (text or json)
pub const DEFAULT_LOG_FORMAT: &str = "text";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Front door listener configuration
    #[serde(default)]
    pub server: ListenerConfig,
    /// Certificate domains served by this instance
    #[serde(default)]
    pub domain: Vec<DomainConfig>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Front door listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    /// Public TCP port (default: 6110)
    #[serde(default = "ListenerConfig::default_port")]
    pub port: u16,
    /// Filesystem path backing the internal relay channel
    #[serde(default = "ListenerConfig::default_relay_path")]
    pub relay_path: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            port: Self::default_port(),
            relay_path: Self::default_relay_path(),
        }
    }
}

impl ListenerConfig {
    fn default_port() -> u16 {
        DEFAULT_HTTP_PORT
    }

    fn default_relay_path() -> String {
        DEFAULT_RELAY_PATH.to_string()
    }
}

/// Configuration for a single certificate domain.
///
/// Exactly one registration form is meaningful per entry: either `cert` and
/// `key` paths (loaded asynchronously at startup) or `alias` naming another
/// configured domain whose context this domain reuses.
#[derive(Debug, Clone, Deserialize)]
pub struct DomainConfig {
    /// Domain name clients announce via SNI / the Host header
    pub domain: String,
    /// PEM certificate chain path
    pub cert: Option<String>,
    /// PEM private key path
    pub key: Option<String>,
    /// Another configured domain whose certificate context to reuse
    pub alias: Option<String>,
}

impl DomainConfig {
    /// Check that exactly one registration form is present.
    fn validate(&self) -> Result<(), ConfigError> {
        let has_files = self.cert.is_some() || self.key.is_some();
        match (&self.alias, has_files) {
            (Some(_), true) => Err(ConfigError::Validation(format!(
                "domain '{}' sets both alias and cert/key; pick one",
                self.domain
            ))),
            (Some(_), false) => Ok(()),
            (None, true) if self.cert.is_some() && self.key.is_some() => Ok(()),
            (None, true) => Err(ConfigError::Validation(format!(
                "domain '{}' needs both cert and key",
                self.domain
            ))),
            (None, false) => Err(ConfigError::Validation(format!(
                "domain '{}' needs either cert/key paths or an alias",
                self.domain
            ))),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "text" (human-readable, default) or "json" (structured)
    #[serde(default = "LoggingConfig::default_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: DEFAULT_LOG_FORMAT.to_string(),
        }
    }
}

impl LoggingConfig {
    fn default_format() -> String {
        DEFAULT_LOG_FORMAT.to_string()
    }
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&contents)?;

        for domain in &config.domain {
            domain.validate()?;
        }

        Ok(config)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Configuration error: {0}")]
    Validation(String),
}
