//! # Configuration Management
//!
//! Settings for a Quassel client connection.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment overrides (`QUASSEL_PROTOCOL_*`) via `from_env()`
//!
//! Durations are stored in TOML as milliseconds.

use crate::error::{ProtocolError, Result};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Port a Quassel core listens on unless told otherwise.
pub const DEFAULT_PORT: u16 = 4242;

/// Largest frame accepted from or sent to the core (64 MiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Client version announced in ClientInit.
pub const CLIENT_VERSION: &str = concat!("quassel-protocol v", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct QuasselConfig {
    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub tls: TlsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl QuasselConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Defaults overridden by `QUASSEL_PROTOCOL_*` environment variables.
    ///
    /// Values that fail to parse are rejected rather than silently ignored.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("QUASSEL_PROTOCOL_ADDRESS") {
            config.client.address = addr;
        }
        if let Ok(user) = std::env::var("QUASSEL_PROTOCOL_USER") {
            config.client.user = Some(user);
        }
        if let Some(ms) = env_parse::<u64>("QUASSEL_PROTOCOL_CONNECTION_TIMEOUT_MS")? {
            config.client.connection_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("QUASSEL_PROTOCOL_HANDSHAKE_TIMEOUT_MS")? {
            config.client.handshake_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("QUASSEL_PROTOCOL_HEARTBEAT_INTERVAL_MS")? {
            config.client.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(tls) = env_parse::<bool>("QUASSEL_PROTOCOL_OFFER_TLS")? {
            config.transport.offer_tls = tls;
        }
        if let Some(compression) = env_parse::<bool>("QUASSEL_PROTOCOL_OFFER_COMPRESSION")? {
            config.transport.offer_compression = compression;
        }
        if let Some(insecure) = env_parse::<bool>("QUASSEL_PROTOCOL_TLS_INSECURE")? {
            config.tls.insecure = insecure;
        }
        if let Ok(level) = std::env::var("QUASSEL_PROTOCOL_LOG_LEVEL") {
            config.logging.log_level = level
                .parse()
                .map_err(|_| ProtocolError::ConfigError(format!("Invalid log level: {level}")))?;
        }

        Ok(config)
    }

    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Default configuration rendered as TOML.
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Every problem found, empty when the configuration is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.client.validate());
        errors.extend(self.transport.validate());
        errors.extend(self.tls.validate(&self.transport));
        errors.extend(self.logging.validate());
        errors
    }

    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ProtocolError::ConfigError(format!("Invalid value for {name}: '{raw}'"))),
        Err(_) => Ok(None),
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Core address as `host:port`
    pub address: String,

    /// Account used by `QuasselClient::login` helpers and logged for context
    #[serde(default)]
    pub user: Option<String>,

    #[serde(with = "duration_serde")]
    pub connection_timeout: Duration,

    /// Budget for negotiation and for each handshake round trip
    #[serde(with = "duration_serde")]
    pub handshake_timeout: Duration,

    #[serde(with = "duration_serde")]
    pub heartbeat_interval: Duration,

    pub client_version: String,

    /// Build date announced next to the version
    pub client_date: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: format!("127.0.0.1:{DEFAULT_PORT}"),
            user: None,
            connection_timeout: timeout::DEFAULT_TIMEOUT,
            handshake_timeout: timeout::DEFAULT_TIMEOUT,
            heartbeat_interval: timeout::KEEPALIVE_INTERVAL,
            client_version: CLIENT_VERSION.to_string(),
            client_date: String::new(),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        match self.address.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {}
            _ => errors.push(format!(
                "Invalid core address: '{}' (expected format: 'core.example.org:4242')",
                self.address
            )),
        }

        if self.connection_timeout.as_millis() < 100 {
            errors.push("Connection timeout too short (minimum: 100ms)".to_string());
        } else if self.connection_timeout.as_secs() > 300 {
            errors.push("Connection timeout too long (maximum: 300s)".to_string());
        }

        if self.handshake_timeout.as_millis() < 100 {
            errors.push("Handshake timeout too short (minimum: 100ms)".to_string());
        }

        if self.heartbeat_interval.as_secs() < 1 {
            errors.push("Heartbeat interval too short (minimum: 1s)".to_string());
        } else if self.heartbeat_interval.as_secs() > 3600 {
            errors.push("Heartbeat interval too long (maximum: 1 hour)".to_string());
        }

        if self.client_version.is_empty() {
            errors.push("Client version cannot be empty".to_string());
        }

        errors
    }
}

/// Which optional stream layers the client offers during negotiation.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    pub offer_tls: bool,

    pub offer_compression: bool,

    /// zlib level for the compressed layer (0-9)
    pub compression_level: u32,

    pub max_frame_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            offer_tls: true,
            offer_compression: true,
            compression_level: 6,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_frame_size < 1024 {
            errors.push("Max frame size too small (minimum: 1 KB)".to_string());
        } else if self.max_frame_size > u32::MAX as usize {
            errors.push(format!(
                "Max frame size too large: {} bytes (length prefix is 32 bits)",
                self.max_frame_size
            ));
        }

        if self.offer_compression && self.compression_level > 9 {
            errors.push(format!(
                "Invalid compression level: {} (valid range: 0-9)",
                self.compression_level
            ));
        }

        if !self.offer_tls {
            errors.push("WARNING: TLS is not offered - credentials travel in clear text".to_string());
        }

        errors
    }
}

/// Certificate trust for the TLS layer.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct TlsConfig {
    /// Name checked against the certificate, defaults to the address host
    #[serde(default)]
    pub server_name: Option<String>,

    /// Extra PEM file with trusted CA certificates
    #[serde(default)]
    pub ca_file: Option<String>,

    /// Hex SHA-256 of the core certificate; accepts exactly that certificate
    #[serde(default)]
    pub pinned_sha256: Option<String>,

    /// Accept any certificate. Testing only.
    #[serde(default)]
    pub insecure: bool,
}

impl TlsConfig {
    pub fn validate(&self, transport: &TransportConfig) -> Vec<String> {
        let mut errors = Vec::new();

        if let Some(path) = &self.ca_file {
            if !Path::new(path).exists() {
                errors.push(format!("CA file does not exist: {path}"));
            }
        }

        if let Some(pin) = &self.pinned_sha256 {
            let hex: String = pin.chars().filter(|c| *c != ':').collect();
            if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
                errors.push(format!("Pinned certificate hash is not a SHA-256 hex digest: {pin}"));
            }
        }

        if self.insecure && transport.offer_tls {
            errors.push(
                "WARNING: Certificate verification is disabled - not recommended for production"
                    .to_string(),
            );
        }

        errors
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub app_name: String,

    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    pub json_format: bool,

    pub ansi_colors: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("quassel-protocol"),
            log_level: Level::INFO,
            json_format: false,
            ansi_colors: true,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.json_format && self.ansi_colors {
            errors.push("ANSI colors have no effect with JSON formatting".to_string());
        }

        errors
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
