//! Shared configuration logic for the host, simulator, and tests.
//!
//! ## Example: TOML Configuration
//!
//! ```toml
//! [transport]
//! port = "/dev/ttyACM0"
//! baud = 57600
//!
//! [handshake]
//! report_version_timeout_ms = 5000
//! retries = 1
//! sampling_interval_ms = 19
//!
//! [serializer]
//! acquire_timeout_ms = 1000
//! max_pending = 64
//! ```
//!
//! Every section and field is optional; missing values fall back to the
//! defaults below.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FirmataConfig {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub handshake: HandshakeConfig,
    #[serde(default)]
    pub serializer: SerializerConfig,
    #[serde(default)]
    pub requests: RequestConfig,
    #[serde(default)]
    pub parser: ParserConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub port: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: "".to_string(),
            baud: default_baud(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HandshakeConfig {
    /// Delay between transport open and the first version request.
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    /// How long to wait for REPORT_VERSION before asking again.
    #[serde(default = "default_report_version_timeout_ms")]
    pub report_version_timeout_ms: u64,
    /// Extra version requests before the handshake raises `timeout`.
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Sent once after the firmware reply, only when set.
    #[serde(default)]
    pub sampling_interval_ms: Option<u32>,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: default_grace_period_ms(),
            report_version_timeout_ms: default_report_version_timeout_ms(),
            retries: default_retries(),
            sampling_interval_ms: None,
        }
    }
}

impl HandshakeConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn report_version_timeout(&self) -> Duration {
        Duration::from_millis(self.report_version_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SerializerConfig {
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

impl Default for SerializerConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: default_acquire_timeout_ms(),
            max_pending: default_max_pending(),
        }
    }
}

impl SerializerConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RequestConfig {
    #[serde(default = "default_request_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl RequestConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ParserConfig {
    #[serde(default = "default_max_sysex_len")]
    pub max_sysex_len: usize,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            max_sysex_len: default_max_sysex_len(),
        }
    }
}

impl FirmataConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transport.baud == 0 {
            return Err(ConfigError::Invalid("transport.baud must be > 0".to_string()));
        }
        if self.serializer.max_pending == 0 {
            return Err(ConfigError::Invalid("serializer.max_pending must be > 0".to_string()));
        }
        if self.requests.timeout_ms == 0 {
            return Err(ConfigError::Invalid("requests.timeout_ms must be > 0".to_string()));
        }
        if self.parser.max_sysex_len < 3 {
            return Err(ConfigError::Invalid("parser.max_sysex_len must be >= 3".to_string()));
        }
        if let Some(interval) = self.handshake.sampling_interval_ms {
            if interval == 0 {
                return Err(ConfigError::Invalid(
                    "handshake.sampling_interval_ms must be > 0".to_string(),
                ));
            }
        }
        Ok(())
    }
}

fn default_baud() -> u32 { 57600 }
fn default_grace_period_ms() -> u64 { 100 }
fn default_report_version_timeout_ms() -> u64 { 5000 }
fn default_retries() -> u32 { 1 }
fn default_acquire_timeout_ms() -> u64 { 1000 }
fn default_max_pending() -> usize { 64 }
fn default_request_timeout_ms() -> u64 { 1000 }
fn default_max_sysex_len() -> usize { 4096 }

pub fn load_config(path: &str) -> Result<FirmataConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        tracing::error!("Failed to read config file '{}': {}", path, e);
        ConfigError::Io(e)
    })?;
    let config: FirmataConfig = toml::from_str(&contents).map_err(|e| {
        tracing::error!("Failed to parse config TOML: {}", e);
        ConfigError::Toml(e)
    })?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: FirmataConfig = toml::from_str("").unwrap();
        assert_eq!(config.transport.baud, 57600);
        assert_eq!(config.handshake.retries, 1);
        assert_eq!(config.handshake.sampling_interval_ms, None);
        assert_eq!(config.serializer.max_pending, 64);
        assert_eq!(config.requests.timeout(), Duration::from_millis(1000));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[transport]\nport = \"/dev/ttyUSB0\"\nbaud = 115200\n\n[handshake]\nsampling_interval_ms = 19\n"
        )
        .unwrap();
        let config = load_config(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.transport.port, "/dev/ttyUSB0");
        assert_eq!(config.transport.baud, 115200);
        assert_eq!(config.handshake.sampling_interval_ms, Some(19));
        assert_eq!(config.handshake.report_version_timeout_ms, 5000);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let config: FirmataConfig = toml::from_str("[serializer]\nmax_pending = 0\n").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = load_config("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
