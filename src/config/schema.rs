//! Configuration schema definitions.
//!
//! Every section is `#[serde(default)]`, so a file only has to name the keys
//! it changes.

use super::error::ConfigResult;
use crate::settings::{
    default_port_name, Handshake, Parity, PortConfiguration, StopBits, Timeout,
    DEFAULT_BAUD_RATE, DEFAULT_DATA_BITS, DEFAULT_PARITY_REPLACE, DEFAULT_READ_BUFFER_SIZE,
    DEFAULT_RECEIVED_BYTES_THRESHOLD, DEFAULT_WRITE_BUFFER_SIZE,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Line settings for the port the binary drives
    pub port: PortSection,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Notification delivery and shutdown tuning
    pub engine: EngineSection,
}

/// `[port]` section. Mirrors [`PortConfiguration`] with timeouts in
/// milliseconds, `-1` meaning infinite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortSection {
    pub name: String,
    pub baud_rate: u32,
    pub parity: Parity,
    pub data_bits: u8,
    pub stop_bits: StopBits,
    pub handshake: Handshake,
    pub dtr: bool,
    pub rts: bool,
    pub discard_null: bool,
    pub parity_replace: u8,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    pub read_timeout_ms: i64,
    pub write_timeout_ms: i64,
    pub received_bytes_threshold: usize,
}

impl Default for PortSection {
    fn default() -> Self {
        Self {
            name: default_port_name().to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            parity: Parity::None,
            data_bits: DEFAULT_DATA_BITS,
            stop_bits: StopBits::One,
            handshake: Handshake::None,
            dtr: false,
            rts: false,
            discard_null: false,
            parity_replace: DEFAULT_PARITY_REPLACE,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            read_timeout_ms: Timeout::INFINITE_MS,
            write_timeout_ms: Timeout::INFINITE_MS,
            received_bytes_threshold: DEFAULT_RECEIVED_BYTES_THRESHOLD,
        }
    }
}

impl PortSection {
    /// Build and validate the line configuration this section describes.
    pub fn to_configuration(&self) -> ConfigResult<PortConfiguration> {
        let config = PortConfiguration {
            port_name: self.name.clone(),
            baud_rate: self.baud_rate,
            parity: self.parity,
            data_bits: self.data_bits,
            stop_bits: self.stop_bits,
            handshake: self.handshake,
            dtr_enable: self.dtr,
            rts_enable: self.rts,
            discard_null: self.discard_null,
            parity_replace: self.parity_replace,
            read_buffer_size: self.read_buffer_size,
            write_buffer_size: self.write_buffer_size,
            read_timeout: Timeout::from_millis(self.read_timeout_ms)?,
            write_timeout: Timeout::from_millis(self.write_timeout_ms)?,
            received_bytes_threshold: self.received_bytes_threshold,
        };
        config.validate()?;
        Ok(config)
    }
}

impl From<&PortConfiguration> for PortSection {
    fn from(config: &PortConfiguration) -> Self {
        Self {
            name: config.port_name.clone(),
            baud_rate: config.baud_rate,
            parity: config.parity,
            data_bits: config.data_bits,
            stop_bits: config.stop_bits,
            handshake: config.handshake,
            dtr: config.dtr_enable,
            rts: config.rts_enable,
            discard_null: config.discard_null,
            parity_replace: config.parity_replace,
            read_buffer_size: config.read_buffer_size,
            write_buffer_size: config.write_buffer_size,
            read_timeout_ms: config.read_timeout.as_millis(),
            write_timeout_ms: config.write_timeout.as_millis(),
            received_bytes_threshold: config.received_bytes_threshold,
        }
    }
}

/// Logging configuration section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    pub level: String,
    /// Log format: "json", "pretty", "compact"
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format
    Json,
    /// Pretty format with colors
    Pretty,
    /// Compact format
    Compact,
}

impl Default for LogFormat {
    fn default() -> Self {
        Self::Compact
    }
}

/// `[engine]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// Where notification batches run
    pub dispatcher: DispatcherKind,
    /// Bound on the drop path's wait for in-flight transfers
    pub close_wait_ms: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            dispatcher: DispatcherKind::Thread,
            close_wait_ms: 2000,
        }
    }
}

impl EngineSection {
    pub fn close_wait(&self) -> Duration {
        Duration::from_millis(self.close_wait_ms)
    }
}

/// Notification dispatcher selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatcherKind {
    /// A short-lived thread per batch
    Thread,
    /// `spawn_blocking` on the current tokio runtime
    Tokio,
}

impl Default for DispatcherKind {
    fn default() -> Self {
        Self::Thread
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigError;
    use crate::error::SerialError;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port.baud_rate, 9600);
        assert_eq!(config.port.read_timeout_ms, -1);
        assert_eq!(config.logging.format, LogFormat::Compact);
        assert_eq!(config.engine.close_wait(), Duration::from_secs(2));
    }

    #[test]
    fn test_config_deserialization() {
        let toml_str = r#"
            [port]
            name = "/dev/ttyUSB0"
            baud_rate = 115200
            parity = "even"
            stop_bits = "two"
            handshake = "rts"
            read_timeout_ms = 500

            [engine]
            dispatcher = "tokio"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.port.name, "/dev/ttyUSB0");
        assert_eq!(config.port.parity, Parity::Even);
        assert_eq!(config.port.stop_bits, StopBits::Two);
        assert_eq!(config.port.handshake, Handshake::RequestToSend);
        assert_eq!(config.engine.dispatcher, DispatcherKind::Tokio);
        // Defaults should still work
        assert_eq!(config.port.data_bits, 8);
        assert_eq!(config.logging.level, "info");

        let port = config.port.to_configuration().unwrap();
        assert_eq!(port.read_timeout, Timeout::After(Duration::from_millis(500)));
        assert_eq!(port.write_timeout, Timeout::Infinite);
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[port]"));
        assert!(toml_str.contains("[engine]"));
        let back: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_invalid_port_section_rejected() {
        let section = PortSection {
            data_bits: 9,
            parity: Parity::Odd,
            ..Default::default()
        };
        assert!(matches!(
            section.to_configuration(),
            Err(ConfigError::InvalidPort(SerialError::OutOfRange { .. }))
        ));

        let section = PortSection {
            read_timeout_ms: -5,
            ..Default::default()
        };
        assert!(section.to_configuration().is_err());

        let section = PortSection {
            rts: true,
            handshake: Handshake::RequestToSend,
            ..Default::default()
        };
        assert!(matches!(
            section.to_configuration(),
            Err(ConfigError::InvalidPort(SerialError::RtsWithHandshake))
        ));
    }

    #[test]
    fn test_section_from_configuration() {
        let mut port = PortConfiguration::new("COM7");
        port.write_timeout = Timeout::After(Duration::from_millis(250));
        let section = PortSection::from(&port);
        assert_eq!(section.write_timeout_ms, 250);
        assert_eq!(section.to_configuration().unwrap(), port);
    }
}
