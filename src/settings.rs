//! Line configuration types and their validation rules.
//!
//! `PortConfiguration` is owned by the [`SerialPort`](crate::port::SerialPort)
//! state machine. Platform back ends read it while opening and while applying
//! individual settings, but they never keep their own copy.

use crate::error::{Result, SerialError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Default line speed.
pub const DEFAULT_BAUD_RATE: u32 = 9600;
/// Default character width.
pub const DEFAULT_DATA_BITS: u8 = 8;
/// Smallest supported character width.
pub const MIN_DATA_BITS: u8 = 5;
/// Largest supported character width. Only legal with [`Parity::None`].
pub const MAX_DATA_BITS: u8 = 9;
/// Default driver receive queue size, in bytes.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 4096;
/// Default driver transmit queue size, in bytes.
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 2048;
/// Default number of queued bytes before a data notification is raised.
pub const DEFAULT_RECEIVED_BYTES_THRESHOLD: usize = 1;
/// Default byte substituted for characters received with a parity error.
pub const DEFAULT_PARITY_REPLACE: u8 = b'?';

/// Parity checking modes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
    Mark,
    Space,
}

impl Parity {
    pub const ALL: [Parity; 5] = [
        Parity::None,
        Parity::Odd,
        Parity::Even,
        Parity::Mark,
        Parity::Space,
    ];
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopBits {
    #[default]
    One,
    OnePointFive,
    Two,
}

/// Flow-control discipline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Handshake {
    #[default]
    #[serde(rename = "none")]
    None,
    #[serde(rename = "xonxoff")]
    XOnXOff,
    #[serde(rename = "rts")]
    RequestToSend,
    #[serde(rename = "rts_xonxoff")]
    RequestToSendXOnXOff,
}

impl Handshake {
    /// Whether the driver owns the RTS line under this discipline.
    pub fn uses_rts(self) -> bool {
        matches!(self, Self::RequestToSend | Self::RequestToSendXOnXOff)
    }

    /// Whether XON/XOFF characters are interpreted under this discipline.
    pub fn uses_xon_xoff(self) -> bool {
        matches!(self, Self::XOnXOff | Self::RequestToSendXOnXOff)
    }
}

/// Read or write timeout.
///
/// Configuration files and the CLI express timeouts as milliseconds where
/// `-1` means [`Timeout::Infinite`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Timeout {
    /// Block until data or buffer space is available, or the device goes away.
    #[default]
    Infinite,
    /// Give up after the given duration. A zero duration returns immediately
    /// for reads and is rejected for writes.
    After(Duration),
}

impl Timeout {
    /// Millisecond value used for [`Timeout::Infinite`].
    pub const INFINITE_MS: i64 = -1;

    /// Parse a millisecond value, rejecting negatives other than `-1`.
    pub fn from_millis(ms: i64) -> Result<Self> {
        match ms {
            Self::INFINITE_MS => Ok(Self::Infinite),
            ms if ms < 0 => Err(SerialError::out_of_range(
                "Timeout",
                format!("{ms} must be non-negative or -1 for infinite"),
            )),
            ms => Ok(Self::After(Duration::from_millis(ms as u64))),
        }
    }

    pub fn as_millis(&self) -> i64 {
        match self {
            Self::Infinite => Self::INFINITE_MS,
            Self::After(d) => i64::try_from(d.as_millis()).unwrap_or(i64::MAX),
        }
    }

    pub fn is_infinite(&self) -> bool {
        matches!(self, Self::Infinite)
    }

    /// The finite window, if any.
    pub fn duration(&self) -> Option<Duration> {
        match self {
            Self::Infinite => None,
            Self::After(d) => Some(*d),
        }
    }
}

impl fmt::Display for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Infinite => f.write_str("infinite"),
            Self::After(d) => write!(f, "{}ms", d.as_millis()),
        }
    }
}

/// Complete line and buffer configuration of a serial port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortConfiguration {
    /// Device name (`COM3`, `/dev/ttyUSB0`).
    pub port_name: String,
    /// Bits per second.
    pub baud_rate: u32,
    pub parity: Parity,
    /// Character width, 5 through 9.
    pub data_bits: u8,
    pub stop_bits: StopBits,
    pub handshake: Handshake,
    pub dtr_enable: bool,
    pub rts_enable: bool,
    /// Drop NUL bytes on receive.
    pub discard_null: bool,
    /// Replacement for characters received with a parity error. Zero disables
    /// replacement.
    pub parity_replace: u8,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    pub read_timeout: Timeout,
    pub write_timeout: Timeout,
    /// Queued byte count that triggers a data notification.
    pub received_bytes_threshold: usize,
}

impl Default for PortConfiguration {
    fn default() -> Self {
        Self {
            port_name: default_port_name().to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            parity: Parity::None,
            data_bits: DEFAULT_DATA_BITS,
            stop_bits: StopBits::One,
            handshake: Handshake::None,
            dtr_enable: false,
            rts_enable: false,
            discard_null: false,
            parity_replace: DEFAULT_PARITY_REPLACE,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            read_timeout: Timeout::Infinite,
            write_timeout: Timeout::Infinite,
            received_bytes_threshold: DEFAULT_RECEIVED_BYTES_THRESHOLD,
        }
    }
}

/// Platform default device name.
pub fn default_port_name() -> &'static str {
    if cfg!(windows) {
        "COM1"
    } else {
        "/dev/ttyS0"
    }
}

impl PortConfiguration {
    /// Create a configuration for `port_name` with default line settings.
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            ..Default::default()
        }
    }

    /// Check every field and every cross-field rule.
    pub fn validate(&self) -> Result<()> {
        validate_port_name(&self.port_name)?;
        validate_baud_rate(self.baud_rate)?;
        validate_data_bits(self.data_bits, self.parity)?;
        validate_buffer_size("ReadBufferSize", self.read_buffer_size)?;
        validate_buffer_size("WriteBufferSize", self.write_buffer_size)?;
        validate_received_bytes_threshold(self.received_bytes_threshold)?;
        validate_write_timeout(self.write_timeout)?;
        if self.rts_enable && self.handshake.uses_rts() {
            return Err(SerialError::RtsWithHandshake);
        }
        Ok(())
    }
}

pub fn validate_port_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(SerialError::out_of_range("PortName", "must not be empty"));
    }
    if name.starts_with("\\\\") {
        return Err(SerialError::out_of_range(
            "PortName",
            format!("'{name}' must not be a UNC path"),
        ));
    }
    Ok(())
}

pub fn validate_baud_rate(baud_rate: u32) -> Result<()> {
    if baud_rate == 0 {
        return Err(SerialError::out_of_range("BaudRate", "must be positive"));
    }
    Ok(())
}

/// Character width must lie in 5..=9, and 9 requires `Parity::None`.
pub fn validate_data_bits(data_bits: u8, parity: Parity) -> Result<()> {
    if !(MIN_DATA_BITS..=MAX_DATA_BITS).contains(&data_bits) {
        return Err(SerialError::out_of_range(
            "DataBits",
            format!("{data_bits} is not between {MIN_DATA_BITS} and {MAX_DATA_BITS}"),
        ));
    }
    if data_bits == MAX_DATA_BITS && parity != Parity::None {
        return Err(SerialError::out_of_range(
            "DataBits",
            format!("{MAX_DATA_BITS} data bits require no parity, got {parity:?}"),
        ));
    }
    Ok(())
}

/// Parity other than `None` is rejected while 9 data bits are configured.
pub fn validate_parity(parity: Parity, data_bits: u8) -> Result<()> {
    if data_bits == MAX_DATA_BITS && parity != Parity::None {
        return Err(SerialError::out_of_range(
            "Parity",
            format!("{parity:?} cannot be combined with {MAX_DATA_BITS} data bits"),
        ));
    }
    Ok(())
}

pub fn validate_buffer_size(name: &'static str, size: usize) -> Result<()> {
    if size == 0 {
        return Err(SerialError::out_of_range(name, "must be positive"));
    }
    Ok(())
}

/// A zero write timeout has no native encoding distinct from "no timeout".
pub fn validate_write_timeout(timeout: Timeout) -> Result<()> {
    if timeout == Timeout::After(Duration::ZERO) {
        return Err(SerialError::out_of_range(
            "WriteTimeout",
            "must be positive or infinite",
        ));
    }
    Ok(())
}

pub fn validate_received_bytes_threshold(threshold: usize) -> Result<()> {
    if threshold == 0 {
        return Err(SerialError::out_of_range(
            "ReceivedBytesThreshold",
            "must be positive",
        ));
    }
    Ok(())
}
