//! Placeholder back end for targets without a native implementation.

use crate::error::{Result, SerialError};
use crate::events::CommEventSource;
use crate::io::CompletionHandle;
use crate::port::PlatformPort;
use crate::settings::{Handshake, Parity, PortConfiguration, StopBits, Timeout};
use std::sync::Arc;

/// Fails every open; nothing else is reachable without one.
#[derive(Debug, Default)]
pub struct UnsupportedPort;

impl PlatformPort for UnsupportedPort {
    fn open(&self, config: &PortConfiguration) -> Result<()> {
        Err(SerialError::not_supported(format!(
            "serial ports are not supported on {} ({})",
            std::env::consts::OS,
            config.port_name
        )))
    }

    fn initialize_buffers(&self, _: usize, _: usize) -> Result<()> {
        Err(SerialError::NotOpen)
    }

    fn event_source(&self) -> Option<Arc<dyn CommEventSource>> {
        None
    }

    fn stop_events(&self) -> Result<bool> {
        Ok(false)
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn set_baud_rate(&self, _: u32) -> Result<()> {
        Err(SerialError::NotOpen)
    }

    fn set_parity(&self, _: Parity, _: u8) -> Result<()> {
        Err(SerialError::NotOpen)
    }

    fn set_data_bits(&self, _: u8) -> Result<()> {
        Err(SerialError::NotOpen)
    }

    fn set_stop_bits(&self, _: StopBits) -> Result<()> {
        Err(SerialError::NotOpen)
    }

    fn set_handshake(&self, _: Handshake, _: bool) -> Result<()> {
        Err(SerialError::NotOpen)
    }

    fn set_dtr_enable(&self, _: bool) -> Result<()> {
        Err(SerialError::NotOpen)
    }

    fn set_rts_enable(&self, _: bool) -> Result<()> {
        Err(SerialError::NotOpen)
    }

    fn set_discard_null(&self, _: bool) -> Result<()> {
        Err(SerialError::NotOpen)
    }

    fn set_parity_replace(&self, _: u8) -> Result<()> {
        Err(SerialError::NotOpen)
    }

    fn set_read_timeout(&self, _: Timeout) -> Result<()> {
        Err(SerialError::NotOpen)
    }

    fn set_write_timeout(&self, _: Timeout) -> Result<()> {
        Err(SerialError::NotOpen)
    }

    fn set_break_state(&self, _: bool) -> Result<()> {
        Err(SerialError::NotOpen)
    }

    fn bytes_to_read(&self) -> Result<usize> {
        Err(SerialError::NotOpen)
    }

    fn bytes_to_write(&self) -> Result<usize> {
        Err(SerialError::NotOpen)
    }

    fn cd_holding(&self) -> Result<bool> {
        Err(SerialError::NotOpen)
    }

    fn cts_holding(&self) -> Result<bool> {
        Err(SerialError::NotOpen)
    }

    fn dsr_holding(&self) -> Result<bool> {
        Err(SerialError::NotOpen)
    }

    fn discard_in_buffer(&self) -> Result<()> {
        Err(SerialError::NotOpen)
    }

    fn discard_out_buffer(&self) -> Result<()> {
        Err(SerialError::NotOpen)
    }

    fn flush(&self) -> Result<()> {
        Err(SerialError::NotOpen)
    }

    fn submit(&self, _: CompletionHandle, _: Timeout) -> Result<()> {
        Err(SerialError::NotOpen)
    }
}
