//! The contract between the platform-neutral state machine and a native
//! back end.

use crate::error::Result;
use crate::events::CommEventSource;
use crate::io::CompletionHandle;
use crate::settings::{Handshake, Parity, PortConfiguration, StopBits, Timeout};
use std::sync::Arc;

/// A native serial back end.
///
/// [`SerialPort`](super::SerialPort) decides *when* each method runs: setting
/// hooks are only called while the port is open, after validation, and a
/// failing hook rolls the configuration back. Implementations own their
/// handle through a [`PortHandle`](super::PortHandle) and use interior
/// locking, so every method takes `&self`.
pub trait PlatformPort: Send + Sync + 'static {
    /// Acquire the device and apply the initial line settings.
    ///
    /// On failure nothing stays acquired.
    fn open(&self, config: &PortConfiguration) -> Result<()>;

    /// Size the driver queues.
    fn initialize_buffers(&self, read_buffer_size: usize, write_buffer_size: usize) -> Result<()>;

    /// Line-status source for the event loop, if the back end has one.
    fn event_source(&self) -> Option<Arc<dyn CommEventSource>>;

    /// Stop native event delivery. Returns whether the device is still
    /// reachable, which decides if close flushes and purges.
    fn stop_events(&self) -> Result<bool>;

    /// Release the handle. A no-op when nothing is held.
    fn close(&self) -> Result<()>;

    fn set_baud_rate(&self, baud_rate: u32) -> Result<()>;
    fn set_parity(&self, parity: Parity, parity_replace: u8) -> Result<()>;
    fn set_data_bits(&self, data_bits: u8) -> Result<()>;
    fn set_stop_bits(&self, stop_bits: StopBits) -> Result<()>;
    /// `rts_enable` is the RTS level to use when the handshake leaves the line alone.
    fn set_handshake(&self, handshake: Handshake, rts_enable: bool) -> Result<()>;
    fn set_dtr_enable(&self, enable: bool) -> Result<()>;
    fn set_rts_enable(&self, enable: bool) -> Result<()>;
    fn set_discard_null(&self, discard: bool) -> Result<()>;
    fn set_parity_replace(&self, replace: u8) -> Result<()>;
    fn set_read_timeout(&self, timeout: Timeout) -> Result<()>;
    fn set_write_timeout(&self, timeout: Timeout) -> Result<()>;
    fn set_break_state(&self, enabled: bool) -> Result<()>;

    fn bytes_to_read(&self) -> Result<usize>;
    fn bytes_to_write(&self) -> Result<usize>;
    fn cd_holding(&self) -> Result<bool>;
    fn cts_holding(&self) -> Result<bool>;
    fn dsr_holding(&self) -> Result<bool>;

    fn discard_in_buffer(&self) -> Result<()>;
    fn discard_out_buffer(&self) -> Result<()>;
    /// Block until queued output has been transmitted.
    fn flush(&self) -> Result<()>;

    /// Start a transfer. The back end completes `op` exactly once, either
    /// before returning or later from another thread. An `Err` means the
    /// transfer never started.
    fn submit(&self, op: CompletionHandle, timeout: Timeout) -> Result<()>;
}
