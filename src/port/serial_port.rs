//! The platform-neutral serial port.
//!
//! [`SerialPort`] owns the configuration and the open/closed lifecycle and
//! decides when the [`PlatformPort`] hooks run:
//!
//! - setting a value equal to the current one never reaches the platform
//! - while closed, a setter validates and records the value
//! - while open, a setter records the value and runs the matching hook; a
//!   failing hook restores the previous value before the error is returned
//!
//! Closing stops the event loop, flushes and purges the device if it is still
//! reachable, waits for the loop and any pending transfer to finish, and only
//! then releases the native handle.

use super::platform::PlatformPort;
use crate::error::{Result, SerialError};
use crate::events::{
    Dispatch, EventKind, EventLoop, EventLoopContext, EventRegistry, SerialEvent,
    SubscriptionId, ThreadDispatcher,
};
use crate::io::{AsyncOperation, OperationKind, PendingOperations};
use crate::settings::{
    validate_baud_rate, validate_buffer_size, validate_data_bits, validate_parity,
    validate_port_name, validate_received_bytes_threshold, validate_write_timeout, Handshake,
    Parity, PortConfiguration, StopBits, Timeout,
};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long the drop path waits for in-flight transfers before releasing the
/// handle anyway.
pub const DEFAULT_CLOSE_WAIT: Duration = Duration::from_secs(2);

/// A serial port driven by the platform back end `P`.
pub struct SerialPort<P: PlatformPort> {
    platform: P,
    config: PortConfiguration,
    is_open: bool,
    break_state: bool,
    registry: Arc<EventRegistry>,
    dispatcher: Arc<dyn Dispatch>,
    threshold: Arc<AtomicUsize>,
    pending: Arc<PendingOperations>,
    event_loop: Option<EventLoop>,
    close_wait: Duration,
}

impl SerialPort<crate::platform::NativePort> {
    /// A closed port on this platform's native back end with default settings.
    pub fn new(port_name: impl Into<String>) -> Self {
        Self::with_platform(
            crate::platform::NativePort::default(),
            PortConfiguration::new(port_name),
        )
    }

    /// A closed native port with a validated configuration.
    pub fn with_config(config: PortConfiguration) -> Result<Self> {
        config.validate()?;
        Ok(Self::with_platform(
            crate::platform::NativePort::default(),
            config,
        ))
    }
}

impl<P: PlatformPort> SerialPort<P> {
    /// A closed port over an explicit back end.
    pub fn with_platform(platform: P, config: PortConfiguration) -> Self {
        let threshold = Arc::new(AtomicUsize::new(config.received_bytes_threshold));
        Self {
            platform,
            config,
            is_open: false,
            break_state: false,
            registry: EventRegistry::new(),
            dispatcher: Arc::new(ThreadDispatcher),
            threshold,
            pending: PendingOperations::new(),
            event_loop: None,
            close_wait: DEFAULT_CLOSE_WAIT,
        }
    }

    /// Run notification batches on `dispatcher` instead of one thread per batch.
    /// Takes effect at the next open.
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn Dispatch>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// Bound on the drop path's wait for pending transfers.
    pub fn with_close_wait(mut self, wait: Duration) -> Self {
        self.close_wait = wait;
        self
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn configuration(&self) -> &PortConfiguration {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        self.is_open
    }

    // ----- configuration surface -----

    pub fn port_name(&self) -> &str {
        &self.config.port_name
    }

    pub fn baud_rate(&self) -> u32 {
        self.config.baud_rate
    }

    pub fn parity(&self) -> Parity {
        self.config.parity
    }

    pub fn data_bits(&self) -> u8 {
        self.config.data_bits
    }

    pub fn stop_bits(&self) -> StopBits {
        self.config.stop_bits
    }

    pub fn handshake(&self) -> Handshake {
        self.config.handshake
    }

    pub fn dtr_enable(&self) -> bool {
        self.config.dtr_enable
    }

    pub fn rts_enable(&self) -> bool {
        self.config.rts_enable
    }

    pub fn discard_null(&self) -> bool {
        self.config.discard_null
    }

    pub fn parity_replace(&self) -> u8 {
        self.config.parity_replace
    }

    pub fn read_buffer_size(&self) -> usize {
        self.config.read_buffer_size
    }

    pub fn write_buffer_size(&self) -> usize {
        self.config.write_buffer_size
    }

    pub fn read_timeout(&self) -> Timeout {
        self.config.read_timeout
    }

    pub fn write_timeout(&self) -> Timeout {
        self.config.write_timeout
    }

    pub fn received_bytes_threshold(&self) -> usize {
        self.config.received_bytes_threshold
    }

    /// Whether the transmit line is held in break. Only meaningful while open.
    pub fn break_state(&self) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.break_state)
    }

    /// The device name can only change while the port is closed.
    pub fn set_port_name(&mut self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        if name == self.config.port_name {
            return Ok(());
        }
        if self.is_open {
            return Err(SerialError::cant_set_when_open("PortName"));
        }
        validate_port_name(&name)?;
        self.config.port_name = name;
        Ok(())
    }

    pub fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        validate_baud_rate(baud_rate)?;
        self.apply(baud_rate, |c| &mut c.baud_rate, |p, v| p.set_baud_rate(v))
    }

    pub fn set_parity(&mut self, parity: Parity) -> Result<()> {
        validate_parity(parity, self.config.data_bits)?;
        let replace = self.config.parity_replace;
        self.apply(parity, |c| &mut c.parity, move |p, v| p.set_parity(v, replace))
    }

    pub fn set_data_bits(&mut self, data_bits: u8) -> Result<()> {
        validate_data_bits(data_bits, self.config.parity)?;
        self.apply(data_bits, |c| &mut c.data_bits, |p, v| p.set_data_bits(v))
    }

    pub fn set_stop_bits(&mut self, stop_bits: StopBits) -> Result<()> {
        self.apply(stop_bits, |c| &mut c.stop_bits, |p, v| p.set_stop_bits(v))
    }

    /// A handshake that drives RTS takes the line over, so `rts_enable` is
    /// cleared when one is selected.
    pub fn set_handshake(&mut self, handshake: Handshake) -> Result<()> {
        let rts_enable = self.config.rts_enable && !handshake.uses_rts();
        self.apply(handshake, |c| &mut c.handshake, move |p, v| {
            p.set_handshake(v, rts_enable)
        })?;
        self.config.rts_enable = rts_enable;
        Ok(())
    }

    pub fn set_dtr_enable(&mut self, enable: bool) -> Result<()> {
        self.apply(enable, |c| &mut c.dtr_enable, |p, v| p.set_dtr_enable(v))
    }

    pub fn set_rts_enable(&mut self, enable: bool) -> Result<()> {
        if enable == self.config.rts_enable {
            return Ok(());
        }
        if self.config.handshake.uses_rts() {
            return Err(SerialError::RtsWithHandshake);
        }
        self.apply(enable, |c| &mut c.rts_enable, |p, v| p.set_rts_enable(v))
    }

    pub fn set_discard_null(&mut self, discard: bool) -> Result<()> {
        self.apply(discard, |c| &mut c.discard_null, |p, v| p.set_discard_null(v))
    }

    pub fn set_parity_replace(&mut self, replace: u8) -> Result<()> {
        self.apply(replace, |c| &mut c.parity_replace, |p, v| {
            p.set_parity_replace(v)
        })
    }

    pub fn set_read_timeout(&mut self, timeout: Timeout) -> Result<()> {
        self.apply(timeout, |c| &mut c.read_timeout, |p, v| p.set_read_timeout(v))
    }

    /// `Timeout::After(Duration::ZERO)` is rejected; use a positive duration
    /// or [`Timeout::Infinite`].
    pub fn set_write_timeout(&mut self, timeout: Timeout) -> Result<()> {
        validate_write_timeout(timeout)?;
        self.apply(timeout, |c| &mut c.write_timeout, |p, v| {
            p.set_write_timeout(v)
        })
    }

    pub fn set_read_buffer_size(&mut self, size: usize) -> Result<()> {
        self.set_buffer_size("ReadBufferSize", size, |c| &mut c.read_buffer_size)
    }

    pub fn set_write_buffer_size(&mut self, size: usize) -> Result<()> {
        self.set_buffer_size("WriteBufferSize", size, |c| &mut c.write_buffer_size)
    }

    /// Minimum queued bytes before a data notification fires. While open the
    /// new value applies to the next event, and a data notification is raised
    /// at once if the queue already holds enough bytes.
    pub fn set_received_bytes_threshold(&mut self, threshold: usize) -> Result<()> {
        validate_received_bytes_threshold(threshold)?;
        if threshold == self.config.received_bytes_threshold {
            return Ok(());
        }
        self.config.received_bytes_threshold = threshold;
        self.threshold.store(threshold, Ordering::Release);
        if let Some(event_loop) = &self.event_loop {
            event_loop.threshold_changed();
        }
        Ok(())
    }

    /// Hold or release a break on the transmit line. Requires an open port.
    pub fn set_break_state(&mut self, enabled: bool) -> Result<()> {
        self.ensure_open()?;
        if enabled == self.break_state {
            return Ok(());
        }
        self.platform.set_break_state(enabled)?;
        self.break_state = enabled;
        Ok(())
    }

    fn set_buffer_size(
        &mut self,
        name: &'static str,
        size: usize,
        field: fn(&mut PortConfiguration) -> &mut usize,
    ) -> Result<()> {
        if size == *field(&mut self.config) {
            return Ok(());
        }
        if self.is_open {
            return Err(SerialError::cant_set_when_open(name));
        }
        validate_buffer_size(name, size)?;
        *field(&mut self.config) = size;
        Ok(())
    }

    /// Record `value` in the field and, while open, push it to the platform.
    fn apply<T, H>(
        &mut self,
        value: T,
        field: fn(&mut PortConfiguration) -> &mut T,
        hook: H,
    ) -> Result<()>
    where
        T: PartialEq + Copy + fmt::Debug,
        H: FnOnce(&P, T) -> Result<()>,
    {
        if *field(&mut self.config) == value {
            return Ok(());
        }
        let previous = std::mem::replace(field(&mut self.config), value);
        if self.is_open {
            if let Err(e) = hook(&self.platform, value) {
                debug!("Setting {:?} failed, restoring {:?}: {}", value, previous, e);
                *field(&mut self.config) = previous;
                return Err(e);
            }
        }
        Ok(())
    }

    // ----- lifecycle -----

    /// Acquire the device, size its queues and start the event loop.
    pub fn open(&mut self) -> Result<()> {
        if self.is_open {
            return Err(SerialError::AlreadyOpen);
        }
        self.config.validate()?;
        info!(
            "Opening {} at {} baud, {} data bits, parity {:?}, stop bits {:?}, handshake {:?}",
            self.config.port_name,
            self.config.baud_rate,
            self.config.data_bits,
            self.config.parity,
            self.config.stop_bits,
            self.config.handshake
        );

        self.platform.open(&self.config)?;
        if let Err(e) = self.start() {
            warn!("Open of {} failed after acquiring the device: {}", self.config.port_name, e);
            if let Some(event_loop) = self.event_loop.take() {
                event_loop.shutdown();
                event_loop.join();
            }
            if let Err(close_err) = self.platform.close() {
                debug!("Releasing {} after failed open: {}", self.config.port_name, close_err);
            }
            return Err(e);
        }

        self.threshold
            .store(self.config.received_bytes_threshold, Ordering::Release);
        self.is_open = true;
        self.break_state = false;
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.platform
            .initialize_buffers(self.config.read_buffer_size, self.config.write_buffer_size)?;
        if let Some(source) = self.platform.event_source() {
            let context = EventLoopContext {
                registry: Arc::clone(&self.registry),
                dispatcher: Arc::clone(&self.dispatcher),
                threshold: Arc::clone(&self.threshold),
            };
            self.event_loop = Some(EventLoop::start(source, context)?);
        }
        Ok(())
    }

    /// Close the port. Closing a closed port does nothing.
    ///
    /// The first failure of a flush, purge or handle release is returned,
    /// except device loss ([`SerialError::is_device_loss`]): a removed device
    /// has already been reported by the transfer or query that met it, and
    /// closing it always succeeds. The port is closed either way.
    pub fn close(&mut self) -> Result<()> {
        self.teardown(true)
    }

    /// Close the port and consume it. Errors are reported as by [`close`].
    ///
    /// [`close`]: SerialPort::close
    pub fn dispose(mut self) -> Result<()> {
        self.teardown(true)
    }

    /// Shared by `close`, `dispose` and `Drop`. Only an explicit close
    /// reports errors, and never device loss.
    fn teardown(&mut self, explicit: bool) -> Result<()> {
        if !self.is_open {
            return Ok(());
        }
        self.is_open = false;
        debug!("Closing {}", self.config.port_name);

        let mut failure: Option<SerialError> = None;
        let mut record = |step: &str, e: SerialError| {
            debug!("Close step '{}' failed: {}", step, e);
            if failure.is_none() {
                failure = Some(e);
            }
        };

        let event_loop = self.event_loop.take();
        if let Some(event_loop) = &event_loop {
            event_loop.shutdown();
        }

        let reachable = self.platform.stop_events().unwrap_or_else(|e| {
            record("stop_events", e);
            false
        });
        if reachable {
            if let Err(e) = self.platform.flush() {
                record("flush", e);
            }
            if let Err(e) = self.platform.discard_in_buffer() {
                record("discard_in_buffer", e);
            }
            if let Err(e) = self.platform.discard_out_buffer() {
                record("discard_out_buffer", e);
            }
        }

        if let Some(event_loop) = event_loop {
            event_loop.join();
        }

        // Purging aborted whatever a reachable device still had in flight.
        // Without that guarantee the wait is bounded.
        if explicit && reachable {
            self.pending.wait_idle();
        } else if !self.pending.wait_idle_timeout(self.close_wait) {
            warn!(
                "{} transfer(s) still pending on {}, releasing handle",
                self.pending.count(),
                self.config.port_name
            );
        }

        if let Err(e) = self.platform.close() {
            record("close", e);
        }
        self.break_state = false;
        info!("Closed {}", self.config.port_name);

        match failure {
            Some(e) if explicit && !e.is_device_loss() => Err(e),
            _ => Ok(()),
        }
    }

    // ----- transfer surface -----

    fn ensure_open(&self) -> Result<()> {
        if self.is_open {
            Ok(())
        } else {
            Err(SerialError::NotOpen)
        }
    }

    /// Read into `buf`, blocking up to the read timeout.
    ///
    /// Returns the number of bytes read. An empty read with a finite timeout
    /// is a [`SerialError::Timeout`].
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let op = self.begin_read(buf.len())?;
        let n = self.end_read(&op, buf)?;
        if n == 0 && !buf.is_empty() {
            if let Some(duration) = self.config.read_timeout.duration() {
                return Err(SerialError::timeout(duration));
            }
        }
        Ok(n)
    }

    /// Write all of `data`, blocking up to the write timeout.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        let op = self.begin_write(data)?;
        let n = self.end_write(&op)?;
        if n < data.len() {
            if let Some(duration) = self.config.write_timeout.duration() {
                return Err(SerialError::timeout(duration));
            }
        }
        Ok(())
    }

    /// Start a read of up to `len` bytes.
    pub fn begin_read(&self, len: usize) -> Result<AsyncOperation> {
        self.ensure_open()?;
        if len == 0 {
            return Ok(AsyncOperation::immediate(OperationKind::Read));
        }
        let op = AsyncOperation::new(OperationKind::Read, vec![0; len], &self.pending);
        self.submit(&op, self.config.read_timeout)?;
        Ok(op)
    }

    /// Wait for a read and copy the received bytes into `dest`.
    pub fn end_read(&self, op: &AsyncOperation, dest: &mut [u8]) -> Result<usize> {
        if op.kind() != OperationKind::Read {
            return Err(SerialError::invalid_state(format!(
                "EndRead called on a {} operation",
                op.kind()
            )));
        }
        let n = op.end(self.config.read_timeout.is_infinite())?;
        Ok(op.copy_into(dest, n))
    }

    /// Start writing `data`. Fails while the line is held in break.
    pub fn begin_write(&self, data: &[u8]) -> Result<AsyncOperation> {
        self.ensure_open()?;
        if self.break_state {
            return Err(SerialError::InBreakState);
        }
        if data.is_empty() {
            return Ok(AsyncOperation::immediate(OperationKind::Write));
        }
        let op = AsyncOperation::new(OperationKind::Write, data.to_vec(), &self.pending);
        self.submit(&op, self.config.write_timeout)?;
        Ok(op)
    }

    /// Wait for a write and return the number of bytes written.
    pub fn end_write(&self, op: &AsyncOperation) -> Result<usize> {
        if op.kind() != OperationKind::Write {
            return Err(SerialError::invalid_state(format!(
                "EndWrite called on a {} operation",
                op.kind()
            )));
        }
        op.end(self.config.write_timeout.is_infinite())
    }

    fn submit(&self, op: &AsyncOperation, timeout: Timeout) -> Result<()> {
        let Some(handle) = op.completion_handle() else {
            return Ok(());
        };
        self.platform.submit(handle, timeout)
    }

    /// Bytes waiting in the receive queue.
    pub fn bytes_to_read(&self) -> Result<usize> {
        self.ensure_open()?;
        self.platform.bytes_to_read()
    }

    /// Bytes waiting in the transmit queue.
    pub fn bytes_to_write(&self) -> Result<usize> {
        self.ensure_open()?;
        self.platform.bytes_to_write()
    }

    pub fn cd_holding(&self) -> Result<bool> {
        self.ensure_open()?;
        self.platform.cd_holding()
    }

    pub fn cts_holding(&self) -> Result<bool> {
        self.ensure_open()?;
        self.platform.cts_holding()
    }

    pub fn dsr_holding(&self) -> Result<bool> {
        self.ensure_open()?;
        self.platform.dsr_holding()
    }

    pub fn discard_in_buffer(&self) -> Result<()> {
        self.ensure_open()?;
        self.platform.discard_in_buffer()
    }

    pub fn discard_out_buffer(&self) -> Result<()> {
        self.ensure_open()?;
        self.platform.discard_out_buffer()
    }

    /// Block until queued output has been transmitted.
    pub fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        self.platform.flush()
    }

    // ----- notification surface -----

    /// Register `sink` for notifications of `kind`. Subscriptions survive
    /// close and reopen.
    pub fn subscribe<F>(&self, kind: EventKind, sink: F) -> SubscriptionId
    where
        F: Fn(&SerialEvent) + Send + Sync + 'static,
    {
        self.registry.subscribe(kind, sink)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.registry.unsubscribe(id)
    }

    /// Raw mask most recently seen by the event loop, if one is running.
    pub fn last_event_mask(&self) -> Option<crate::events::EventMask> {
        self.event_loop.as_ref().map(EventLoop::last_event_mask)
    }
}

impl<P: PlatformPort> Drop for SerialPort<P> {
    fn drop(&mut self) {
        if let Err(e) = self.teardown(false) {
            debug!("Ignoring close failure on drop: {}", e);
        }
    }
}

impl<P: PlatformPort> fmt::Debug for SerialPort<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialPort")
            .field("port_name", &self.config.port_name)
            .field("is_open", &self.is_open)
            .field("baud_rate", &self.config.baud_rate)
            .field("event_loop", &self.event_loop)
            .finish()
    }
}
