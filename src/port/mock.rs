//! Mock platform back end for testing.
//!
//! [`MockPlatform`] implements [`PlatformPort`] without hardware. It counts
//! every native call, can fail the next call of a given name, and completes
//! transfers synchronously, from a background thread, by hand, or from two
//! racing paths at once. [`MockEventSource`] feeds scripted event masks to
//! the event loop.
//!
//! # Example
//! ```
//! use serial_engine::port::{MockPlatform, SerialPort};
//! use serial_engine::PortConfiguration;
//!
//! let mock = MockPlatform::new();
//! mock.enqueue_read(b"hello");
//!
//! let mut port = SerialPort::with_platform(mock.clone(), PortConfiguration::new("MOCK0"));
//! port.open().unwrap();
//!
//! let mut buf = [0u8; 5];
//! assert_eq!(port.read(&mut buf).unwrap(), 5);
//! assert_eq!(&buf, b"hello");
//!
//! port.write(b"world").unwrap();
//! assert_eq!(mock.write_log(), vec![b"world".to_vec()]);
//! ```

use super::handle::{NativeHandle, PortHandle};
use super::platform::PlatformPort;
use crate::error::{Result, SerialError};
use crate::events::{CommEventSource, ErrorFlags, EventMask, WaitOutcome};
use crate::io::{CompletionHandle, OperationKind};
use crate::settings::{Handshake, Parity, PortConfiguration, StopBits, Timeout};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

/// Handle value issued by the mock. Closing it is free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockHandle(u32);

impl NativeHandle for MockHandle {
    fn close(self) -> Result<()> {
        Ok(())
    }
}

/// How submitted transfers complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionMode {
    /// Inside `submit`, on the caller's thread.
    #[default]
    Synchronous,
    /// On a background thread after the delay.
    Deferred(Duration),
    /// Held until the test takes it with [`MockPlatform::take_submitted`] or a
    /// purge aborts it.
    Manual,
    /// From the caller's thread and a background thread at the same time.
    Racing,
}

/// What the mock finds when asked to open the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MockDevice {
    #[default]
    Present,
    Missing,
    NotASerialPort,
    Busy,
    AccessDenied,
}

#[derive(Debug, Default)]
struct MockState {
    calls: HashMap<&'static str, usize>,
    failures: HashMap<&'static str, SerialError>,
    device: MockDevice,
    max_baud: Option<u32>,
    lost: bool,
    applied: Option<PortConfiguration>,
    buffers: Option<(usize, usize)>,
    break_state: bool,
    read_timeout: Timeout,
    write_timeout: Timeout,
    read_queue: VecDeque<u8>,
    out_queue: VecDeque<u8>,
    write_log: Vec<Vec<u8>>,
    loopback: bool,
    completion: CompletionMode,
    submitted: Vec<CompletionHandle>,
    pins: (bool, bool, bool),
    events_disabled: bool,
    error_flags: ErrorFlags,
    fail_clear_errors: bool,
}

/// Purging aborts held transfers the way a driver purge does.
fn abort_all(ops: Vec<CompletionHandle>) {
    for op in ops {
        op.complete(0, Some(SerialError::OperationAborted));
    }
}

impl MockState {
    /// Remove held transfers of `kind`.
    fn take_held(&mut self, kind: OperationKind) -> Vec<CompletionHandle> {
        let (taken, kept) = std::mem::take(&mut self.submitted)
            .into_iter()
            .partition(|op| op.kind() == kind);
        self.submitted = kept;
        taken
    }

    fn record(&mut self, op: &'static str) -> Result<()> {
        *self.calls.entry(op).or_default() += 1;
        if let Some(err) = self.failures.remove(op) {
            return Err(err);
        }
        if self.lost {
            return Err(SerialError::DeviceRemoved);
        }
        Ok(())
    }
}

/// Mock platform back end. Clones share state.
#[derive(Clone)]
pub struct MockPlatform {
    name: Arc<Mutex<String>>,
    handle: Arc<PortHandle<MockHandle>>,
    state: Arc<Mutex<MockState>>,
    events: Arc<MockEventSource>,
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

static NEXT_HANDLE: AtomicU32 = AtomicU32::new(1);

impl MockPlatform {
    pub fn new() -> Self {
        let state = Arc::new(Mutex::new(MockState::default()));
        Self {
            name: Arc::new(Mutex::new(String::new())),
            handle: Arc::new(PortHandle::new()),
            events: Arc::new(MockEventSource::new(Arc::clone(&state))),
            state,
        }
    }

    /// Run a counted native call against the open handle.
    fn native<T>(&self, op: &'static str, f: impl FnOnce(&mut MockState) -> T) -> Result<T> {
        self.handle.with(|_| {
            let mut state = self.state.lock();
            state.record(op)?;
            Ok(f(&mut state))
        })
    }

    fn applied(&self, f: impl FnOnce(&mut PortConfiguration)) {
        if let Some(config) = self.state.lock().applied.as_mut() {
            f(config);
        }
    }

    // ----- inspection -----

    /// Number of times the native call `op` ran.
    pub fn calls(&self, op: &str) -> usize {
        self.state.lock().calls.get(op).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.state.lock().calls.values().sum()
    }

    pub fn reset_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Settings as last pushed to the "device".
    pub fn applied_configuration(&self) -> Option<PortConfiguration> {
        self.state.lock().applied.clone()
    }

    pub fn buffer_sizes(&self) -> Option<(usize, usize)> {
        self.state.lock().buffers
    }

    pub fn device_break_state(&self) -> bool {
        self.state.lock().break_state
    }

    pub fn device_timeouts(&self) -> (Timeout, Timeout) {
        let state = self.state.lock();
        (state.read_timeout, state.write_timeout)
    }

    pub fn is_handle_open(&self) -> bool {
        self.handle.is_valid()
    }

    pub fn port_name(&self) -> String {
        self.name.lock().clone()
    }

    pub fn write_log(&self) -> Vec<Vec<u8>> {
        self.state.lock().write_log.clone()
    }

    pub fn events(&self) -> &MockEventSource {
        &self.events
    }

    // ----- scripting -----

    /// Fail the next native call named `op` with `error`.
    pub fn fail_next(&self, op: &'static str, error: SerialError) {
        self.state.lock().failures.insert(op, error);
    }

    pub fn set_device(&self, device: MockDevice) {
        self.state.lock().device = device;
    }

    pub fn set_max_baud(&self, max_baud: Option<u32>) {
        self.state.lock().max_baud = max_baud;
    }

    pub fn set_completion_mode(&self, mode: CompletionMode) {
        self.state.lock().completion = mode;
    }

    /// Echo written bytes into the receive queue.
    pub fn set_loopback(&self, loopback: bool) {
        self.state.lock().loopback = loopback;
    }

    pub fn set_pins(&self, cd: bool, cts: bool, dsr: bool) {
        self.state.lock().pins = (cd, cts, dsr);
    }

    /// Open without an event source, so no event loop runs.
    pub fn disable_events(&self) {
        self.state.lock().events_disabled = true;
    }

    pub fn enqueue_read(&self, data: &[u8]) {
        self.state.lock().read_queue.extend(data);
    }

    /// Pretend the transmit queue went out on the wire.
    pub fn drain_output(&self) -> usize {
        let mut state = self.state.lock();
        let n = state.out_queue.len();
        state.out_queue.clear();
        n
    }

    /// Transfers held back in [`CompletionMode::Manual`].
    pub fn take_submitted(&self) -> Vec<CompletionHandle> {
        std::mem::take(&mut self.state.lock().submitted)
    }

    pub fn submitted_count(&self) -> usize {
        self.state.lock().submitted.len()
    }

    /// Surprise removal: the next native call fails with
    /// [`SerialError::DeviceRemoved`] and the event loop sees the loss.
    pub fn lose_device(&self) {
        self.state.lock().lost = true;
        self.events.signal(Signal::Lost);
    }

    /// Move bytes for one transfer and return the byte count.
    fn transfer(&self, op: &CompletionHandle) -> usize {
        let mut state = self.state.lock();
        match op.kind() {
            OperationKind::Read => op.with_buffer(|buf| {
                let n = buf.len().min(state.read_queue.len());
                for (slot, byte) in buf.iter_mut().zip(state.read_queue.drain(..n)) {
                    *slot = byte;
                }
                n
            }),
            OperationKind::Write => {
                let data = op.with_buffer(|buf| buf.to_vec());
                state.out_queue.extend(&data);
                if state.loopback {
                    state.read_queue.extend(&data);
                }
                let n = data.len();
                state.write_log.push(data);
                n
            }
            OperationKind::WaitEvent => 0,
        }
    }
}

impl PlatformPort for MockPlatform {
    fn open(&self, config: &PortConfiguration) -> Result<()> {
        let mut state = self.state.lock();
        state.record("open")?;
        let name = config.port_name.clone();
        match state.device {
            MockDevice::Present => {}
            MockDevice::Missing => return Err(SerialError::NotFound(name)),
            MockDevice::NotASerialPort => return Err(SerialError::NotASerialPort(name)),
            MockDevice::Busy => return Err(SerialError::SharingViolation(name)),
            MockDevice::AccessDenied => return Err(SerialError::AccessDenied(name)),
        }
        if let Some(max) = state.max_baud.filter(|max| config.baud_rate > *max) {
            return Err(SerialError::out_of_range(
                "BaudRate",
                format!("{} exceeds the device maximum of {}", config.baud_rate, max),
            ));
        }

        self.handle
            .attach(MockHandle(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed)))?;
        state.applied = Some(config.clone());
        state.read_timeout = config.read_timeout;
        state.write_timeout = config.write_timeout;
        state.break_state = false;
        state.error_flags = ErrorFlags::default();
        drop(state);

        *self.name.lock() = config.port_name.clone();
        self.events.drain();
        Ok(())
    }

    fn initialize_buffers(&self, read_buffer_size: usize, write_buffer_size: usize) -> Result<()> {
        self.native("initialize_buffers", |state| {
            state.buffers = Some((read_buffer_size, write_buffer_size));
        })
    }

    fn event_source(&self) -> Option<Arc<dyn CommEventSource>> {
        if self.state.lock().events_disabled {
            return None;
        }
        Some(Arc::clone(&self.events) as Arc<dyn CommEventSource>)
    }

    fn stop_events(&self) -> Result<bool> {
        if !self.handle.is_valid() {
            return Ok(false);
        }
        let mut state = self.state.lock();
        *state.calls.entry("stop_events").or_default() += 1;
        if let Some(err) = state.failures.remove("stop_events") {
            return Err(err);
        }
        Ok(!state.lost)
    }

    fn close(&self) -> Result<()> {
        if self.handle.release()? {
            let mut state = self.state.lock();
            *state.calls.entry("close").or_default() += 1;
            state.lost = false;
            if let Some(err) = state.failures.remove("close") {
                return Err(err);
            }
        }
        Ok(())
    }

    fn set_baud_rate(&self, baud_rate: u32) -> Result<()> {
        let max = self.state.lock().max_baud;
        if let Some(max) = max.filter(|max| baud_rate > *max) {
            return Err(SerialError::out_of_range(
                "BaudRate",
                format!("{baud_rate} exceeds the device maximum of {max}"),
            ));
        }
        self.native("set_baud_rate", |_| ())?;
        self.applied(|c| c.baud_rate = baud_rate);
        Ok(())
    }

    fn set_parity(&self, parity: Parity, parity_replace: u8) -> Result<()> {
        self.native("set_parity", |_| ())?;
        self.applied(|c| {
            c.parity = parity;
            c.parity_replace = parity_replace;
        });
        Ok(())
    }

    fn set_data_bits(&self, data_bits: u8) -> Result<()> {
        self.native("set_data_bits", |_| ())?;
        self.applied(|c| c.data_bits = data_bits);
        Ok(())
    }

    fn set_stop_bits(&self, stop_bits: StopBits) -> Result<()> {
        self.native("set_stop_bits", |_| ())?;
        self.applied(|c| c.stop_bits = stop_bits);
        Ok(())
    }

    fn set_handshake(&self, handshake: Handshake, rts_enable: bool) -> Result<()> {
        self.native("set_handshake", |_| ())?;
        self.applied(|c| {
            c.handshake = handshake;
            c.rts_enable = rts_enable;
        });
        Ok(())
    }

    fn set_dtr_enable(&self, enable: bool) -> Result<()> {
        self.native("set_dtr_enable", |_| ())?;
        self.applied(|c| c.dtr_enable = enable);
        Ok(())
    }

    fn set_rts_enable(&self, enable: bool) -> Result<()> {
        self.native("set_rts_enable", |_| ())?;
        self.applied(|c| c.rts_enable = enable);
        Ok(())
    }

    fn set_discard_null(&self, discard: bool) -> Result<()> {
        self.native("set_discard_null", |_| ())?;
        self.applied(|c| c.discard_null = discard);
        Ok(())
    }

    fn set_parity_replace(&self, replace: u8) -> Result<()> {
        self.native("set_parity_replace", |_| ())?;
        self.applied(|c| c.parity_replace = replace);
        Ok(())
    }

    fn set_read_timeout(&self, timeout: Timeout) -> Result<()> {
        self.native("set_read_timeout", |state| state.read_timeout = timeout)
    }

    fn set_write_timeout(&self, timeout: Timeout) -> Result<()> {
        self.native("set_write_timeout", |state| state.write_timeout = timeout)
    }

    fn set_break_state(&self, enabled: bool) -> Result<()> {
        self.native("set_break_state", |state| state.break_state = enabled)
    }

    fn bytes_to_read(&self) -> Result<usize> {
        self.native("bytes_to_read", |state| state.read_queue.len())
    }

    fn bytes_to_write(&self) -> Result<usize> {
        self.native("bytes_to_write", |state| state.out_queue.len())
    }

    fn cd_holding(&self) -> Result<bool> {
        self.native("cd_holding", |state| state.pins.0)
    }

    fn cts_holding(&self) -> Result<bool> {
        self.native("cts_holding", |state| state.pins.1)
    }

    fn dsr_holding(&self) -> Result<bool> {
        self.native("dsr_holding", |state| state.pins.2)
    }

    fn discard_in_buffer(&self) -> Result<()> {
        let aborted = self.native("discard_in_buffer", |state| {
            state.read_queue.clear();
            state.take_held(OperationKind::Read)
        })?;
        abort_all(aborted);
        Ok(())
    }

    fn discard_out_buffer(&self) -> Result<()> {
        let aborted = self.native("discard_out_buffer", |state| {
            state.out_queue.clear();
            state.take_held(OperationKind::Write)
        })?;
        abort_all(aborted);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.native("flush", |state| state.out_queue.clear())
    }

    fn submit(&self, op: CompletionHandle, _timeout: Timeout) -> Result<()> {
        let name = match op.kind() {
            OperationKind::Read => "read",
            OperationKind::Write => "write",
            OperationKind::WaitEvent => "wait_event",
        };
        let mode = self.native(name, |state| state.completion)?;

        match mode {
            CompletionMode::Synchronous => {
                let n = self.transfer(&op);
                op.complete(n, None);
            }
            CompletionMode::Deferred(delay) => {
                let this = self.clone();
                std::thread::spawn(move || {
                    std::thread::sleep(delay);
                    let n = this.transfer(&op);
                    op.complete(n, None);
                });
            }
            CompletionMode::Manual => self.state.lock().submitted.push(op),
            CompletionMode::Racing => {
                let n = self.transfer(&op);
                let callback = op.clone();
                let racer = std::thread::spawn(move || callback.complete(n, None));
                op.complete(n, None);
                // The loser's completion is ignored; only one may win.
                let _ = racer.join();
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for MockPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockPlatform")
            .field("name", &*self.name.lock())
            .field("handle", &self.handle)
            .finish()
    }
}

enum Signal {
    Mask(u32),
    Lost,
    Wake,
}

/// Scripted line-status source shared with a [`MockPlatform`].
pub struct MockEventSource {
    state: Arc<Mutex<MockState>>,
    tx: Mutex<mpsc::Sender<Signal>>,
    rx: Mutex<mpsc::Receiver<Signal>>,
}

impl MockEventSource {
    const POLL: Duration = Duration::from_millis(50);

    fn new(state: Arc<Mutex<MockState>>) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            state,
            tx: Mutex::new(tx),
            rx: Mutex::new(rx),
        }
    }

    fn signal(&self, signal: Signal) {
        // The receiver lives as long as we do, so sending cannot fail.
        let _ = self.tx.lock().send(signal);
    }

    /// Forget anything queued by a previous session.
    fn drain(&self) {
        while self.rx.lock().try_recv().is_ok() {}
    }

    /// Deliver a raw `EV_*` mask to the event loop.
    pub fn inject_event(&self, mask: u32) {
        self.signal(Signal::Mask(mask));
    }

    /// Error state returned by the next error query.
    pub fn set_error_flags(&self, flags: ErrorFlags) {
        let mut state = self.state.lock();
        state.error_flags = state.error_flags.union(flags);
    }

    /// Make the next error query report the device as gone.
    pub fn fail_clear_errors(&self) {
        self.state.lock().fail_clear_errors = true;
    }
}

impl CommEventSource for MockEventSource {
    fn wait_event(&self) -> WaitOutcome {
        match self.rx.lock().recv_timeout(Self::POLL) {
            Ok(Signal::Mask(mask)) => WaitOutcome::Events(EventMask(mask)),
            Ok(Signal::Lost) => WaitOutcome::DeviceLost,
            Ok(Signal::Wake) | Err(mpsc::RecvTimeoutError::Timeout) => WaitOutcome::Interrupted,
            Err(mpsc::RecvTimeoutError::Disconnected) => WaitOutcome::DeviceLost,
        }
    }

    fn clear_errors(&self) -> Result<ErrorFlags> {
        let mut state = self.state.lock();
        *state.calls.entry("clear_errors").or_default() += 1;
        if std::mem::take(&mut state.fail_clear_errors) {
            return Err(SerialError::DeviceRemoved);
        }
        Ok(std::mem::take(&mut state.error_flags))
    }

    fn bytes_available(&self) -> Result<usize> {
        Ok(self.state.lock().read_queue.len())
    }

    fn interrupt(&self) {
        self.signal(Signal::Wake);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_mock() -> MockPlatform {
        let mock = MockPlatform::new();
        mock.open(&PortConfiguration::new("MOCK0")).unwrap();
        mock
    }

    #[test]
    fn test_calls_are_counted() {
        let mock = open_mock();
        mock.set_baud_rate(19200).unwrap();
        mock.set_baud_rate(38400).unwrap();
        assert_eq!(mock.calls("open"), 1);
        assert_eq!(mock.calls("set_baud_rate"), 2);
        assert_eq!(mock.applied_configuration().unwrap().baud_rate, 38400);
    }

    #[test]
    fn test_fail_next_fails_once() {
        let mock = open_mock();
        mock.fail_next("flush", SerialError::Io(std::io::Error::other("stuck")));
        assert!(mock.flush().is_err());
        assert!(mock.flush().is_ok());
    }

    #[test]
    fn test_open_reports_device_kind() {
        let mock = MockPlatform::new();
        mock.set_device(MockDevice::NotASerialPort);
        let err = mock.open(&PortConfiguration::new("MOCK0")).unwrap_err();
        assert!(matches!(err, SerialError::NotASerialPort(name) if name == "MOCK0"));
        assert!(!mock.is_handle_open());
    }

    #[test]
    fn test_lost_device_invalidates_handle() {
        let mock = open_mock();
        mock.lose_device();
        assert!(matches!(mock.bytes_to_read(), Err(SerialError::DeviceRemoved)));
        assert!(matches!(mock.bytes_to_read(), Err(SerialError::NotOpen)));
        assert!(!mock.stop_events().unwrap());
        mock.close().unwrap();
        assert_eq!(mock.calls("close"), 1);
    }
}
