//! Shared helpers for the integration tests.
//!
//! - mock-backed ports with inline notification delivery
//! - an event collector that records every notification
//! - polling helpers for conditions reached on background threads

#![allow(dead_code)]

use parking_lot::Mutex;
use serial_engine::events::{EventKind, InlineDispatcher, SerialEvent};
use serial_engine::port::{MockPlatform, SerialPort};
use serial_engine::PortConfiguration;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Generous upper bound for anything that happens on another thread.
pub const SETTLE: Duration = Duration::from_secs(2);

/// A closed mock-backed port. Notifications run on the event loop thread.
pub fn mock_port(name: &str) -> (MockPlatform, SerialPort<MockPlatform>) {
    mock_port_with(PortConfiguration::new(name))
}

pub fn mock_port_with(config: PortConfiguration) -> (MockPlatform, SerialPort<MockPlatform>) {
    let mock = MockPlatform::new();
    let port = SerialPort::with_platform(mock.clone(), config)
        .with_dispatcher(Arc::new(InlineDispatcher));
    (mock, port)
}

/// An open mock-backed port with its call counters reset.
pub fn open_mock_port(name: &str) -> (MockPlatform, SerialPort<MockPlatform>) {
    let (mock, mut port) = mock_port(name);
    port.open().expect("mock port opens");
    mock.reset_calls();
    (mock, port)
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Records every notification delivered to a port.
#[derive(Clone, Default)]
pub struct EventCollector {
    events: Arc<Mutex<Vec<SerialEvent>>>,
}

impl EventCollector {
    /// Subscribe to all three channels of `port`.
    pub fn attach(port: &SerialPort<MockPlatform>) -> Self {
        let collector = Self::default();
        for kind in [EventKind::Data, EventKind::Error, EventKind::PinChanged] {
            let events = Arc::clone(&collector.events);
            port.subscribe(kind, move |event| events.lock().push(*event));
        }
        collector
    }

    pub fn events(&self) -> Vec<SerialEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().len()
    }

    pub fn count_of(&self, kind: EventKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind() == kind).count()
    }

    /// Wait for at least `n` notifications.
    pub fn wait_for(&self, n: usize) -> bool {
        wait_until(SETTLE, || self.count() >= n)
    }
}
