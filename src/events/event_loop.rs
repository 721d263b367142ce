//! Background loop translating native line-status events into notifications.
//!
//! The loop owns one thread. Each cycle blocks in
//! [`CommEventSource::wait_event`], classifies the raw mask and hands every
//! batch to the [`Dispatch`] implementation, then immediately waits again.
//! Losing the device while querying the error state stops the loop quietly;
//! the failure surfaces on the caller's next foreground operation.

use super::{classify, Batch, Dispatch, ErrorFlags, EventMask, EventRegistry, SerialEvent};
use crate::error::{Result, SerialError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, trace, warn};

/// Result of one wait on the native event source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// One or more events fired.
    Events(EventMask),
    /// The wait ended without events, e.g. because of a shutdown request.
    Interrupted,
    /// The device can no longer be reached.
    DeviceLost,
}

/// Native line-status source used by the event loop.
pub trait CommEventSource: Send + Sync + 'static {
    /// Block until the OS reports events, the wait is interrupted, or the
    /// device goes away.
    fn wait_event(&self) -> WaitOutcome;

    /// Read and clear the driver error state.
    fn clear_errors(&self) -> Result<ErrorFlags>;

    /// Bytes queued in the receive buffer.
    fn bytes_available(&self) -> Result<usize>;

    /// Wake an in-flight [`wait_event`](Self::wait_event).
    fn interrupt(&self) {}
}

/// What the loop publishes into.
#[derive(Clone)]
pub struct EventLoopContext {
    pub registry: Arc<EventRegistry>,
    pub dispatcher: Arc<dyn Dispatch>,
    /// Received-bytes threshold, shared with the port so it can change while
    /// the loop runs.
    pub threshold: Arc<AtomicUsize>,
}

struct LoopShared {
    stop: AtomicBool,
    running: AtomicBool,
    last_mask: AtomicU32,
}

/// Handle to the running loop.
pub struct EventLoop {
    shared: Arc<LoopShared>,
    source: Arc<dyn CommEventSource>,
    context: EventLoopContext,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EventLoop {
    /// Spawn the loop thread.
    pub fn start(source: Arc<dyn CommEventSource>, context: EventLoopContext) -> Result<Self> {
        let shared = Arc::new(LoopShared {
            stop: AtomicBool::new(false),
            running: AtomicBool::new(true),
            last_mask: AtomicU32::new(0),
        });

        let worker = {
            let shared = Arc::clone(&shared);
            let source = Arc::clone(&source);
            let context = context.clone();
            std::thread::Builder::new()
                .name("serial-event-loop".to_string())
                .spawn(move || run(&shared, &source, &context))
                .map_err(SerialError::Io)?
        };
        debug!("Event loop started");

        Ok(Self {
            shared,
            source,
            context,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Ask the loop to stop. Safe while a wait is in flight.
    pub fn shutdown(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.source.interrupt();
    }

    /// Wait for the loop thread to exit. Returns false if it panicked.
    pub fn join(&self) -> bool {
        let Some(worker) = self.worker.lock().take() else {
            return true;
        };
        match worker.join() {
            Ok(()) => true,
            Err(_) => {
                warn!("Event loop thread panicked");
                false
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.stop.load(Ordering::Acquire)
    }

    /// Most recent raw mask observed by the loop.
    pub fn last_event_mask(&self) -> EventMask {
        EventMask(self.shared.last_mask.load(Ordering::Acquire))
    }

    /// Re-evaluate the data notification after the threshold changed, in
    /// case the queue already holds enough bytes.
    pub fn threshold_changed(&self) {
        if self.is_running() {
            dispatch_received(EventMask(EventMask::RXCHAR), &self.source, &self.context);
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.shutdown();
        self.join();
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("running", &self.is_running())
            .field("last_event_mask", &self.last_event_mask())
            .finish()
    }
}

fn run(shared: &LoopShared, source: &Arc<dyn CommEventSource>, context: &EventLoopContext) {
    while !shared.stop.load(Ordering::Acquire) {
        match source.wait_event() {
            WaitOutcome::Events(mask) => {
                shared.last_mask.store(mask.bits(), Ordering::Release);
                trace!(?mask, "comm event");
                if shared.stop.load(Ordering::Acquire) {
                    break;
                }
                if !dispatch_events(mask, source, context) {
                    shared.stop.store(true, Ordering::Release);
                }
            }
            WaitOutcome::Interrupted => {}
            WaitOutcome::DeviceLost => {
                debug!("Device lost, stopping event loop");
                shared.stop.store(true, Ordering::Release);
            }
        }
    }
    shared.running.store(false, Ordering::Release);
    debug!("Event loop exited");
}

/// Returns false when the device became unreachable.
fn dispatch_events(
    mask: EventMask,
    source: &Arc<dyn CommEventSource>,
    context: &EventLoopContext,
) -> bool {
    let errors = if mask.contains(EventMask::QUERY_ERRORS) {
        match source.clear_errors() {
            Ok(errors) => Some(errors),
            Err(e) => {
                debug!("Querying error state failed, stopping event loop: {}", e);
                return false;
            }
        }
    } else {
        None
    };

    for batch in classify(mask, errors) {
        match batch {
            Batch::Errors(flags) => {
                let registry = Arc::clone(&context.registry);
                context.dispatcher.dispatch(Box::new(move || {
                    for error in flags.errors() {
                        registry.publish(&SerialEvent::Error(error));
                    }
                }));
            }
            Batch::Pins(pins) => {
                let registry = Arc::clone(&context.registry);
                context.dispatcher.dispatch(Box::new(move || {
                    for pin in pins.pin_changes() {
                        registry.publish(&SerialEvent::PinChanged(pin));
                    }
                }));
            }
            Batch::Received(received) => dispatch_received(received, source, context),
        }
    }
    true
}

/// Data notifications fire once the queue reaches the threshold. The EOF
/// marker always fires.
fn dispatch_received(
    received: EventMask,
    source: &Arc<dyn CommEventSource>,
    context: &EventLoopContext,
) {
    let registry = Arc::clone(&context.registry);
    let threshold = Arc::clone(&context.threshold);
    let source = Arc::clone(source);
    context.dispatcher.dispatch(Box::new(move || {
        let eof = received.contains(EventMask::RXFLAG);
        let queued = source.bytes_available().unwrap_or(0);
        if !eof && queued < threshold.load(Ordering::Acquire) {
            return;
        }
        for data in received.received() {
            registry.publish(&SerialEvent::Data(data));
        }
    }));
}
