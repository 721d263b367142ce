//! Line-status notifications.
//!
//! Raw event masks (the Win32 `EV_*` layout, also produced by the POSIX event
//! source) are classified into up to three independent batches: line errors,
//! pin changes and received data. Each batch expands into typed
//! [`SerialEvent`]s which the [`EventRegistry`] delivers to subscribers.

pub mod dispatch;
pub mod event_loop;
mod registry;

pub use dispatch::{Dispatch, InlineDispatcher, ThreadDispatcher, TokioDispatcher};
pub use event_loop::{CommEventSource, EventLoop, EventLoopContext, WaitOutcome};
pub use registry::{EventRegistry, EventSink, SubscriptionId};

use std::fmt;

/// Raw `EV_*` event mask.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EventMask(pub u32);

impl EventMask {
    pub const RXCHAR: u32 = 0x0001;
    pub const RXFLAG: u32 = 0x0002;
    pub const TXEMPTY: u32 = 0x0004;
    pub const CTS: u32 = 0x0008;
    pub const DSR: u32 = 0x0010;
    pub const RLSD: u32 = 0x0020;
    pub const BREAK: u32 = 0x0040;
    pub const ERR: u32 = 0x0080;
    pub const RING: u32 = 0x0100;

    pub const PIN_CHANGED: u32 = Self::BREAK | Self::RLSD | Self::CTS | Self::RING | Self::DSR;
    pub const RECEIVED: u32 = Self::RXCHAR | Self::RXFLAG;
    /// Bits that require the driver's error state to be queried.
    pub const QUERY_ERRORS: u32 = Self::ERR | Self::RXCHAR;
    /// Everything the event loop subscribes to (all but `TXEMPTY`).
    pub const MONITORED: u32 = 0x01FB;

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, bits: u32) -> bool {
        self.0 & bits != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn pin_changes(self) -> Vec<PinChange> {
        [
            (Self::CTS, PinChange::CtsChanged),
            (Self::DSR, PinChange::DsrChanged),
            (Self::RLSD, PinChange::CdChanged),
            (Self::RING, PinChange::Ring),
            (Self::BREAK, PinChange::Break),
        ]
        .into_iter()
        .filter(|(bit, _)| self.contains(*bit))
        .map(|(_, pin)| pin)
        .collect()
    }

    pub fn received(self) -> Vec<SerialData> {
        let mut data = Vec::new();
        if self.contains(Self::RXCHAR) {
            data.push(SerialData::Chars);
        }
        if self.contains(Self::RXFLAG) {
            data.push(SerialData::Eof);
        }
        data
    }
}

impl fmt::Debug for EventMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventMask({:#06x})", self.0)
    }
}

/// Driver error state (`CE_*` flags).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ErrorFlags(pub u32);

impl ErrorFlags {
    pub const RXOVER: u32 = 0x0001;
    pub const OVERRUN: u32 = 0x0002;
    pub const RXPARITY: u32 = 0x0004;
    pub const FRAME: u32 = 0x0008;
    pub const BREAK: u32 = 0x0010;
    pub const TXFULL: u32 = 0x0100;

    /// Flags reported as line errors. `BREAK` surfaces as a pin change.
    pub const REPORTED: u32 =
        Self::FRAME | Self::OVERRUN | Self::RXOVER | Self::RXPARITY | Self::TXFULL;

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 & Self::REPORTED == 0
    }

    pub fn union(self, other: ErrorFlags) -> ErrorFlags {
        ErrorFlags(self.0 | other.0)
    }

    pub fn errors(self) -> Vec<LineError> {
        [
            (Self::TXFULL, LineError::TxFull),
            (Self::RXOVER, LineError::RxOver),
            (Self::OVERRUN, LineError::Overrun),
            (Self::RXPARITY, LineError::RxParity),
            (Self::FRAME, LineError::Frame),
        ]
        .into_iter()
        .filter(|(bit, _)| self.0 & bit != 0)
        .map(|(_, error)| error)
        .collect()
    }
}

impl fmt::Debug for ErrorFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ErrorFlags({:#06x})", self.0)
    }
}

/// Data-received sub-classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SerialData {
    /// Ordinary characters were received.
    Chars,
    /// The end-of-file marker byte was received.
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LineError {
    /// The transmit buffer is full.
    TxFull,
    /// The receive buffer overflowed.
    RxOver,
    /// The hardware overran a character.
    Overrun,
    RxParity,
    Frame,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PinChange {
    CtsChanged,
    DsrChanged,
    CdChanged,
    Ring,
    Break,
}

/// A typed notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SerialEvent {
    Data(SerialData),
    Error(LineError),
    PinChanged(PinChange),
}

impl SerialEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Data(_) => EventKind::Data,
            Self::Error(_) => EventKind::Error,
            Self::PinChanged(_) => EventKind::PinChanged,
        }
    }
}

impl fmt::Display for SerialEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data(d) => write!(f, "data received ({d:?})"),
            Self::Error(e) => write!(f, "line error ({e:?})"),
            Self::PinChanged(p) => write!(f, "pin changed ({p:?})"),
        }
    }
}

/// Notification channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Data,
    Error,
    PinChanged,
}

/// One unit of dispatch work produced from a raw mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Batch {
    Errors(ErrorFlags),
    Pins(EventMask),
    Received(EventMask),
}

/// Split a raw mask into independent batches.
///
/// `errors` is the driver error state, queried by the caller when the mask
/// contains [`EventMask::QUERY_ERRORS`] bits.
pub fn classify(mask: EventMask, errors: Option<ErrorFlags>) -> Vec<Batch> {
    let mut batches = Vec::with_capacity(3);
    if let Some(errors) = errors.filter(|e| !e.is_empty()) {
        batches.push(Batch::Errors(errors));
    }
    if mask.contains(EventMask::PIN_CHANGED) {
        batches.push(Batch::Pins(EventMask(mask.0 & EventMask::PIN_CHANGED)));
    }
    if mask.contains(EventMask::RECEIVED) {
        batches.push(Batch::Received(EventMask(mask.0 & EventMask::RECEIVED)));
    }
    batches
}
