//! Serial port state machine and the platform contract behind it.
//!
//! [`SerialPort`] is the type applications use. It runs the lifecycle and
//! configuration rules and delegates native work to a [`PlatformPort`]. The
//! native handle itself lives in a [`PortHandle`], and [`MockPlatform`]
//! stands in for hardware in tests.

mod handle;
pub mod mock;
mod platform;
mod serial_port;

pub use handle::{NativeHandle, PortHandle};
pub use mock::{CompletionMode, MockDevice, MockEventSource, MockPlatform};
pub use platform::PlatformPort;
pub use serial_port::{SerialPort, DEFAULT_CLOSE_WAIT};
