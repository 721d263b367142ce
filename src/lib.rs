//! Serial Engine Library
//!
//! A cross-platform serial port with a synchronous and begin/end transfer
//! surface, per-port event notifications, and configuration codecs for
//! Win32 `DCB` and POSIX `termios`.
//!
//! # Modules
//!
//! - `settings`: line configuration types and validation rules
//! - `port`: the `SerialPort` state machine and the platform contract
//! - `platform`: native back ends (overlapped Win32, Linux `termios2`)
//! - `io`: completion contract for in-flight transfers
//! - `events`: event loop, notification registry and dispatchers
//! - `codec`: `DCB`, `termios` and timeout encoders
//! - `error`: unified error handling
//! - `config`: TOML configuration with environment overrides
//! - `logging`: subscriber setup for the binary

pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod io;
pub mod logging;
pub mod platform;
pub mod port;
pub mod settings;

// Re-export commonly used types for convenience
pub use error::{ErrorKind, NativeErrorKind, Result, SerialError};
pub use events::{
    Dispatch, EventKind, EventMask, LineError, PinChange, SerialData, SerialEvent, SubscriptionId,
    ThreadDispatcher, TokioDispatcher,
};
pub use io::{AsyncOperation, OperationKind};
pub use platform::NativePort;
pub use port::{MockPlatform, PlatformPort, SerialPort};
pub use settings::{Handshake, Parity, PortConfiguration, StopBits, Timeout};

// Re-export config types
pub use config::{Config, ConfigError, ConfigLoader, ConfigResult};
