//! Engine error types.
//!
//! Every fallible operation returns [`SerialError`]. Failures fall into five
//! groups, exposed through [`SerialError::kind`]:
//!
//! - configuration: out-of-range or inconsistent settings, rejected before
//!   any platform call
//! - state: the operation is invalid for the current open/closed state
//! - native: an OS error code mapped to a small set of kinds
//! - timeout: the configured window elapsed
//! - not supported: a line setting the platform cannot express
//!
//! Misusing the completion protocol (ending an operation twice) is reported
//! as its own [`ErrorKind::Protocol`] group.

use crate::io::OperationKind;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the serial engine.
#[derive(Debug, Error)]
pub enum SerialError {
    /// A setting is outside its legal range or conflicts with another setting.
    #[error("{name} is out of range: {reason}")]
    OutOfRange { name: &'static str, reason: String },

    /// The operation is not valid in the current state.
    #[error("Invalid operation: {0}")]
    InvalidState(String),

    #[error("Port is not open")]
    NotOpen,

    #[error("Port is already open")]
    AlreadyOpen,

    /// `RtsEnable` was changed while the handshake drives the RTS line.
    #[error("RtsEnable cannot be changed while Handshake uses RTS flow control")]
    RtsWithHandshake,

    /// A write was attempted while the line is held in break.
    #[error("Cannot write while the port is in break state")]
    InBreakState,

    /// The line setting has no representation on this platform.
    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Serial port not found: {0}")]
    NotFound(String),

    #[error("Access to serial port '{0}' is denied")]
    AccessDenied(String),

    #[error("Serial port '{0}' is in use by another process")]
    SharingViolation(String),

    /// The named device exists but is not a serial port.
    #[error("'{0}' is not a serial port")]
    NotASerialPort(String),

    /// A native call reported the handle as stale. The handle is not used again.
    #[error("The port handle has been invalidated")]
    HandleInvalidated,

    #[error("The device has been removed")]
    DeviceRemoved,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The native layer aborted the operation, or an operation with an
    /// infinite timeout completed without transferring anything.
    #[error("The I/O operation has been aborted")]
    OperationAborted,

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// `end` was called a second time on the same operation.
    #[error("End{0} can only be called once for each asynchronous operation")]
    EndCalledTwice(OperationKind),
}

/// Broad classification of a [`SerialError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    State,
    Native(NativeErrorKind),
    Timeout,
    NotSupported,
    Protocol,
}

/// Native failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeErrorKind {
    NotFound,
    AccessDenied,
    SharingViolation,
    NotASerialPort,
    HandleInvalidated,
    DeviceRemoved,
    Io,
}

impl SerialError {
    /// Create an OutOfRange error for the named setting.
    pub fn out_of_range(name: &'static str, reason: impl Into<String>) -> Self {
        Self::OutOfRange {
            name,
            reason: reason.into(),
        }
    }

    /// Create an InvalidState error from a message.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    /// Create an InvalidState error for a property that is fixed while open.
    pub fn cant_set_when_open(property: &str) -> Self {
        Self::InvalidState(format!("{property} cannot be set while the port is open"))
    }

    /// Create a NotSupported error from a message.
    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::NotSupported(message.into())
    }

    /// Create a Timeout error from a duration.
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout(duration)
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::OutOfRange { .. } => ErrorKind::Configuration,
            Self::InvalidState(_)
            | Self::NotOpen
            | Self::AlreadyOpen
            | Self::RtsWithHandshake
            | Self::InBreakState => ErrorKind::State,
            Self::NotSupported(_) => ErrorKind::NotSupported,
            Self::NotFound(_) => ErrorKind::Native(NativeErrorKind::NotFound),
            Self::AccessDenied(_) => ErrorKind::Native(NativeErrorKind::AccessDenied),
            Self::SharingViolation(_) => ErrorKind::Native(NativeErrorKind::SharingViolation),
            Self::NotASerialPort(_) => ErrorKind::Native(NativeErrorKind::NotASerialPort),
            Self::HandleInvalidated => ErrorKind::Native(NativeErrorKind::HandleInvalidated),
            Self::DeviceRemoved => ErrorKind::Native(NativeErrorKind::DeviceRemoved),
            Self::Io(_) | Self::OperationAborted => ErrorKind::Native(NativeErrorKind::Io),
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::EndCalledTwice(_) => ErrorKind::Protocol,
        }
    }

    /// Fill in the device name of a name-carrying error that was raised
    /// without one. Other errors pass through.
    pub fn for_port(self, port: &str) -> Self {
        match self {
            Self::NotFound(name) if name.is_empty() => Self::NotFound(port.to_string()),
            Self::AccessDenied(name) if name.is_empty() => Self::AccessDenied(port.to_string()),
            Self::SharingViolation(name) if name.is_empty() => {
                Self::SharingViolation(port.to_string())
            }
            Self::NotASerialPort(name) if name.is_empty() => {
                Self::NotASerialPort(port.to_string())
            }
            other => other,
        }
    }

    /// True when the device can no longer be reached through the current handle.
    pub fn is_device_loss(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Native(NativeErrorKind::HandleInvalidated)
                | ErrorKind::Native(NativeErrorKind::DeviceRemoved)
        )
    }
}

/// A specialized `Result` type for engine operations.
pub type Result<T> = std::result::Result<T, SerialError>;

/// Win32 error codes the engine distinguishes.
pub mod win32 {
    pub const ERROR_FILE_NOT_FOUND: u32 = 2;
    pub const ERROR_PATH_NOT_FOUND: u32 = 3;
    pub const ERROR_ACCESS_DENIED: u32 = 5;
    pub const ERROR_INVALID_HANDLE: u32 = 6;
    pub const ERROR_BAD_COMMAND: u32 = 22;
    pub const ERROR_SHARING_VIOLATION: u32 = 32;
    pub const ERROR_HANDLE_EOF: u32 = 38;
    pub const ERROR_INVALID_PARAMETER: u32 = 87;
    pub const ERROR_OPERATION_ABORTED: u32 = 995;
    pub const ERROR_IO_INCOMPLETE: u32 = 996;
    pub const ERROR_IO_PENDING: u32 = 997;
    pub const ERROR_DEVICE_REMOVED: u32 = 1617;
}

/// Map a Win32 error code to a [`SerialError`].
///
/// `port` names the device for the kinds that carry it.
pub fn map_win32_error(code: u32, port: Option<&str>) -> SerialError {
    use win32::*;

    let port = port.unwrap_or_default().to_string();
    match code {
        ERROR_FILE_NOT_FOUND | ERROR_PATH_NOT_FOUND => SerialError::NotFound(port),
        ERROR_ACCESS_DENIED => SerialError::AccessDenied(port),
        ERROR_SHARING_VIOLATION => SerialError::SharingViolation(port),
        ERROR_INVALID_HANDLE => SerialError::HandleInvalidated,
        ERROR_DEVICE_REMOVED => SerialError::DeviceRemoved,
        ERROR_OPERATION_ABORTED => SerialError::OperationAborted,
        code => SerialError::Io(std::io::Error::from_raw_os_error(code as i32)),
    }
}

/// Map a POSIX `errno` value to a [`SerialError`].
#[cfg(unix)]
pub fn map_errno(errno: i32, port: Option<&str>) -> SerialError {
    let port = port.unwrap_or_default().to_string();
    match errno {
        libc::ENOENT | libc::ENXIO | libc::ENODEV => SerialError::NotFound(port),
        libc::EACCES | libc::EPERM => SerialError::AccessDenied(port),
        libc::EBUSY => SerialError::SharingViolation(port),
        libc::ENOTTY => SerialError::NotASerialPort(port),
        libc::EBADF => SerialError::HandleInvalidated,
        libc::ECANCELED => SerialError::OperationAborted,
        errno => SerialError::Io(std::io::Error::from_raw_os_error(errno)),
    }
}

/// Map the calling thread's last OS error.
pub fn last_os_error(port: Option<&str>) -> SerialError {
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        #[cfg(unix)]
        Some(errno) => map_errno(errno, port),
        #[cfg(windows)]
        Some(code) => map_win32_error(code as u32, port),
        _ => SerialError::Io(err),
    }
}
