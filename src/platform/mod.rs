//! Native back ends.
//!
//! [`NativePort`] names the back end for the target being built: overlapped
//! Win32 I/O on Windows, `termios2` on Linux. Other targets get a back end
//! whose open fails with [`SerialError::NotSupported`](crate::SerialError::NotSupported).

#[cfg(target_os = "linux")]
pub mod posix;
#[cfg(not(any(windows, target_os = "linux")))]
pub mod unsupported;
#[cfg(windows)]
pub mod windows;

#[cfg(target_os = "linux")]
pub type NativePort = posix::PosixPort;

#[cfg(windows)]
pub type NativePort = windows::WindowsPort;

#[cfg(not(any(windows, target_os = "linux")))]
pub type NativePort = unsupported::UnsupportedPort;
