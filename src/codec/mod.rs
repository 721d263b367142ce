//! Pure translation between typed line settings and native control words.
//!
//! Nothing in this module performs I/O. Each codec transforms a bundle the
//! caller owns and never keeps a reference to it across calls.

pub mod dcb;
pub mod termios;
pub mod timeouts;

pub use dcb::{DcbBundle, DcbFlag};
pub use termios::{decode, encode, FlagGroup, LineSettings, TermiosBundle};
pub use timeouts::{poll_timeout_ms, CommTimeouts};
