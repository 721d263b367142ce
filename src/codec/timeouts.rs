//! Mapping of [`Timeout`] values onto native timeout controls.
//!
//! On Windows the read timeout becomes a `COMMTIMEOUTS` triple. On POSIX the
//! line is programmed with `VMIN = 0, VTIME = 0` and the timeout is enforced
//! with `poll(2)`, since `VTIME` can neither express "infinite" nor anything
//! above 25.5 seconds.

use crate::settings::Timeout;

pub const MAXDWORD: u32 = u32::MAX;

/// Constant used for an infinite read. `MAXDWORD` itself would turn the
/// triple into "return immediately".
pub const INFINITE_COMM_TIMEOUT: u32 = 0xFFFF_FFFE;

/// Field-for-field image of a Win32 `COMMTIMEOUTS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommTimeouts {
    pub read_interval: u32,
    pub read_total_multiplier: u32,
    pub read_total_constant: u32,
    pub write_total_multiplier: u32,
    pub write_total_constant: u32,
}

impl CommTimeouts {
    pub fn from_timeouts(read: Timeout, write: Timeout) -> Self {
        let mut timeouts = Self::default();
        timeouts.set_read(read);
        timeouts.set_write(write);
        timeouts
    }

    pub fn set_read(&mut self, read: Timeout) {
        let (interval, multiplier, constant) = match read {
            Timeout::After(d) if d.is_zero() => (MAXDWORD, 0, 0),
            Timeout::Infinite => (MAXDWORD, MAXDWORD, INFINITE_COMM_TIMEOUT),
            Timeout::After(d) => (MAXDWORD, MAXDWORD, clamp_millis(d.as_millis())),
        };
        self.read_interval = interval;
        self.read_total_multiplier = multiplier;
        self.read_total_constant = constant;
    }

    /// A zero total constant means "no timeout" to the driver, so finite
    /// writes never go below one millisecond.
    pub fn set_write(&mut self, write: Timeout) {
        self.write_total_multiplier = 0;
        self.write_total_constant = match write {
            Timeout::Infinite => 0,
            Timeout::After(d) => clamp_millis(d.as_millis()).max(1),
        };
    }
}

fn clamp_millis(millis: u128) -> u32 {
    u32::try_from(millis).unwrap_or(INFINITE_COMM_TIMEOUT - 1)
}

/// Millisecond argument for `poll(2)`; `-1` blocks indefinitely.
pub fn poll_timeout_ms(timeout: Timeout) -> i32 {
    match timeout {
        Timeout::Infinite => -1,
        Timeout::After(d) => i32::try_from(d.as_millis()).unwrap_or(i32::MAX),
    }
}
