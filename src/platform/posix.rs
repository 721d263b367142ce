//! Linux back end over `termios2`.
//!
//! The line is programmed raw with `VMIN = 0, VTIME = 0`, so a read never
//! blocks in the kernel; read and write timeouts are enforced with `poll(2)`
//! and transfers complete before `submit` returns. Line settings go through
//! the termios codec against a cached bundle that is only committed after the
//! kernel accepted it.
//!
//! Notifications come from [`PosixEventSource`], which polls for input and
//! diffs the queue length, the modem lines and the driver's interrupt
//! counters between cycles.

use crate::codec::{poll_timeout_ms, TermiosBundle};
use crate::error::{last_os_error, map_errno, Result, SerialError};
use crate::events::{CommEventSource, ErrorFlags, EventMask, WaitOutcome};
use crate::io::{CompletionHandle, OperationKind};
use crate::port::{NativeHandle, PlatformPort, PortHandle};
use crate::settings::{Handshake, Parity, PortConfiguration, StopBits, Timeout};
use libc::{c_int, c_void};
use parking_lot::Mutex;
use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// `TIOCGICOUNT` from `asm-generic/ioctls.h`.
const TIOCGICOUNT: u32 = 0x545D;

/// `struct serial_icounter_struct` from `linux/serial.h`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct SerialIcounter {
    cts: c_int,
    dsr: c_int,
    rng: c_int,
    dcd: c_int,
    rx: c_int,
    tx: c_int,
    frame: c_int,
    overrun: c_int,
    parity: c_int,
    brk: c_int,
    buf_overrun: c_int,
    reserved: [c_int; 9],
}

/// An open tty file descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fd(RawFd);

impl NativeHandle for Fd {
    fn close(self) -> Result<()> {
        if unsafe { libc::close(self.0) } != 0 {
            return Err(last_os_error(None));
        }
        Ok(())
    }
}

/// Map the last errno of a call on an open descriptor. Losing the device
/// shows up as `EIO`, `ENXIO` or `ENODEV` once the fd exists. The device
/// name is added by the caller through [`SerialError::for_port`].
fn op_error() -> SerialError {
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EIO | libc::ENXIO | libc::ENODEV) => SerialError::DeviceRemoved,
        Some(errno) => map_errno(errno, None),
        None => SerialError::Io(err),
    }
}

fn check(ret: c_int) -> Result<c_int> {
    if ret < 0 {
        Err(op_error())
    } else {
        Ok(ret)
    }
}

fn read_termios(fd: Fd) -> Result<TermiosBundle> {
    let mut tio: libc::termios2 = unsafe { std::mem::zeroed() };
    check(unsafe { libc::ioctl(fd.0, libc::TCGETS2 as _, &mut tio) })?;
    let mut bundle = TermiosBundle {
        input: tio.c_iflag,
        output: tio.c_oflag,
        control: tio.c_cflag,
        local: tio.c_lflag,
        line: tio.c_line,
        ispeed: tio.c_ispeed,
        ospeed: tio.c_ospeed,
        ..TermiosBundle::default()
    };
    let n = bundle.cc.len().min(tio.c_cc.len());
    bundle.cc[..n].copy_from_slice(&tio.c_cc[..n]);
    Ok(bundle)
}

fn write_termios(fd: Fd, bundle: &TermiosBundle) -> Result<()> {
    let mut tio: libc::termios2 = unsafe { std::mem::zeroed() };
    tio.c_iflag = bundle.input;
    tio.c_oflag = bundle.output;
    tio.c_cflag = bundle.control;
    tio.c_lflag = bundle.local;
    tio.c_line = bundle.line;
    tio.c_ispeed = bundle.ispeed;
    tio.c_ospeed = bundle.ospeed;
    let n = bundle.cc.len().min(tio.c_cc.len());
    tio.c_cc[..n].copy_from_slice(&bundle.cc[..n]);
    check(unsafe { libc::ioctl(fd.0, libc::TCSETS2 as _, &tio) })?;
    Ok(())
}

fn modem_bits(fd: Fd) -> Result<c_int> {
    let mut bits: c_int = 0;
    check(unsafe { libc::ioctl(fd.0, libc::TIOCMGET as _, &mut bits) })?;
    Ok(bits)
}

fn set_modem_line(fd: Fd, line: c_int, on: bool) -> Result<()> {
    let request = if on { libc::TIOCMBIS } else { libc::TIOCMBIC };
    check(unsafe { libc::ioctl(fd.0, request as _, &line) })?;
    Ok(())
}

fn queued_input(fd: Fd) -> Result<usize> {
    let mut n: c_int = 0;
    check(unsafe { libc::ioctl(fd.0, libc::FIONREAD as _, &mut n) })?;
    Ok(n.max(0) as usize)
}

fn interrupt_counts(fd: Fd) -> Option<SerialIcounter> {
    let mut counts = SerialIcounter::default();
    // Not every driver keeps counters; those simply report no errors.
    let ret = unsafe { libc::ioctl(fd.0, TIOCGICOUNT as _, &mut counts) };
    (ret == 0).then_some(counts)
}

/// Remaining milliseconds for `poll(2)`, `-1` when unbounded.
fn remaining_ms(deadline: Option<Instant>) -> i32 {
    match deadline {
        None => -1,
        Some(deadline) => {
            let left = deadline.saturating_duration_since(Instant::now());
            i32::try_from(left.as_millis()).unwrap_or(i32::MAX)
        }
    }
}

/// Wait for `events` on `fd`. `Ok(None)` on timeout.
fn wait_ready(fd: Fd, events: i16, deadline: Option<Instant>) -> Result<Option<i16>> {
    loop {
        let mut pfd = libc::pollfd {
            fd: fd.0,
            events,
            revents: 0,
        };
        let ret = unsafe { libc::poll(&mut pfd, 1, remaining_ms(deadline)) };
        if ret < 0 {
            if std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(op_error());
        }
        if ret == 0 {
            return Ok(None);
        }
        if pfd.revents & libc::POLLNVAL != 0 {
            return Err(SerialError::HandleInvalidated);
        }
        if pfd.revents & (libc::POLLHUP | libc::POLLERR) != 0 {
            return Err(SerialError::DeviceRemoved);
        }
        return Ok(Some(pfd.revents));
    }
}

fn deadline_for(timeout: Timeout) -> Option<Instant> {
    match poll_timeout_ms(timeout) {
        ms if ms < 0 => None,
        ms => Some(Instant::now() + Duration::from_millis(ms as u64)),
    }
}

fn would_block() -> bool {
    matches!(
        std::io::Error::last_os_error().raw_os_error(),
        Some(libc::EAGAIN | libc::EINTR)
    )
}

/// Read whatever arrives first, up to the buffer size.
fn read_timed(fd: Fd, op: &CompletionHandle, timeout: Timeout) -> Result<usize> {
    let deadline = deadline_for(timeout);
    loop {
        if wait_ready(fd, libc::POLLIN, deadline)?.is_none() {
            return Ok(0);
        }
        let n = op.with_buffer(|buf| unsafe {
            libc::read(fd.0, buf.as_mut_ptr() as *mut c_void, buf.len())
        });
        match n {
            n if n > 0 => return Ok(n as usize),
            // readable with nothing to read: the other end hung up
            0 => return Err(SerialError::DeviceRemoved),
            _ if would_block() => continue,
            _ => return Err(op_error()),
        }
    }
}

/// Write the whole buffer unless the deadline passes first.
fn write_timed(fd: Fd, op: &CompletionHandle, timeout: Timeout) -> Result<usize> {
    let deadline = deadline_for(timeout);
    let total = op.len();
    let mut written = 0;
    while written < total {
        if wait_ready(fd, libc::POLLOUT, deadline)?.is_none() {
            break;
        }
        let n = op.with_buffer(|buf| unsafe {
            libc::write(
                fd.0,
                buf[written..].as_ptr() as *const c_void,
                buf.len() - written,
            )
        });
        if n < 0 {
            if would_block() {
                continue;
            }
            return Err(op_error());
        }
        written += n as usize;
    }
    Ok(written)
}

/// Push `handshake` over `current` and move RTS when the handshake leaves it
/// to the caller. If RTS cannot follow, `current` is written back so the
/// line keeps its old flow control. Returns the image now in the kernel.
fn switch_handshake(
    fd: Fd,
    current: TermiosBundle,
    handshake: Handshake,
    rts_enable: bool,
) -> Result<TermiosBundle> {
    let mut next = current;
    next.set_handshake(handshake);
    write_termios(fd, &next)?;
    if handshake.uses_rts() {
        return Ok(next);
    }
    if let Err(e) = set_modem_line(fd, libc::TIOCM_RTS, rts_enable) {
        if let Err(restore) = write_termios(fd, &current) {
            debug!("Restoring flow control after failed RTS change: {}", restore);
        }
        return Err(e);
    }
    Ok(next)
}

#[derive(Debug, Default, Clone, Copy)]
struct Recorded {
    parity_replace: u8,
    discard_null: bool,
}

/// The Linux [`PlatformPort`].
pub struct PosixPort {
    name: Mutex<String>,
    handle: Arc<PortHandle<Fd>>,
    termios: Mutex<TermiosBundle>,
    timeouts: Mutex<(Timeout, Timeout)>,
    recorded: Mutex<Recorded>,
    events: Mutex<Option<Arc<PosixEventSource>>>,
}

impl Default for PosixPort {
    fn default() -> Self {
        Self {
            name: Mutex::new(String::new()),
            handle: Arc::new(PortHandle::new()),
            termios: Mutex::new(TermiosBundle::default()),
            timeouts: Mutex::new((Timeout::Infinite, Timeout::Infinite)),
            recorded: Mutex::new(Recorded::default()),
            events: Mutex::new(None),
        }
    }
}

impl PosixPort {
    pub fn new() -> Self {
        Self::default()
    }

    /// The termios image last accepted by the kernel.
    pub fn termios(&self) -> TermiosBundle {
        *self.termios.lock()
    }

    /// Run `f` on the open descriptor. Errors name this port.
    fn with_fd<T>(&self, f: impl FnOnce(Fd) -> Result<T>) -> Result<T> {
        self.handle.with(f).map_err(|e| e.for_port(&self.name.lock()))
    }

    /// Apply `f` to a copy of the cached bundle, push it, then commit it.
    fn update(&self, f: impl FnOnce(&mut TermiosBundle) -> Result<()>) -> Result<()> {
        self.with_fd(|fd| {
            let mut next = *self.termios.lock();
            f(&mut next)?;
            write_termios(fd, &next)?;
            *self.termios.lock() = next;
            Ok(())
        })
    }

    fn configure(&self, fd: Fd, config: &PortConfiguration) -> Result<()> {
        let name = &config.port_name;

        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd.0, &mut stat) } != 0 {
            return Err(last_os_error(Some(name)));
        }
        if stat.st_mode & libc::S_IFMT != libc::S_IFCHR {
            return Err(SerialError::NotASerialPort(name.clone()));
        }
        let mut bundle =
            read_termios(fd).map_err(|_| SerialError::NotASerialPort(name.clone()))?;
        if unsafe { libc::ioctl(fd.0, libc::TIOCEXCL as _) } != 0 {
            return Err(last_os_error(Some(name)));
        }

        bundle.configure(config)?;
        write_termios(fd, &bundle)?;
        *self.termios.lock() = bundle;

        set_modem_line(fd, libc::TIOCM_DTR, config.dtr_enable)?;
        if !config.handshake.uses_rts() {
            set_modem_line(fd, libc::TIOCM_RTS, config.rts_enable)?;
        }

        *self.timeouts.lock() = (config.read_timeout, config.write_timeout);
        *self.recorded.lock() = Recorded {
            parity_replace: config.parity_replace,
            discard_null: config.discard_null,
        };
        if config.discard_null {
            debug!("{}: null stripping is not available on this platform", name);
        }
        Ok(())
    }
}

impl PlatformPort for PosixPort {
    fn open(&self, config: &PortConfiguration) -> Result<()> {
        let name = &config.port_name;
        let path = CString::new(name.as_str())
            .map_err(|_| SerialError::out_of_range("PortName", "must not contain NUL"))?;
        let raw = unsafe {
            libc::open(
                path.as_ptr(),
                libc::O_RDWR | libc::O_NOCTTY | libc::O_NONBLOCK | libc::O_CLOEXEC,
            )
        };
        if raw < 0 {
            return Err(last_os_error(Some(name)));
        }
        let fd = Fd(raw);

        if let Err(e) = self
            .configure(fd, config)
            .and_then(|()| self.handle.attach(fd))
            .map_err(|e| e.for_port(name))
        {
            if let Err(close_err) = fd.close() {
                debug!("Closing {} after failed open: {}", name, close_err);
            }
            return Err(e);
        }

        *self.name.lock() = name.clone();
        *self.events.lock() = Some(Arc::new(PosixEventSource::new(
            Arc::clone(&self.handle),
            fd,
        )));
        debug!("Opened {} as fd {}", name, raw);
        Ok(())
    }

    fn initialize_buffers(&self, read_buffer_size: usize, write_buffer_size: usize) -> Result<()> {
        // tty queues have a fixed size in the kernel
        self.handle.get()?;
        debug!(
            "{}: buffer sizes {}/{} kept by the driver",
            self.name.lock(),
            read_buffer_size,
            write_buffer_size
        );
        Ok(())
    }

    fn event_source(&self) -> Option<Arc<dyn CommEventSource>> {
        self.events
            .lock()
            .as_ref()
            .map(|source| Arc::clone(source) as Arc<dyn CommEventSource>)
    }

    fn stop_events(&self) -> Result<bool> {
        if let Some(source) = self.events.lock().take() {
            source.interrupt();
        }
        let Ok(fd) = self.handle.get() else {
            return Ok(false);
        };
        Ok(modem_bits(fd).is_ok())
    }

    fn close(&self) -> Result<()> {
        self.events.lock().take();
        if self.handle.release()? {
            debug!("Closed {}", self.name.lock());
        }
        Ok(())
    }

    fn set_baud_rate(&self, baud_rate: u32) -> Result<()> {
        self.update(|bundle| {
            bundle.set_speed(baud_rate);
            Ok(())
        })
    }

    fn set_parity(&self, parity: Parity, parity_replace: u8) -> Result<()> {
        self.update(|bundle| bundle.set_parity(parity))?;
        self.recorded.lock().parity_replace = parity_replace;
        Ok(())
    }

    fn set_data_bits(&self, data_bits: u8) -> Result<()> {
        self.update(|bundle| bundle.set_data_bits(data_bits))
    }

    fn set_stop_bits(&self, stop_bits: StopBits) -> Result<()> {
        self.update(|bundle| bundle.set_stop_bits(stop_bits))
    }

    fn set_handshake(&self, handshake: Handshake, rts_enable: bool) -> Result<()> {
        self.with_fd(|fd| {
            let next = switch_handshake(fd, self.termios(), handshake, rts_enable)?;
            *self.termios.lock() = next;
            Ok(())
        })
    }

    fn set_dtr_enable(&self, enable: bool) -> Result<()> {
        self.with_fd(|fd| set_modem_line(fd, libc::TIOCM_DTR, enable))
    }

    fn set_rts_enable(&self, enable: bool) -> Result<()> {
        self.with_fd(|fd| set_modem_line(fd, libc::TIOCM_RTS, enable))
    }

    fn set_discard_null(&self, discard: bool) -> Result<()> {
        self.handle.get()?;
        self.recorded.lock().discard_null = discard;
        debug!("{}: discard_null={} recorded only", self.name.lock(), discard);
        Ok(())
    }

    fn set_parity_replace(&self, replace: u8) -> Result<()> {
        self.handle.get()?;
        self.recorded.lock().parity_replace = replace;
        debug!("{}: parity_replace={:#04x} recorded only", self.name.lock(), replace);
        Ok(())
    }

    fn set_read_timeout(&self, timeout: Timeout) -> Result<()> {
        self.handle.get()?;
        self.timeouts.lock().0 = timeout;
        Ok(())
    }

    fn set_write_timeout(&self, timeout: Timeout) -> Result<()> {
        self.handle.get()?;
        self.timeouts.lock().1 = timeout;
        Ok(())
    }

    fn set_break_state(&self, enabled: bool) -> Result<()> {
        let request = if enabled {
            libc::TIOCSBRK
        } else {
            libc::TIOCCBRK
        };
        self.with_fd(|fd| {
            check(unsafe { libc::ioctl(fd.0, request as _) })?;
            Ok(())
        })
    }

    fn bytes_to_read(&self) -> Result<usize> {
        self.with_fd(queued_input)
    }

    fn bytes_to_write(&self) -> Result<usize> {
        self.with_fd(|fd| {
            let mut n: c_int = 0;
            check(unsafe { libc::ioctl(fd.0, libc::TIOCOUTQ as _, &mut n) })?;
            Ok(n.max(0) as usize)
        })
    }

    fn cd_holding(&self) -> Result<bool> {
        self.with_fd(|fd| Ok(modem_bits(fd)? & libc::TIOCM_CAR != 0))
    }

    fn cts_holding(&self) -> Result<bool> {
        self.with_fd(|fd| Ok(modem_bits(fd)? & libc::TIOCM_CTS != 0))
    }

    fn dsr_holding(&self) -> Result<bool> {
        self.with_fd(|fd| Ok(modem_bits(fd)? & libc::TIOCM_DSR != 0))
    }

    fn discard_in_buffer(&self) -> Result<()> {
        self.with_fd(|fd| {
            check(unsafe { libc::tcflush(fd.0, libc::TCIFLUSH) })?;
            Ok(())
        })
    }

    fn discard_out_buffer(&self) -> Result<()> {
        self.with_fd(|fd| {
            check(unsafe { libc::tcflush(fd.0, libc::TCOFLUSH) })?;
            Ok(())
        })
    }

    fn flush(&self) -> Result<()> {
        self.with_fd(|fd| {
            check(unsafe { libc::tcdrain(fd.0) })?;
            Ok(())
        })
    }

    fn submit(&self, op: CompletionHandle, timeout: Timeout) -> Result<()> {
        let n = self.with_fd(|fd| match op.kind() {
            OperationKind::Read => read_timed(fd, &op, timeout),
            OperationKind::Write => write_timed(fd, &op, timeout),
            OperationKind::WaitEvent => Err(SerialError::not_supported(
                "event waits are served by the event source",
            )),
        })?;
        op.complete(n, None);
        Ok(())
    }
}

impl std::fmt::Debug for PosixPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PosixPort")
            .field("name", &*self.name.lock())
            .field("handle", &self.handle)
            .finish()
    }
}

#[derive(Debug, Default)]
struct Snapshot {
    queued: usize,
    modem: c_int,
    counts: Option<SerialIcounter>,
}

/// Line-status source built from periodic `poll(2)` and driver queries.
pub struct PosixEventSource {
    handle: Arc<PortHandle<Fd>>,
    interrupted: AtomicBool,
    last: Mutex<Snapshot>,
    errors: Mutex<ErrorFlags>,
}

impl PosixEventSource {
    const CYCLE: Duration = Duration::from_millis(50);

    fn new(handle: Arc<PortHandle<Fd>>, fd: Fd) -> Self {
        let last = Snapshot {
            queued: queued_input(fd).unwrap_or(0),
            modem: modem_bits(fd).unwrap_or(0),
            counts: interrupt_counts(fd),
        };
        Self {
            handle,
            interrupted: AtomicBool::new(false),
            last: Mutex::new(last),
            errors: Mutex::new(ErrorFlags::default()),
        }
    }

    /// Diff the device state against the previous cycle.
    fn changes(&self, fd: Fd) -> Result<u32> {
        let queued = queued_input(fd)?;
        let modem = modem_bits(fd)?;
        let counts = interrupt_counts(fd);

        let mut last = self.last.lock();
        let mut mask = 0;
        if queued > last.queued {
            mask |= EventMask::RXCHAR;
        }

        let flipped = modem ^ last.modem;
        for (line, bit) in [
            (libc::TIOCM_CTS, EventMask::CTS),
            (libc::TIOCM_DSR, EventMask::DSR),
            (libc::TIOCM_CAR, EventMask::RLSD),
            (libc::TIOCM_RNG, EventMask::RING),
        ] {
            if flipped & line != 0 {
                mask |= bit;
            }
        }

        if let (Some(now), Some(before)) = (counts, last.counts) {
            let mut flags = 0;
            for (after, prior, flag) in [
                (now.frame, before.frame, ErrorFlags::FRAME),
                (now.overrun, before.overrun, ErrorFlags::OVERRUN),
                (now.parity, before.parity, ErrorFlags::RXPARITY),
                (now.buf_overrun, before.buf_overrun, ErrorFlags::RXOVER),
            ] {
                if after != prior {
                    flags |= flag;
                }
            }
            if flags != 0 {
                let mut errors = self.errors.lock();
                *errors = errors.union(ErrorFlags(flags));
                mask |= EventMask::ERR;
            }
            if now.brk != before.brk {
                mask |= EventMask::BREAK;
            }
        }

        *last = Snapshot {
            queued,
            modem,
            counts,
        };
        Ok(mask)
    }
}

impl CommEventSource for PosixEventSource {
    fn wait_event(&self) -> WaitOutcome {
        if self.interrupted.swap(false, Ordering::AcqRel) {
            return WaitOutcome::Interrupted;
        }
        let Ok(fd) = self.handle.get() else {
            return WaitOutcome::DeviceLost;
        };
        let ready = match wait_ready(fd, libc::POLLIN, Some(Instant::now() + Self::CYCLE)) {
            Ok(ready) => ready.is_some(),
            Err(_) => return WaitOutcome::DeviceLost,
        };
        match self.changes(fd) {
            Ok(0) => {
                // Unread input keeps the fd readable; don't spin on it.
                if ready {
                    std::thread::sleep(Self::CYCLE);
                }
                WaitOutcome::Interrupted
            }
            Ok(mask) => WaitOutcome::Events(EventMask(mask)),
            Err(_) => WaitOutcome::DeviceLost,
        }
    }

    fn clear_errors(&self) -> Result<ErrorFlags> {
        self.handle.with(modem_bits)?;
        Ok(std::mem::take(&mut *self.errors.lock()))
    }

    fn bytes_available(&self) -> Result<usize> {
        self.handle.with(queued_input)
    }

    fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_icounter_layout() {
        assert_eq!(std::mem::size_of::<SerialIcounter>(), 20 * 4);
    }

    #[test]
    fn test_remaining_ms() {
        assert_eq!(remaining_ms(None), -1);
        let past = Instant::now() - Duration::from_millis(5);
        assert_eq!(remaining_ms(Some(past)), 0);
    }

    #[test]
    fn test_open_missing_device() {
        let port = PosixPort::new();
        let err = port
            .open(&PortConfiguration::new("/dev/serial-engine-missing"))
            .unwrap_err();
        assert!(matches!(err, SerialError::NotFound(_)));
    }

    #[test]
    fn test_regular_file_is_not_a_serial_port() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let name = file.path().to_string_lossy().into_owned();
        let port = PosixPort::new();
        let err = port.open(&PortConfiguration::new(name)).unwrap_err();
        assert!(matches!(err, SerialError::NotASerialPort(_)));
        assert!(matches!(port.bytes_to_read(), Err(SerialError::NotOpen)));
    }

    /// A pty master: a tty whose driver has no modem-control lines.
    fn open_pty() -> Option<Fd> {
        let path = CString::new("/dev/ptmx").ok()?;
        let raw = unsafe { libc::open(path.as_ptr(), libc::O_RDWR | libc::O_NOCTTY) };
        (raw >= 0).then_some(Fd(raw))
    }

    #[test]
    fn test_failed_rts_change_restores_flow_control() {
        let Some(fd) = open_pty() else {
            println!("Skipping: no pty available");
            return;
        };
        let before = read_termios(fd).unwrap();
        // ptys start with IXON on
        let target = if before.handshake() == Handshake::XOnXOff {
            Handshake::None
        } else {
            Handshake::XOnXOff
        };

        // TIOCMBIS is rejected, so the switch must not stick.
        assert!(switch_handshake(fd, before, target, true).is_err());
        let after = read_termios(fd).unwrap();
        assert_eq!(after.handshake(), before.handshake());
        assert_eq!(after.input, before.input);

        // Handshakes that own RTS need no modem-line call.
        let next = switch_handshake(fd, before, Handshake::RequestToSend, false).unwrap();
        assert_eq!(read_termios(fd).unwrap().handshake(), next.handshake());

        fd.close().unwrap();
    }

    #[test]
    fn test_open_errors_name_the_port() {
        let port = PosixPort::new();
        let err = port.open(&PortConfiguration::new("/dev/ptmx")).unwrap_err();
        match err {
            SerialError::NotASerialPort(name)
            | SerialError::NotFound(name)
            | SerialError::AccessDenied(name)
            | SerialError::SharingViolation(name) => assert_eq!(name, "/dev/ptmx"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(matches!(port.bytes_to_read(), Err(SerialError::NotOpen)));
    }

    #[test]
    fn test_dev_null_is_not_a_tty() {
        // a character device that rejects TCGETS2
        let port = PosixPort::new();
        let err = port.open(&PortConfiguration::new("/dev/null")).unwrap_err();
        assert!(matches!(err, SerialError::NotASerialPort(_)));
    }
}
