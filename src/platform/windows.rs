//! Windows back end over overlapped device I/O.
//!
//! The device is opened with `FILE_FLAG_OVERLAPPED` and bound to the system
//! thread pool, so every read, write and `WaitCommEvent` completes through
//! [`io_completed`]. Each native call gets its own heap [`OverlappedBlock`]
//! shared by the submitting side and the callback through a
//! [`NativeContext`]; whichever side releases last frees it.

use crate::codec::{CommTimeouts, DcbBundle};
use crate::error::{last_os_error, map_win32_error, win32, Result, SerialError};
use crate::events::{CommEventSource, ErrorFlags, EventMask, WaitOutcome};
use crate::io::{CompletionHandle, ContextRef, NativeContext, OperationKind};
use crate::port::{NativeHandle, PlatformPort, PortHandle};
use crate::settings::{Handshake, Parity, PortConfiguration, StopBits, Timeout};
use parking_lot::Mutex;
use std::ffi::OsStr;
use std::os::windows::ffi::OsStrExt;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use winapi::shared::minwindef::{BOOL, DWORD, FALSE, TRUE};
use winapi::um::commapi::{
    ClearCommBreak, ClearCommError, EscapeCommFunction, GetCommModemStatus, GetCommProperties,
    GetCommState, PurgeComm, SetCommBreak, SetCommMask, SetCommState, SetCommTimeouts, SetupComm,
    WaitCommEvent,
};
use winapi::um::errhandlingapi::GetLastError;
use winapi::um::fileapi::{CreateFileW, FlushFileBuffers, GetFileType, ReadFile, WriteFile};
use winapi::um::handleapi::{CloseHandle, INVALID_HANDLE_VALUE};
use winapi::um::ioapiset::GetOverlappedResult;
use winapi::um::minwinbase::{LPOVERLAPPED, OVERLAPPED};
use winapi::um::synchapi::{CreateEventW, WaitForSingleObject};
use winapi::um::winbase::{BindIoCompletionCallback, COMMPROP, COMMTIMEOUTS, COMSTAT, DCB};
use winapi::um::winnt::HANDLE;

const GENERIC_READ: DWORD = 0x8000_0000;
const GENERIC_WRITE: DWORD = 0x4000_0000;
const OPEN_EXISTING: DWORD = 3;
const FILE_FLAG_OVERLAPPED: DWORD = 0x4000_0000;
const FILE_TYPE_UNKNOWN: DWORD = 0;
const FILE_TYPE_CHAR: DWORD = 2;
const INFINITE: DWORD = 0xFFFF_FFFF;

const SETRTS: DWORD = 3;
const CLRRTS: DWORD = 4;
const SETDTR: DWORD = 5;
const CLRDTR: DWORD = 6;

const PURGE_TXABORT: DWORD = 0x0001;
const PURGE_RXABORT: DWORD = 0x0002;
const PURGE_TXCLEAR: DWORD = 0x0004;
const PURGE_RXCLEAR: DWORD = 0x0008;

const MS_CTS_ON: DWORD = 0x0010;
const MS_DSR_ON: DWORD = 0x0020;
const MS_RLSD_ON: DWORD = 0x0080;

/// A device handle from `CreateFileW`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Win32Handle(usize);

impl Win32Handle {
    fn raw(self) -> HANDLE {
        self.0 as HANDLE
    }
}

impl NativeHandle for Win32Handle {
    fn close(self) -> Result<()> {
        if unsafe { CloseHandle(self.raw()) } == 0 {
            return Err(last_os_error(None));
        }
        Ok(())
    }
}

/// Map the last error of a call on an open handle. Removal of the device
/// surfaces as access denied or bad command once the handle exists.
fn op_error() -> SerialError {
    let code = unsafe { GetLastError() };
    match code {
        win32::ERROR_ACCESS_DENIED | win32::ERROR_BAD_COMMAND => SerialError::DeviceRemoved,
        code => map_win32_error(code, None),
    }
}

fn check(ok: BOOL) -> Result<()> {
    if ok == 0 {
        Err(op_error())
    } else {
        Ok(())
    }
}

/// Per-call overlapped state. `overlapped` must stay the first field: the
/// completion callback receives a pointer to it and casts back.
#[repr(C)]
struct OverlappedBlock {
    overlapped: OVERLAPPED,
    completion: Mutex<Option<CompletionHandle>>,
    callback_ref: Mutex<Option<ContextRef>>,
    event_mask: DWORD,
}

struct BlockPtr(*mut OverlappedBlock);

// The block is only freed once, by the last context release.
unsafe impl Send for BlockPtr {}

impl BlockPtr {
    unsafe fn free(self) {
        drop(Box::from_raw(self.0));
    }
}

/// Allocate a block. The callback's claim is parked inside the block; the
/// waiter's claim is returned.
fn allocate_block(
    completion: Option<CompletionHandle>,
    event: HANDLE,
) -> (*mut OverlappedBlock, ContextRef) {
    let mut overlapped: OVERLAPPED = unsafe { std::mem::zeroed() };
    overlapped.hEvent = event;
    let block = Box::into_raw(Box::new(OverlappedBlock {
        overlapped,
        completion: Mutex::new(completion),
        callback_ref: Mutex::new(None),
        event_mask: 0,
    }));
    let owned = BlockPtr(block);
    let (waiter, callback) = NativeContext::allocate(move || unsafe { owned.free() });
    unsafe {
        *(*block).callback_ref.lock() = Some(callback);
    }
    (block, waiter)
}

/// Drop the callback's claim for a call that never queued a completion.
unsafe fn abandon_callback(block: *mut OverlappedBlock) {
    (*block).completion.lock().take();
    let callback = (*block).callback_ref.lock().take();
    drop(callback);
}

/// Thread-pool completion routine for every overlapped call on the port.
unsafe extern "system" fn io_completed(error: DWORD, bytes: DWORD, overlapped: LPOVERLAPPED) {
    if overlapped.is_null() {
        return;
    }
    let block = overlapped as *mut OverlappedBlock;
    let completion = (*block).completion.lock().take();
    if let Some(op) = completion {
        let error = (error != 0).then(|| map_win32_error(error, None));
        op.complete(bytes as usize, error);
    }
    let callback = (*block).callback_ref.lock().take();
    // may free the block
    if let Some(callback) = callback {
        callback.release();
    }
}

fn read_dcb(handle: Win32Handle) -> Result<DcbBundle> {
    let mut dcb: DCB = unsafe { std::mem::zeroed() };
    dcb.DCBlength = std::mem::size_of::<DCB>() as DWORD;
    check(unsafe { GetCommState(handle.raw(), &mut dcb) })?;
    Ok(DcbBundle {
        baud_rate: dcb.BaudRate,
        flags: dcb.BitFields,
        xon_limit: dcb.XonLim,
        xoff_limit: dcb.XoffLim,
        byte_size: dcb.ByteSize,
        parity: dcb.Parity,
        stop_bits: dcb.StopBits,
        xon_char: dcb.XonChar as u8,
        xoff_char: dcb.XoffChar as u8,
        error_char: dcb.ErrorChar as u8,
        eof_char: dcb.EofChar as u8,
        event_char: dcb.EvtChar as u8,
    })
}

fn write_dcb(handle: Win32Handle, bundle: &DcbBundle) -> Result<()> {
    let mut dcb: DCB = unsafe { std::mem::zeroed() };
    dcb.DCBlength = std::mem::size_of::<DCB>() as DWORD;
    dcb.BaudRate = bundle.baud_rate;
    dcb.BitFields = bundle.flags;
    dcb.XonLim = bundle.xon_limit;
    dcb.XoffLim = bundle.xoff_limit;
    dcb.ByteSize = bundle.byte_size;
    dcb.Parity = bundle.parity;
    dcb.StopBits = bundle.stop_bits;
    dcb.XonChar = bundle.xon_char as _;
    dcb.XoffChar = bundle.xoff_char as _;
    dcb.ErrorChar = bundle.error_char as _;
    dcb.EofChar = bundle.eof_char as _;
    dcb.EvtChar = bundle.event_char as _;
    check(unsafe { SetCommState(handle.raw(), &mut dcb) })
}

fn write_timeouts(handle: Win32Handle, timeouts: &CommTimeouts) -> Result<()> {
    let mut native = COMMTIMEOUTS {
        ReadIntervalTimeout: timeouts.read_interval,
        ReadTotalTimeoutMultiplier: timeouts.read_total_multiplier,
        ReadTotalTimeoutConstant: timeouts.read_total_constant,
        WriteTotalTimeoutMultiplier: timeouts.write_total_multiplier,
        WriteTotalTimeoutConstant: timeouts.write_total_constant,
    };
    check(unsafe { SetCommTimeouts(handle.raw(), &mut native) })
}

fn comm_status(handle: Win32Handle) -> Result<(DWORD, COMSTAT)> {
    let mut errors: DWORD = 0;
    let mut stat: COMSTAT = unsafe { std::mem::zeroed() };
    check(unsafe { ClearCommError(handle.raw(), &mut errors, &mut stat) })?;
    Ok((errors, stat))
}

fn modem_status(handle: Win32Handle) -> Result<DWORD> {
    let mut status: DWORD = 0;
    check(unsafe { GetCommModemStatus(handle.raw(), &mut status) })?;
    Ok(status)
}

fn escape(handle: Win32Handle, function: DWORD) -> Result<()> {
    check(unsafe { EscapeCommFunction(handle.raw(), function) })
}

/// `COM` followed by a number.
fn validate_com_name(name: &str) -> Result<()> {
    let valid = match (name.get(..3), name.get(3..)) {
        (Some(prefix), Some(number)) => {
            prefix.eq_ignore_ascii_case("COM") && number.parse::<u32>().is_ok()
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(SerialError::out_of_range(
            "PortName",
            format!("'{name}' is not a valid COM port name"),
        ))
    }
}

/// The Windows [`PlatformPort`].
pub struct WindowsPort {
    name: Mutex<String>,
    handle: Arc<PortHandle<Win32Handle>>,
    dcb: Mutex<DcbBundle>,
    timeouts: Mutex<CommTimeouts>,
    events: Mutex<Option<Arc<WindowsEventSource>>>,
}

impl Default for WindowsPort {
    fn default() -> Self {
        Self {
            name: Mutex::new(String::new()),
            handle: Arc::new(PortHandle::new()),
            dcb: Mutex::new(DcbBundle::default()),
            timeouts: Mutex::new(CommTimeouts::default()),
            events: Mutex::new(None),
        }
    }
}

impl WindowsPort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `f` to a copy of the cached DCB, push it, then commit it.
    fn update_dcb(&self, f: impl FnOnce(&mut DcbBundle)) -> Result<()> {
        self.handle.with(|h| {
            let mut next = *self.dcb.lock();
            f(&mut next);
            write_dcb(h, &next)?;
            *self.dcb.lock() = next;
            Ok(())
        })
    }

    fn update_timeouts(&self, f: impl FnOnce(&mut CommTimeouts)) -> Result<()> {
        self.handle.with(|h| {
            let mut next = *self.timeouts.lock();
            f(&mut next);
            write_timeouts(h, &next)?;
            *self.timeouts.lock() = next;
            Ok(())
        })
    }

    fn configure(&self, h: Win32Handle, config: &PortConfiguration) -> Result<()> {
        let name = config.port_name.as_str();

        let file_type = unsafe { GetFileType(h.raw()) };
        if file_type != FILE_TYPE_CHAR && file_type != FILE_TYPE_UNKNOWN {
            return Err(SerialError::NotASerialPort(name.to_string()));
        }

        let mut props: COMMPROP = unsafe { std::mem::zeroed() };
        let mut modem: DWORD = 0;
        let ok = unsafe {
            GetCommProperties(h.raw(), &mut props) != 0
                && GetCommModemStatus(h.raw(), &mut modem) != 0
        };
        if !ok {
            let code = unsafe { GetLastError() };
            return Err(match code {
                win32::ERROR_INVALID_PARAMETER | win32::ERROR_INVALID_HANDLE => {
                    SerialError::NotASerialPort(name.to_string())
                }
                code => map_win32_error(code, Some(name)),
            });
        }
        if props.dwMaxBaud != 0 && config.baud_rate > props.dwMaxBaud {
            return Err(SerialError::out_of_range(
                "BaudRate",
                format!("must not exceed the device maximum of {}", props.dwMaxBaud),
            ));
        }

        let mut dcb = read_dcb(h)?;
        dcb.initialize(config, props.dwCurrentRxQueue)?;
        dcb.set_dtr_enable(config.dtr_enable);
        dcb.set_handshake(config.handshake, config.rts_enable);
        write_dcb(h, &dcb)?;
        *self.dcb.lock() = dcb;

        escape(h, if config.dtr_enable { SETDTR } else { CLRDTR })?;
        if !config.handshake.uses_rts() {
            escape(h, if config.rts_enable { SETRTS } else { CLRRTS })?;
        }

        let timeouts = CommTimeouts::from_timeouts(config.read_timeout, config.write_timeout);
        write_timeouts(h, &timeouts)?;
        *self.timeouts.lock() = timeouts;

        check(unsafe { SetCommMask(h.raw(), EventMask::MONITORED) })?;
        check(unsafe { BindIoCompletionCallback(h.raw(), Some(io_completed), 0) })?;
        Ok(())
    }

    /// Start an overlapped read or write for `op`.
    fn start_transfer(&self, h: Win32Handle, op: CompletionHandle) -> Result<()> {
        let (buffer, len) = op.buffer_ptr();
        let len = DWORD::try_from(len).unwrap_or(DWORD::MAX);
        let (block, waiter) = allocate_block(Some(op.clone()), ptr::null_mut());
        op.attach_waiter_context(waiter);

        let overlapped = block as LPOVERLAPPED;
        let ok = unsafe {
            match op.kind() {
                OperationKind::Write => {
                    WriteFile(h.raw(), buffer as _, len, ptr::null_mut(), overlapped)
                }
                _ => ReadFile(h.raw(), buffer as _, len, ptr::null_mut(), overlapped),
            }
        };

        if ok != 0 {
            // Finished inline; the callback is still queued and will lose the race.
            let mut transferred: DWORD = 0;
            if unsafe { GetOverlappedResult(h.raw(), overlapped, &mut transferred, FALSE) } != 0 {
                op.complete(transferred as usize, None);
            }
            return Ok(());
        }

        let code = unsafe { GetLastError() };
        if code == win32::ERROR_IO_PENDING {
            return Ok(());
        }
        unsafe { abandon_callback(block) };
        Err(match code {
            win32::ERROR_ACCESS_DENIED | win32::ERROR_BAD_COMMAND => SerialError::DeviceRemoved,
            code => map_win32_error(code, None),
        })
    }
}

impl PlatformPort for WindowsPort {
    fn open(&self, config: &PortConfiguration) -> Result<()> {
        let name = config.port_name.as_str();
        validate_com_name(name)?;

        let path: Vec<u16> = OsStr::new(&format!("\\\\?\\{name}"))
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();
        let raw = unsafe {
            CreateFileW(
                path.as_ptr(),
                GENERIC_READ | GENERIC_WRITE,
                0,
                ptr::null_mut(),
                OPEN_EXISTING,
                FILE_FLAG_OVERLAPPED,
                ptr::null_mut(),
            )
        };
        if raw == INVALID_HANDLE_VALUE {
            return Err(last_os_error(Some(name)));
        }
        let h = Win32Handle(raw as usize);

        if let Err(e) = self
            .configure(h, config)
            .and_then(|()| self.handle.attach(h))
        {
            if let Err(close_err) = h.close() {
                debug!("Closing {} after failed open: {}", name, close_err);
            }
            return Err(e);
        }

        let source = WindowsEventSource::new(Arc::clone(&self.handle))?;
        *self.events.lock() = Some(Arc::new(source));
        *self.name.lock() = name.to_string();
        debug!("Opened {}", name);
        Ok(())
    }

    fn initialize_buffers(&self, read_buffer_size: usize, write_buffer_size: usize) -> Result<()> {
        let read = DWORD::try_from(read_buffer_size).unwrap_or(DWORD::MAX);
        let write = DWORD::try_from(write_buffer_size).unwrap_or(DWORD::MAX);
        self.handle
            .with(|h| check(unsafe { SetupComm(h.raw(), read, write) }))
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
        let Ok(h) = self.handle.get() else {
            return Ok(false);
        };
        // Clearing the mask also completes a pending WaitCommEvent.
        Ok(unsafe { SetCommMask(h.raw(), 0) } != 0)
    }

    fn close(&self) -> Result<()> {
        self.events.lock().take();
        if self.handle.release()? {
            debug!("Closed {}", self.name.lock());
        }
        Ok(())
    }

    fn set_baud_rate(&self, baud_rate: u32) -> Result<()> {
        self.update_dcb(|dcb| dcb.baud_rate = baud_rate)
    }

    fn set_parity(&self, parity: Parity, parity_replace: u8) -> Result<()> {
        self.update_dcb(|dcb| dcb.set_parity(parity, parity_replace))
    }

    fn set_data_bits(&self, data_bits: u8) -> Result<()> {
        self.update_dcb(|dcb| dcb.byte_size = data_bits)
    }

    fn set_stop_bits(&self, stop_bits: StopBits) -> Result<()> {
        self.update_dcb(|dcb| dcb.set_stop_bits(stop_bits))
    }

    fn set_handshake(&self, handshake: Handshake, rts_enable: bool) -> Result<()> {
        self.update_dcb(|dcb| dcb.set_handshake(handshake, rts_enable))
    }

    fn set_dtr_enable(&self, enable: bool) -> Result<()> {
        self.update_dcb(|dcb| dcb.set_dtr_enable(enable))?;
        self.handle
            .with(|h| escape(h, if enable { SETDTR } else { CLRDTR }))
    }

    fn set_rts_enable(&self, enable: bool) -> Result<()> {
        self.update_dcb(|dcb| dcb.set_rts_enable(enable))?;
        self.handle
            .with(|h| escape(h, if enable { SETRTS } else { CLRRTS }))
    }

    fn set_discard_null(&self, discard: bool) -> Result<()> {
        self.update_dcb(|dcb| dcb.set_discard_null(discard))
    }

    fn set_parity_replace(&self, replace: u8) -> Result<()> {
        self.update_dcb(|dcb| dcb.apply_parity_replace(replace))
    }

    fn set_read_timeout(&self, timeout: Timeout) -> Result<()> {
        self.update_timeouts(|t| t.set_read(timeout))
    }

    fn set_write_timeout(&self, timeout: Timeout) -> Result<()> {
        self.update_timeouts(|t| t.set_write(timeout))
    }

    fn set_break_state(&self, enabled: bool) -> Result<()> {
        self.handle.with(|h| {
            check(unsafe {
                if enabled {
                    SetCommBreak(h.raw())
                } else {
                    ClearCommBreak(h.raw())
                }
            })
        })
    }

    fn bytes_to_read(&self) -> Result<usize> {
        self.handle
            .with(|h| comm_status(h).map(|(_, stat)| stat.cbInQue as usize))
    }

    fn bytes_to_write(&self) -> Result<usize> {
        self.handle
            .with(|h| comm_status(h).map(|(_, stat)| stat.cbOutQue as usize))
    }

    fn cd_holding(&self) -> Result<bool> {
        self.handle
            .with(|h| Ok(modem_status(h)? & MS_RLSD_ON != 0))
    }

    fn cts_holding(&self) -> Result<bool> {
        self.handle
            .with(|h| Ok(modem_status(h)? & MS_CTS_ON != 0))
    }

    fn dsr_holding(&self) -> Result<bool> {
        self.handle
            .with(|h| Ok(modem_status(h)? & MS_DSR_ON != 0))
    }

    fn discard_in_buffer(&self) -> Result<()> {
        self.handle.with(|h| {
            check(unsafe { PurgeComm(h.raw(), PURGE_RXCLEAR | PURGE_RXABORT) })
        })
    }

    fn discard_out_buffer(&self) -> Result<()> {
        self.handle.with(|h| {
            check(unsafe { PurgeComm(h.raw(), PURGE_TXCLEAR | PURGE_TXABORT) })
        })
    }

    fn flush(&self) -> Result<()> {
        self.handle
            .with(|h| check(unsafe { FlushFileBuffers(h.raw()) }))
    }

    fn submit(&self, op: CompletionHandle, _timeout: Timeout) -> Result<()> {
        if op.kind() == OperationKind::WaitEvent {
            return Err(SerialError::not_supported(
                "event waits are served by the event source",
            ));
        }
        self.handle.with(|h| self.start_transfer(h, op))
    }
}

impl std::fmt::Debug for WindowsPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowsPort")
            .field("name", &*self.name.lock())
            .field("handle", &self.handle)
            .finish()
    }
}

/// `WaitCommEvent`-driven line-status source.
pub struct WindowsEventSource {
    handle: Arc<PortHandle<Win32Handle>>,
    /// Manual-reset event signalled when a wait completes.
    event: usize,
    stopping: AtomicBool,
}

impl WindowsEventSource {
    fn new(handle: Arc<PortHandle<Win32Handle>>) -> Result<Self> {
        let event = unsafe { CreateEventW(ptr::null_mut(), TRUE, FALSE, ptr::null()) };
        if event.is_null() {
            return Err(last_os_error(None));
        }
        Ok(Self {
            handle,
            event: event as usize,
            stopping: AtomicBool::new(false),
        })
    }

    fn is_loss(code: DWORD) -> bool {
        matches!(
            code,
            win32::ERROR_ACCESS_DENIED | win32::ERROR_BAD_COMMAND | win32::ERROR_DEVICE_REMOVED
        )
    }
}

impl CommEventSource for WindowsEventSource {
    fn wait_event(&self) -> WaitOutcome {
        if self.stopping.load(Ordering::Acquire) {
            return WaitOutcome::Interrupted;
        }
        let Ok(h) = self.handle.get() else {
            return WaitOutcome::DeviceLost;
        };

        let (block, waiter) = allocate_block(None, self.event as HANDLE);
        let overlapped = block as LPOVERLAPPED;
        let ok = unsafe { WaitCommEvent(h.raw(), ptr::addr_of_mut!((*block).event_mask), overlapped) };

        if ok == 0 {
            let code = unsafe { GetLastError() };
            if code != win32::ERROR_IO_PENDING {
                unsafe { abandon_callback(block) };
                waiter.release();
                return if Self::is_loss(code) {
                    WaitOutcome::DeviceLost
                } else {
                    debug!("WaitCommEvent failed with {}", code);
                    WaitOutcome::Interrupted
                };
            }
            unsafe { WaitForSingleObject(self.event as HANDLE, INFINITE) };
            let mut unused: DWORD = 0;
            loop {
                if unsafe { GetOverlappedResult(h.raw(), overlapped, &mut unused, FALSE) } != 0 {
                    break;
                }
                let code = unsafe { GetLastError() };
                if code == win32::ERROR_IO_INCOMPLETE {
                    std::thread::yield_now();
                    continue;
                }
                waiter.release();
                return if Self::is_loss(code) {
                    WaitOutcome::DeviceLost
                } else {
                    WaitOutcome::Interrupted
                };
            }
        }

        let mask = unsafe { (*block).event_mask };
        waiter.release();
        if mask == 0 {
            WaitOutcome::Interrupted
        } else {
            WaitOutcome::Events(EventMask(mask))
        }
    }

    fn clear_errors(&self) -> Result<ErrorFlags> {
        self.handle
            .with(|h| comm_status(h).map(|(errors, _)| ErrorFlags(errors)))
    }

    fn bytes_available(&self) -> Result<usize> {
        self.handle
            .with(|h| comm_status(h).map(|(_, stat)| stat.cbInQue as usize))
    }

    fn interrupt(&self) {
        self.stopping.store(true, Ordering::Release);
        if let Ok(h) = self.handle.get() {
            if unsafe { SetCommMask(h.raw(), 0) } == 0 {
                warn!("Could not clear the event mask to stop the event loop");
            }
        }
    }
}

impl Drop for WindowsEventSource {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.event as HANDLE) };
    }
}
