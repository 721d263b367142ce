//! POSIX `termios` control-word codec.
//!
//! [`TermiosBundle`] mirrors the Linux `termios2` layout: four flag groups, the
//! line discipline, the control-character array and the explicit input/output
//! speeds used with `BOTHER`. Every accessor is a pure read-modify-write over
//! a caller-supplied bundle. Pushing the bundle to the device is the job of
//! the platform layer.
//!
//! Settings with no termios representation (mark/space parity, nine data bits,
//! one-and-a-half stop bits) fail with [`SerialError::NotSupported`].

use crate::error::{Result, SerialError};
use crate::settings::{Handshake, Parity, PortConfiguration, StopBits};

/// Size of the control-character array.
pub const NCCS: usize = 19;

/// Linux flag values.
pub mod flags {
    // input modes
    pub const IGNBRK: u32 = 0x0001;
    pub const BRKINT: u32 = 0x0002;
    pub const IGNPAR: u32 = 0x0004;
    pub const PARMRK: u32 = 0x0008;
    pub const INPCK: u32 = 0x0010;
    pub const ISTRIP: u32 = 0x0020;
    pub const INLCR: u32 = 0x0040;
    pub const IGNCR: u32 = 0x0080;
    pub const ICRNL: u32 = 0x0100;
    pub const IXON: u32 = 0x0400;
    pub const IXANY: u32 = 0x0800;
    pub const IXOFF: u32 = 0x1000;

    // output modes
    pub const OPOST: u32 = 0x0001;
    pub const ONLCR: u32 = 0x0004;
    pub const OCRNL: u32 = 0x0008;
    pub const ONOCR: u32 = 0x0010;
    pub const ONLRET: u32 = 0x0020;
    pub const OFILL: u32 = 0x0040;

    // control modes
    pub const CBAUD: u32 = 0x0000_100f;
    pub const CSIZE: u32 = 0x0030;
    pub const CS5: u32 = 0x0000;
    pub const CS6: u32 = 0x0010;
    pub const CS7: u32 = 0x0020;
    pub const CS8: u32 = 0x0030;
    pub const CSTOPB: u32 = 0x0040;
    pub const CREAD: u32 = 0x0080;
    pub const PARENB: u32 = 0x0100;
    pub const PARODD: u32 = 0x0200;
    pub const HUPCL: u32 = 0x0400;
    pub const CLOCAL: u32 = 0x0800;
    pub const CBAUDEX: u32 = 0x0000_1000;
    pub const BOTHER: u32 = 0x0000_1000;
    pub const CMSPAR: u32 = 0x4000_0000;
    pub const CRTSCTS: u32 = 0x8000_0000;

    // local modes
    pub const ISIG: u32 = 0x0001;
    pub const ICANON: u32 = 0x0002;
    pub const ECHO: u32 = 0x0008;
    pub const ECHOE: u32 = 0x0010;
    pub const ECHOK: u32 = 0x0020;
    pub const ECHONL: u32 = 0x0040;
    pub const IEXTEN: u32 = 0x8000;

    // control-character indices
    pub const VINTR: usize = 0;
    pub const VQUIT: usize = 1;
    pub const VERASE: usize = 2;
    pub const VKILL: usize = 3;
    pub const VEOF: usize = 4;
    pub const VTIME: usize = 5;
    pub const VMIN: usize = 6;
    pub const VSTART: usize = 8;
    pub const VSTOP: usize = 9;
}

use flags::*;

/// Standard `Bnnn` speed codes.
const STANDARD_SPEEDS: &[(u32, u32)] = &[
    (0, 0x0000),
    (50, 0x0001),
    (75, 0x0002),
    (110, 0x0003),
    (134, 0x0004),
    (150, 0x0005),
    (200, 0x0006),
    (300, 0x0007),
    (600, 0x0008),
    (1200, 0x0009),
    (1800, 0x000a),
    (2400, 0x000b),
    (4800, 0x000c),
    (9600, 0x000d),
    (19200, 0x000e),
    (38400, 0x000f),
    (57600, 0x1001),
    (115200, 0x1002),
    (230400, 0x1003),
    (460800, 0x1004),
    (500000, 0x1005),
    (576000, 0x1006),
    (921600, 0x1007),
    (1000000, 0x1008),
    (1152000, 0x1009),
    (1500000, 0x100a),
    (2000000, 0x100b),
    (2500000, 0x100c),
    (3000000, 0x100d),
    (3500000, 0x100e),
    (4000000, 0x100f),
];

/// The speed code for `baud`, if it is one of the standard rates.
pub fn standard_speed(baud: u32) -> Option<u32> {
    STANDARD_SPEEDS
        .iter()
        .find(|(rate, _)| *rate == baud)
        .map(|(_, code)| *code)
}

fn rate_for_code(code: u32) -> Option<u32> {
    STANDARD_SPEEDS
        .iter()
        .find(|(_, c)| *c == code)
        .map(|(rate, _)| *rate)
}

/// One of the four flag words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagGroup {
    Input,
    Output,
    Control,
    Local,
}

/// Snapshot of the terminal control words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TermiosBundle {
    pub input: u32,
    pub output: u32,
    pub control: u32,
    pub local: u32,
    pub line: u8,
    pub cc: [u8; NCCS],
    pub ispeed: u32,
    pub ospeed: u32,
}

impl TermiosBundle {
    fn group(&self, group: FlagGroup) -> u32 {
        match group {
            FlagGroup::Input => self.input,
            FlagGroup::Output => self.output,
            FlagGroup::Control => self.control,
            FlagGroup::Local => self.local,
        }
    }

    fn group_mut(&mut self, group: FlagGroup) -> &mut u32 {
        match group {
            FlagGroup::Input => &mut self.input,
            FlagGroup::Output => &mut self.output,
            FlagGroup::Control => &mut self.control,
            FlagGroup::Local => &mut self.local,
        }
    }

    /// True when every bit of `mask` is set in `group`.
    pub fn flag(&self, group: FlagGroup, mask: u32) -> bool {
        self.group(group) & mask == mask
    }

    pub fn set_flag(&mut self, group: FlagGroup, mask: u32, on: bool) {
        let word = self.group_mut(group);
        if on {
            *word |= mask;
        } else {
            *word &= !mask;
        }
    }

    pub fn parity(&self) -> Result<Parity> {
        if self.control & PARENB == 0 {
            return Ok(Parity::None);
        }
        if self.control & CMSPAR != 0 {
            return Err(SerialError::not_supported(
                "mark/space parity has no termios representation",
            ));
        }
        if self.control & PARODD != 0 {
            Ok(Parity::Odd)
        } else {
            Ok(Parity::Even)
        }
    }

    pub fn set_parity(&mut self, parity: Parity) -> Result<()> {
        let (enable, odd) = match parity {
            Parity::None => (false, false),
            Parity::Even => (true, false),
            Parity::Odd => (true, true),
            Parity::Mark | Parity::Space => {
                return Err(SerialError::not_supported(format!(
                    "{parity:?} parity is not supported by termios"
                )))
            }
        };
        self.input &= !(IGNPAR | PARMRK);
        self.set_flag(FlagGroup::Control, PARENB, enable);
        self.set_flag(FlagGroup::Control, PARODD, odd);
        self.control &= !CMSPAR;
        self.set_flag(FlagGroup::Input, INPCK, enable);
        Ok(())
    }

    pub fn data_bits(&self) -> u8 {
        match self.control & CSIZE {
            CS5 => 5,
            CS6 => 6,
            CS7 => 7,
            _ => 8,
        }
    }

    pub fn set_data_bits(&mut self, bits: u8) -> Result<()> {
        let size = match bits {
            5 => CS5,
            6 => CS6,
            7 => CS7,
            8 => CS8,
            bits => {
                return Err(SerialError::not_supported(format!(
                    "{bits} data bits cannot be expressed with CSIZE"
                )))
            }
        };
        self.control = (self.control & !CSIZE) | size;
        Ok(())
    }

    pub fn stop_bits(&self) -> StopBits {
        if self.control & CSTOPB != 0 {
            StopBits::Two
        } else {
            StopBits::One
        }
    }

    pub fn set_stop_bits(&mut self, stop_bits: StopBits) -> Result<()> {
        match stop_bits {
            StopBits::One => self.control &= !CSTOPB,
            StopBits::Two => self.control |= CSTOPB,
            StopBits::OnePointFive => {
                return Err(SerialError::not_supported(
                    "1.5 stop bits are not supported by termios",
                ))
            }
        }
        Ok(())
    }

    pub fn handshake(&self) -> Handshake {
        let hardware = self.control & CRTSCTS != 0;
        let software = self.input & IXON != 0;
        match (hardware, software) {
            (true, true) => Handshake::RequestToSendXOnXOff,
            (true, false) => Handshake::RequestToSend,
            (false, true) => Handshake::XOnXOff,
            (false, false) => Handshake::None,
        }
    }

    pub fn set_handshake(&mut self, handshake: Handshake) {
        self.control &= !CRTSCTS;
        self.input &= !(IXON | IXOFF | IXANY);
        if handshake.uses_rts() {
            self.control |= CRTSCTS;
        }
        if handshake.uses_xon_xoff() {
            self.input |= IXON | IXOFF | IXANY;
        }
    }

    /// Minimum byte count for a non-canonical read (raw `VMIN`).
    pub fn vmin(&self) -> u8 {
        self.cc[VMIN]
    }

    pub fn set_vmin(&mut self, value: u8) {
        self.cc[VMIN] = value;
    }

    /// Inter-byte timer in deciseconds (raw `VTIME`).
    pub fn vtime(&self) -> u8 {
        self.cc[VTIME]
    }

    pub fn set_vtime(&mut self, value: u8) {
        self.cc[VTIME] = value;
    }

    pub fn canonical_mode(&self) -> bool {
        self.flag(FlagGroup::Local, ICANON)
    }

    pub fn set_canonical_mode(&mut self, on: bool) {
        self.set_flag(FlagGroup::Local, ICANON, on);
    }

    pub fn echo(&self) -> bool {
        self.flag(FlagGroup::Local, ECHO)
    }

    /// Toggles `ECHO` together with its `ECHOE`/`ECHONL` companions.
    pub fn set_echo(&mut self, on: bool) {
        self.set_flag(FlagGroup::Local, ECHO, on);
        if !on {
            self.local &= !(ECHOE | ECHONL);
        }
    }

    pub fn signal_chars(&self) -> bool {
        self.flag(FlagGroup::Local, ISIG)
    }

    pub fn set_signal_chars(&mut self, on: bool) {
        self.set_flag(FlagGroup::Local, ISIG, on);
    }

    pub fn output_processing(&self) -> bool {
        self.flag(FlagGroup::Output, OPOST)
    }

    pub fn set_output_processing(&mut self, on: bool) {
        self.set_flag(FlagGroup::Output, OPOST, on);
    }

    pub fn receiver_enabled(&self) -> bool {
        self.flag(FlagGroup::Control, CREAD)
    }

    pub fn set_receiver_enabled(&mut self, on: bool) {
        self.set_flag(FlagGroup::Control, CREAD, on);
    }

    /// `CLOCAL`: ignore modem control lines.
    pub fn local_mode(&self) -> bool {
        self.flag(FlagGroup::Control, CLOCAL)
    }

    pub fn set_local_mode(&mut self, on: bool) {
        self.set_flag(FlagGroup::Control, CLOCAL, on);
    }

    pub fn hangup_on_close(&self) -> bool {
        self.flag(FlagGroup::Control, HUPCL)
    }

    pub fn set_hangup_on_close(&mut self, on: bool) {
        self.set_flag(FlagGroup::Control, HUPCL, on);
    }

    /// Same effect as `cfmakeraw(3)`.
    pub fn make_raw(&mut self) {
        self.input &= !(IGNBRK | BRKINT | PARMRK | ISTRIP | INLCR | IGNCR | ICRNL | IXON);
        self.output &= !OPOST;
        self.local &= !(ECHO | ECHONL | ICANON | ISIG | IEXTEN);
        self.control &= !(CSIZE | PARENB);
        self.control |= CS8;
        self.cc[VMIN] = 1;
        self.cc[VTIME] = 0;
    }

    /// Line speed in bits per second.
    pub fn speed(&self) -> Result<u32> {
        let code = self.control & CBAUD;
        if code == BOTHER {
            return Ok(self.ospeed);
        }
        rate_for_code(code)
            .ok_or_else(|| SerialError::not_supported(format!("unknown speed code {code:#x}")))
    }

    /// Select a standard speed code when one exists, `BOTHER` otherwise.
    pub fn set_speed(&mut self, baud: u32) {
        let code = standard_speed(baud).unwrap_or(BOTHER);
        self.control = (self.control & !CBAUD) | code;
        self.ispeed = baud;
        self.ospeed = baud;
    }

    /// Raw mode with the receiver on, modem status lines ignored, and the
    /// character format and speed taken from `config`.
    pub fn configure(&mut self, config: &PortConfiguration) -> Result<()> {
        let mut next = *self;
        next.make_raw();
        next.set_receiver_enabled(true);
        next.set_local_mode(true);
        // Drop leftover IXOFF/IXANY/INPCK so encode starts from whole groups.
        next.set_handshake(Handshake::None);
        next.set_parity(Parity::None)?;
        let settings = LineSettings {
            parity: config.parity,
            data_bits: config.data_bits,
            stop_bits: config.stop_bits,
            handshake: config.handshake,
            ..LineSettings::default()
        };
        encode(&settings, &mut next)?;
        next.set_speed(config.baud_rate);
        *self = next;
        Ok(())
    }
}

/// Typed view of the line settings carried by a [`TermiosBundle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineSettings {
    pub parity: Parity,
    pub data_bits: u8,
    pub stop_bits: StopBits,
    pub handshake: Handshake,
    pub canonical: bool,
    pub echo: bool,
    pub signals: bool,
    pub output_processing: bool,
    pub vmin: u8,
    pub vtime: u8,
}

impl Default for LineSettings {
    /// 8-N-1 raw mode with non-blocking reads.
    fn default() -> Self {
        Self {
            parity: Parity::None,
            data_bits: 8,
            stop_bits: StopBits::One,
            handshake: Handshake::None,
            canonical: false,
            echo: false,
            signals: false,
            output_processing: false,
            vmin: 0,
            vtime: 0,
        }
    }
}

/// Write `settings` into `bundle`, leaving unrelated bits untouched.
///
/// Parity, handshake and echo are rewritten only when the bundle does not
/// already decode to the requested value, so companion bits such as `INPCK`
/// or `IXOFF` survive and `encode(&decode(b)?, b)` leaves `b` as it was.
/// The bundle is left unchanged when any setting is unsupported.
pub fn encode(settings: &LineSettings, bundle: &mut TermiosBundle) -> Result<()> {
    let mut next = *bundle;
    if next.parity().ok() != Some(settings.parity) {
        next.set_parity(settings.parity)?;
    }
    next.set_data_bits(settings.data_bits)?;
    next.set_stop_bits(settings.stop_bits)?;
    if next.handshake() != settings.handshake {
        next.set_handshake(settings.handshake);
    }
    next.set_canonical_mode(settings.canonical);
    if next.echo() != settings.echo {
        next.set_echo(settings.echo);
    }
    next.set_signal_chars(settings.signals);
    next.set_output_processing(settings.output_processing);
    next.set_vmin(settings.vmin);
    next.set_vtime(settings.vtime);
    *bundle = next;
    Ok(())
}

/// Read the line settings out of `bundle`.
pub fn decode(bundle: &TermiosBundle) -> Result<LineSettings> {
    Ok(LineSettings {
        parity: bundle.parity()?,
        data_bits: bundle.data_bits(),
        stop_bits: bundle.stop_bits(),
        handshake: bundle.handshake(),
        canonical: bundle.canonical_mode(),
        echo: bundle.echo(),
        signals: bundle.signal_chars(),
        output_processing: bundle.output_processing(),
        vmin: bundle.vmin(),
        vtime: bundle.vtime(),
    })
}
