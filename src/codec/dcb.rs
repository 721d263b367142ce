//! Windows device control block codec.
//!
//! [`DcbBundle`] holds the fields of a Win32 `DCB` with the packed bitfield
//! word exposed through named [`DcbFlag`] accessors. The codec is pure and
//! platform independent, so the Windows back end and the tests share it.

use crate::error::{Result, SerialError};
use crate::settings::{Handshake, Parity, PortConfiguration, StopBits};

pub const XON_CHAR: u8 = 17;
pub const XOFF_CHAR: u8 = 19;
pub const EOF_CHAR: u8 = 26;

pub const NOPARITY: u8 = 0;
pub const ODDPARITY: u8 = 1;
pub const EVENPARITY: u8 = 2;
pub const MARKPARITY: u8 = 3;
pub const SPACEPARITY: u8 = 4;

pub const ONESTOPBIT: u8 = 0;
pub const ONE5STOPBITS: u8 = 1;
pub const TWOSTOPBITS: u8 = 2;

pub const DTR_CONTROL_DISABLE: u32 = 0;
pub const DTR_CONTROL_ENABLE: u32 = 1;
pub const DTR_CONTROL_HANDSHAKE: u32 = 2;

pub const RTS_CONTROL_DISABLE: u32 = 0;
pub const RTS_CONTROL_ENABLE: u32 = 1;
pub const RTS_CONTROL_HANDSHAKE: u32 = 2;
pub const RTS_CONTROL_TOGGLE: u32 = 3;

/// Named fields of the packed `DCB` bitfield word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DcbFlag {
    Binary,
    Parity,
    OutxCtsFlow,
    OutxDsrFlow,
    DtrControl,
    DsrSensitivity,
    TxContinueOnXoff,
    OutX,
    InX,
    ErrorChar,
    Null,
    RtsControl,
    AbortOnError,
}

impl DcbFlag {
    pub const fn position(self) -> u32 {
        match self {
            Self::Binary => 0,
            Self::Parity => 1,
            Self::OutxCtsFlow => 2,
            Self::OutxDsrFlow => 3,
            Self::DtrControl => 4,
            Self::DsrSensitivity => 6,
            Self::TxContinueOnXoff => 7,
            Self::OutX => 8,
            Self::InX => 9,
            Self::ErrorChar => 10,
            Self::Null => 11,
            Self::RtsControl => 12,
            Self::AbortOnError => 14,
        }
    }

    pub const fn width(self) -> u32 {
        match self {
            Self::DtrControl | Self::RtsControl => 2,
            _ => 1,
        }
    }

    /// Mask of the field within the bitfield word.
    pub const fn mask(self) -> u32 {
        ((1 << self.width()) - 1) << self.position()
    }
}

/// Field-for-field image of a Win32 `DCB`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DcbBundle {
    pub baud_rate: u32,
    pub flags: u32,
    pub xon_limit: u16,
    pub xoff_limit: u16,
    pub byte_size: u8,
    pub parity: u8,
    pub stop_bits: u8,
    pub xon_char: u8,
    pub xoff_char: u8,
    pub error_char: u8,
    pub eof_char: u8,
    pub event_char: u8,
}

impl DcbBundle {
    pub fn flag(&self, flag: DcbFlag) -> u32 {
        (self.flags & flag.mask()) >> flag.position()
    }

    /// Store `value` in the field, truncated to its width.
    pub fn set_flag(&mut self, flag: DcbFlag, value: u32) {
        let field = (value << flag.position()) & flag.mask();
        self.flags = (self.flags & !flag.mask()) | field;
    }

    fn set_bool(&mut self, flag: DcbFlag, on: bool) {
        self.set_flag(flag, u32::from(on));
    }

    /// Overwrite the line settings from `config`.
    ///
    /// `rx_queue` is the driver's current receive queue size; the XON/XOFF
    /// limits are a quarter of it.
    pub fn initialize(&mut self, config: &PortConfiguration, rx_queue: u32) -> Result<()> {
        self.baud_rate = config.baud_rate;
        self.byte_size = config.data_bits;
        self.stop_bits = encode_stop_bits(config.stop_bits);
        self.parity = encode_parity(config.parity);

        self.set_bool(DcbFlag::Parity, config.parity != Parity::None);
        self.set_bool(DcbFlag::Binary, true);
        self.set_bool(DcbFlag::OutxDsrFlow, false);
        self.set_flag(DcbFlag::DtrControl, DTR_CONTROL_DISABLE);
        self.set_bool(DcbFlag::DsrSensitivity, false);
        self.set_bool(DcbFlag::AbortOnError, false);
        self.set_bool(DcbFlag::Null, config.discard_null);

        if config.handshake.uses_rts() {
            self.set_flag(DcbFlag::RtsControl, RTS_CONTROL_HANDSHAKE);
        } else if self.flag(DcbFlag::RtsControl) == RTS_CONTROL_HANDSHAKE {
            self.set_flag(DcbFlag::RtsControl, RTS_CONTROL_DISABLE);
        }
        self.set_bool(DcbFlag::OutxCtsFlow, config.handshake.uses_rts());
        let software = config.handshake.uses_xon_xoff();
        self.set_bool(DcbFlag::InX, software);
        self.set_bool(DcbFlag::OutX, software);

        self.apply_parity_replace(config.parity_replace);

        self.xon_char = XON_CHAR;
        self.xoff_char = XOFF_CHAR;
        let limit = u16::try_from(rx_queue / 4).unwrap_or(u16::MAX);
        self.xon_limit = limit;
        self.xoff_limit = limit;
        self.eof_char = EOF_CHAR;
        // EV_RXFLAG fires on the EOF marker.
        self.event_char = EOF_CHAR;

        self.validate()
    }

    /// Reject combinations the driver would refuse anyway.
    pub fn validate(&self) -> Result<()> {
        if !(5..=8).contains(&self.byte_size) && !(self.byte_size == 9 && self.parity == NOPARITY) {
            return Err(SerialError::out_of_range(
                "DataBits",
                format!("{} data bits with parity code {}", self.byte_size, self.parity),
            ));
        }
        Ok(())
    }

    pub fn set_parity(&mut self, parity: Parity, parity_replace: u8) {
        self.parity = encode_parity(parity);
        self.set_bool(DcbFlag::Parity, parity != Parity::None);
        self.apply_parity_replace(parity_replace);
    }

    /// Error-character replacement only applies while parity checking is on.
    pub fn apply_parity_replace(&mut self, parity_replace: u8) {
        if self.flag(DcbFlag::Parity) == 1 {
            self.error_char = parity_replace;
            self.set_bool(DcbFlag::ErrorChar, parity_replace != 0);
        } else {
            self.error_char = 0;
            self.set_bool(DcbFlag::ErrorChar, false);
        }
    }

    pub fn set_stop_bits(&mut self, stop_bits: StopBits) {
        self.stop_bits = encode_stop_bits(stop_bits);
    }

    /// `rts_enable` chooses the RTS level when the handshake leaves it free.
    pub fn set_handshake(&mut self, handshake: Handshake, rts_enable: bool) {
        let software = handshake.uses_xon_xoff();
        self.set_bool(DcbFlag::InX, software);
        self.set_bool(DcbFlag::OutX, software);
        self.set_bool(DcbFlag::OutxCtsFlow, handshake.uses_rts());
        let rts = if handshake.uses_rts() {
            RTS_CONTROL_HANDSHAKE
        } else if rts_enable {
            RTS_CONTROL_ENABLE
        } else {
            RTS_CONTROL_DISABLE
        };
        self.set_flag(DcbFlag::RtsControl, rts);
    }

    pub fn set_dtr_enable(&mut self, on: bool) {
        let value = if on {
            DTR_CONTROL_ENABLE
        } else {
            DTR_CONTROL_DISABLE
        };
        self.set_flag(DcbFlag::DtrControl, value);
    }

    pub fn dtr_enable(&self) -> bool {
        self.flag(DcbFlag::DtrControl) == DTR_CONTROL_ENABLE
    }

    pub fn set_rts_enable(&mut self, on: bool) {
        let value = if on {
            RTS_CONTROL_ENABLE
        } else {
            RTS_CONTROL_DISABLE
        };
        self.set_flag(DcbFlag::RtsControl, value);
    }

    pub fn rts_enable(&self) -> bool {
        self.flag(DcbFlag::RtsControl) == RTS_CONTROL_ENABLE
    }

    pub fn set_discard_null(&mut self, on: bool) {
        self.set_bool(DcbFlag::Null, on);
    }
}

pub fn encode_parity(parity: Parity) -> u8 {
    match parity {
        Parity::None => NOPARITY,
        Parity::Odd => ODDPARITY,
        Parity::Even => EVENPARITY,
        Parity::Mark => MARKPARITY,
        Parity::Space => SPACEPARITY,
    }
}

pub fn decode_parity(code: u8) -> Result<Parity> {
    match code {
        NOPARITY => Ok(Parity::None),
        ODDPARITY => Ok(Parity::Odd),
        EVENPARITY => Ok(Parity::Even),
        MARKPARITY => Ok(Parity::Mark),
        SPACEPARITY => Ok(Parity::Space),
        code => Err(SerialError::out_of_range(
            "Parity",
            format!("unknown parity code {code}"),
        )),
    }
}

pub fn encode_stop_bits(stop_bits: StopBits) -> u8 {
    match stop_bits {
        StopBits::One => ONESTOPBIT,
        StopBits::OnePointFive => ONE5STOPBITS,
        StopBits::Two => TWOSTOPBITS,
    }
}

pub fn decode_stop_bits(code: u8) -> Result<StopBits> {
    match code {
        ONESTOPBIT => Ok(StopBits::One),
        ONE5STOPBITS => Ok(StopBits::OnePointFive),
        TWOSTOPBITS => Ok(StopBits::Two),
        code => Err(SerialError::out_of_range(
            "StopBits",
            format!("unknown stop bits code {code}"),
        )),
    }
}
