//! Properties of the DCB, termios and timeout encoders.

use proptest::prelude::*;
use serial_engine::codec::dcb::{
    decode_parity, decode_stop_bits, DTR_CONTROL_DISABLE, RTS_CONTROL_HANDSHAKE,
};
use serial_engine::codec::termios::flags::{CBAUD, CLOCAL, CREAD};
use serial_engine::codec::timeouts::{INFINITE_COMM_TIMEOUT, MAXDWORD};
use serial_engine::codec::{
    decode, encode, poll_timeout_ms, CommTimeouts, DcbBundle, DcbFlag, LineSettings,
    TermiosBundle,
};
use serial_engine::settings::validate_data_bits;
use serial_engine::{ErrorKind, Handshake, Parity, PortConfiguration, StopBits, Timeout};
use std::time::Duration;

const DCB_FLAGS: [DcbFlag; 13] = [
    DcbFlag::Binary,
    DcbFlag::Parity,
    DcbFlag::OutxCtsFlow,
    DcbFlag::OutxDsrFlow,
    DcbFlag::DtrControl,
    DcbFlag::DsrSensitivity,
    DcbFlag::TxContinueOnXoff,
    DcbFlag::OutX,
    DcbFlag::InX,
    DcbFlag::ErrorChar,
    DcbFlag::Null,
    DcbFlag::RtsControl,
    DcbFlag::AbortOnError,
];

fn any_handshake() -> impl Strategy<Value = Handshake> {
    prop_oneof![
        Just(Handshake::None),
        Just(Handshake::XOnXOff),
        Just(Handshake::RequestToSend),
        Just(Handshake::RequestToSendXOnXOff),
    ]
}

fn any_parity() -> impl Strategy<Value = Parity> {
    prop::sample::select(Parity::ALL.to_vec())
}

fn any_stop_bits() -> impl Strategy<Value = StopBits> {
    prop_oneof![
        Just(StopBits::One),
        Just(StopBits::OnePointFive),
        Just(StopBits::Two),
    ]
}

/// Settings termios can express.
fn termios_settings() -> impl Strategy<Value = LineSettings> {
    (
        prop_oneof![Just(Parity::None), Just(Parity::Odd), Just(Parity::Even)],
        5u8..=8,
        prop_oneof![Just(StopBits::One), Just(StopBits::Two)],
        any_handshake(),
        any::<(bool, bool, bool, bool)>(),
        any::<(u8, u8)>(),
    )
        .prop_map(
            |(parity, data_bits, stop_bits, handshake, (canonical, echo, signals, opost), (vmin, vtime))| {
                LineSettings {
                    parity,
                    data_bits,
                    stop_bits,
                    handshake,
                    canonical,
                    echo,
                    signals,
                    output_processing: opost,
                    vmin,
                    vtime,
                }
            },
        )
}

/// An arbitrary starting image, as a driver might hand back.
fn any_bundle() -> impl Strategy<Value = TermiosBundle> {
    (any::<[u32; 4]>(), any::<[u8; 19]>(), any::<u32>()).prop_map(|(words, cc, speed)| {
        TermiosBundle {
            input: words[0],
            output: words[1],
            control: words[2],
            local: words[3],
            line: 0,
            cc,
            ispeed: speed,
            ospeed: speed,
        }
    })
}

/// Valid port configurations.
fn any_configuration() -> impl Strategy<Value = PortConfiguration> {
    (
        1u32..=4_000_000,
        any_parity(),
        5u8..=8,
        any_stop_bits(),
        any_handshake(),
        any::<(bool, bool, u8)>(),
    )
        .prop_map(
            |(baud_rate, parity, data_bits, stop_bits, handshake, (dtr, discard_null, replace))| {
                let mut config = PortConfiguration::new("COM3");
                config.baud_rate = baud_rate;
                config.parity = parity;
                config.data_bits = data_bits;
                config.stop_bits = stop_bits;
                config.handshake = handshake;
                config.dtr_enable = dtr;
                config.discard_null = discard_null;
                config.parity_replace = replace;
                config
            },
        )
}

proptest! {
    #[test]
    fn termios_decode_recovers_encoded_settings(
        settings in termios_settings(),
        mut bundle in any_bundle(),
    ) {
        encode(&settings, &mut bundle).unwrap();
        prop_assert_eq!(decode(&bundle).unwrap(), settings);
    }

    #[test]
    fn termios_reencoding_a_decoded_bundle_changes_nothing(original in any_bundle()) {
        // Mark/space parity has no decoded form.
        let Ok(settings) = decode(&original) else {
            return Ok(());
        };
        let mut bundle = original;
        encode(&settings, &mut bundle).unwrap();
        prop_assert_eq!(bundle, original);
    }

    #[test]
    fn termios_encode_leaves_speed_and_receiver_bits_alone(
        settings in termios_settings(),
        original in any_bundle(),
    ) {
        let mut bundle = original;
        encode(&settings, &mut bundle).unwrap();
        prop_assert_eq!(bundle.control & CBAUD, original.control & CBAUD);
        prop_assert_eq!(bundle.control & (CREAD | CLOCAL), original.control & (CREAD | CLOCAL));
        prop_assert_eq!(bundle.ispeed, original.ispeed);
        prop_assert_eq!(bundle.line, original.line);
    }

    #[test]
    fn termios_configure_is_raw_and_readable(config in any_configuration(), base in any_bundle()) {
        let mut bundle = base;
        let expressible = matches!(config.parity, Parity::None | Parity::Odd | Parity::Even)
            && config.stop_bits != StopBits::OnePointFive;
        match bundle.configure(&config) {
            Ok(()) => {
                prop_assert!(expressible);
                prop_assert!(bundle.receiver_enabled());
                prop_assert!(bundle.local_mode());
                prop_assert!(!bundle.canonical_mode());
                prop_assert!(!bundle.echo());
                prop_assert_eq!(bundle.speed().unwrap(), config.baud_rate);
                let decoded = decode(&bundle).unwrap();
                prop_assert_eq!(decoded.data_bits, config.data_bits);
                prop_assert_eq!(decoded.parity, config.parity);
            }
            Err(e) => {
                prop_assert!(!expressible);
                prop_assert_eq!(e.kind(), ErrorKind::NotSupported);
                prop_assert_eq!(bundle, base);
            }
        }
    }

    #[test]
    fn dcb_initialize_reflects_configuration(config in any_configuration(), rx_queue in 0u32..1_000_000) {
        let mut dcb = DcbBundle::default();
        dcb.initialize(&config, rx_queue).unwrap();

        prop_assert_eq!(dcb.baud_rate, config.baud_rate);
        prop_assert_eq!(dcb.byte_size, config.data_bits);
        prop_assert_eq!(decode_parity(dcb.parity).unwrap(), config.parity);
        prop_assert_eq!(decode_stop_bits(dcb.stop_bits).unwrap(), config.stop_bits);
        prop_assert_eq!(dcb.flag(DcbFlag::Binary), 1);
        prop_assert_eq!(dcb.flag(DcbFlag::Parity) == 1, config.parity != Parity::None);
        prop_assert_eq!(dcb.flag(DcbFlag::DtrControl), DTR_CONTROL_DISABLE);
        prop_assert_eq!(dcb.flag(DcbFlag::OutxCtsFlow) == 1, config.handshake.uses_rts());
        prop_assert_eq!(dcb.flag(DcbFlag::InX), dcb.flag(DcbFlag::OutX));
        prop_assert_eq!(dcb.flag(DcbFlag::InX) == 1, config.handshake.uses_xon_xoff());
        prop_assert_eq!(
            dcb.flag(DcbFlag::RtsControl) == RTS_CONTROL_HANDSHAKE,
            config.handshake.uses_rts()
        );
        prop_assert_eq!(dcb.flag(DcbFlag::Null) == 1, config.discard_null);
        prop_assert_eq!(u32::from(dcb.xon_limit), (rx_queue / 4).min(u32::from(u16::MAX)));
        if config.parity == Parity::None {
            prop_assert_eq!(dcb.flag(DcbFlag::ErrorChar), 0);
        } else {
            prop_assert_eq!(dcb.error_char, config.parity_replace);
        }
    }

    #[test]
    fn dcb_set_flag_touches_only_its_field(start in any::<u32>(), index in 0usize..13, value in any::<u32>()) {
        let flag = DCB_FLAGS[index];
        let mut dcb = DcbBundle { flags: start, ..Default::default() };
        dcb.set_flag(flag, value);
        prop_assert_eq!(dcb.flags & !flag.mask(), start & !flag.mask());
        prop_assert_eq!(dcb.flag(flag), value & ((1 << flag.width()) - 1));
    }

    #[test]
    fn finite_read_timeouts_map_to_constant(ms in 1u64..=u64::from(u32::MAX - 2)) {
        let t = CommTimeouts::from_timeouts(Timeout::After(Duration::from_millis(ms)), Timeout::Infinite);
        prop_assert_eq!(t.read_interval, MAXDWORD);
        prop_assert_eq!(t.read_total_multiplier, MAXDWORD);
        prop_assert_eq!(u64::from(t.read_total_constant), ms);
        prop_assert_eq!(poll_timeout_ms(Timeout::After(Duration::from_millis(ms))), i32::try_from(ms).unwrap_or(i32::MAX));
    }
}

#[test]
fn test_data_bits_and_parity_table() {
    for bits in 0u8..=12 {
        for parity in Parity::ALL {
            let expected = (5..=8).contains(&bits) || (bits == 9 && parity == Parity::None);
            assert_eq!(
                validate_data_bits(bits, parity).is_ok(),
                expected,
                "{} data bits with {:?}",
                bits,
                parity
            );

            if expected {
                let mut config = PortConfiguration::new("COM1");
                config.data_bits = bits;
                config.parity = parity;
                let mut dcb = DcbBundle::default();
                assert!(dcb.initialize(&config, 4096).is_ok(), "{} / {:?}", bits, parity);
            }
        }
    }
}

#[test]
fn test_termios_rejects_what_it_cannot_express() {
    let mut bundle = TermiosBundle::default();
    for parity in [Parity::Mark, Parity::Space] {
        assert_eq!(
            bundle.set_parity(parity).unwrap_err().kind(),
            ErrorKind::NotSupported
        );
    }
    assert_eq!(
        bundle.set_data_bits(9).unwrap_err().kind(),
        ErrorKind::NotSupported
    );
    assert_eq!(
        bundle.set_stop_bits(StopBits::OnePointFive).unwrap_err().kind(),
        ErrorKind::NotSupported
    );
}

#[test]
fn test_infinite_timeouts() {
    let t = CommTimeouts::from_timeouts(Timeout::Infinite, Timeout::Infinite);
    assert_eq!(t.read_total_constant, INFINITE_COMM_TIMEOUT);
    assert_eq!(t.write_total_constant, 0);
    assert_eq!(poll_timeout_ms(Timeout::Infinite), -1);
    assert_eq!(poll_timeout_ms(Timeout::After(Duration::ZERO)), 0);
}
