//! Lifecycle and configuration rules of `SerialPort`, driven through the mock
//! back end.

mod common;

use common::{mock_port, mock_port_with, open_mock_port};
use pretty_assertions::assert_eq;
use serial_engine::port::{CompletionMode, MockDevice, MockPlatform, SerialPort};
use serial_engine::{
    ErrorKind, Handshake, Parity, PortConfiguration, SerialError, StopBits, Timeout,
};
use std::time::{Duration, Instant};

fn io_error(message: &str) -> SerialError {
    SerialError::Io(std::io::Error::other(message.to_string()))
}

// ============================================================================
// Configuration surface
// ============================================================================

type Setter = fn(&mut SerialPort<MockPlatform>) -> serial_engine::Result<()>;

/// Every public setter, each writing back the value the port already holds.
const REASSIGN_CURRENT: &[(&str, Setter)] = &[
    ("port_name", |p| {
        let v = p.port_name().to_string();
        p.set_port_name(v)
    }),
    ("baud_rate", |p| p.set_baud_rate(p.baud_rate())),
    ("parity", |p| p.set_parity(p.parity())),
    ("data_bits", |p| p.set_data_bits(p.data_bits())),
    ("stop_bits", |p| p.set_stop_bits(p.stop_bits())),
    ("handshake", |p| p.set_handshake(p.handshake())),
    ("dtr_enable", |p| p.set_dtr_enable(p.dtr_enable())),
    ("rts_enable", |p| p.set_rts_enable(p.rts_enable())),
    ("discard_null", |p| p.set_discard_null(p.discard_null())),
    ("parity_replace", |p| p.set_parity_replace(p.parity_replace())),
    ("read_timeout", |p| p.set_read_timeout(p.read_timeout())),
    ("write_timeout", |p| p.set_write_timeout(p.write_timeout())),
    ("read_buffer_size", |p| p.set_read_buffer_size(p.read_buffer_size())),
    ("write_buffer_size", |p| p.set_write_buffer_size(p.write_buffer_size())),
    ("received_bytes_threshold", |p| {
        p.set_received_bytes_threshold(p.received_bytes_threshold())
    }),
];

fn assert_reassignment_is_silent(mock: &MockPlatform, port: &mut SerialPort<MockPlatform>) {
    let before = port.configuration().clone();
    for (name, setter) in REASSIGN_CURRENT {
        setter(port).unwrap_or_else(|e| panic!("{name}: {e}"));
        assert_eq!(mock.total_calls(), 0, "{name} reached the platform");
    }
    assert_eq!(port.configuration(), &before);
}

#[test]
fn test_setting_current_value_makes_no_native_call() {
    let (mock, mut port) = open_mock_port("MOCK0");
    assert_reassignment_is_silent(&mock, &mut port);

    let break_state = port.break_state().unwrap();
    port.set_break_state(break_state).unwrap();
    assert_eq!(mock.total_calls(), 0);
}

#[test]
fn test_setting_current_non_default_value_makes_no_native_call() {
    let mut config = PortConfiguration::new("MOCK0");
    config.baud_rate = 57_600;
    config.parity = Parity::Even;
    config.data_bits = 7;
    config.stop_bits = StopBits::Two;
    config.handshake = Handshake::XOnXOff;
    config.dtr_enable = true;
    config.rts_enable = true;
    config.discard_null = true;
    config.parity_replace = 0;
    config.read_timeout = Timeout::After(Duration::ZERO);
    config.write_timeout = Timeout::After(Duration::from_millis(750));
    config.read_buffer_size = 8192;
    config.write_buffer_size = 1024;
    config.received_bytes_threshold = 16;

    let (mock, mut port) = mock_port_with(config);
    port.open().unwrap();
    port.set_break_state(true).unwrap();
    mock.reset_calls();

    assert_reassignment_is_silent(&mock, &mut port);
    port.set_break_state(true).unwrap();
    assert_eq!(mock.total_calls(), 0);
}

#[test]
fn test_reassigning_while_closed_touches_nothing() {
    let (mock, mut port) = mock_port("MOCK0");
    assert_reassignment_is_silent(&mock, &mut port);
}

#[test]
fn test_closed_setters_record_without_native_calls() {
    let (mock, mut port) = mock_port("MOCK0");

    port.set_baud_rate(115200).unwrap();
    port.set_parity(Parity::Even).unwrap();
    port.set_data_bits(7).unwrap();
    port.set_read_buffer_size(8192).unwrap();
    port.set_port_name("MOCK1").unwrap();

    assert_eq!(mock.total_calls(), 0);
    assert_eq!(port.baud_rate(), 115200);
    assert_eq!(port.parity(), Parity::Even);
    assert_eq!(port.data_bits(), 7);
    assert_eq!(port.read_buffer_size(), 8192);
    assert_eq!(port.port_name(), "MOCK1");
}

#[test]
fn test_closed_setters_validate() {
    let (_mock, mut port) = mock_port("MOCK0");

    assert!(matches!(
        port.set_baud_rate(0),
        Err(SerialError::OutOfRange { name: "BaudRate", .. })
    ));
    assert!(matches!(
        port.set_data_bits(4),
        Err(SerialError::OutOfRange { .. })
    ));
    assert!(port.set_port_name("").is_err());
    assert!(port.set_write_buffer_size(0).is_err());
    assert!(port.set_received_bytes_threshold(0).is_err());

    port.set_data_bits(9).unwrap();
    assert!(matches!(
        port.set_parity(Parity::Odd),
        Err(SerialError::OutOfRange { name: "Parity", .. })
    ));
    assert_eq!(port.parity(), Parity::None);
}

#[test]
fn test_open_setters_reach_platform() {
    let (mock, mut port) = open_mock_port("MOCK0");

    port.set_baud_rate(19200).unwrap();
    port.set_parity(Parity::Odd).unwrap();
    port.set_stop_bits(StopBits::Two).unwrap();
    port.set_write_timeout(Timeout::After(Duration::from_millis(100)))
        .unwrap();

    assert_eq!(mock.calls("set_baud_rate"), 1);
    assert_eq!(mock.calls("set_parity"), 1);
    assert_eq!(mock.calls("set_stop_bits"), 1);
    assert_eq!(mock.calls("set_write_timeout"), 1);

    let applied = mock.applied_configuration().unwrap();
    assert_eq!(applied.baud_rate, 19200);
    assert_eq!(applied.parity, Parity::Odd);
    assert_eq!(applied.stop_bits, StopBits::Two);
    assert_eq!(
        mock.device_timeouts().1,
        Timeout::After(Duration::from_millis(100))
    );
}

#[test]
fn test_zero_write_timeout_is_rejected() {
    let (mock, mut port) = open_mock_port("MOCK0");
    port.set_write_timeout(Timeout::After(Duration::from_millis(100)))
        .unwrap();
    mock.reset_calls();

    let err = port
        .set_write_timeout(Timeout::After(Duration::ZERO))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(matches!(
        err,
        SerialError::OutOfRange { name: "WriteTimeout", .. }
    ));
    assert_eq!(port.write_timeout(), Timeout::After(Duration::from_millis(100)));
    assert_eq!(mock.calls("set_write_timeout"), 0);

    // A zero read timeout remains a valid "return immediately".
    port.set_read_timeout(Timeout::After(Duration::ZERO)).unwrap();

    let mut config = PortConfiguration::new("MOCK1");
    config.write_timeout = Timeout::After(Duration::ZERO);
    let (other, mut closed) = mock_port_with(config);
    assert!(matches!(
        closed.open(),
        Err(SerialError::OutOfRange { name: "WriteTimeout", .. })
    ));
    assert!(!closed.is_open());
    assert_eq!(other.calls("open"), 0);
}

#[test]
fn test_failed_hook_restores_previous_value() {
    let (mock, mut port) = open_mock_port("MOCK0");

    mock.fail_next("set_baud_rate", io_error("rejected"));
    assert!(port.set_baud_rate(57600).is_err());
    assert_eq!(port.baud_rate(), 9600);
    assert_eq!(mock.applied_configuration().unwrap().baud_rate, 9600);

    mock.set_max_baud(Some(115200));
    assert!(port.set_baud_rate(230400).is_err());
    assert_eq!(port.baud_rate(), 9600);

    port.set_baud_rate(115200).unwrap();
    assert_eq!(port.baud_rate(), 115200);
}

#[test]
fn test_rts_enable_conflicts_with_rts_handshake() {
    let (_mock, mut port) = mock_port("MOCK0");

    port.set_handshake(Handshake::RequestToSend).unwrap();
    assert!(matches!(
        port.set_rts_enable(true),
        Err(SerialError::RtsWithHandshake)
    ));
    assert!(!port.rts_enable());

    port.set_handshake(Handshake::None).unwrap();
    port.set_rts_enable(true).unwrap();
    port.set_handshake(Handshake::RequestToSendXOnXOff).unwrap();
    assert!(!port.rts_enable());
    port.configuration().validate().unwrap();
}

#[test]
fn test_handshake_change_while_open_passes_rts_state() {
    let (mock, mut port) = open_mock_port("MOCK0");

    port.set_rts_enable(true).unwrap();
    port.set_handshake(Handshake::RequestToSend).unwrap();

    let applied = mock.applied_configuration().unwrap();
    assert_eq!(applied.handshake, Handshake::RequestToSend);
    assert!(!applied.rts_enable);
    assert!(!port.rts_enable());
}

#[test]
fn test_fixed_properties_rejected_while_open() {
    let (mock, mut port) = open_mock_port("MOCK0");

    let err = port.set_port_name("MOCK9").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);
    assert!(port.set_read_buffer_size(1024).is_err());
    assert!(port.set_write_buffer_size(1024).is_err());

    assert_eq!(port.port_name(), "MOCK0");
    assert_eq!(mock.total_calls(), 0);
}

#[test]
fn test_break_state_requires_open_port() {
    let (mock, mut port) = mock_port("MOCK0");
    assert!(matches!(port.break_state(), Err(SerialError::NotOpen)));
    assert!(matches!(
        port.set_break_state(true),
        Err(SerialError::NotOpen)
    ));

    port.open().unwrap();
    port.set_break_state(true).unwrap();
    assert!(port.break_state().unwrap());
    assert!(mock.device_break_state());
    assert!(matches!(
        port.write(b"x"),
        Err(SerialError::InBreakState)
    ));

    port.set_break_state(false).unwrap();
    port.write(b"x").unwrap();
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_open_applies_configuration_and_buffers() {
    let mut config = PortConfiguration::new("MOCK0");
    config.baud_rate = 38400;
    config.read_buffer_size = 1024;
    config.write_buffer_size = 512;
    let (mock, mut port) = mock_port_with(config.clone());

    port.open().unwrap();
    assert!(port.is_open());
    assert_eq!(mock.applied_configuration(), Some(config));
    assert_eq!(mock.buffer_sizes(), Some((1024, 512)));
    assert_eq!(mock.port_name(), "MOCK0");
    assert!(!port.break_state().unwrap());
}

#[test]
fn test_open_twice_fails() {
    let (mock, mut port) = open_mock_port("MOCK0");
    assert!(matches!(port.open(), Err(SerialError::AlreadyOpen)));
    assert_eq!(mock.calls("open"), 0);
    assert!(port.is_open());
}

#[test]
fn test_open_reports_native_failures() {
    let cases = [
        (MockDevice::Missing, ErrorKind::Native(serial_engine::NativeErrorKind::NotFound)),
        (MockDevice::Busy, ErrorKind::Native(serial_engine::NativeErrorKind::SharingViolation)),
        (MockDevice::AccessDenied, ErrorKind::Native(serial_engine::NativeErrorKind::AccessDenied)),
        (MockDevice::NotASerialPort, ErrorKind::Native(serial_engine::NativeErrorKind::NotASerialPort)),
    ];
    for (device, kind) in cases {
        let (mock, mut port) = mock_port("MOCK0");
        mock.set_device(device);
        let err = port.open().unwrap_err();
        assert_eq!(err.kind(), kind, "{:?}", device);
        assert!(!port.is_open());
        assert!(!mock.is_handle_open());
    }
}

#[test]
fn test_failed_open_releases_handle() {
    let (mock, mut port) = mock_port("MOCK0");
    mock.fail_next("initialize_buffers", io_error("no memory"));

    assert!(port.open().is_err());
    assert!(!port.is_open());
    assert!(!mock.is_handle_open());
    assert_eq!(mock.calls("close"), 1);

    port.open().unwrap();
    assert!(port.is_open());
}

#[test]
fn test_close_is_idempotent() {
    let (mock, mut port) = mock_port("MOCK0");
    port.close().unwrap();
    assert_eq!(mock.total_calls(), 0);

    port.open().unwrap();
    port.close().unwrap();
    mock.reset_calls();

    port.close().unwrap();
    assert_eq!(mock.total_calls(), 0);
    assert!(!port.is_open());
}

#[test]
fn test_close_drains_and_purges_reachable_device() {
    let (mock, mut port) = open_mock_port("MOCK0");

    port.close().unwrap();
    assert_eq!(mock.calls("stop_events"), 1);
    assert_eq!(mock.calls("flush"), 1);
    assert_eq!(mock.calls("discard_in_buffer"), 1);
    assert_eq!(mock.calls("discard_out_buffer"), 1);
    assert_eq!(mock.calls("close"), 1);
    assert!(!mock.is_handle_open());
}

#[test]
fn test_close_reports_failure_but_still_closes() {
    let (mock, mut port) = open_mock_port("MOCK0");
    mock.fail_next("flush", io_error("stuck"));

    assert!(matches!(port.close(), Err(SerialError::Io(_))));
    assert!(!port.is_open());
    assert!(!mock.is_handle_open());
    assert_eq!(mock.calls("discard_in_buffer"), 1);
}

#[test]
fn test_close_does_not_report_device_loss() {
    let (mock, mut port) = open_mock_port("MOCK0");
    mock.fail_next("flush", SerialError::DeviceRemoved);

    port.close().unwrap();
    assert!(!port.is_open());
    assert!(!mock.is_handle_open());
    assert_eq!(mock.calls("close"), 1);

    let (mock, port) = open_mock_port("MOCK1");
    mock.lose_device();
    port.dispose().unwrap();
    assert!(!mock.is_handle_open());
}

#[test]
fn test_drop_swallows_close_failure() {
    let (mock, port) = open_mock_port("MOCK0");
    mock.fail_next("flush", io_error("stuck"));
    drop(port);
    assert!(!mock.is_handle_open());
}

#[test]
fn test_dispose_closes() {
    let (mock, port) = open_mock_port("MOCK0");
    port.dispose().unwrap();
    assert!(!mock.is_handle_open());
    assert_eq!(mock.calls("close"), 1);
}

#[test]
fn test_reopen_after_close() {
    let (mock, mut port) = open_mock_port("MOCK0");
    port.close().unwrap();
    port.set_port_name("MOCK1").unwrap();
    port.open().unwrap();
    assert_eq!(mock.port_name(), "MOCK1");
    assert!(mock.is_handle_open());
}

// ============================================================================
// Device loss
// ============================================================================

#[test]
fn test_device_loss_surfaces_once() {
    let (mock, mut port) = open_mock_port("MOCK0");
    mock.lose_device();

    assert!(matches!(
        port.bytes_to_read(),
        Err(SerialError::DeviceRemoved)
    ));
    assert!(matches!(port.bytes_to_read(), Err(SerialError::NotOpen)));

    // Loss is not reported again by close.
    port.close().unwrap();
    assert!(!mock.is_handle_open());
    assert_eq!(mock.calls("close"), 1);
    assert_eq!(mock.calls("flush"), 0);

    port.open().unwrap();
    assert_eq!(port.bytes_to_read().unwrap(), 0);
}

#[test]
fn test_unreachable_device_bounds_close_wait() {
    let (mock, port) = open_mock_port("MOCK0");
    let port = port.with_close_wait(Duration::from_millis(50));
    mock.set_completion_mode(CompletionMode::Manual);

    let op = port.begin_read(8).unwrap();
    mock.lose_device();

    let started = Instant::now();
    drop(port);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(!mock.is_handle_open());

    for handle in mock.take_submitted() {
        handle.complete(0, Some(SerialError::OperationAborted));
    }
    assert!(matches!(op.end(false), Err(SerialError::OperationAborted)));
}

// ============================================================================
// Transfers
// ============================================================================

#[test]
fn test_write_drain_close_at_9600_8n1() {
    let (mock, mut port) = mock_port("MOCK0");
    assert_eq!(port.baud_rate(), 9600);
    assert_eq!(port.data_bits(), 8);
    assert_eq!(port.parity(), Parity::None);
    assert_eq!(port.stop_bits(), StopBits::One);

    port.open().unwrap();
    port.write(b"hello").unwrap();
    assert_eq!(port.bytes_to_write().unwrap(), 5);

    port.flush().unwrap();
    assert_eq!(port.bytes_to_write().unwrap(), 0);
    assert_eq!(mock.write_log(), vec![b"hello".to_vec()]);

    port.close().unwrap();
    assert!(!mock.is_handle_open());
}

#[test]
fn test_queries_on_closed_port_fail() {
    let (mock, port) = mock_port("MOCK0");

    assert!(matches!(port.bytes_to_read(), Err(SerialError::NotOpen)));
    assert!(matches!(port.bytes_to_write(), Err(SerialError::NotOpen)));
    assert!(matches!(port.cd_holding(), Err(SerialError::NotOpen)));
    assert!(matches!(port.discard_in_buffer(), Err(SerialError::NotOpen)));
    assert!(matches!(port.begin_read(4), Err(SerialError::NotOpen)));
    assert!(matches!(port.write(b"x"), Err(SerialError::NotOpen)));
    assert_eq!(mock.total_calls(), 0);
}

#[test]
fn test_pin_queries() {
    let (mock, port) = open_mock_port("MOCK0");
    mock.set_pins(true, false, true);
    assert!(port.cd_holding().unwrap());
    assert!(!port.cts_holding().unwrap());
    assert!(port.dsr_holding().unwrap());
}

#[test]
fn test_read_returns_queued_bytes() {
    let (mock, port) = open_mock_port("MOCK0");
    mock.enqueue_read(b"abcdef");
    assert_eq!(port.bytes_to_read().unwrap(), 6);

    let mut buf = [0u8; 4];
    assert_eq!(port.read(&mut buf).unwrap(), 4);
    assert_eq!(&buf, b"abcd");
    assert_eq!(port.bytes_to_read().unwrap(), 2);

    port.discard_in_buffer().unwrap();
    assert_eq!(port.bytes_to_read().unwrap(), 0);
}

#[test]
fn test_empty_read_with_finite_timeout_times_out() {
    let (_mock, mut port) = open_mock_port("MOCK0");
    port.set_read_timeout(Timeout::After(Duration::from_millis(10)))
        .unwrap();

    let mut buf = [0u8; 4];
    match port.read(&mut buf) {
        Err(SerialError::Timeout(d)) => assert_eq!(d, Duration::from_millis(10)),
        other => panic!("expected timeout, got {:?}", other),
    }
}

#[test]
fn test_empty_read_with_infinite_timeout_is_aborted() {
    let (_mock, port) = open_mock_port("MOCK0");
    let mut buf = [0u8; 4];
    assert!(matches!(
        port.read(&mut buf),
        Err(SerialError::OperationAborted)
    ));
}

#[test]
fn test_zero_length_transfers_skip_platform() {
    let (mock, port) = open_mock_port("MOCK0");

    port.write(&[]).unwrap();
    let mut empty = [0u8; 0];
    assert_eq!(port.read(&mut empty).unwrap(), 0);

    let op = port.begin_read(0).unwrap();
    assert!(op.is_immediate());
    assert_eq!(port.end_read(&op, &mut empty).unwrap(), 0);

    assert_eq!(mock.calls("read"), 0);
    assert_eq!(mock.calls("write"), 0);
}

#[test]
fn test_loopback_begin_end() {
    let (mock, port) = open_mock_port("MOCK0");
    mock.set_loopback(true);

    let write = port.begin_write(b"ping").unwrap();
    assert_eq!(port.end_write(&write).unwrap(), 4);

    let read = port.begin_read(16).unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(port.end_read(&read, &mut buf).unwrap(), 4);
    assert_eq!(&buf[..4], b"ping");
}

#[test]
fn test_end_with_wrong_kind_is_rejected() {
    let (_mock, port) = open_mock_port("MOCK0");
    let write = port.begin_write(b"abc").unwrap();
    let mut buf = [0u8; 3];
    assert!(matches!(
        port.end_read(&write, &mut buf),
        Err(SerialError::InvalidState(_))
    ));
    assert_eq!(port.end_write(&write).unwrap(), 3);
}

#[test]
fn test_failed_submit_leaves_nothing_pending() {
    let (mock, mut port) = open_mock_port("MOCK0");
    mock.fail_next("write", io_error("refused"));

    assert!(port.begin_write(b"abc").is_err());

    let started = Instant::now();
    port.close().unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[test]
fn test_explicit_close_aborts_held_transfers() {
    let (mock, mut port) = open_mock_port("MOCK0");
    mock.set_completion_mode(CompletionMode::Manual);

    let read = port.begin_read(8).unwrap();
    let write = port.begin_write(b"stuck").unwrap();
    assert_eq!(mock.submitted_count(), 2);

    port.close().unwrap();
    let mut buf = [0u8; 8];
    assert!(matches!(
        port.end_read(&read, &mut buf),
        Err(SerialError::OperationAborted)
    ));
    assert!(matches!(
        port.end_write(&write),
        Err(SerialError::OperationAborted)
    ));
}

#[test]
fn test_deferred_completion() {
    let (mock, port) = open_mock_port("MOCK0");
    mock.set_completion_mode(CompletionMode::Deferred(Duration::from_millis(20)));
    mock.enqueue_read(b"late");

    let op = port.begin_read(4).unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(port.end_read(&op, &mut buf).unwrap(), 4);
    assert_eq!(&buf, b"late");
}
