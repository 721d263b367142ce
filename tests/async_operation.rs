//! Completion contract of in-flight transfers.

mod common;

use common::open_mock_port;
use serial_engine::io::{AsyncOperation, NativeContext, OperationKind, PendingOperations};
use serial_engine::port::CompletionMode;
use serial_engine::SerialError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn test_end_called_twice_fails() {
    let (mock, port) = open_mock_port("MOCK0");
    mock.enqueue_read(b"xy");

    let op = port.begin_read(2).unwrap();
    let mut buf = [0u8; 2];
    assert_eq!(port.end_read(&op, &mut buf).unwrap(), 2);
    assert!(matches!(
        port.end_read(&op, &mut buf),
        Err(SerialError::EndCalledTwice(OperationKind::Read))
    ));
}

#[test]
fn test_end_twice_on_failed_operation() {
    let pending = PendingOperations::new();
    let op = AsyncOperation::new(OperationKind::Write, vec![0; 3], &pending);
    op.completion_handle()
        .unwrap()
        .complete(0, Some(SerialError::DeviceRemoved));

    assert!(matches!(op.end(false), Err(SerialError::DeviceRemoved)));
    assert!(matches!(
        op.end(false),
        Err(SerialError::EndCalledTwice(OperationKind::Write))
    ));
}

#[test]
fn test_racing_completions_record_one_outcome() {
    let (mock, port) = open_mock_port("MOCK0");
    mock.set_completion_mode(CompletionMode::Racing);

    for _ in 0..50 {
        let op = port.begin_write(b"race").unwrap();
        assert_eq!(port.end_write(&op).unwrap(), 4);
    }
    assert_eq!(mock.write_log().len(), 50);
}

#[test]
fn test_concurrent_complete_has_single_winner() {
    let pending = PendingOperations::new();
    for _ in 0..100 {
        let op = AsyncOperation::new(OperationKind::Read, vec![0; 8], &pending);
        let barrier = Arc::new(Barrier::new(2));
        let wins = Arc::new(AtomicUsize::new(0));

        let racers: Vec<_> = [3usize, 5]
            .into_iter()
            .map(|bytes| {
                let handle = op.completion_handle().unwrap();
                let barrier = Arc::clone(&barrier);
                let wins = Arc::clone(&wins);
                thread::spawn(move || {
                    barrier.wait();
                    if handle.complete(bytes, None) {
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for racer in racers {
            racer.join().unwrap();
        }

        assert_eq!(wins.load(Ordering::SeqCst), 1);
        let n = op.end(false).unwrap();
        assert!(n == 3 || n == 5);
    }
    assert_eq!(pending.count(), 0);
}

#[test]
fn test_native_context_freed_exactly_once() {
    let frees = Arc::new(AtomicUsize::new(0));

    for callback_first in [true, false] {
        let counter = Arc::clone(&frees);
        let (waiter, callback) = NativeContext::allocate(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let pending = PendingOperations::new();
        let op = AsyncOperation::new(OperationKind::Read, vec![0; 4], &pending);
        let handle = op.completion_handle().unwrap();
        handle.attach_waiter_context(waiter);

        if callback_first {
            handle.complete(4, None);
            callback.release();
            op.end(false).unwrap();
        } else {
            let completer = handle.clone();
            let end = thread::spawn(move || op.end(false));
            completer.complete(4, None);
            assert_eq!(end.join().unwrap().unwrap(), 4);
            callback.release();
        }
    }

    assert_eq!(frees.load(Ordering::SeqCst), 2);
}

#[test]
fn test_dropped_operation_releases_native_context() {
    let frees = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&frees);
    let (waiter, callback) = NativeContext::allocate(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let pending = PendingOperations::new();
    let op = AsyncOperation::new(OperationKind::Write, vec![1; 4], &pending);
    let handle = op.completion_handle().unwrap();
    handle.attach_waiter_context(waiter);

    handle.complete(4, None);
    drop(op);
    drop(handle);
    assert_eq!(frees.load(Ordering::SeqCst), 0);
    callback.release();
    assert_eq!(frees.load(Ordering::SeqCst), 1);
}

#[test]
fn test_zero_byte_completion_with_infinite_timeout_is_aborted() {
    let pending = PendingOperations::new();
    let op = AsyncOperation::new(OperationKind::Read, vec![0; 4], &pending);
    op.completion_handle().unwrap().complete(0, None);
    assert!(matches!(op.end(true), Err(SerialError::OperationAborted)));

    let op = AsyncOperation::new(OperationKind::Read, vec![0; 4], &pending);
    op.completion_handle().unwrap().complete(0, None);
    assert_eq!(op.end(false).unwrap(), 0);
}

#[test]
fn test_zero_length_operation_completes_immediately() {
    let (mock, port) = open_mock_port("MOCK0");
    mock.set_completion_mode(CompletionMode::Manual);

    let op = port.begin_write(&[]).unwrap();
    assert!(op.is_completed());
    assert_eq!(op.requested(), 0);
    assert_eq!(port.end_write(&op).unwrap(), 0);
    assert_eq!(mock.submitted_count(), 0);
}

#[test]
fn test_manual_completion_delivers_buffer() {
    let (mock, port) = open_mock_port("MOCK0");
    mock.set_completion_mode(CompletionMode::Manual);

    let op = port.begin_read(3).unwrap();
    assert!(!op.is_completed());

    let handles = mock.take_submitted();
    assert_eq!(handles.len(), 1);
    handles[0].with_buffer(|buf| buf.copy_from_slice(b"abc"));
    assert!(handles[0].complete(3, None));

    let mut buf = [0u8; 3];
    assert_eq!(port.end_read(&op, &mut buf).unwrap(), 3);
    assert_eq!(&buf, b"abc");
}
