//! Data path integration tests
//!
//! Receive delivery and replenishment, transmit reporting, buffer ownership,
//! cancellation draining and device loss, all against a scripted transport.
//!
//! Run with: `cargo test -p driver --test data_path_tests`

use driver::testing::{CancelPolicy, EndpointLog, MockTransport, RecordingEndpoint};
use driver::usb::BufferPool;
use driver::{
    BufferState, DeviceState, DeviceStateMachine, DriverError, DriverSettings, EndpointKind,
    QueuedToken, TransferStatus, TransportError, TransportEvent,
};
use std::sync::Arc;
use std::time::Duration;

fn enabled(settings: DriverSettings) -> (Arc<MockTransport>, DeviceStateMachine, EndpointLog) {
    let mock = Arc::new(MockTransport::new(0x0BDA, 0x8812));
    let (endpoint, log) = RecordingEndpoint::new();
    let mut machine =
        DeviceStateMachine::probe(mock.clone(), settings, Box::new(endpoint)).unwrap();
    machine.bring_up().unwrap();
    (mock, machine, log)
}

/// Every buffer is in exactly one state and the total never changes
fn assert_accounted(pool: &BufferPool) {
    let total = pool.count(BufferState::Free)
        + pool.count(BufferState::PostedForReceive)
        + pool.count(BufferState::PostedForTransmit)
        + pool.count(BufferState::ReadyForDelivery);
    assert_eq!(total, pool.capacity());
    assert_eq!(pool.count(BufferState::ReadyForDelivery), 0);
}

// ============================================================================
// Receive
// ============================================================================

#[test]
fn test_received_frames_delivered_in_order_and_replenished() {
    let (mock, mut machine, log) = enabled(DriverSettings::default());

    mock.complete_receive(b"first").unwrap();
    mock.complete_receive(b"second").unwrap();
    mock.complete_receive(b"third").unwrap();
    assert_eq!(machine.process_completions(), 3);

    assert_eq!(
        log.frames(),
        vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()]
    );
    assert_eq!(mock.pending_count(EndpointKind::BulkIn), 8);
    assert_eq!(machine.stats().rx_frames, 3);
    assert_eq!(machine.stats().rx_bytes, 16);
    assert_accounted(machine.rx_pool());
}

#[test]
fn test_empty_receive_is_not_delivered() {
    let (mock, mut machine, log) = enabled(DriverSettings::default());

    mock.complete_receive(&[]).unwrap();
    machine.process_completions();

    assert!(log.frames().is_empty());
    assert_eq!(mock.pending_count(EndpointKind::BulkIn), 8);
}

#[test]
fn test_transient_receive_error_is_reposted() {
    let (mock, mut machine, log) = enabled(DriverSettings::default());

    let transient = [
        TransferStatus::Stall,
        TransferStatus::Timeout,
        TransferStatus::Overflow,
        TransferStatus::Error,
    ];
    for status in transient {
        assert!(status.is_transient());
        mock.fail_next(EndpointKind::BulkIn, status).unwrap();
    }
    machine.process_completions();

    assert!(log.frames().is_empty());
    assert_eq!(machine.state(), DeviceState::Enabled);
    assert_eq!(mock.pending_count(EndpointKind::BulkIn), 8);
    assert_eq!(machine.stats().rx_transient_errors, 4);
    assert_eq!(machine.rx_pool().outstanding(), 8);
}

#[test]
fn test_receive_device_gone_forces_close() {
    let (mock, mut machine, log) = enabled(DriverSettings::default());

    mock.fail_next(EndpointKind::BulkIn, TransferStatus::DeviceGone).unwrap();
    machine.process_completions();

    // Remaining receives were cancelled immediately and drained in the same pass.
    assert_eq!(machine.state(), DeviceState::Closed);
    assert_eq!(log.link_down_count(), 1);
    assert!(machine.rx_pool().all_free());
    assert_eq!(mock.release_count(), 1);
}

#[test]
fn test_receive_exhaustion_degrades_without_double_ownership() {
    let mock = Arc::new(MockTransport::new(0x0BDA, 0x8812));
    mock.set_cancel_policy(CancelPolicy::Manual);
    let settings = DriverSettings {
        drain_timeout: Duration::from_millis(20),
        ..DriverSettings::default()
    };
    let (endpoint, log) = RecordingEndpoint::new();
    let mut machine =
        DeviceStateMachine::probe(mock.clone(), settings, Box::new(endpoint)).unwrap();
    machine.bring_up().unwrap();

    // Nothing answers the cancellations; every receive buffer is leaked.
    let report = machine.bring_down().unwrap();
    assert_eq!(report.leaked, 8);
    assert_eq!(machine.rx_pool().count(BufferState::Free), 0);

    // Re-enable finds the pool empty and skips priming.
    machine.bring_up().unwrap();
    assert_eq!(machine.state(), DeviceState::Enabled);
    assert_eq!(machine.stats().rx_resubmit_skipped, 1);
    assert_eq!(mock.submitted_count(), 8);
    assert_accounted(machine.rx_pool());

    // The leaked transfers finally come home and each frees a slot.
    assert_eq!(mock.complete_all(TransferStatus::Cancelled), 8);
    assert_eq!(machine.process_completions(), 8);

    assert_eq!(mock.pending_count(EndpointKind::BulkIn), 8);
    assert_eq!(machine.rx_pool().count(BufferState::PostedForReceive), 8);
    assert_eq!(machine.stats().unknown_completions, 0);
    assert_accounted(machine.rx_pool());

    // Steady state resumes.
    mock.complete_receive(&[7; 32]).unwrap();
    machine.process_completions();
    assert_eq!(log.frames(), vec![vec![7; 32]]);
    assert_eq!(mock.pending_count(EndpointKind::BulkIn), 8);
}

// ============================================================================
// Transmit
// ============================================================================

#[test]
fn test_transmit_reports_completion() {
    let (mock, mut machine, log) = enabled(DriverSettings::default());

    let first = machine.transmit(&[1; 100]).unwrap();
    let second = machine.transmit(&[2; 200]).unwrap();
    assert_ne!(first, second);
    assert_eq!(mock.pending_count(EndpointKind::BulkOut), 2);
    assert_eq!(machine.tx_pool().count(BufferState::PostedForTransmit), 2);

    mock.complete_transmit().unwrap();
    mock.complete_transmit().unwrap();
    machine.process_completions();

    assert_eq!(log.transmit_completed(), vec![first, second]);
    assert_eq!(machine.stats().tx_frames, 2);
    assert_eq!(machine.stats().tx_bytes, 300);
    assert!(machine.tx_pool().all_free());
}

#[test]
fn test_transmit_failure_reported_not_retried() {
    let (mock, mut machine, log) = enabled(DriverSettings::default());

    let token = machine.transmit(&[0xFF; 60]).unwrap();
    mock.fail_next(EndpointKind::BulkOut, TransferStatus::Stall).unwrap();
    machine.process_completions();

    assert_eq!(log.transmit_failed(), vec![(token, TransferStatus::Stall)]);
    assert_eq!(mock.pending_count(EndpointKind::BulkOut), 0);
    assert_eq!(machine.stats().tx_failed, 1);
    assert!(machine.tx_pool().all_free());
}

#[test]
fn test_transmit_busy_when_pool_exhausted() {
    let settings = DriverSettings {
        tx_buffers: 2,
        ..DriverSettings::default()
    };
    let (mock, mut machine, _log) = enabled(settings);

    machine.transmit(&[1]).unwrap();
    machine.transmit(&[2]).unwrap();
    assert_eq!(machine.transmit(&[3]), Err(DriverError::Busy));
    assert_eq!(mock.pending_count(EndpointKind::BulkOut), 2);

    mock.complete_transmit().unwrap();
    machine.process_completions();
    assert!(machine.transmit(&[3]).is_ok());
}

#[test]
fn test_oversized_frame_rejected() {
    let (mock, mut machine, _log) = enabled(DriverSettings::default());

    let result = machine.transmit(&vec![0u8; 4096]);

    assert_eq!(
        result,
        Err(DriverError::FrameTooLarge {
            len: 4096,
            max: 2048
        })
    );
    assert_eq!(mock.pending_count(EndpointKind::BulkOut), 0);
    assert!(machine.tx_pool().all_free());
}

#[test]
fn test_rejected_submit_returns_buffer() {
    let (mock, mut machine, _log) = enabled(DriverSettings::default());
    mock.reject_submits(Some(TransportError::Io));

    assert!(machine.transmit(&[1, 2, 3]).is_err());
    assert!(machine.tx_pool().all_free());
    assert_eq!(machine.state(), DeviceState::Enabled);
}

// ============================================================================
// Teardown
// ============================================================================

#[test]
fn test_bring_down_waits_for_every_completion() {
    let mock = Arc::new(MockTransport::new(0x0BDA, 0x8812));
    mock.set_cancel_policy(CancelPolicy::Deferred(Duration::from_millis(5)));
    let settings = DriverSettings {
        rx_buffers: 4,
        ..DriverSettings::default()
    };
    let (endpoint, log) = RecordingEndpoint::new();
    let mut machine =
        DeviceStateMachine::probe(mock.clone(), settings, Box::new(endpoint)).unwrap();
    machine.bring_up().unwrap();

    let tokens: Vec<QueuedToken> = (0..3)
        .map(|i| machine.transmit(&[i; 10]).unwrap())
        .collect();

    let report = machine.bring_down().unwrap();

    // N = 4 receives, M = 3 transmits
    assert_eq!(report.completed, 7);
    assert_eq!(report.leaked, 0);
    assert_eq!(mock.completed_count(), 7);
    assert_eq!(machine.state(), DeviceState::Disabled);
    assert!(machine.rx_pool().all_free());
    assert!(machine.tx_pool().all_free());

    // Deferred cancellations may land in any order across endpoints.
    let mut failed: Vec<QueuedToken> = log
        .transmit_failed()
        .into_iter()
        .map(|(t, _)| t)
        .collect();
    failed.sort();
    assert_eq!(failed, tokens);
    assert!(
        log.transmit_failed()
            .iter()
            .all(|(_, status)| *status == TransferStatus::Cancelled)
    );
    assert!(log.frames().is_empty());
}

#[test]
fn test_device_gone_with_outstanding_transfers() {
    let mock = Arc::new(MockTransport::new(0x0BDA, 0x8812));
    mock.set_cancel_policy(CancelPolicy::Manual);
    let settings = DriverSettings {
        rx_buffers: 2,
        ..DriverSettings::default()
    };
    let (endpoint, log) = RecordingEndpoint::new();
    let mut machine =
        DeviceStateMachine::probe(mock.clone(), settings, Box::new(endpoint)).unwrap();
    machine.bring_up().unwrap();
    let token = machine.transmit(&[9; 40]).unwrap();
    assert_eq!(mock.submitted_count(), 3);

    machine.handle_transport_event(TransportEvent::DeviceGone);

    assert_eq!(machine.state(), DeviceState::Closing);
    assert_eq!(mock.cancel_requests().len(), 3);
    assert_eq!(log.link_down_count(), 1);
    assert_eq!(machine.transmit(&[1]), Err(DriverError::NotReady(DeviceState::Closing)));

    // Repeated notifications change nothing.
    machine.handle_transport_event(TransportEvent::DeviceGone);
    assert_eq!(mock.cancel_requests().len(), 3);

    assert_eq!(mock.complete_all(TransferStatus::DeviceGone), 3);
    assert_eq!(machine.process_completions(), 3);

    assert_eq!(machine.state(), DeviceState::Closed);
    assert_eq!(machine.stats().unknown_completions, 0);
    assert!(machine.rx_pool().all_free());
    assert!(machine.tx_pool().all_free());
    assert_eq!(log.transmit_failed(), vec![(token, TransferStatus::DeviceGone)]);
    assert_eq!(mock.release_count(), 1);

    // Detach after a forced close is a no-op.
    machine.detach().unwrap();
    assert_eq!(mock.release_count(), 1);
}

#[test]
fn test_late_completion_after_close_is_harmless() {
    let mock = Arc::new(MockTransport::new(0x0BDA, 0x8812));
    mock.set_cancel_policy(CancelPolicy::Manual);
    let settings = DriverSettings {
        rx_buffers: 1,
        drain_timeout: Duration::from_millis(10),
        ..DriverSettings::default()
    };
    let (endpoint, log) = RecordingEndpoint::new();
    let mut machine =
        DeviceStateMachine::probe(mock.clone(), settings, Box::new(endpoint)).unwrap();
    machine.bring_up().unwrap();
    machine.detach().unwrap();
    assert_eq!(machine.rx_pool().count(BufferState::PostedForReceive), 1);

    mock.complete_receive(b"late").unwrap();
    machine.process_completions();

    assert!(log.frames().is_empty());
    assert!(machine.rx_pool().all_free());
    assert_eq!(machine.state(), DeviceState::Closed);
}
