mod common;

use common::{small_device_metadata, Event, Script, ScriptedTransport};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::bounded;
use sump_rs::protocol::{CMD_RUN, SLA_V1};
use sump_rs::{
    CaptureConfiguration, CaptureOutcome, CaptureRequest, CaptureTask, NullSink, SessionState,
    SumpDevice,
};

const PORT: &str = "/dev/ttyTEST1";

fn request(depth: u32) -> CaptureRequest {
    let config = CaptureConfiguration::builder()
        .sample_depth(depth)
        .group(1, false)
        .group(2, false)
        .group(3, false)
        .build()
        .unwrap();
    CaptureRequest::new(PORT, 115_200, config)
}

#[test]
fn test_cancel_while_waiting_for_trigger() {
    let transport = ScriptedTransport::new(Script {
        ids: vec![SLA_V1],
        metadata: small_device_metadata(),
        hold_samples: true,
        ..Script::default()
    });
    let device = SumpDevice::new(Arc::new(transport.clone()));

    let task = CaptureTask::spawn(device, request(16), NullSink, NullSink).unwrap();
    assert!(transport.wait_for(&Event::Command(CMD_RUN), Duration::from_secs(5)));
    assert!(!task.is_finished());

    task.cancel();
    task.cancel();
    let (device, result) = task.join();

    let outcome = result.unwrap();
    let CaptureOutcome::Cancelled(Some(trace)) = outcome else {
        unreachable!("readout had started, expected a partial trace");
    };
    assert_eq!(trace.len(), 16);
    assert!(trace.values().iter().all(|v| *v == 0));

    // one forced close from the cancel, one from the detach after it
    let events = transport.events();
    let shutdown = events
        .iter()
        .position(|e| *e == Event::Shutdown)
        .unwrap();
    let closes_before = events[..shutdown]
        .iter()
        .filter(|e| **e == Event::Close)
        .count();
    assert_eq!(closes_before, 1);
    assert_eq!(transport.count(&Event::Shutdown), 1);
    assert_eq!(transport.count(&Event::Close), 2);
    assert_eq!(device.state(), SessionState::Detached);
}

#[test]
fn test_try_join_returns_running_task() {
    let transport = ScriptedTransport::new(Script {
        ids: vec![SLA_V1],
        metadata: small_device_metadata(),
        hold_samples: true,
        ..Script::default()
    });
    let device = SumpDevice::new(Arc::new(transport.clone()));

    let task = CaptureTask::spawn(device, request(8), NullSink, NullSink).unwrap();
    assert!(transport.wait_for(&Event::Command(CMD_RUN), Duration::from_secs(5)));

    let task = match task.try_join() {
        Ok(_) => unreachable!("capture cannot finish before the trigger fires"),
        Err(task) => task,
    };
    task.cancel_token().cancel();
    let (_device, result) = task.join();
    assert!(result.unwrap().is_cancelled());
}

#[test]
fn test_completed_capture_returns_device_for_reuse() {
    let transport = ScriptedTransport::new(Script {
        ids: vec![SLA_V1, SLA_V1],
        metadata: small_device_metadata(),
        samples: vec![8, 7, 6, 5, 4, 3, 2, 1],
        ..Script::default()
    });
    let device = SumpDevice::new(Arc::new(transport.clone()));
    let (progress_tx, progress_rx) = bounded::<u8>(4);
    let (sample_tx, sample_rx) = bounded::<u32>(4);

    let task = CaptureTask::spawn(device, request(8), progress_tx, sample_tx).unwrap();
    let (device, result) = task.join();

    let trace = result.unwrap().into_trace().unwrap();
    assert_eq!(trace.values(), &[1, 2, 3, 4, 5, 6, 7, 8]);

    // full sinks drop events instead of stalling the capture
    assert_eq!(progress_rx.try_iter().count(), 4);
    assert_eq!(sample_rx.try_iter().collect::<Vec<u32>>(), vec![8, 7, 6, 5]);

    let task = CaptureTask::spawn(device, request(8), NullSink, NullSink).unwrap();
    let (device, result) = task.join();
    assert!(!result.unwrap().is_cancelled());
    assert_eq!(transport.count(&Event::Shutdown), 2);
    assert_eq!(device.state(), SessionState::Detached);
}

#[test]
fn test_cancelled_device_can_capture_again() {
    let transport = ScriptedTransport::new(Script {
        ids: vec![SLA_V1, SLA_V1],
        metadata: small_device_metadata(),
        hold_samples: true,
        ..Script::default()
    });
    let device = SumpDevice::new(Arc::new(transport.clone()));

    let task = CaptureTask::spawn(device, request(8), NullSink, NullSink).unwrap();
    assert!(transport.wait_for(&Event::Command(CMD_RUN), Duration::from_secs(5)));
    task.cancel();
    let (device, _) = task.join();
    assert!(device.cancel_token().is_cancelled());

    // spawning clears the earlier cancellation
    let task = CaptureTask::spawn(device, request(8), NullSink, NullSink).unwrap();
    assert!(!task.cancel_token().is_cancelled());
    task.cancel();
    let (_device, result) = task.join();
    assert!(result.unwrap().is_cancelled());
}

#[test]
fn test_cancel_during_readout_keeps_words_read() {
    let transport = ScriptedTransport::new(Script {
        ids: vec![SLA_V1],
        metadata: small_device_metadata(),
        samples: vec![8, 7, 6],
        block_when_drained: true,
        ..Script::default()
    });
    let device = SumpDevice::new(Arc::new(transport.clone()));
    let (sample_tx, sample_rx) = bounded::<u32>(8);

    let task = CaptureTask::spawn(device, request(8), NullSink, sample_tx).unwrap();
    for expected in [8, 7, 6] {
        assert_eq!(sample_rx.recv_timeout(Duration::from_secs(5)), Ok(expected));
    }
    assert!(!task.is_finished());

    task.cancel();
    let (device, result) = task.join();

    let CaptureOutcome::Cancelled(Some(trace)) = result.unwrap() else {
        unreachable!("readout was cancelled after three words");
    };
    assert_eq!(trace.values(), &[0, 0, 0, 0, 0, 6, 7, 8]);
    assert_eq!(transport.count(&Event::Shutdown), 1);
    assert_eq!(device.state(), SessionState::Detached);
}
