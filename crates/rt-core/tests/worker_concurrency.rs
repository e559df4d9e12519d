//! The run lock admits one device operation at a time.

use rt_common::{BackupName, OperationKind};
use rt_config::Policy;
use rt_core::cancel::CancellationToken;
use rt_core::pipeline::{
    OperationOutcome, OperationRequest, PipelineError, WarningAcknowledgement,
};
use rt_core::test_utils::{CollectingSink, FakeDevice};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const ACK: WarningAcknowledgement = WarningAcknowledgement::Acknowledged;
const WAIT: Duration = Duration::from_secs(10);

/// A sink that parks the worker at the probing stage until released.
struct Gate {
    sink: Arc<CollectingSink>,
    entered: Receiver<()>,
    release: Sender<()>,
}

fn gated_sink() -> Gate {
    let (entered_tx, entered) = mpsc::channel();
    let (release, release_rx) = mpsc::channel::<()>();
    let entered_tx = Mutex::new(entered_tx);
    let release_rx = Mutex::new(release_rx);
    let sink = CollectingSink::with_hook(move |event| {
        if event.as_operation().is_some_and(|p| p.stage == "probing") {
            let _ = entered_tx.lock().unwrap().send(());
            let _ = release_rx.lock().unwrap().recv_timeout(WAIT);
        }
    });
    Gate {
        sink: Arc::new(sink),
        entered,
        release,
    }
}

fn check() -> OperationRequest {
    OperationRequest::new(OperationKind::Check)
}

#[test]
fn test_second_submit_fails_while_first_runs() {
    let device = FakeDevice::new();
    let tools = device.romtools(&Policy::default());
    let gate = gated_sink();

    let first = tools
        .request_operation(check(), ACK, gate.sink.clone())
        .unwrap();
    gate.entered.recv_timeout(WAIT).unwrap();
    assert!(tools.pipeline().lock().is_held());

    let second = tools
        .request_operation(check(), ACK, Arc::new(CollectingSink::new()))
        .err()
        .expect("lock is held");
    assert!(matches!(second, PipelineError::ConcurrentOperation));

    let inline = tools
        .run_operation(
            &check(),
            ACK,
            &CollectingSink::new(),
            &CancellationToken::new(),
        )
        .unwrap_err();
    assert!(matches!(inline, PipelineError::ConcurrentOperation));

    gate.release.send(()).unwrap();
    let report = first.wait().unwrap();
    assert!(report.outcome.is_completed(), "{:?}", report.outcome);
    assert!(!tools.pipeline().lock().is_held());

    let third = tools
        .request_operation(check(), ACK, Arc::new(CollectingSink::new()))
        .unwrap();
    assert!(third.wait().unwrap().outcome.is_completed());
}

#[test]
fn test_facade_operations_share_the_run_lock() {
    let device = FakeDevice::new();
    let tools = device.romtools(&Policy::default());
    let gate = gated_sink();

    let handle = tools
        .request_operation(check(), ACK, gate.sink.clone())
        .unwrap();
    gate.entered.recv_timeout(WAIT).unwrap();

    let err = tools
        .create_backup(&BackupName::new("during-run").unwrap(), &[])
        .unwrap_err();
    assert_eq!(err.code(), 42);
    let err = tools.setup_retention().unwrap_err();
    assert_eq!(err.code(), 42);
    assert!(tools.list_backups().unwrap().is_empty());

    gate.release.send(()).unwrap();
    handle.wait().unwrap();
    tools
        .create_backup(&BackupName::new("after-run").unwrap(), &[])
        .unwrap();
    assert_eq!(tools.list_backups().unwrap().len(), 1);
}

#[test]
fn test_cancel_through_handle() {
    let device = FakeDevice::new();
    let tools = device.romtools(&Policy::default());
    let gate = gated_sink();

    let handle = tools
        .request_operation(OperationRequest::new(OperationKind::Unlock), ACK, gate.sink.clone())
        .unwrap();
    gate.entered.recv_timeout(WAIT).unwrap();
    handle.cancel();
    gate.release.send(()).unwrap();

    let report = handle.wait().unwrap();
    assert_eq!(
        report.outcome,
        OperationOutcome::Cancelled {
            stage: "gating".to_string()
        }
    );
    assert!(device.mutating_calls().is_empty());
    assert!(!tools.pipeline().lock().is_held());
}

#[test]
fn test_wait_timeout_reports_running() {
    let device = FakeDevice::new();
    let tools = device.romtools(&Policy::default());
    let gate = gated_sink();

    let handle = tools
        .request_operation(check(), ACK, gate.sink.clone())
        .unwrap();
    gate.entered.recv_timeout(WAIT).unwrap();
    assert!(handle.wait_timeout(Duration::from_millis(20)).is_none());

    gate.release.send(()).unwrap();
    let report = handle.wait_timeout(WAIT).expect("finished").unwrap();
    assert!(report.outcome.is_completed());
    assert_eq!(gate.sink.percents().last(), Some(&100.0));
}
