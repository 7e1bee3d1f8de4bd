//! Tests for error types

use prometheus_operations::core::{CancellationReason, SchedulerError};

#[test]
fn test_queue_full_error() {
    let err = SchedulerError::QueueFull("coordinators".to_string());
    assert_eq!(format!("{}", err), "queue full: coordinators");
}

#[test]
fn test_shutdown_error() {
    let err = SchedulerError::Shutdown;
    assert_eq!(format!("{}", err), "scheduler has been shut down");
}

#[test]
fn test_backend_error() {
    let err = SchedulerError::Backend("thread spawn failed".to_string());
    assert_eq!(format!("{}", err), "backend error: thread spawn failed");
}

#[test]
fn test_unfinished_dependency_message() {
    let reason = CancellationReason::UnfinishedDependency { index: 3 };
    assert_eq!(
        format!("{}", reason),
        "step 3 was started before its dependencies finished"
    );
    assert!(reason.step_path().is_empty());
}

#[test]
fn test_cancelled_error_exposes_nested_reason() {
    let inner = CancellationReason::wrapped(0, CancellationReason::message("disk full"));
    let err = SchedulerError::Cancelled(CancellationReason::wrapped(1, inner));

    let reason = err.cancellation_reason().expect("cancellation reason");
    assert_eq!(reason.step_path(), vec![1, 0]);
    assert_eq!(reason.root_cause().to_string(), "disk full");
}

#[test]
fn test_non_cancellation_errors_have_no_reason() {
    assert!(SchedulerError::Shutdown.cancellation_reason().is_none());
    assert!(SchedulerError::InvalidConfig("x".into()).cancellation_reason().is_none());
}
