//! Tests for error types

use std::path::PathBuf;

use ml_scheduler::core::SchedulerError;

#[test]
fn test_acquire_timeout_error() {
    let err = SchedulerError::AcquireTimeout {
        requested: 4,
        waited_ms: 1500,
    };
    assert_eq!(format!("{err}"), "timed out after 1500ms waiting for 4 units");
}

#[test]
fn test_process_failed_error() {
    let err = SchedulerError::ProcessFailed {
        code: Some(2),
        stdout: "loss=nan".into(),
    };
    assert_eq!(format!("{err}"), "process exited with code Some(2)");
}

#[test]
fn test_stale_lock_error() {
    let err = SchedulerError::StaleLock(PathBuf::from("runs.csv.lock"));
    assert_eq!(format!("{err}"), "stale lock file runs.csv.lock");
}

#[test]
fn test_cancelled_flag() {
    assert!(SchedulerError::Cancelled.is_cancelled());
    assert!(!SchedulerError::Config("x".into()).is_cancelled());
}

#[test]
fn test_io_error_conversion() {
    let err: SchedulerError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
    assert!(matches!(err, SchedulerError::Io(_)));
    assert_eq!(format!("{err}"), "gone");
}

#[test]
fn test_anyhow_round_trip() {
    let app: anyhow::Error = SchedulerError::Cancelled.into();
    assert!(app
        .downcast_ref::<SchedulerError>()
        .is_some_and(SchedulerError::is_cancelled));
}
