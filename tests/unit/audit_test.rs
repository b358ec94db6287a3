//! Tests for audit sinks

use ml_scheduler::core::{build_audit_event, AuditAction, AuditSink, InMemoryAuditSink};
use serde_json::json;

#[test]
fn test_in_memory_audit_sink() {
    let sink = InMemoryAuditSink::new(10);

    let event = build_audit_event("row1", AuditAction::Report, Some(json!({"loss": 0.5})));
    sink.record(event.clone());
    assert_eq!(sink.events().len(), 1);

    let events = sink.events();
    assert_eq!(events[0].event_id, event.event_id);
    assert_eq!(events[0].row_id, "row1");
    assert_eq!(events[0].action, AuditAction::Report);
}

#[test]
fn test_audit_sink_overflow() {
    let sink = InMemoryAuditSink::new(2);

    sink.record(build_audit_event("row1", AuditAction::Submit, None));
    sink.record(build_audit_event("row2", AuditAction::Submit, None));
    sink.record(build_audit_event("row3", AuditAction::Submit, None));

    let events = sink.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].row_id, "row2"); // First one popped
    assert_eq!(events[1].row_id, "row3");
}

#[test]
fn test_zero_capacity_sink_keeps_nothing() {
    let sink = InMemoryAuditSink::new(0);
    sink.record(build_audit_event("row1", AuditAction::Start, None));
    assert!(sink.events().is_empty());
}

#[test]
fn test_build_audit_event() {
    let event = build_audit_event("row1", AuditAction::Finish, Some(json!({"status": "done"})));
    let other = build_audit_event("row1", AuditAction::Finish, None);

    assert_eq!(event.row_id, "row1");
    assert_eq!(event.action, AuditAction::Finish);
    assert_eq!(event.payload, Some(json!({"status": "done"})));
    assert!(event.created_at_ms > 0);
    assert_ne!(event.event_id, other.event_id);
}
