//! Tests for audit sink

use std::sync::Arc;

use parking_lot::Mutex;
use prometheus_operations::core::{
    AuditDelegate, AuditSink, CancellationReason, IdentityRegistry, InMemoryAuditSink, Task,
    TaskDelegate, build_audit_event,
};

#[test]
fn test_in_memory_audit_sink() {
    let mut sink = InMemoryAuditSink::new(10);

    let event = build_audit_event("task1", "backup", "did_finish", Some("payload".to_string()));

    sink.record(event.clone());
    assert_eq!(sink.events().len(), 1);

    let events = sink.events();
    assert_eq!(events[0].event_id, event.event_id);
    assert_eq!(events[0].task_id, "task1");
    assert_eq!(events[0].action, "did_finish");
}

#[test]
fn test_audit_sink_overflow() {
    let mut sink = InMemoryAuditSink::new(2);

    sink.record(build_audit_event("task1", "a", "will_execute", None));
    sink.record(build_audit_event("task2", "b", "will_execute", None));
    sink.record(build_audit_event("task3", "c", "will_execute", None));

    let events = sink.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].task_id, "task2"); // First one popped
    assert_eq!(events[1].task_id, "task3");
}

#[test]
fn test_build_audit_event() {
    let event = build_audit_event("task1", "backup", "cancelled", Some("disk full".to_string()));

    assert_eq!(event.task_id, "task1");
    assert_eq!(event.task, "backup");
    assert_eq!(event.action, "cancelled");
    assert_eq!(event.payload, Some("disk full".to_string()));
    assert!(event.created_at_ms > 0);
    assert!(!event.event_id.is_empty());
}

#[test]
fn test_audit_delegate_records_lifecycle_once() {
    let sink = Arc::new(Mutex::new(InMemoryAuditSink::new(16)));
    let task = Task::from_fn("audited", |_| Ok(()));
    task.set_delegate(Arc::new(AuditDelegate::new(Arc::clone(&sink))) as Arc<dyn TaskDelegate>);

    task.enqueue(Arc::new(IdentityRegistry::new())).unwrap();
    assert!(task.is_ready());
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    rt.block_on(task.start());
    task.finish();

    let sink = sink.lock();
    assert_eq!(sink.count("will_execute"), 1);
    assert_eq!(sink.count("did_finish"), 1);
    assert_eq!(sink.count("cancelled"), 0);
}

#[test]
fn test_audit_delegate_records_cancellation_reason() {
    let sink = Arc::new(Mutex::new(InMemoryAuditSink::new(16)));
    let task = Task::from_fn("audited", |_| Ok(()));
    task.set_delegate(Arc::new(AuditDelegate::new(Arc::clone(&sink))) as Arc<dyn TaskDelegate>);

    task.cancel(CancellationReason::message("operator request"));
    task.finish();

    let events = sink.lock().events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].action, "cancelled");
    assert_eq!(events[0].payload.as_deref(), Some("operator request"));
}
