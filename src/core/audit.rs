//! Audit sink implementations.
//!
//! Provides an in-memory event log and a [`TaskDelegate`] that records task
//! lifecycle events into any [`AuditSink`].

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use super::task::{Task, TaskDelegate};
use crate::util::clock::now_ms;

/// Audit event structure.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    /// Event identifier.
    pub event_id: String,
    /// Related task identifier.
    pub task_id: String,
    /// Name of the related task.
    pub task: String,
    /// Action taken (`will_execute`, `did_finish`, `cancelled`).
    pub action: String,
    /// Timestamp milliseconds.
    pub created_at_ms: u128,
    /// Additional context, such as a cancellation reason.
    pub payload: Option<String>,
}

/// Audit sink abstraction.
pub trait AuditSink: Send {
    /// Record an audit event.
    fn record(&mut self, event: AuditEvent);
}

/// In-memory audit sink for testing and dev.
pub struct InMemoryAuditSink {
    events: VecDeque<AuditEvent>,
    max_events: usize,
}

impl InMemoryAuditSink {
    /// Create a new in-memory sink with a bounded buffer.
    #[must_use]
    pub fn new(max_events: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(max_events),
            max_events,
        }
    }

    /// Retrieve a snapshot of stored events.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.iter().cloned().collect()
    }

    /// Number of stored events with the given action.
    #[must_use]
    pub fn count(&self, action: &str) -> usize {
        self.events.iter().filter(|e| e.action == action).count()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&mut self, event: AuditEvent) {
        if self.events.len() >= self.max_events {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }
}

/// Helper to build an audit event from context.
pub fn build_audit_event(
    task_id: impl Into<String>,
    task: impl Into<String>,
    action: impl Into<String>,
    payload: Option<String>,
) -> AuditEvent {
    AuditEvent {
        event_id: Uuid::new_v4().to_string(),
        task_id: task_id.into(),
        task: task.into(),
        action: action.into(),
        created_at_ms: now_ms(),
        payload,
    }
}

/// Completion delegate that writes lifecycle events to a sink.
pub struct AuditDelegate<S: AuditSink> {
    sink: Arc<Mutex<S>>,
}

impl<S: AuditSink> AuditDelegate<S> {
    /// Record into `sink`.
    pub fn new(sink: Arc<Mutex<S>>) -> Self {
        Self { sink }
    }

    /// The shared sink.
    #[must_use]
    pub fn sink(&self) -> Arc<Mutex<S>> {
        Arc::clone(&self.sink)
    }
}

impl<S: AuditSink + 'static> TaskDelegate for AuditDelegate<S> {
    fn task_will_execute(&self, task: &Task) {
        let event = build_audit_event(task.id().to_string(), task.name(), "will_execute", None);
        self.sink.lock().record(event);
    }

    fn task_did_finish(&self, task: &Task) {
        let reason = task.cancellation_reason();
        let action = if reason.is_some() { "cancelled" } else { "did_finish" };
        let event = build_audit_event(
            task.id().to_string(),
            task.name(),
            action,
            reason.map(|r| r.to_string()),
        );
        self.sink.lock().record(event);
    }
}
