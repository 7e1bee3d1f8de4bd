//! Tests for utility functions

use prometheus_operations::core::{FlowId, TaskId, TaskIdentity};
use prometheus_operations::util::now_ms;
use uuid::Uuid;

#[test]
fn test_now_ms_is_after_epoch() {
    let first = now_ms();
    let second = now_ms();
    assert!(first > 0);
    assert!(second >= first);
}

#[test]
fn test_task_ids_are_unique() {
    assert_ne!(TaskId::new(), TaskId::new());
    assert_ne!(FlowId::new(), FlowId::new());
}

#[test]
fn test_identity_display() {
    let id = Uuid::nil();
    let identity = TaskIdentity::new("backup", id);
    assert_eq!(identity.to_string(), format!("backup:{id}"));
}

#[test]
fn test_identity_equality_uses_kind_and_id() {
    let id = Uuid::new_v4();
    assert_eq!(TaskIdentity::new("backup", id), TaskIdentity::new("backup", id));
    assert_ne!(TaskIdentity::new("backup", id), TaskIdentity::new("restore", id));
}
