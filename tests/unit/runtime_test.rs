//! Tests for the caller-facing API

use std::collections::HashMap;

use prometheus_operations::config::SchedulerConfig;
use prometheus_operations::core::{CancellationReason, Scheduler, Task, TaskState};
use prometheus_operations::runtime::{
    await_task, cancel_task, health, list_schedulers, submit_task, task_status,
};

#[test]
fn test_task_status_of_new_task() {
    let task = Task::from_fn("status", |_| Ok(()));
    let status = task_status(&task);
    assert_eq!(status.state, TaskState::Initialized);
    assert_eq!(status.name, "status");
    assert!(!status.cancelled);
    assert!(status.reason.is_none());
}

#[test]
fn test_task_status_serializes_state_in_snake_case() {
    let task = Task::from_fn("status", |_| Ok(()));
    task.cancel(CancellationReason::wrapped(2, CancellationReason::message("boom")));
    let json = serde_json::to_value(task_status(&task)).unwrap();
    assert_eq!(json["state"], "initialized");
    assert_eq!(json["cancelled"], true);
    assert_eq!(json["step_path"], serde_json::json!([2]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_submit_and_await_task() {
    let scheduler = Scheduler::new(SchedulerConfig::new("api").with_worker_count(1)).unwrap();
    let task = Task::from_fn("api-task", |_| Ok(()));

    let submitted = submit_task(&scheduler, &task).unwrap();
    assert!(submitted.state >= TaskState::EvaluatingConditions);

    let finished = await_task(&task).await;
    assert_eq!(finished.state, TaskState::Finished);
    assert!(!finished.cancelled);
    scheduler.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_task_reports_reason() {
    let scheduler = Scheduler::new(SchedulerConfig::new("api").with_worker_count(1)).unwrap();
    let blocker = Task::from_fn("blocker", |_| Ok(()));
    let task = Task::from_fn("waiting", |_| Ok(()));
    task.add_dependency(&blocker).unwrap();
    submit_task(&scheduler, &task).unwrap();

    let status = cancel_task(&scheduler, &task, "operator request");
    assert!(status.cancelled);
    assert_eq!(status.reason.as_deref(), Some("operator request"));

    let finished = await_task(&task).await;
    assert_eq!(finished.state, TaskState::Finished);
    assert!(finished.cancelled);
    scheduler.shutdown();
}

#[test]
fn test_list_schedulers_and_health() {
    let mut schedulers = HashMap::new();
    schedulers.insert(
        "b".to_string(),
        Scheduler::new(SchedulerConfig::new("b").with_worker_count(1)).unwrap(),
    );
    schedulers.insert(
        "a".to_string(),
        Scheduler::new(SchedulerConfig::new("a").with_worker_count(2)).unwrap(),
    );

    let listing = list_schedulers(&schedulers);
    assert_eq!(listing.len(), 2);
    assert_eq!(listing[0].name, "a");
    assert_eq!(listing[0].worker_count, 2);

    let status = health(&schedulers);
    assert!(status.ok);
    assert_eq!(status.schedulers, 2);
    assert_eq!(status.in_flight, 0);

    for scheduler in schedulers.values() {
        scheduler.shutdown();
    }
}
