//! API-facing request/response models and caller helpers.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::core::{
    CancellationReason, Scheduler, SchedulerError, SchedulerStats, Task, TaskId, TaskIdentity,
    TaskState,
};

/// Task status response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusResponse {
    /// Task identifier.
    pub task_id: TaskId,
    /// Task name.
    pub name: String,
    /// Current state.
    pub state: TaskState,
    /// Whether cancellation was requested.
    pub cancelled: bool,
    /// Cancellation reason, rendered with its full chain.
    pub reason: Option<String>,
    /// Step indices from the outermost composition layer to the failing step.
    pub step_path: Vec<usize>,
    /// Mutual exclusion identity.
    pub identity: Option<TaskIdentity>,
}

/// Scheduler snapshot data for listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSnapshot {
    /// Scheduler name.
    pub name: String,
    /// Worker threads.
    pub worker_count: usize,
    /// Max queue depth.
    pub max_queue_depth: usize,
    /// Live statistics.
    pub stats: SchedulerStats,
}

/// Health response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Health {
    /// Healthy flag.
    pub ok: bool,
    /// Registered schedulers.
    pub schedulers: usize,
    /// Unfinished tasks across all schedulers.
    pub in_flight: usize,
}

/// Snapshot a task for callers.
#[must_use]
pub fn task_status(task: &Task) -> TaskStatusResponse {
    let reason = task.cancellation_reason();
    TaskStatusResponse {
        task_id: task.id(),
        name: task.name().to_string(),
        state: task.state(),
        cancelled: reason.is_some(),
        step_path: reason.as_ref().map(CancellationReason::step_path).unwrap_or_default(),
        reason: reason.map(|r| r.to_string()),
        identity: task.identity().cloned(),
    }
}

/// Submit a task and report its status right after submission.
///
/// # Errors
///
/// Returns the submission error.
pub fn submit_task(scheduler: &Scheduler, task: &Task) -> Result<TaskStatusResponse, SchedulerError> {
    scheduler.submit(task)?;
    Ok(task_status(task))
}

/// Wait for a submitted task and report its final status.
pub async fn await_task(task: &Task) -> TaskStatusResponse {
    task.finished().await;
    task.log_reason_if_cancelled();
    task_status(task)
}

/// Cancel a task with a caller-supplied message.
pub fn cancel_task(scheduler: &Scheduler, task: &Task, message: impl Into<String>) -> TaskStatusResponse {
    scheduler.cancel(task, CancellationReason::message(message));
    task_status(task)
}

/// Build scheduler listings.
#[must_use]
pub fn list_schedulers(schedulers: &HashMap<String, Scheduler>) -> Vec<SchedulerSnapshot> {
    let mut snapshots: Vec<SchedulerSnapshot> = schedulers
        .iter()
        .map(|(name, scheduler)| SchedulerSnapshot {
            name: name.clone(),
            worker_count: scheduler.config().worker_count,
            max_queue_depth: scheduler.config().max_queue_depth,
            stats: scheduler.stats(),
        })
        .collect();
    snapshots.sort_by(|a, b| a.name.cmp(&b.name));
    snapshots
}

/// Return a health payload.
#[must_use]
pub fn health(schedulers: &HashMap<String, Scheduler>) -> Health {
    Health {
        ok: !schedulers.is_empty(),
        schedulers: schedulers.len(),
        in_flight: schedulers.values().map(Scheduler::in_flight_count).sum(),
    }
}
