//! Caller-facing API surface.

pub mod api;

pub use api::{
    Health, SchedulerSnapshot, TaskStatusResponse, await_task, cancel_task, health,
    list_schedulers, submit_task, task_status,
};
