//! Bounded-concurrency scheduler executing tasks on dedicated worker threads.
//!
//! A [`Scheduler`] holds submitted tasks until they become ready, then hands them
//! to a fixed set of OS worker threads. Each worker owns a single-threaded tokio
//! runtime, so task bodies may be `async` without blocking the caller's runtime.
//!
//! # Readiness
//!
//! A dispatcher thread re-evaluates pending tasks with [`Task::tick`] whenever a
//! relevant input changes: a task is submitted or cancelled, a dependency
//! finishes, or the identity registry releases an identity. Wake signals are
//! coalesced through a one-slot channel, so there is no polling.
//!
//! # Example
//!
//! ```rust,ignore
//! use prometheus_operations::config::SchedulerConfig;
//! use prometheus_operations::core::{Scheduler, Task};
//!
//! let scheduler = Scheduler::new(SchedulerConfig::new("coordinators").with_worker_count(4))?;
//! let task = Task::from_fn("refresh", |_| Ok(()));
//! scheduler.add_and_await(&task).await?;
//! scheduler.shutdown();
//! ```
//!
//! [`Task::tick`]: crate::core::Task::tick

mod native;

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

pub use native::Scheduler;

/// Statistics about scheduler utilization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    /// Number of worker threads.
    pub worker_count: usize,
    /// Tasks waiting for their conditions.
    pub pending_tasks: u64,
    /// Tasks handed to workers and not finished yet.
    pub active_tasks: u64,
    /// Total tasks that finished without cancellation.
    pub completed_tasks: u64,
    /// Total tasks that finished cancelled.
    pub cancelled_tasks: u64,
    /// Total tasks submitted.
    pub submitted_tasks: u64,
}

/// Internal counters for scheduler statistics (thread-safe).
#[derive(Debug, Default)]
pub(crate) struct SchedulerCounters {
    pub pending_tasks: AtomicU64,
    pub active_tasks: AtomicU64,
    pub completed_tasks: AtomicU64,
    pub cancelled_tasks: AtomicU64,
    pub submitted_tasks: AtomicU64,
}

impl SchedulerCounters {
    /// Get a snapshot of current statistics.
    pub fn snapshot(&self, worker_count: usize) -> SchedulerStats {
        SchedulerStats {
            worker_count,
            pending_tasks: self.pending_tasks.load(Ordering::Relaxed),
            active_tasks: self.active_tasks.load(Ordering::Relaxed),
            completed_tasks: self.completed_tasks.load(Ordering::Relaxed),
            cancelled_tasks: self.cancelled_tasks.load(Ordering::Relaxed),
            submitted_tasks: self.submitted_tasks.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_stats_default() {
        let stats = SchedulerStats::default();
        assert_eq!(stats.worker_count, 0);
        assert_eq!(stats.active_tasks, 0);
        assert_eq!(stats.completed_tasks, 0);
    }

    #[test]
    fn test_scheduler_counters_snapshot() {
        let counters = SchedulerCounters::default();
        counters.submitted_tasks.fetch_add(10, Ordering::Relaxed);
        counters.completed_tasks.fetch_add(5, Ordering::Relaxed);
        counters.cancelled_tasks.fetch_add(2, Ordering::Relaxed);

        let stats = counters.snapshot(4);
        assert_eq!(stats.worker_count, 4);
        assert_eq!(stats.submitted_tasks, 10);
        assert_eq!(stats.completed_tasks, 5);
        assert_eq!(stats.cancelled_tasks, 2);
    }
}
