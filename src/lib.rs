//! # Prometheus Operations
//!
//! An in-process operation scheduling and transactional composition framework.
//!
//! Work is modelled as [`Task`](core::Task)s with an explicit state machine.
//! A [`Scheduler`](core::Scheduler) holds submitted tasks until they are ready,
//! then runs them on a bounded set of dedicated worker threads.
//!
//! ## Core Problem Solved
//!
//! Higher layers (backup coordinators, sync flows, key rotation) need to run
//! chains of operations where:
//!
//! - **Readiness is conditional**: a task waits for its dependencies and for
//!   exclusive use of its logical identity
//! - **Identity is exclusive**: at most one task per [`TaskIdentity`](core::TaskIdentity)
//!   executes at any instant, across every scheduler sharing a registry
//! - **Effects are atomic**: steps of a [`Composition`](core::Composition) share one
//!   transactional context that is committed only if every step succeeded
//! - **Failures keep their origin**: a [`CancellationReason`](core::CancellationReason)
//!   nests one layer per composition, so the failing step deep in a chain stays
//!   inspectable from the outermost caller
//!
//! ## Scheduler
//!
//! ```rust,ignore
//! use prometheus_operations::config::SchedulerConfig;
//! use prometheus_operations::core::{Scheduler, Task, TaskIdentity};
//!
//! let scheduler = Scheduler::new(SchedulerConfig::new("coordinators").with_worker_count(4))?;
//!
//! let identity = TaskIdentity::unique("backup");
//! let first = Task::from_fn_with_identity("backup-1", identity.clone(), |_| Ok(()));
//! let second = Task::from_fn_with_identity("backup-2", identity, |_| Ok(()));
//! scheduler.submit(&first)?;
//! scheduler.add_and_await(&second).await?; // never overlaps `first`
//! ```
//!
//! ## Composition
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use prometheus_operations::core::{ContextCreator, ContextualTask, FlowId};
//!
//! let creator: Arc<dyn ContextCreator<MyContext>> = Arc::new(|_flow: FlowId| MyContext::default());
//! let steps = vec![
//!     ContextualTask::from_fn("fetch", |ctx: &mut MyContext, _| ctx.fetch()),
//!     ContextualTask::from_fn("store", |ctx: &mut MyContext, _| ctx.store()),
//! ];
//! let report = scheduler.run_composition(creator, steps).await?;
//! assert!(report.committed);
//! ```
//!
//! For complete examples, see:
//! - `tests/composition_test.rs` - Composition semantics
//! - `tests/scheduler_test.rs` - Mutual exclusion under contention

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Task state machine, scheduler, compositions and wrappers.
pub mod core;
/// Configuration models for schedulers.
pub mod config;
/// Builders to construct schedulers from configuration.
pub mod builders;
/// Caller-facing API surface.
pub mod runtime;
/// Shared utilities.
pub mod util;
