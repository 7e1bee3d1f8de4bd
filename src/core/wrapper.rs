//! Wrapper combinators that run one task inside another.
//!
//! Both flavors build an outer [`Task`] whose body runs the inner task on a
//! private serial scheduler sharing the outer task's identity registry, forwards
//! outer cancellation to the inner task, and returns only after the inner
//! terminal event was delivered to the [`WrapperHooks`]. An inner cancellation
//! becomes the outer reason `StepCancelled { index: 0, .. }`.
//!
//! - [`DelegatingWrapper`] (push): installs a [`TaskDelegate`] on the inner task.
//! - [`ObservingWrapper`] (pull): consumes the inner task's transition stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::error::CancellationReason;
use super::scheduler::Scheduler;
use super::task::{ExecutionContext, Operation, Task, TaskDelegate, TaskState};
use crate::config::SchedulerConfig;

/// Callbacks fired by a wrapper for the task it wraps.
pub trait WrapperHooks: Send + Sync + 'static {
    /// The wrapped task's body started. Not fired when it was cancelled before starting.
    fn wrapped_did_start(&self, task: &Task);

    /// The wrapped task reached `Finished` with `outcome`.
    fn wrapped_did_finish(&self, task: &Task, outcome: &Result<(), CancellationReason>);
}

#[derive(Debug, Default)]
struct OneShot(AtomicBool);

impl OneShot {
    /// `true` exactly once.
    fn fire(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }
}

fn outcome_of(task: &Task) -> Result<(), CancellationReason> {
    task.cancellation_reason().map_or(Ok(()), Err)
}

fn private_queue(inner: &Task, cx: &ExecutionContext) -> Result<Scheduler, CancellationReason> {
    let registry = cx.registry().unwrap_or_default();
    let mut config = SchedulerConfig::serial(format!("wrap-{}", inner.id()));
    if let Some(size) = cx.thread_stack_size() {
        config = config.with_thread_stack_size(size);
    }
    Scheduler::with_registry(config, registry).map_err(CancellationReason::leaf)
}

/// Run `inner` on a private serial queue and wait for it, forwarding
/// cancellation of the running task. Returns the inner outcome unchanged, or the
/// running task's own reason if it was cancelled meanwhile.
pub(crate) async fn run_on_private_queue(
    inner: &Task,
    cx: &ExecutionContext,
) -> Result<(), CancellationReason> {
    let queue = private_queue(inner, cx)?;
    if let Err(e) = queue.submit(inner) {
        queue.shutdown();
        return Err(CancellationReason::leaf(e));
    }

    tokio::select! {
        () = inner.finished() => {}
        () = cx.cancelled() => {
            if let Some(reason) = cx.cancellation_reason() {
                inner.cancel(reason);
            }
            inner.finished().await;
        }
    }
    queue.shutdown();

    if let Some(own) = cx.cancellation_reason() {
        return Err(own);
    }
    outcome_of(inner)
}

struct ForwardingDelegate {
    hooks: Arc<dyn WrapperHooks>,
    /// Delegate the inner task carried before it was wrapped.
    previous: Option<Arc<dyn TaskDelegate>>,
    started: OneShot,
    finished: OneShot,
}

impl TaskDelegate for ForwardingDelegate {
    fn task_will_execute(&self, task: &Task) {
        if let Some(previous) = &self.previous {
            previous.task_will_execute(task);
        }
        if self.started.fire() {
            debug!(task_id = %task.id(), task = %task.name(), "forwarding start");
            self.hooks.wrapped_did_start(task);
        }
    }

    fn task_did_finish(&self, task: &Task) {
        if let Some(previous) = &self.previous {
            previous.task_did_finish(task);
        }
        if self.finished.fire() {
            debug!(task_id = %task.id(), task = %task.name(), "forwarding finish");
            self.hooks.wrapped_did_finish(task, &outcome_of(task));
        }
    }
}

/// Push-style wrapper: the inner task calls back through its delegate.
pub struct DelegatingWrapper;

impl DelegatingWrapper {
    /// Build the outer task.
    ///
    /// A delegate already set on `inner` keeps being notified, before the hooks.
    pub fn wrap(inner: Task, hooks: Arc<dyn WrapperHooks>) -> Task {
        let previous = inner.take_delegate();
        if previous.is_some() {
            debug!(task_id = %inner.id(), task = %inner.name(), "chaining existing delegate");
        }
        inner.set_delegate(Arc::new(ForwardingDelegate {
            hooks,
            previous,
            started: OneShot::default(),
            finished: OneShot::default(),
        }));
        Task::new(DelegatingOperation { inner })
    }
}

struct DelegatingOperation {
    inner: Task,
}

#[async_trait]
impl Operation for DelegatingOperation {
    fn name(&self) -> String {
        format!("delegating({})", self.inner.name())
    }

    async fn execute(&self, cx: &ExecutionContext) -> Result<(), CancellationReason> {
        match run_on_private_queue(&self.inner, cx).await {
            Err(reason) if cx.cancellation_reason().is_none() => {
                Err(CancellationReason::wrapped(0, reason))
            }
            other => other,
        }
    }
}

/// Pull-style wrapper: the outer body watches the inner task's transitions.
pub struct ObservingWrapper;

impl ObservingWrapper {
    /// Build the outer task.
    pub fn wrap(inner: Task, hooks: Arc<dyn WrapperHooks>) -> Task {
        Task::new(ObservingOperation { inner, hooks })
    }
}

struct ObservingOperation {
    inner: Task,
    hooks: Arc<dyn WrapperHooks>,
}

#[async_trait]
impl Operation for ObservingOperation {
    fn name(&self) -> String {
        format!("observing({})", self.inner.name())
    }

    async fn execute(&self, cx: &ExecutionContext) -> Result<(), CancellationReason> {
        let inner = &self.inner;
        let mut transitions = inner.subscribe();
        let queue = private_queue(inner, cx)?;
        if let Err(e) = queue.submit(inner) {
            queue.shutdown();
            return Err(CancellationReason::wrapped(0, CancellationReason::leaf(e)));
        }

        let started = OneShot::default();
        let finished = OneShot::default();
        let mut forwarded = false;

        loop {
            tokio::select! {
                transition = transitions.recv() => {
                    let Some(transition) = transition else {
                        break;
                    };
                    match transition.state {
                        TaskState::Executing if started.fire() => {
                            debug!(task_id = %inner.id(), task = %inner.name(), "observed start");
                            self.hooks.wrapped_did_start(inner);
                        }
                        TaskState::Finished => {
                            if finished.fire() {
                                debug!(task_id = %inner.id(), task = %inner.name(), "observed finish");
                                self.hooks.wrapped_did_finish(inner, &outcome_of(inner));
                            }
                            break;
                        }
                        _ => {}
                    }
                }
                () = cx.cancelled(), if !forwarded => {
                    forwarded = true;
                    if let Some(reason) = cx.cancellation_reason() {
                        inner.cancel(reason);
                    }
                }
            }
        }

        inner.finished().await;
        queue.shutdown();

        if let Some(own) = cx.cancellation_reason() {
            return Err(own);
        }
        outcome_of(inner).map_err(|reason| CancellationReason::wrapped(0, reason))
    }
}
