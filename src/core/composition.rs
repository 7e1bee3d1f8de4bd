//! Transactional composition of steps sharing one context.
//!
//! A [`Composition`] runs `1..=n` [`ContextualTask`]s strictly in order against a
//! single context produced by a [`ContextCreator`]. The context is committed only
//! after every step succeeded and only if it holds pending changes; any
//! cancellation drops it uncommitted.
//!
//! Steps run on a private scheduler sized to the number of steps and sharing the
//! caller's identity registry, so nested compositions never compete with their
//! parents for workers.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::error::{BoxError, CancellationReason, SchedulerError};
use super::identity::{FlowId, TaskIdentity};
use super::scheduler::Scheduler;
use super::task::{ExecutionContext, Operation, Task, TaskState};
use super::wrapper::run_on_private_queue;
use crate::config::SchedulerConfig;

/// A scoped resource batching side effects for all-or-nothing commit.
pub trait TransactionalContext: Send + 'static {
    /// Whether any step recorded a change.
    fn has_pending_changes(&self) -> bool;

    /// Make every recorded change durable.
    ///
    /// # Errors
    ///
    /// Returns the persistence failure; the composition then cancels with
    /// [`CancellationReason::TransactionFailed`].
    fn commit(&mut self) -> Result<(), BoxError>;
}

/// Produces a fresh context for each composition run.
pub trait ContextCreator<C>: Send + Sync + 'static {
    /// Create the context of the flow `flow_id`.
    fn create_context(&self, flow_id: FlowId) -> C;
}

impl<C, F> ContextCreator<C> for F
where
    F: Fn(FlowId) -> C + Send + Sync + 'static,
{
    fn create_context(&self, flow_id: FlowId) -> C {
        self(flow_id)
    }
}

/// Body of a composition step, with access to the shared context.
#[async_trait]
pub trait ContextualStep<C: Send + 'static>: Send + Sync + 'static {
    /// Human-readable name used in logs.
    fn name(&self) -> String;

    /// Identity used for mutual exclusion, if any.
    fn identity(&self) -> Option<TaskIdentity> {
        None
    }

    /// Run the step against the shared context.
    async fn execute(&self, context: &mut C, cx: &ExecutionContext) -> Result<(), CancellationReason>;

    /// The step finished cancelled without running.
    fn skipped(&self, _reason: &CancellationReason) {}
}

/// A task whose body needs a context injected before it runs.
pub struct ContextualTask<C> {
    task: Task,
    slot: Arc<Mutex<Option<C>>>,
}

impl<C: Send + 'static> ContextualTask<C> {
    /// Wrap a step into a schedulable task.
    pub fn new(step: impl ContextualStep<C>) -> Self {
        let slot = Arc::new(Mutex::new(None));
        let task = Task::new(StepOperation {
            step,
            slot: Arc::clone(&slot),
        });
        Self { task, slot }
    }

    /// Step whose body is a synchronous closure.
    pub fn from_fn<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut C, &ExecutionContext) -> Result<(), CancellationReason> + Send + Sync + 'static,
    {
        Self::new(FnStep {
            name: name.into(),
            identity: None,
            body,
        })
    }

    /// Step with an identity whose body is a synchronous closure.
    pub fn from_fn_with_identity<F>(name: impl Into<String>, identity: TaskIdentity, body: F) -> Self
    where
        F: Fn(&mut C, &ExecutionContext) -> Result<(), CancellationReason> + Send + Sync + 'static,
    {
        Self::new(FnStep {
            name: name.into(),
            identity: Some(identity),
            body,
        })
    }

    /// The underlying task.
    #[must_use]
    pub const fn task(&self) -> &Task {
        &self.task
    }

    /// Declare that `other` must have finished before this step runs.
    ///
    /// # Errors
    ///
    /// See [`Task::add_dependency`].
    pub fn add_dependency(&self, other: &Task) -> Result<(), SchedulerError> {
        self.task.add_dependency(other)
    }

    /// Hand the context to the step.
    pub fn inject(&self, context: C) {
        *self.slot.lock() = Some(context);
    }

    /// Take the context back once the step finished.
    pub fn take_context(&self) -> Option<C> {
        self.slot.lock().take()
    }
}

impl<C> Clone for ContextualTask<C> {
    fn clone(&self) -> Self {
        Self {
            task: self.task.clone(),
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<C> fmt::Debug for ContextualTask<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextualTask")
            .field("task", &self.task)
            .finish_non_exhaustive()
    }
}

struct StepOperation<S, C> {
    step: S,
    slot: Arc<Mutex<Option<C>>>,
}

#[async_trait]
impl<S, C> Operation for StepOperation<S, C>
where
    S: ContextualStep<C>,
    C: Send + 'static,
{
    fn name(&self) -> String {
        self.step.name()
    }

    fn identity(&self) -> Option<TaskIdentity> {
        self.step.identity()
    }

    async fn execute(&self, cx: &ExecutionContext) -> Result<(), CancellationReason> {
        let mut context = self
            .slot
            .lock()
            .take()
            .ok_or(CancellationReason::MissingContext)?;
        let result = self.step.execute(&mut context, cx).await;
        *self.slot.lock() = Some(context);
        result
    }

    fn skipped(&self, reason: &CancellationReason) {
        self.step.skipped(reason);
    }
}

struct FnStep<F> {
    name: String,
    identity: Option<TaskIdentity>,
    body: F,
}

#[async_trait]
impl<C, F> ContextualStep<C> for FnStep<F>
where
    C: Send + 'static,
    F: Fn(&mut C, &ExecutionContext) -> Result<(), CancellationReason> + Send + Sync + 'static,
{
    fn name(&self) -> String {
        self.name.clone()
    }

    fn identity(&self) -> Option<TaskIdentity> {
        self.identity.clone()
    }

    async fn execute(&self, context: &mut C, cx: &ExecutionContext) -> Result<(), CancellationReason> {
        (self.body)(context, cx)
    }
}

/// Diagnostics recorded when a composition body completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositionReport {
    /// Flow the composition ran as.
    pub flow_id: FlowId,
    /// Number of steps.
    pub steps: usize,
    /// Whether the context was committed.
    pub committed: bool,
    /// Wall clock from the first step dispatch to completion.
    pub duration: Duration,
}

/// An ordered chain of steps committed atomically.
///
/// The composition itself is a [`Task`]: submit [`Composition::task`] to any
/// scheduler, or use [`Scheduler::run_composition`].
#[derive(Debug, Clone)]
pub struct Composition {
    task: Task,
    flow_id: FlowId,
    steps: Vec<Task>,
    report: Arc<Mutex<Option<CompositionReport>>>,
}

impl Composition {
    /// Compose `steps` under a fresh flow id.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::InvalidConfig` if `steps` is empty.
    pub fn new<C>(
        creator: Arc<dyn ContextCreator<C>>,
        steps: Vec<ContextualTask<C>>,
    ) -> Result<Self, SchedulerError>
    where
        C: TransactionalContext,
    {
        Self::with_flow_id(FlowId::new(), creator, steps)
    }

    /// Compose `steps` as part of the flow `flow_id`.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::InvalidConfig` if `steps` is empty.
    pub fn with_flow_id<C>(
        flow_id: FlowId,
        creator: Arc<dyn ContextCreator<C>>,
        steps: Vec<ContextualTask<C>>,
    ) -> Result<Self, SchedulerError>
    where
        C: TransactionalContext,
    {
        if steps.is_empty() {
            return Err(SchedulerError::InvalidConfig(
                "a composition needs at least one step".into(),
            ));
        }

        let names: Vec<&str> = steps.iter().map(|s| s.task().name()).collect();
        let name = format!("composition({})", names.join(", "));
        let step_tasks = steps.iter().map(|s| s.task().clone()).collect();
        let report = Arc::new(Mutex::new(None));

        let task = Task::new(CompositionOperation {
            name,
            flow_id,
            creator,
            steps,
            report: Arc::clone(&report),
        });

        Ok(Self {
            task,
            flow_id,
            steps: step_tasks,
            report,
        })
    }

    /// The task running the composition.
    #[must_use]
    pub const fn task(&self) -> &Task {
        &self.task
    }

    /// Flow the composition runs as.
    #[must_use]
    pub const fn flow_id(&self) -> FlowId {
        self.flow_id
    }

    /// Step tasks in declared order.
    #[must_use]
    pub fn steps(&self) -> &[Task] {
        &self.steps
    }

    /// Report of the last run, once its body completed.
    #[must_use]
    pub fn report(&self) -> Option<CompositionReport> {
        self.report.lock().clone()
    }

    /// Wall clock from the first step dispatch to completion.
    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        self.report.lock().as_ref().map(|r| r.duration)
    }

    /// Use this composition as one step of an enclosing composition.
    ///
    /// The step ignores the enclosing context; the inner composition keeps its
    /// own. An inner failure surfaces unchanged, so the enclosing layer adds its
    /// own step index in front of the inner path.
    #[must_use]
    pub fn into_step<C: Send + 'static>(self) -> ContextualTask<C> {
        ContextualTask::new(NestedComposition { inner: self })
    }
}

struct NestedComposition {
    inner: Composition,
}

#[async_trait]
impl<C: Send + 'static> ContextualStep<C> for NestedComposition {
    fn name(&self) -> String {
        self.inner.task.name().to_string()
    }

    async fn execute(&self, _context: &mut C, cx: &ExecutionContext) -> Result<(), CancellationReason> {
        run_on_private_queue(&self.inner.task, cx).await
    }

    fn skipped(&self, reason: &CancellationReason) {
        let task = &self.inner.task;
        if task.state() == TaskState::Initialized {
            task.cancel(reason.clone());
            task.finish();
        }
    }
}

struct CompositionOperation<C> {
    name: String,
    flow_id: FlowId,
    creator: Arc<dyn ContextCreator<C>>,
    steps: Vec<ContextualTask<C>>,
    report: Arc<Mutex<Option<CompositionReport>>>,
}

impl<C: TransactionalContext> CompositionOperation<C> {
    /// Run every step then commit. `Ok(true)` when the context was committed.
    async fn run(&self, queue: &Scheduler, cx: &ExecutionContext) -> Result<bool, CancellationReason> {
        let flow_id = self.flow_id;
        let mut context = Some(self.creator.create_context(flow_id));

        for (index, step) in self.steps.iter().enumerate() {
            if let Some(reason) = cx.cancellation_reason() {
                self.cancel_from(index, &reason);
                return Err(reason);
            }

            if !step.task().dependencies_finished() {
                error!(
                    flow_id = %flow_id,
                    step = index,
                    task = %step.task().name(),
                    "step started before its dependencies finished"
                );
                let reason = CancellationReason::UnfinishedDependency { index };
                self.cancel_from(index, &reason);
                return Err(reason);
            }

            let Some(current) = context.take() else {
                error!(flow_id = %flow_id, step = index, "transactional context lost");
                let reason = CancellationReason::wrapped(index, CancellationReason::UnknownReason);
                self.cancel_from(index, &reason);
                return Err(reason);
            };
            step.inject(current);

            if let Err(e) = queue.submit(step.task()) {
                let reason = CancellationReason::wrapped(index, CancellationReason::leaf(e));
                self.cancel_from(index, &reason);
                return Err(reason);
            }
            debug!(flow_id = %flow_id, step = index, task = %step.task().name(), "step dispatched");

            tokio::select! {
                () = step.task().finished() => {}
                () = cx.cancelled() => {
                    if let Some(reason) = cx.cancellation_reason() {
                        step.task().cancel(reason);
                    }
                    step.task().finished().await;
                }
            }
            context = step.take_context();

            if let Some(step_reason) = step.task().cancellation_reason() {
                if let Some(own) = cx.cancellation_reason() {
                    self.cancel_from(index + 1, &own);
                    return Err(own);
                }
                warn!(
                    flow_id = %flow_id,
                    step = index,
                    task = %step.task().name(),
                    reason = %step_reason,
                    "step cancelled; discarding context"
                );
                let reason = CancellationReason::wrapped(index, step_reason);
                self.cancel_from(index + 1, &reason);
                return Err(reason);
            }
        }

        if let Some(reason) = cx.cancellation_reason() {
            return Err(reason);
        }

        let Some(mut context) = context else {
            error!(flow_id = %flow_id, "transactional context lost after the last step");
            return Err(CancellationReason::UnknownReason);
        };

        if !context.has_pending_changes() {
            debug!(flow_id = %flow_id, "no pending changes; skipping commit");
            return Ok(false);
        }

        context.commit().map_err(|e| {
            error!(flow_id = %flow_id, error = %e, "commit failed");
            CancellationReason::transaction_failed(e)
        })?;
        info!(flow_id = %flow_id, steps = self.steps.len(), "composition committed");
        Ok(true)
    }

    /// Finish every step from `index` on that was never dispatched.
    fn cancel_from(&self, index: usize, reason: &CancellationReason) {
        for step in self.steps.iter().skip(index) {
            let task = step.task();
            if task.state() == TaskState::Initialized {
                task.cancel(reason.clone());
                task.finish();
            }
        }
    }
}

#[async_trait]
impl<C: TransactionalContext> Operation for CompositionOperation<C> {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn skipped(&self, reason: &CancellationReason) {
        debug!(flow_id = %self.flow_id, reason = %reason, "composition cancelled before start");
        self.cancel_from(0, reason);
    }

    async fn execute(&self, cx: &ExecutionContext) -> Result<(), CancellationReason> {
        let registry = cx.registry().unwrap_or_default();
        let mut config = SchedulerConfig::for_composition(format!("flow-{}", self.flow_id), self.steps.len());
        if let Some(size) = cx.thread_stack_size() {
            config = config.with_thread_stack_size(size);
        }
        let queue = Scheduler::with_registry(config, registry).map_err(CancellationReason::leaf)?;

        let started = Instant::now();
        let result = self.run(&queue, cx).await;
        let duration = started.elapsed();
        queue.shutdown();

        *self.report.lock() = Some(CompositionReport {
            flow_id: self.flow_id,
            steps: self.steps.len(),
            committed: matches!(result, Ok(true)),
            duration,
        });

        match &result {
            Ok(committed) => debug!(
                flow_id = %self.flow_id,
                committed,
                duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
                "composition finished"
            ),
            Err(reason) => warn!(
                flow_id = %self.flow_id,
                step_path = ?reason.step_path(),
                reason = %reason,
                "composition cancelled"
            ),
        }

        result.map(|_| ())
    }
}
