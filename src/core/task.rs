//! Task abstraction with an explicit state machine.
//!
//! A [`Task`] moves monotonically through
//! `Initialized → EvaluatingConditions → Ready → Executing → Finishing → Finished`.
//! Readiness is not stored: [`Task::tick`] evaluates it on demand, and the
//! evaluation itself moves the task to `Ready` once every dependency has finished
//! and its identity could be registered.
//!
//! # Locking
//!
//! Each task serializes its own state behind one `parking_lot::Mutex`; the
//! identity registry has its own lock. Delegate callbacks are never invoked
//! while either lock is held. Channel sends (subscribers, wakers) never run user
//! code and are made under the task lock so transitions are delivered in order.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use crossbeam_channel::{Sender, TrySendError};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, trace, warn};

use super::error::{CancellationReason, SchedulerError};
use super::identity::{IdentityRegistry, TaskId, TaskIdentity};

/// Lifecycle state of a task. States are ordered and never revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Created by its owner; dependencies may still be added.
    Initialized,
    /// Enqueued; waiting for dependencies and for its identity.
    EvaluatingConditions,
    /// May be started by the scheduler.
    Ready,
    /// Body is running.
    Executing,
    /// Identity released; observers are being notified.
    Finishing,
    /// Terminal state.
    Finished,
}

impl TaskState {
    /// Whether this is the terminal state.
    #[must_use]
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Finished)
    }

    /// Lowercase name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::EvaluatingConditions => "evaluating_conditions",
            Self::Ready => "ready",
            Self::Executing => "executing",
            Self::Finishing => "finishing",
            Self::Finished => "finished",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One state change, as delivered to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskTransition {
    /// Task that changed state.
    pub task_id: TaskId,
    /// State entered.
    pub state: TaskState,
    /// Whether cancellation had been requested when the state was entered.
    pub cancelled: bool,
}

/// The body of a task.
///
/// A body that cannot complete returns `Err` with a structured reason; the task
/// is then cancelled with that reason. Faults inside the body must be converted
/// into a reason by the body itself.
#[async_trait]
pub trait Operation: Send + Sync + 'static {
    /// Human-readable name used in logs.
    fn name(&self) -> String;

    /// Identity used for mutual exclusion, if any.
    fn identity(&self) -> Option<TaskIdentity> {
        None
    }

    /// Run the body.
    async fn execute(&self, cx: &ExecutionContext) -> Result<(), CancellationReason>;

    /// Called once, instead of `execute`, when the task finishes cancelled
    /// without its body having run.
    fn skipped(&self, _reason: &CancellationReason) {}
}

/// Completion delegate notified around execution.
///
/// Both callbacks are invoked outside any internal lock, at most once per task.
pub trait TaskDelegate: Send + Sync {
    /// The body of `task` is about to run.
    fn task_will_execute(&self, _task: &Task) {}

    /// `task` reached `Finished`.
    fn task_did_finish(&self, task: &Task);
}

/// Handle given to a running body.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    task: Task,
    thread_stack_size: Option<usize>,
}

impl ExecutionContext {
    /// The running task.
    #[must_use]
    pub const fn task(&self) -> &Task {
        &self.task
    }

    /// Registry the task was enqueued with.
    #[must_use]
    pub fn registry(&self) -> Option<Arc<IdentityRegistry>> {
        self.task.registry()
    }

    /// Stack size of the scheduler worker running the body, if any.
    #[must_use]
    pub const fn thread_stack_size(&self) -> Option<usize> {
        self.thread_stack_size
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.task.is_cancelled()
    }

    /// Reason cancellation was requested with.
    #[must_use]
    pub fn cancellation_reason(&self) -> Option<CancellationReason> {
        self.task.cancellation_reason()
    }

    /// Cooperative cancellation point: `Err` once cancellation was requested.
    ///
    /// # Errors
    ///
    /// Returns the cancellation reason if the task was cancelled.
    pub fn check_cancelled(&self) -> Result<(), CancellationReason> {
        self.task.cancellation_reason().map_or(Ok(()), Err)
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        self.task.cancelled().await;
    }
}

struct TaskCore {
    state: TaskState,
    dependencies: Vec<Task>,
    cancellation: Option<CancellationReason>,
    registry: Option<Arc<IdentityRegistry>>,
    registered: bool,
    completed: bool,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
    subscribers: Vec<mpsc::UnboundedSender<TaskTransition>>,
    wakers: Vec<Sender<()>>,
    delegate: Option<Arc<dyn TaskDelegate>>,
}

struct TaskInner {
    id: TaskId,
    name: String,
    identity: Option<TaskIdentity>,
    operation: Arc<dyn Operation>,
    core: Mutex<TaskCore>,
    completion: Condvar,
    completed_tx: watch::Sender<bool>,
    cancelled_tx: watch::Sender<bool>,
}

impl TaskInner {
    fn publish(&self, core: &mut TaskCore, state: TaskState) {
        let transition = TaskTransition {
            task_id: self.id,
            state,
            cancelled: core.cancellation.is_some(),
        };
        core.subscribers.retain(|tx| tx.send(transition).is_ok());
    }

    fn set_state(&self, core: &mut TaskCore, state: TaskState) {
        trace!(task_id = %self.id, task = %self.name, from = %core.state, to = %state, "task transition");
        core.state = state;
        self.publish(core, state);
    }
}

fn wake(wakers: &mut Vec<Sender<()>>) {
    wakers.retain(|waker| !matches!(waker.try_send(()), Err(TrySendError::Disconnected(()))));
}

/// A schedulable unit of work with its own state machine.
///
/// `Task` is a cheap handle; clones refer to the same task.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

impl Task {
    /// Create a task in `Initialized` from a body.
    pub fn new(operation: impl Operation) -> Self {
        Self::from_arc(Arc::new(operation))
    }

    /// Create a task from a shared body.
    pub fn from_arc(operation: Arc<dyn Operation>) -> Self {
        let (completed_tx, _) = watch::channel(false);
        let (cancelled_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(TaskInner {
                id: TaskId::new(),
                name: operation.name(),
                identity: operation.identity(),
                operation,
                core: Mutex::new(TaskCore {
                    state: TaskState::Initialized,
                    dependencies: Vec::new(),
                    cancellation: None,
                    registry: None,
                    registered: false,
                    completed: false,
                    started_at: None,
                    finished_at: None,
                    subscribers: Vec::new(),
                    wakers: Vec::new(),
                    delegate: None,
                }),
                completion: Condvar::new(),
                completed_tx,
                cancelled_tx,
            }),
        }
    }

    /// Create a task whose body is a synchronous closure.
    pub fn from_fn<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&ExecutionContext) -> Result<(), CancellationReason> + Send + Sync + 'static,
    {
        Self::new(FnOperation {
            name: name.into(),
            identity: None,
            body,
        })
    }

    /// Create a task with an identity whose body is a synchronous closure.
    pub fn from_fn_with_identity<F>(name: impl Into<String>, identity: TaskIdentity, body: F) -> Self
    where
        F: Fn(&ExecutionContext) -> Result<(), CancellationReason> + Send + Sync + 'static,
    {
        Self::new(FnOperation {
            name: name.into(),
            identity: Some(identity),
            body,
        })
    }

    /// Unique id of this task instance.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    /// Name of the body.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Identity used for mutual exclusion.
    #[must_use]
    pub fn identity(&self) -> Option<&TaskIdentity> {
        self.inner.identity.as_ref()
    }

    /// Current state, without evaluating readiness.
    #[must_use]
    pub fn state(&self) -> TaskState {
        self.inner.core.lock().state
    }

    /// Whether the task reached `Finished`.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state().is_finished()
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.core.lock().cancellation.is_some()
    }

    /// The first reason cancellation was requested with.
    #[must_use]
    pub fn cancellation_reason(&self) -> Option<CancellationReason> {
        self.inner.core.lock().cancellation.clone()
    }

    /// Final outcome, once the task is `Finished`.
    #[must_use]
    pub fn outcome(&self) -> Option<Result<(), CancellationReason>> {
        let core = self.inner.core.lock();
        if !core.state.is_finished() {
            return None;
        }
        Some(core.cancellation.clone().map_or(Ok(()), Err))
    }

    /// Declared dependencies.
    #[must_use]
    pub fn dependencies(&self) -> Vec<Self> {
        self.inner.core.lock().dependencies.clone()
    }

    /// Whether every declared dependency reached `Finished`.
    #[must_use]
    pub fn dependencies_finished(&self) -> bool {
        self.dependencies().iter().all(Self::is_finished)
    }

    /// Registry the task was enqueued with.
    #[must_use]
    pub fn registry(&self) -> Option<Arc<IdentityRegistry>> {
        self.inner.core.lock().registry.clone()
    }

    /// Time spent between start and finish.
    #[must_use]
    pub fn execution_duration(&self) -> Option<Duration> {
        let core = self.inner.core.lock();
        match (core.started_at, core.finished_at) {
            (Some(started), Some(finished)) => Some(finished.duration_since(started)),
            _ => None,
        }
    }

    /// Declare that `other` must finish before this task becomes ready.
    ///
    /// # Errors
    ///
    /// Fails once the task left `Initialized`, or if `other` is this task.
    pub fn add_dependency(&self, other: &Self) -> Result<(), SchedulerError> {
        if Arc::ptr_eq(&self.inner, &other.inner) {
            return Err(SchedulerError::SelfDependency(self.inner.name.clone()));
        }
        let mut core = self.inner.core.lock();
        if core.state != TaskState::Initialized {
            error!(
                task_id = %self.inner.id,
                task = %self.inner.name,
                state = %core.state,
                "dependency added after the task was enqueued"
            );
            return Err(SchedulerError::DependenciesFrozen(self.inner.name.clone()));
        }
        core.dependencies.push(other.clone());
        Ok(())
    }

    /// Set the completion delegate, replacing any previous one.
    pub fn set_delegate(&self, delegate: Arc<dyn TaskDelegate>) {
        self.inner.core.lock().delegate = Some(delegate);
    }

    /// Remove and return the completion delegate, if one is set and the task
    /// has not finished yet.
    pub fn take_delegate(&self) -> Option<Arc<dyn TaskDelegate>> {
        self.inner.core.lock().delegate.take()
    }

    /// Subscribe to state transitions.
    ///
    /// The first message is the state at subscription time; every later
    /// transition follows in order, so a subscriber never misses one.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TaskTransition> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut core = self.inner.core.lock();
        let snapshot = TaskTransition {
            task_id: self.inner.id,
            state: core.state,
            cancelled: core.cancellation.is_some(),
        };
        if tx.send(snapshot).is_ok() && !core.state.is_finished() {
            core.subscribers.push(tx);
        }
        rx
    }

    /// Register a channel signalled when the task is cancelled or finishes.
    ///
    /// Ignored once the task completed: nothing would ever drain it.
    pub fn add_waker(&self, waker: Sender<()>) {
        let mut core = self.inner.core.lock();
        if !core.completed {
            core.wakers.push(waker);
        }
    }

    /// Move from `Initialized` to `EvaluatingConditions`, freezing dependencies.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::AlreadyEnqueued`] if the task left `Initialized`.
    pub fn enqueue(&self, registry: Arc<IdentityRegistry>) -> Result<(), SchedulerError> {
        let mut core = self.inner.core.lock();
        if core.state != TaskState::Initialized {
            return Err(SchedulerError::AlreadyEnqueued(self.inner.name.clone()));
        }
        core.registry = Some(registry);
        self.inner.set_state(&mut core, TaskState::EvaluatingConditions);
        Ok(())
    }

    /// Request cancellation. Only the first reason is kept.
    ///
    /// Returns `false` if the task was already cancelled or is finishing.
    pub fn cancel(&self, reason: CancellationReason) -> bool {
        let mut core = self.inner.core.lock();
        if core.state >= TaskState::Finishing || core.cancellation.is_some() {
            return false;
        }
        if reason.is_unknown() {
            error!(task_id = %self.inner.id, task = %self.inner.name, "task cancelled without a known reason");
        } else {
            debug!(task_id = %self.inner.id, task = %self.inner.name, reason = %reason, "task cancelled");
        }
        core.cancellation = Some(reason);
        self.inner.cancelled_tx.send_replace(true);
        wake(&mut core.wakers);
        true
    }

    /// Evaluate readiness, transitioning to `Ready` when conditions hold.
    ///
    /// In `EvaluatingConditions` the task becomes ready once every dependency is
    /// `Finished` and its identity is registered. A cancelled task, or one with a
    /// cancelled dependency, becomes ready without registering so that it can
    /// finish without running its body. If another task holds the identity the
    /// task stays put and must be ticked again later.
    pub fn tick(&self) -> TaskState {
        let (dependencies, cancelled, registry) = {
            let core = self.inner.core.lock();
            if core.state != TaskState::EvaluatingConditions {
                return core.state;
            }
            (
                core.dependencies.clone(),
                core.cancellation.is_some(),
                core.registry.clone(),
            )
        };

        if cancelled {
            return self.become_ready(false);
        }
        if !dependencies.iter().all(Self::is_finished) {
            return TaskState::EvaluatingConditions;
        }
        if dependencies.iter().any(Self::is_cancelled) {
            self.cancel(CancellationReason::DependencyCancelled);
            return self.become_ready(false);
        }

        let registered = match (&self.inner.identity, &registry) {
            (Some(identity), Some(registry)) => {
                if !registry.try_register(identity, self.inner.id) {
                    trace!(task_id = %self.inner.id, identity = %identity, "identity held by another task");
                    return TaskState::EvaluatingConditions;
                }
                true
            }
            _ => false,
        };
        self.become_ready(registered)
    }

    /// Whether the task is `Ready` after evaluating readiness.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.tick() == TaskState::Ready
    }

    fn become_ready(&self, registered: bool) -> TaskState {
        let mut core = self.inner.core.lock();
        if core.state == TaskState::EvaluatingConditions {
            core.registered |= registered;
            self.inner.set_state(&mut core, TaskState::Ready);
            return TaskState::Ready;
        }
        let state = core.state;
        if state >= TaskState::Finishing && registered && !core.registered {
            let registry = core.registry.clone();
            drop(core);
            if let (Some(registry), Some(identity)) = (registry, &self.inner.identity) {
                registry.deregister(identity, self.inner.id);
            }
        } else {
            core.registered |= registered;
        }
        state
    }

    /// Run the task. Called by the scheduler once the task is `Ready`.
    ///
    /// A cancelled task (or one whose dependency was cancelled) skips its body and
    /// goes straight to `Finishing`. Otherwise the delegate is told the body will
    /// execute, the body runs, an `Err` cancels the task with its reason, and the
    /// task finishes.
    pub async fn start(&self) {
        self.run(None).await;
    }

    /// Run the task on a scheduler worker whose threads use `thread_stack_size`.
    pub(crate) async fn start_on_worker(&self, thread_stack_size: usize) {
        self.run(Some(thread_stack_size)).await;
    }

    async fn run(&self, thread_stack_size: Option<usize>) {
        if self.state() != TaskState::Ready {
            warn!(task_id = %self.inner.id, task = %self.inner.name, state = %self.state(), "start requested on a task that is not ready");
            return;
        }
        if self.dependencies().iter().any(Self::is_cancelled) {
            self.cancel(CancellationReason::DependencyCancelled);
        }

        let delegate = {
            let mut core = self.inner.core.lock();
            if core.state != TaskState::Ready {
                return;
            }
            if core.cancellation.is_some() {
                None
            } else {
                core.started_at = Some(Instant::now());
                self.inner.set_state(&mut core, TaskState::Executing);
                Some(core.delegate.clone())
            }
        };

        let Some(delegate) = delegate else {
            debug!(task_id = %self.inner.id, task = %self.inner.name, "skipping body of cancelled task");
            self.finish();
            return;
        };

        if let Some(delegate) = delegate {
            delegate.task_will_execute(self);
        }

        debug!(task_id = %self.inner.id, task = %self.inner.name, "executing task");
        let cx = ExecutionContext {
            task: self.clone(),
            thread_stack_size,
        };
        if let Err(reason) = self.inner.operation.execute(&cx).await {
            self.cancel(reason);
        }
        self.finish();
    }

    /// Move to `Finishing` then `Finished`. Idempotent.
    ///
    /// Only the first call has an effect: the identity is deregistered on entry to
    /// `Finishing` before any observer is notified, then the delegate, blocking
    /// waiters and async waiters are notified exactly once.
    pub fn finish(&self) -> bool {
        let (registry, registered, skipped) = {
            let mut core = self.inner.core.lock();
            if core.state >= TaskState::Finishing {
                return false;
            }
            trace!(task_id = %self.inner.id, from = %core.state, to = %TaskState::Finishing, "task transition");
            core.state = TaskState::Finishing;
            let registered = std::mem::take(&mut core.registered);
            let skipped = if core.started_at.is_none() {
                core.cancellation.clone()
            } else {
                None
            };
            (core.registry.clone(), registered, skipped)
        };

        if registered {
            if let (Some(registry), Some(identity)) = (registry, &self.inner.identity) {
                registry.deregister(identity, self.inner.id);
            }
        }

        if let Some(reason) = skipped {
            self.guarded("skipped", || self.inner.operation.skipped(&reason));
        }

        let delegate = {
            let mut core = self.inner.core.lock();
            self.inner.publish(&mut core, TaskState::Finishing);
            core.finished_at = Some(Instant::now());
            self.inner.set_state(&mut core, TaskState::Finished);
            core.subscribers.clear();
            core.delegate.take()
        };

        if let Some(delegate) = delegate {
            self.guarded("task_did_finish", || delegate.task_did_finish(self));
        }

        {
            let mut core = self.inner.core.lock();
            core.completed = true;
            self.inner.completed_tx.send_replace(true);
            wake(&mut core.wakers);
            core.wakers.clear();
        }
        self.inner.completion.notify_all();

        debug!(
            task_id = %self.inner.id,
            task = %self.inner.name,
            cancelled = self.is_cancelled(),
            "task finished"
        );
        true
    }

    /// Run a user callback from `finish`; a panic is logged so waiters are
    /// still released.
    fn guarded(&self, callback: &str, f: impl FnOnce()) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
            error!(
                task_id = %self.inner.id,
                task = %self.inner.name,
                callback,
                panic = %panic_message(payload.as_ref()),
                "callback panicked while finishing"
            );
        }
    }

    /// Block the current thread until the task finished and observers were notified.
    pub fn wait_until_finished(&self) {
        let mut core = self.inner.core.lock();
        while !core.completed {
            self.inner.completion.wait(&mut core);
        }
    }

    /// Like [`Task::wait_until_finished`], giving up after `timeout`.
    ///
    /// Returns whether the task finished.
    pub fn wait_until_finished_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut core = self.inner.core.lock();
        while !core.completed {
            if self.inner.completion.wait_until(&mut core, deadline).timed_out() {
                return core.completed;
            }
        }
        true
    }

    /// Resolves once the task finished and observers were notified.
    pub async fn finished(&self) {
        let mut rx = self.inner.completed_tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        let mut rx = self.inner.cancelled_tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Log the full reason chain at warn level if the task was cancelled.
    pub fn log_reason_if_cancelled(&self) {
        if let Some(reason) = self.cancellation_reason() {
            warn!(
                task_id = %self.inner.id,
                task = %self.inner.name,
                step_path = ?reason.step_path(),
                root_cause = %reason.root_cause(),
                "{} cancelled: {reason}",
                self.inner.name
            );
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

struct FnOperation<F> {
    name: String,
    identity: Option<TaskIdentity>,
    body: F,
}

#[async_trait]
impl<F> Operation for FnOperation<F>
where
    F: Fn(&ExecutionContext) -> Result<(), CancellationReason> + Send + Sync + 'static,
{
    fn name(&self) -> String {
        self.name.clone()
    }

    fn identity(&self) -> Option<TaskIdentity> {
        self.identity.clone()
    }

    async fn execute(&self, cx: &ExecutionContext) -> Result<(), CancellationReason> {
        (self.body)(cx)
    }
}

/// Text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn noop(name: &str) -> Task {
        Task::from_fn(name, |_| Ok(()))
    }

    fn run_inline(task: &Task) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(task.start());
    }

    struct CountingDelegate {
        will_execute: AtomicUsize,
        did_finish: AtomicUsize,
    }

    impl TaskDelegate for CountingDelegate {
        fn task_will_execute(&self, _task: &Task) {
            self.will_execute.fetch_add(1, Ordering::SeqCst);
        }

        fn task_did_finish(&self, _task: &Task) {
            self.did_finish.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_initialized_task_is_never_ready() {
        let task = noop("a");
        assert!(!task.is_ready());
        assert_eq!(task.state(), TaskState::Initialized);
    }

    #[test]
    fn test_tick_moves_enqueued_task_to_ready() {
        let task = noop("a");
        task.enqueue(Arc::new(IdentityRegistry::new())).unwrap();
        assert_eq!(task.state(), TaskState::EvaluatingConditions);
        assert!(task.is_ready());
        assert_eq!(task.state(), TaskState::Ready);
    }

    #[test]
    fn test_enqueue_twice_is_rejected() {
        let registry = Arc::new(IdentityRegistry::new());
        let task = noop("a");
        task.enqueue(Arc::clone(&registry)).unwrap();
        assert!(matches!(
            task.enqueue(registry),
            Err(SchedulerError::AlreadyEnqueued(_))
        ));
    }

    #[test]
    fn test_dependencies_freeze_on_enqueue() {
        let task = noop("a");
        let dep = noop("b");
        task.add_dependency(&dep).unwrap();
        task.enqueue(Arc::new(IdentityRegistry::new())).unwrap();

        let late = noop("c");
        assert!(matches!(
            task.add_dependency(&late),
            Err(SchedulerError::DependenciesFrozen(_))
        ));
        assert_eq!(task.dependencies().len(), 1);
    }

    #[test]
    fn test_self_dependency_is_rejected() {
        let task = noop("a");
        assert!(matches!(
            task.add_dependency(&task.clone()),
            Err(SchedulerError::SelfDependency(_))
        ));
    }

    #[test]
    fn test_finish_is_idempotent() {
        let task = noop("a");
        let delegate = Arc::new(CountingDelegate {
            will_execute: AtomicUsize::new(0),
            did_finish: AtomicUsize::new(0),
        });
        task.set_delegate(Arc::clone(&delegate) as Arc<dyn TaskDelegate>);

        assert!(task.finish());
        assert!(!task.finish());
        assert!(!task.finish());
        assert_eq!(task.state(), TaskState::Finished);
        assert_eq!(delegate.did_finish.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_body_error_cancels_with_reason() {
        let task = Task::from_fn("failing", |_| Err(CancellationReason::message("nope")));
        task.enqueue(Arc::new(IdentityRegistry::new())).unwrap();
        assert!(task.is_ready());
        run_inline(&task);

        let outcome = task.outcome().unwrap();
        assert_eq!(outcome.unwrap_err().to_string(), "nope");
    }

    #[test]
    fn test_cancelled_task_skips_body_and_execution_state() {
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        let task = Task::from_fn("skipped", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let mut transitions = task.subscribe();

        task.enqueue(Arc::new(IdentityRegistry::new())).unwrap();
        task.cancel(CancellationReason::message("stop"));
        assert!(task.is_ready());
        run_inline(&task);

        assert_eq!(ran.load(Ordering::SeqCst), 0);
        let mut seen = Vec::new();
        while let Ok(transition) = transitions.try_recv() {
            seen.push(transition.state);
        }
        assert!(!seen.contains(&TaskState::Executing));
        assert_eq!(seen.last(), Some(&TaskState::Finished));
    }

    #[test]
    fn test_first_cancellation_reason_wins() {
        let task = noop("a");
        assert!(task.cancel(CancellationReason::message("first")));
        assert!(!task.cancel(CancellationReason::message("second")));
        assert_eq!(task.cancellation_reason().unwrap().to_string(), "first");
    }

    #[test]
    fn test_subscriber_gets_snapshot_then_transitions() {
        let task = noop("a");
        let mut rx = task.subscribe();
        task.enqueue(Arc::new(IdentityRegistry::new())).unwrap();
        task.tick();
        run_inline(&task);

        let mut states = Vec::new();
        while let Ok(transition) = rx.try_recv() {
            states.push(transition.state);
        }
        assert_eq!(
            states,
            vec![
                TaskState::Initialized,
                TaskState::EvaluatingConditions,
                TaskState::Ready,
                TaskState::Executing,
                TaskState::Finishing,
                TaskState::Finished,
            ]
        );
    }

    #[test]
    fn test_identity_released_on_finish() {
        let registry = Arc::new(IdentityRegistry::new());
        let identity = TaskIdentity::unique("backup");
        let task = Task::from_fn_with_identity("a", identity.clone(), |_| Ok(()));
        task.enqueue(Arc::clone(&registry)).unwrap();
        assert!(task.is_ready());
        assert_eq!(registry.holder(&identity), Some(task.id()));

        task.finish();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_waker_added_after_completion_is_dropped() {
        let task = noop("done");
        task.finish();
        let (tx, _rx) = crossbeam_channel::bounded(1);
        task.add_waker(tx.clone());
        task.add_waker(tx);
        assert!(task.inner.core.lock().wakers.is_empty());
    }

    #[test]
    fn test_panicking_delegate_still_releases_waiters() {
        struct Exploding;

        impl TaskDelegate for Exploding {
            fn task_did_finish(&self, _task: &Task) {
                panic!("delegate failure");
            }
        }

        let task = noop("exploding");
        task.set_delegate(Arc::new(Exploding));
        assert!(task.finish());
        assert!(task.wait_until_finished_for(Duration::from_millis(100)));
    }
}
