//! Native implementation of `Scheduler` using OS threads.
//!
//! # Design Principles
//!
//! - **No polling**: the dispatcher blocks on a coalescing wake channel, workers
//!   block on the ready channel, waiters use Condvar (blocking) or watch (async)
//! - **Single shared resource**: the identity registry is the only state tasks
//!   contend over; losers stay pending until the registry wakes the dispatcher
//! - **Clean shutdown**: stopping the dispatcher drops the ready sender, which
//!   unblocks every worker

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::core::composition::{
    Composition, CompositionReport, ContextCreator, ContextualTask, TransactionalContext,
};
use crate::core::error::{CancellationReason, SchedulerError};
use crate::core::identity::{IdentityRegistry, TaskId};
use crate::core::task::{panic_message, Task, TaskState};

use super::{SchedulerCounters, SchedulerStats};

/// How long shutdown waits for in-flight tasks and for each thread to exit.
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// State shared between the scheduler handle, its dispatcher and its workers.
struct Shared {
    name: String,
    /// Submitted tasks that have not become ready yet.
    pending: Mutex<Vec<Task>>,
    /// Every submitted task that has not finished yet.
    in_flight: Mutex<HashMap<TaskId, Task>>,
    /// Signalled when `in_flight` becomes empty.
    idle: Condvar,
    counters: SchedulerCounters,
}

impl Shared {
    /// Tick every pending task and hand the ready ones to the workers.
    fn dispatch_ready(&self, ready_tx: &Sender<Task>) {
        let mut ready = Vec::new();
        let mut finished = Vec::new();
        {
            let mut pending = self.pending.lock();
            pending.retain(|task| match task.tick() {
                TaskState::Ready => {
                    ready.push(task.clone());
                    false
                }
                TaskState::Finished => {
                    finished.push(task.clone());
                    false
                }
                // Started or finishing elsewhere; its finish will wake us again.
                _ => true,
            });
        }

        for task in finished {
            self.counters.pending_tasks.fetch_sub(1, Ordering::Relaxed);
            self.complete(&task);
        }

        for task in ready {
            self.counters.pending_tasks.fetch_sub(1, Ordering::Relaxed);
            self.counters.active_tasks.fetch_add(1, Ordering::Relaxed);
            debug!(scheduler = %self.name, task_id = %task.id(), task = %task.name(), "task ready");
            if let Err(crossbeam_channel::SendError(task)) = ready_tx.send(task) {
                warn!(scheduler = %self.name, task = %task.name(), "no worker left to run ready task");
                task.cancel(CancellationReason::message(format!(
                    "scheduler `{}` has no running worker",
                    self.name
                )));
                task.finish();
                self.counters.active_tasks.fetch_sub(1, Ordering::Relaxed);
                self.complete(&task);
            }
        }
    }

    /// Forget a finished task and signal idleness.
    fn complete(&self, task: &Task) {
        let mut in_flight = self.in_flight.lock();
        if in_flight.remove(&task.id()).is_none() {
            return;
        }
        if task.is_cancelled() {
            self.counters.cancelled_tasks.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.completed_tasks.fetch_add(1, Ordering::Relaxed);
        }
        if in_flight.is_empty() {
            self.idle.notify_all();
        }
    }

    /// Cancel and finish every task that never became ready.
    fn abandon_pending(&self, reason: &CancellationReason) -> usize {
        let abandoned: Vec<Task> = std::mem::take(&mut *self.pending.lock());
        for task in &abandoned {
            task.cancel(reason.clone());
            task.finish();
            self.counters.pending_tasks.fetch_sub(1, Ordering::Relaxed);
            self.complete(task);
        }
        abandoned.len()
    }
}

/// Bounded-concurrency scheduler with dedicated OS worker threads.
///
/// # Design
///
/// - **Readiness on demand**: pending tasks are ticked by a dispatcher thread
///   whenever a wake arrives
/// - **Bounded concurrency**: at most `worker_count` bodies execute at once
/// - **Mutual exclusion**: tasks sharing an identity never execute together,
///   across every scheduler sharing the same registry
pub struct Scheduler {
    /// Scheduler configuration.
    config: SchedulerConfig,

    /// Registry of executing identities shared with every enqueued task.
    registry: Arc<IdentityRegistry>,

    /// Queue state shared with the dispatcher and workers.
    shared: Arc<Shared>,

    /// Coalescing wake signal for the dispatcher.
    wake_tx: Sender<()>,

    /// Set once submissions are refused.
    closed: AtomicBool,

    /// Tells the dispatcher to exit.
    stop: Arc<AtomicBool>,

    /// Dispatcher and worker thread handles.
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Create a scheduler with its own identity registry.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::InvalidConfig` if the configuration is invalid,
    /// or `SchedulerError::Backend` if a thread cannot be spawned.
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        Self::with_registry(config, Arc::new(IdentityRegistry::new()))
    }

    /// Create a scheduler sharing an existing identity registry.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::InvalidConfig` if the configuration is invalid,
    /// or `SchedulerError::Backend` if a thread cannot be spawned.
    pub fn with_registry(
        config: SchedulerConfig,
        registry: Arc<IdentityRegistry>,
    ) -> Result<Self, SchedulerError> {
        config.validate().map_err(SchedulerError::InvalidConfig)?;

        let (wake_tx, wake_rx) = bounded::<()>(1);
        let (ready_tx, ready_rx) = unbounded::<Task>();
        let shared = Arc::new(Shared {
            name: config.name.clone(),
            pending: Mutex::new(Vec::new()),
            in_flight: Mutex::new(HashMap::new()),
            idle: Condvar::new(),
            counters: SchedulerCounters::default(),
        });
        let stop = Arc::new(AtomicBool::new(false));

        let mut threads = Vec::with_capacity(config.worker_count + 1);
        for worker_id in 0..config.worker_count {
            threads.push(spawn_worker(
                worker_id,
                ready_rx.clone(),
                Arc::clone(&shared),
                config.thread_stack_size,
            )?);
        }
        threads.push(spawn_dispatcher(
            Arc::clone(&shared),
            wake_rx,
            ready_tx,
            Arc::clone(&stop),
        )?);

        registry.add_waker(wake_tx.clone());

        info!(
            scheduler = %config.name,
            worker_count = config.worker_count,
            max_queue_depth = config.max_queue_depth,
            "scheduler initialized"
        );

        Ok(Self {
            config,
            registry,
            shared,
            wake_tx,
            closed: AtomicBool::new(false),
            stop,
            threads: Mutex::new(threads),
        })
    }

    /// Scheduler name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Scheduler configuration.
    #[must_use]
    pub const fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Identity registry shared with every task enqueued here.
    #[must_use]
    pub const fn registry(&self) -> &Arc<IdentityRegistry> {
        &self.registry
    }

    /// Submit a task. It runs once its dependencies finished and its identity is free.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::Shutdown` if the scheduler has been shut down
    /// - `SchedulerError::QueueFull` if `max_queue_depth` tasks are unfinished
    /// - `SchedulerError::AlreadyEnqueued` if the task was submitted before
    pub fn submit(&self, task: &Task) -> Result<(), SchedulerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SchedulerError::Shutdown);
        }

        {
            let mut in_flight = self.shared.in_flight.lock();
            if in_flight.len() >= self.config.max_queue_depth {
                warn!(
                    scheduler = %self.config.name,
                    task = %task.name(),
                    depth = in_flight.len(),
                    "task rejected: queue full"
                );
                return Err(SchedulerError::QueueFull(self.config.name.clone()));
            }
            task.enqueue(Arc::clone(&self.registry))?;
            in_flight.insert(task.id(), task.clone());
        }

        task.add_waker(self.wake_tx.clone());
        for dependency in task.dependencies() {
            dependency.add_waker(self.wake_tx.clone());
        }
        self.shared.pending.lock().push(task.clone());

        self.shared.counters.submitted_tasks.fetch_add(1, Ordering::Relaxed);
        self.shared.counters.pending_tasks.fetch_add(1, Ordering::Relaxed);
        debug!(scheduler = %self.config.name, task_id = %task.id(), task = %task.name(), "task submitted");

        self.wake();
        Ok(())
    }

    /// Submit a task and wait asynchronously until it finished.
    ///
    /// # Errors
    ///
    /// Returns the submission error, or `SchedulerError::Cancelled` carrying the
    /// task's cancellation reason.
    pub async fn add_and_await(&self, task: &Task) -> Result<(), SchedulerError> {
        self.submit(task)?;
        task.finished().await;
        outcome_of(task)
    }

    /// Submit a task and block the current thread until it finished.
    ///
    /// # Errors
    ///
    /// Returns the submission error, or `SchedulerError::Cancelled` carrying the
    /// task's cancellation reason.
    pub fn add_and_wait(&self, task: &Task) -> Result<(), SchedulerError> {
        self.submit(task)?;
        task.wait_until_finished();
        outcome_of(task)
    }

    /// Run `steps` as one composition sharing a context from `creator`.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::Cancelled` carrying the composition's reason when a
    /// step cancelled, a dependency was unfinished or the commit failed.
    pub async fn run_composition<C>(
        &self,
        creator: Arc<dyn ContextCreator<C>>,
        steps: Vec<ContextualTask<C>>,
    ) -> Result<CompositionReport, SchedulerError>
    where
        C: TransactionalContext,
    {
        let composition = Composition::new(creator, steps)?;
        self.add_and_await(composition.task()).await?;
        composition
            .report()
            .ok_or_else(|| SchedulerError::Backend("composition finished without a report".into()))
    }

    /// Request cancellation of `task`.
    pub fn cancel(&self, task: &Task, reason: CancellationReason) -> bool {
        task.cancel(reason)
    }

    /// Request cancellation of every unfinished task. Returns how many were cancelled.
    pub fn cancel_all(&self, reason: CancellationReason) -> usize {
        let tasks: Vec<Task> = self.shared.in_flight.lock().values().cloned().collect();
        tasks.iter().filter(|task| task.cancel(reason.clone())).count()
    }

    /// Block until every submitted task finished.
    pub fn wait_until_all_finished(&self) {
        let mut in_flight = self.shared.in_flight.lock();
        while !in_flight.is_empty() {
            self.shared.idle.wait(&mut in_flight);
        }
    }

    /// Like [`Scheduler::wait_until_all_finished`], giving up after `timeout`.
    ///
    /// Returns whether every task finished.
    pub fn wait_until_all_finished_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut in_flight = self.shared.in_flight.lock();
        while !in_flight.is_empty() {
            if self.shared.idle.wait_until(&mut in_flight, deadline).timed_out() {
                return in_flight.is_empty();
            }
        }
        true
    }

    /// Number of tasks waiting for their conditions.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Number of submitted tasks that have not finished.
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.shared.in_flight.lock().len()
    }

    /// Whether every submitted task finished.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.shared.in_flight.lock().is_empty()
    }

    /// Get current scheduler statistics.
    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        self.shared.counters.snapshot(self.config.worker_count)
    }

    /// Shut the scheduler down.
    ///
    /// New submissions are refused, unfinished tasks are cancelled and given up
    /// to two seconds to finish, then the dispatcher and workers are joined with
    /// the same per-thread timeout. Threads that do not exit in time are detached.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        info!(scheduler = %self.config.name, "shutting down scheduler");

        let reason = CancellationReason::message(format!("scheduler `{}` shut down", self.config.name));
        let cancelled = self.cancel_all(reason.clone());
        if cancelled > 0 {
            debug!(scheduler = %self.config.name, cancelled, "cancelled unfinished tasks");
        }
        self.wake();
        if !self.wait_until_all_finished_for(JOIN_TIMEOUT) {
            warn!(
                scheduler = %self.config.name,
                in_flight = self.in_flight_count(),
                "tasks still running at shutdown"
            );
        }

        self.stop.store(true, Ordering::Release);
        self.wake();
        self.shared.abandon_pending(&reason);

        let mut threads = self.threads.lock();
        let thread_count = threads.len();

        for (idx, handle) in threads.drain(..).enumerate() {
            let (tx, rx) = std::sync::mpsc::channel();
            let join_thread = thread::spawn(move || {
                let result = handle.join();
                let _ = tx.send(result.is_ok());
            });

            match rx.recv_timeout(JOIN_TIMEOUT) {
                Ok(true) => {
                    debug!(scheduler = %self.config.name, thread = idx, "thread joined");
                }
                Ok(false) => {
                    warn!(scheduler = %self.config.name, thread = idx, "thread panicked");
                }
                Err(_) => {
                    warn!(scheduler = %self.config.name, thread = idx, "thread did not exit within timeout - detaching");
                    continue;
                }
            }

            let _ = join_thread.join();
        }

        info!(scheduler = %self.config.name, thread_count, "scheduler shut down complete");
    }

    fn wake(&self) {
        let _ = self.wake_tx.try_send(());
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // Signal shutdown but don't join threads in Drop.
        if !self.closed.swap(true, Ordering::AcqRel) {
            let reason =
                CancellationReason::message(format!("scheduler `{}` dropped", self.config.name));
            self.cancel_all(reason.clone());
            self.shared.abandon_pending(&reason);
            self.stop.store(true, Ordering::Release);
            self.wake();
            debug!(scheduler = %self.config.name, "scheduler dropped without explicit shutdown - threads will be detached");
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.config.name)
            .field("worker_count", &self.config.worker_count)
            .field("in_flight", &self.in_flight_count())
            .finish_non_exhaustive()
    }
}

fn outcome_of(task: &Task) -> Result<(), SchedulerError> {
    match task.cancellation_reason() {
        Some(reason) => Err(SchedulerError::Cancelled(reason)),
        None => Ok(()),
    }
}

fn build_runtime(worker_id: usize) -> Option<tokio::runtime::Runtime> {
    match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => Some(rt),
        Err(e) => {
            error!(worker_id, error = %e, "failed to create worker runtime");
            None
        }
    }
}

/// Spawn a worker thread.
fn spawn_worker(
    worker_id: usize,
    ready_rx: Receiver<Task>,
    shared: Arc<Shared>,
    stack_size: usize,
) -> Result<JoinHandle<()>, SchedulerError> {
    thread::Builder::new()
        .name(format!("{}-worker-{worker_id}", shared.name))
        .stack_size(stack_size)
        .spawn(move || {
            debug!(scheduler = %shared.name, worker_id, "worker thread started");

            // Each worker has its own single-threaded tokio runtime
            let Some(mut rt) = build_runtime(worker_id) else {
                return;
            };

            // Blocks until a ready task arrives; exits once the dispatcher is gone
            while let Ok(task) = ready_rx.recv() {
                debug!(
                    scheduler = %shared.name,
                    worker_id,
                    task_id = %task.id(),
                    task = %task.name(),
                    "worker executing task"
                );

                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    rt.block_on(task.start_on_worker(stack_size));
                }));
                let mut runtime_lost = false;
                if let Err(payload) = outcome {
                    let message = panic_message(payload.as_ref());
                    error!(
                        scheduler = %shared.name,
                        worker_id,
                        task = %task.name(),
                        panic = %message,
                        "task panicked"
                    );
                    task.cancel(CancellationReason::Panicked(message));
                    task.finish();
                    match build_runtime(worker_id) {
                        Some(fresh) => rt = fresh,
                        None => runtime_lost = true,
                    }
                }

                shared.counters.active_tasks.fetch_sub(1, Ordering::Relaxed);
                shared.complete(&task);

                if runtime_lost {
                    break;
                }
            }

            debug!(scheduler = %shared.name, worker_id, "worker thread exiting");
        })
        .map_err(|e| SchedulerError::Backend(format!("failed to spawn worker thread: {e}")))
}

/// Spawn the dispatcher thread that turns wake signals into readiness ticks.
fn spawn_dispatcher(
    shared: Arc<Shared>,
    wake_rx: Receiver<()>,
    ready_tx: Sender<Task>,
    stop: Arc<AtomicBool>,
) -> Result<JoinHandle<()>, SchedulerError> {
    thread::Builder::new()
        .name(format!("{}-dispatcher", shared.name))
        .spawn(move || {
            while wake_rx.recv().is_ok() {
                if stop.load(Ordering::Acquire) {
                    break;
                }
                shared.dispatch_ready(&ready_tx);
            }
            debug!(scheduler = %shared.name, "dispatcher exiting");
        })
        .map_err(|e| SchedulerError::Backend(format!("failed to spawn dispatcher thread: {e}")))
}
