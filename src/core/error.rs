//! Error types for scheduler operations and task cancellation.

use std::error::Error as StdError;
use std::sync::Arc;

use thiserror::Error;

/// Boxed error returned by external collaborators such as transactional contexts.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Shared error value; cancellation reasons are cloned to every observer.
pub type SharedError = Arc<dyn StdError + Send + Sync + 'static>;

/// Why a task or composition did not complete successfully.
///
/// Reasons nest: every composition layer wraps the reason of its failing step in
/// [`CancellationReason::StepCancelled`], so the origin of a failure raised deep
/// inside nested compositions stays inspectable from the outermost layer through
/// [`CancellationReason::root_cause`] and [`CancellationReason::step_path`].
#[derive(Debug, Clone, Error)]
pub enum CancellationReason {
    /// A step cancelled itself with its own error.
    #[error("{0}")]
    Leaf(SharedError),
    /// A step of a composition (or the task wrapped by a wrapper) cancelled.
    #[error("step {index} cancelled: {reason}")]
    StepCancelled {
        /// Zero-based position of the failing step.
        index: usize,
        /// The step's own reason.
        #[source]
        reason: Box<CancellationReason>,
    },
    /// A step was asked to run before one of its declared dependencies finished.
    #[error("step {index} was started before its dependencies finished")]
    UnfinishedDependency {
        /// Zero-based position of the offending step.
        index: usize,
    },
    /// Every step succeeded but committing the shared context failed.
    #[error("transaction failed: {0}")]
    TransactionFailed(SharedError),
    /// A step finished in a cancelled state without supplying a reason.
    #[error("cancelled for an unknown reason")]
    UnknownReason,
    /// At least one dependency of the task finished cancelled.
    #[error("a dependency was cancelled")]
    DependencyCancelled,
    /// A contextual step ran without a transactional context injected.
    #[error("no transactional context was injected")]
    MissingContext,
    /// The task body panicked; the worker caught the panic.
    #[error("task panicked: {0}")]
    Panicked(String),
    /// Free-form reason supplied by a caller.
    #[error("{0}")]
    Message(String),
}

impl CancellationReason {
    /// Build a leaf reason from a concrete error.
    pub fn leaf<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Leaf(Arc::new(error))
    }

    /// Build a free-form reason.
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    /// Wrap the reason of the step at `index`.
    #[must_use]
    pub fn wrapped(index: usize, reason: Self) -> Self {
        Self::StepCancelled {
            index,
            reason: Box::new(reason),
        }
    }

    /// Build a commit failure reason.
    pub fn transaction_failed(error: BoxError) -> Self {
        Self::TransactionFailed(Arc::from(error))
    }

    /// The innermost reason, after unwrapping every composition layer.
    #[must_use]
    pub fn root_cause(&self) -> &Self {
        let mut current = self;
        while let Self::StepCancelled { reason, .. } = current {
            current = reason;
        }
        current
    }

    /// Step indices from the outermost composition layer to the innermost one.
    #[must_use]
    pub fn step_path(&self) -> Vec<usize> {
        let mut path = Vec::new();
        let mut current = self;
        while let Self::StepCancelled { index, reason } = current {
            path.push(*index);
            current = reason;
        }
        path
    }

    /// Whether the root cause is [`CancellationReason::UnknownReason`].
    ///
    /// An unknown reason means a step misbehaved and should be reported as a bug.
    #[must_use]
    pub fn is_unknown(&self) -> bool {
        matches!(self.root_cause(), Self::UnknownReason)
    }
}

/// Errors produced by scheduler components.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Queue is full for the target scheduler.
    #[error("queue full: {0}")]
    QueueFull(String),
    /// The scheduler has been shut down.
    #[error("scheduler has been shut down")]
    Shutdown,
    /// The task left the `Initialized` state already.
    #[error("task `{0}` was already enqueued")]
    AlreadyEnqueued(String),
    /// Dependencies can only be added while the task is `Initialized`.
    #[error("dependencies of task `{0}` are frozen")]
    DependenciesFrozen(String),
    /// The dependency would make the task depend on itself.
    #[error("task `{0}` cannot depend on itself")]
    SelfDependency(String),
    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The awaited task finished cancelled.
    #[error("cancelled: {0}")]
    Cancelled(#[from] CancellationReason),
    /// Thread or runtime failure with context.
    #[error("backend error: {0}")]
    Backend(String),
}

impl SchedulerError {
    /// The cancellation reason, if the awaited task was cancelled.
    #[must_use]
    pub const fn cancellation_reason(&self) -> Option<&CancellationReason> {
        match self {
            Self::Cancelled(reason) => Some(reason),
            _ => None,
        }
    }
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("disk full")]
    struct DiskFull;

    #[test]
    fn test_root_cause_and_path_through_nested_layers() {
        let reason = CancellationReason::wrapped(
            2,
            CancellationReason::wrapped(0, CancellationReason::leaf(DiskFull)),
        );

        assert_eq!(reason.step_path(), vec![2, 0]);
        assert!(matches!(reason.root_cause(), CancellationReason::Leaf(_)));
        assert_eq!(reason.root_cause().to_string(), "disk full");
        assert_eq!(
            reason.to_string(),
            "step 2 cancelled: step 0 cancelled: disk full"
        );
    }

    #[test]
    fn test_source_chain_follows_wrapped_reason() {
        let reason = CancellationReason::wrapped(1, CancellationReason::UnknownReason);
        let source = reason.source().map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("cancelled for an unknown reason"));
        assert!(reason.is_unknown());
    }

    #[test]
    fn test_leaf_is_its_own_root() {
        let reason = CancellationReason::message("boom");
        assert!(reason.step_path().is_empty());
        assert_eq!(reason.root_cause().to_string(), "boom");
        assert!(!reason.is_unknown());
    }

    #[test]
    fn test_transaction_failed_keeps_error_text() {
        let reason = CancellationReason::transaction_failed(Box::new(DiskFull));
        assert_eq!(reason.to_string(), "transaction failed: disk full");
    }

    #[test]
    fn test_scheduler_error_from_reason() {
        let err: SchedulerError = CancellationReason::DependencyCancelled.into();
        assert!(matches!(
            err.cancellation_reason(),
            Some(CancellationReason::DependencyCancelled)
        ));
        assert_eq!(err.to_string(), "cancelled: a dependency was cancelled");
    }
}
