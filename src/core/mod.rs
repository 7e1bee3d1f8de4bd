//! Core scheduling abstractions: tasks, identities, schedulers and compositions.

pub mod error;
pub mod identity;
pub mod task;
pub mod audit;
pub mod scheduler;
pub mod composition;
pub mod wrapper;

pub use error::{AppResult, BoxError, CancellationReason, SchedulerError};
pub use identity::{FlowId, IdentityRegistry, TaskId, TaskIdentity};
pub use task::{ExecutionContext, Operation, Task, TaskDelegate, TaskState, TaskTransition};
pub use audit::{AuditDelegate, AuditEvent, AuditSink, InMemoryAuditSink, build_audit_event};
pub use scheduler::{Scheduler, SchedulerStats};
pub use composition::{
    Composition, CompositionReport, ContextCreator, ContextualStep, ContextualTask,
    TransactionalContext,
};
pub use wrapper::{DelegatingWrapper, ObservingWrapper, WrapperHooks};
