//! Task identities and the registry of identities currently executing.
//!
//! A [`TaskIdentity`] names a logical class of work. Two tasks sharing an identity
//! never execute at the same time: a task registers its identity in the shared
//! [`IdentityRegistry`] while it becomes ready and deregisters it when it starts
//! finishing.

use std::collections::HashMap;
use std::fmt;

use crossbeam_channel::{Sender, TrySendError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier unique to one task instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Generate a new unique task ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlates every log line emitted on behalf of one logical flow of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowId(pub Uuid);

impl FlowId {
    /// Generate a new flow identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for FlowId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical identity used for mutual exclusion between equivalent tasks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskIdentity {
    /// Class of work, e.g. `"backup-upload"`.
    pub kind: String,
    /// Instance the work applies to.
    pub id: Uuid,
}

impl TaskIdentity {
    /// Create an identity.
    pub fn new(kind: impl Into<String>, id: Uuid) -> Self {
        Self {
            kind: kind.into(),
            id,
        }
    }

    /// Create an identity with a fresh random id.
    pub fn unique(kind: impl Into<String>) -> Self {
        Self::new(kind, Uuid::new_v4())
    }
}

impl fmt::Display for TaskIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Set of identities held by tasks between `Ready` and `Finishing`.
///
/// One registry is created with a scheduler and shared by reference with every
/// task it enqueues, and with the private queues of compositions and wrappers
/// running on it. It holds at most one entry per identity.
#[derive(Default)]
pub struct IdentityRegistry {
    holders: Mutex<HashMap<TaskIdentity, TaskId>>,
    wakers: Mutex<Vec<Sender<()>>>,
}

impl IdentityRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `holder` as the executing task for `identity`.
    ///
    /// Returns `true` if the identity is now held by `holder` (including when it
    /// already was), `false` if another task holds it.
    pub fn try_register(&self, identity: &TaskIdentity, holder: TaskId) -> bool {
        let mut holders = self.holders.lock();
        match holders.get(identity) {
            Some(current) => *current == holder,
            None => {
                holders.insert(identity.clone(), holder);
                true
            }
        }
    }

    /// Release `identity` if `holder` holds it, then wake every scheduler
    /// waiting on this registry.
    pub fn deregister(&self, identity: &TaskIdentity, holder: TaskId) -> bool {
        let removed = {
            let mut holders = self.holders.lock();
            if holders.get(identity) == Some(&holder) {
                holders.remove(identity);
                true
            } else {
                false
            }
        };
        if removed {
            self.wake_all();
        }
        removed
    }

    /// The task currently holding `identity`.
    pub fn holder(&self, identity: &TaskIdentity) -> Option<TaskId> {
        self.holders.lock().get(identity).copied()
    }

    /// Whether `identity` is currently held.
    pub fn contains(&self, identity: &TaskIdentity) -> bool {
        self.holders.lock().contains_key(identity)
    }

    /// Number of identities currently held.
    pub fn len(&self) -> usize {
        self.holders.lock().len()
    }

    /// Whether no identity is held.
    pub fn is_empty(&self) -> bool {
        self.holders.lock().is_empty()
    }

    /// Register a wake channel signalled whenever an identity is released.
    pub fn add_waker(&self, waker: Sender<()>) {
        self.wakers.lock().push(waker);
    }

    fn wake_all(&self) {
        let mut wakers = self.wakers.lock();
        wakers.retain(|waker| !matches!(waker.try_send(()), Err(TrySendError::Disconnected(()))));
    }
}

impl fmt::Debug for IdentityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityRegistry")
            .field("held", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_holder_is_refused() {
        let registry = IdentityRegistry::new();
        let identity = TaskIdentity::unique("backup");
        let first = TaskId::new();
        let second = TaskId::new();

        assert!(registry.try_register(&identity, first));
        assert!(!registry.try_register(&identity, second));
        assert_eq!(registry.holder(&identity), Some(first));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_is_idempotent_for_same_holder() {
        let registry = IdentityRegistry::new();
        let identity = TaskIdentity::unique("sync");
        let holder = TaskId::new();

        assert!(registry.try_register(&identity, holder));
        assert!(registry.try_register(&identity, holder));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_only_holder_can_deregister() {
        let registry = IdentityRegistry::new();
        let identity = TaskIdentity::unique("bootstrap");
        let holder = TaskId::new();
        registry.try_register(&identity, holder);

        assert!(!registry.deregister(&identity, TaskId::new()));
        assert!(registry.contains(&identity));
        assert!(registry.deregister(&identity, holder));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_deregister_wakes_waiters() {
        let registry = IdentityRegistry::new();
        let (tx, rx) = crossbeam_channel::bounded(1);
        registry.add_waker(tx);

        let identity = TaskIdentity::unique("crypto");
        let holder = TaskId::new();
        registry.try_register(&identity, holder);
        assert!(rx.try_recv().is_err());

        registry.deregister(&identity, holder);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_identity_display() {
        let id = Uuid::nil();
        let identity = TaskIdentity::new("backup", id);
        assert_eq!(identity.to_string(), format!("backup:{id}"));
    }
}
