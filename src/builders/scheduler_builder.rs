//! Builders to construct schedulers from configuration.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{OperationsConfig, SchedulerConfig};
use crate::core::{IdentityRegistry, Scheduler, SchedulerError};

/// Builder for a single named scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    registry: Option<Arc<IdentityRegistry>>,
}

impl SchedulerBuilder {
    /// Start from the default configuration named `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            config: SchedulerConfig::new(name),
            registry: None,
        }
    }

    /// Start from an existing configuration.
    #[must_use]
    pub const fn from_config(config: SchedulerConfig) -> Self {
        Self {
            config,
            registry: None,
        }
    }

    /// Scheduler name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Configuration the scheduler will be built with.
    #[must_use]
    pub const fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Set the number of worker threads.
    #[must_use]
    pub fn worker_count(mut self, worker_count: usize) -> Self {
        self.config = self.config.with_worker_count(worker_count);
        self
    }

    /// Set the maximum number of unfinished tasks.
    #[must_use]
    pub fn max_queue_depth(mut self, max_queue_depth: usize) -> Self {
        self.config = self.config.with_max_queue_depth(max_queue_depth);
        self
    }

    /// Share `registry` instead of creating a new one.
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<IdentityRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Build and start the scheduler.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::InvalidConfig` for an invalid configuration, or
    /// `SchedulerError::Backend` if a thread cannot be spawned.
    pub fn build(self) -> Result<Scheduler, SchedulerError> {
        match self.registry {
            Some(registry) => Scheduler::with_registry(self.config, registry),
            None => Scheduler::new(self.config),
        }
    }
}

/// Build every configured scheduler, all sharing one identity registry.
///
/// # Errors
///
/// Returns `SchedulerError::InvalidConfig` naming the invalid scheduler, or the
/// first construction failure.
pub fn build_schedulers(
    cfg: &OperationsConfig,
) -> Result<HashMap<String, Scheduler>, SchedulerError> {
    cfg.validate().map_err(SchedulerError::InvalidConfig)?;

    let registry = Arc::new(IdentityRegistry::new());
    let mut schedulers = HashMap::new();
    for (name, scheduler_cfg) in &cfg.schedulers {
        let scheduler = SchedulerBuilder::from_config(scheduler_cfg.clone().with_name(name.clone()))
            .with_registry(Arc::clone(&registry))
            .build()?;
        schedulers.insert(name.clone(), scheduler);
    }

    Ok(schedulers)
}
