//! Scheduler configuration structures.

use std::collections::HashMap;
use std::env;

use serde::{Deserialize, Serialize};

/// Default stack size for worker threads (2 MiB).
pub const DEFAULT_THREAD_STACK_SIZE: usize = 2 * 1024 * 1024;

/// Default bound on tasks held by one scheduler.
pub const DEFAULT_MAX_QUEUE_DEPTH: usize = 1024;

fn default_name() -> String {
    "operations".into()
}

fn default_worker_count() -> usize {
    num_cpus::get().max(1)
}

const fn default_max_queue_depth() -> usize {
    DEFAULT_MAX_QUEUE_DEPTH
}

const fn default_thread_stack_size() -> usize {
    DEFAULT_THREAD_STACK_SIZE
}

/// Configuration of one scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Scheduler name, used for thread names and logs.
    #[serde(default = "default_name")]
    pub name: String,
    /// Number of worker threads, i.e. the maximum number of tasks executing at once.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Maximum number of submitted tasks that have not finished yet.
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: usize,
    /// Stack size of each worker thread, in bytes.
    #[serde(default = "default_thread_stack_size")]
    pub thread_stack_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            worker_count: default_worker_count(),
            max_queue_depth: default_max_queue_depth(),
            thread_stack_size: default_thread_stack_size(),
        }
    }
}

impl SchedulerConfig {
    /// Default configuration with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Single-worker queue: tasks execute one at a time in readiness order.
    pub fn serial(name: impl Into<String>) -> Self {
        Self::new(name).with_worker_count(1)
    }

    /// Private queue of a composition, sized to its number of steps.
    pub fn for_composition(name: impl Into<String>, steps: usize) -> Self {
        let steps = steps.max(1);
        Self::new(name)
            .with_worker_count(steps)
            .with_max_queue_depth(steps)
    }

    /// Set the name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the number of worker threads.
    #[must_use]
    pub const fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    /// Set the maximum number of unfinished tasks.
    #[must_use]
    pub const fn with_max_queue_depth(mut self, max_queue_depth: usize) -> Self {
        self.max_queue_depth = max_queue_depth;
        self
    }

    /// Set the worker thread stack size.
    #[must_use]
    pub const fn with_thread_stack_size(mut self, thread_stack_size: usize) -> Self {
        self.thread_stack_size = thread_stack_size;
        self
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid value.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("name must not be empty".into());
        }
        if self.worker_count == 0 {
            return Err("worker_count must be greater than 0".into());
        }
        if self.max_queue_depth == 0 {
            return Err("max_queue_depth must be greater than 0".into());
        }
        if self.thread_stack_size < 64 * 1024 {
            return Err("thread_stack_size must be at least 64 KiB".into());
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    ///
    /// # Errors
    ///
    /// Returns a description of the parse or validation failure.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Build configuration from `OPS_*` environment variables, loading a `.env`
    /// file first when present.
    ///
    /// Recognised variables: `OPS_SCHEDULER_NAME`, `OPS_WORKER_COUNT`,
    /// `OPS_MAX_QUEUE_DEPTH`, `OPS_THREAD_STACK_SIZE`. Unset variables keep
    /// their defaults.
    ///
    /// # Errors
    ///
    /// Returns a description of an unparsable variable or invalid value.
    pub fn from_env() -> Result<Self, String> {
        let _ = dotenvy::dotenv();
        let mut cfg = Self::default();
        if let Ok(name) = env::var("OPS_SCHEDULER_NAME") {
            cfg.name = name;
        }
        if let Some(value) = parse_env("OPS_WORKER_COUNT")? {
            cfg.worker_count = value;
        }
        if let Some(value) = parse_env("OPS_MAX_QUEUE_DEPTH")? {
            cfg.max_queue_depth = value;
        }
        if let Some(value) = parse_env("OPS_THREAD_STACK_SIZE")? {
            cfg.thread_stack_size = value;
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

fn parse_env(key: &str) -> Result<Option<usize>, String> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| format!("{key}: {e}")),
        Err(_) => Ok(None),
    }
}

/// Root configuration: named schedulers sharing one identity registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationsConfig {
    /// Map of scheduler name to configuration.
    pub schedulers: HashMap<String, SchedulerConfig>,
}

impl OperationsConfig {
    /// Validate all schedulers and ensure at least one exists.
    ///
    /// # Errors
    ///
    /// Returns a description naming the invalid scheduler.
    pub fn validate(&self) -> Result<(), String> {
        if self.schedulers.is_empty() {
            return Err("at least one scheduler must be defined".into());
        }
        for (name, scheduler) in &self.schedulers {
            scheduler
                .validate()
                .map_err(|e| format!("scheduler `{name}` invalid: {e}"))?;
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    ///
    /// # Errors
    ///
    /// Returns a description of the parse or validation failure.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }
}
