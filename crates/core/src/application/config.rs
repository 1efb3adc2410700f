// Engine Configuration - groups, types, callbacks
//
// The numeric half (threads, ratios, budgets, timeouts) can also be loaded
// from a file through `application::settings`; callbacks are registered
// programmatically, either directly on this struct or through the engine's
// `config_*` builders before the first start.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::time::Duration;

use crate::domain::{JobGroup, JobItem, JobType};
use crate::error::EngineError;
use crate::sync::PrioConfig;

use super::engine::JobsEngine;

/// Shared handle to a registered job.
pub type JobHandle<R, S> = Arc<JobItem<R, S>>;

/// Per-invocation scheduling feedback returned by processing callbacks.
///
/// `delay_next_request` asks the group to pause before its next iteration;
/// the engine merges it (max) with the group's configured delay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessingConfig {
    pub delay_next_request: Option<Duration>,
}

/// Processes a batch of jobs of one type. Receives a handle to the engine
/// so it can re-enter the public API (submit children, set states, ...).
pub type ProcessingFn<R, S> = Arc<
    dyn Fn(JobsEngine<R, S>, Vec<JobHandle<R, S>>) -> BoxFuture<'static, ProcessingConfig>
        + Send
        + Sync,
>;

/// Runs on a parent each time one of its children completes.
pub type ChildrenFinishedFn<R, S> = Arc<
    dyn Fn(JobsEngine<R, S>, JobHandle<R, S>, JobHandle<R, S>) -> BoxFuture<'static, ()>
        + Send
        + Sync,
>;

/// Runs once per job when it reaches a terminal state.
pub type FinishedFn<R, S> =
    Arc<dyn Fn(JobsEngine<R, S>, Vec<JobHandle<R, S>>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Engine-wide knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Worker tasks to start; 0 defers to an explicit `start_threads`.
    pub threads_count: usize,
    /// Priority levels in use and their anti-starvation ratios.
    pub prio_config: PrioConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            threads_count: super::constants::DEFAULT_ENGINE_THREADS,
            prio_config: PrioConfig::default(),
        }
    }
}

/// Per-group scheduling budget.
#[derive(Debug, Clone)]
pub struct GroupConfig {
    /// Worker tasks this group may occupy at once.
    pub threads_count: usize,
    /// Jobs a single worker dequeues per iteration (upper bound).
    pub bulk_count: usize,
    /// Pause between consecutive iterations of this group.
    pub delay_next_request: Option<Duration>,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            threads_count: super::constants::DEFAULT_GROUP_THREADS,
            bulk_count: super::constants::DEFAULT_BULK_COUNT,
            delay_next_request: None,
        }
    }
}

impl GroupConfig {
    pub fn new(threads_count: usize) -> Self {
        Self {
            threads_count,
            ..Default::default()
        }
    }

    pub fn with_bulk_count(mut self, bulk_count: usize) -> Self {
        self.bulk_count = bulk_count;
        self
    }

    pub fn with_delay_next_request(mut self, delay: Duration) -> Self {
        self.delay_next_request = Some(delay);
        self
    }
}

/// Per-type routing, timeout and callback overrides.
pub struct TypeConfig<R, S> {
    /// Group this type is scheduled under.
    pub group: JobGroup,
    /// Watchdog timeout installed at submission time.
    pub timeout: Option<Duration>,
    pub processing: Option<ProcessingFn<R, S>>,
    pub on_children_finished: Option<ChildrenFinishedFn<R, S>>,
    pub on_finished: Option<FinishedFn<R, S>>,
}

impl<R, S> TypeConfig<R, S> {
    pub fn new(group: JobGroup) -> Self {
        Self {
            group,
            timeout: None,
            processing: None,
            on_children_finished: None,
            on_finished: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl<R, S> Clone for TypeConfig<R, S> {
    fn clone(&self) -> Self {
        Self {
            group: self.group.clone(),
            timeout: self.timeout,
            processing: self.processing.clone(),
            on_children_finished: self.on_children_finished.clone(),
            on_finished: self.on_finished.clone(),
        }
    }
}

/// Full engine configuration: engine knobs, group budgets, type bindings
/// and the default callbacks applied to types without their own.
pub struct JobsConfig<R, S> {
    pub engine: EngineConfig,
    pub groups: HashMap<JobGroup, GroupConfig>,
    pub types: HashMap<JobType, TypeConfig<R, S>>,
    pub default_processing: Option<ProcessingFn<R, S>>,
    pub default_on_children_finished: Option<ChildrenFinishedFn<R, S>>,
    pub default_on_finished: Option<FinishedFn<R, S>>,
}

impl<R, S> Default for JobsConfig<R, S> {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            groups: HashMap::new(),
            types: HashMap::new(),
            default_processing: None,
            default_on_children_finished: None,
            default_on_finished: None,
        }
    }
}

impl<R, S> Clone for JobsConfig<R, S> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            groups: self.groups.clone(),
            types: self.types.clone(),
            default_processing: self.default_processing.clone(),
            default_on_children_finished: self.default_on_children_finished.clone(),
            default_on_finished: self.default_on_finished.clone(),
        }
    }
}

impl<R, S> JobsConfig<R, S> {
    pub fn new(engine: EngineConfig) -> Self {
        Self {
            engine,
            ..Default::default()
        }
    }

    pub fn with_group(mut self, group: JobGroup, config: GroupConfig) -> Self {
        self.groups.insert(group, config);
        self
    }

    pub fn with_type(mut self, job_type: JobType, config: TypeConfig<R, S>) -> Self {
        self.types.insert(job_type, config);
        self
    }

    /// Every type must be bound to a configured group.
    pub fn validate(&self) -> Result<(), EngineError> {
        for (job_type, type_config) in &self.types {
            if !self.groups.contains_key(&type_config.group) {
                return Err(EngineError::Config(format!(
                    "job type '{}' bound to unknown group '{}'",
                    job_type, type_config.group
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestConfig = JobsConfig<String, String>;

    #[test]
    fn test_validate_accepts_bound_types() {
        let config = TestConfig::new(EngineConfig::default())
            .with_group(JobGroup::new("g"), GroupConfig::new(2))
            .with_type(JobType::new("t"), TypeConfig::new(JobGroup::new("g")));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unknown_group() {
        let config = TestConfig::new(EngineConfig::default())
            .with_type(JobType::new("t"), TypeConfig::new(JobGroup::new("missing")));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_group_config_builders() {
        let config = GroupConfig::new(4)
            .with_bulk_count(16)
            .with_delay_next_request(Duration::from_millis(5));
        assert_eq!(config.threads_count, 4);
        assert_eq!(config.bulk_count, 16);
        assert_eq!(config.delay_next_request, Some(Duration::from_millis(5)));
    }
}
