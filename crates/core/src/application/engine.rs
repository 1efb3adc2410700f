// Jobs Engine - facade wiring queue, state, thread pool and watchdog
//
// The engine owns the registry of live jobs, one priority queue and one
// admission budget per group, a delayed-start pump, a timeout watchdog and
// the worker pool of group tokens. Submissions go through `queue()`, state
// transitions through `state()`.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::domain::{JobGroup, JobId, JobState, JobType, Priority};
use crate::error::EngineError;
use crate::sync::worker_pool::panic_message;
use crate::sync::{PopResult, PrioQueue, TimerTask, WorkerPool};

use super::config::{
    ChildrenFinishedFn, FinishedFn, GroupConfig, JobHandle, JobsConfig, ProcessingConfig,
    ProcessingFn,
};
use super::pool::GroupStats;
use super::queue::JobsQueue;
use super::state::JobsState;

/// Per-group runtime: configured budget, the priority queue of job ids and
/// the admission stats.
pub(super) struct GroupRuntime {
    pub(super) config: GroupConfig,
    pub(super) queue: PrioQueue<JobId>,
    pub(super) stats: Mutex<GroupStats>,
}

/// The routing/budget half of the configuration, frozen at construction
/// (or by a pre-start `set_config`) and read lock-free through an `Arc`
/// snapshot afterwards.
pub(super) struct Topology {
    pub(super) groups: HashMap<JobGroup, GroupRuntime>,
    pub(super) type_groups: HashMap<JobType, JobGroup>,
    pub(super) type_timeouts: HashMap<JobType, Duration>,
}

/// Resolved callbacks per type (per-type override or the default).
pub(super) struct TypeCallbacks<R, S> {
    pub(super) processing: Option<ProcessingFn<R, S>>,
    pub(super) on_children_finished: Option<ChildrenFinishedFn<R, S>>,
    pub(super) on_finished: Option<FinishedFn<R, S>>,
}

pub(super) struct CallbackTable<R, S> {
    pub(super) types: HashMap<JobType, TypeCallbacks<R, S>>,
}

fn build_topology<R, S>(config: &JobsConfig<R, S>) -> Topology {
    let groups = config
        .groups
        .iter()
        .map(|(group, group_config)| {
            (
                group.clone(),
                GroupRuntime {
                    config: group_config.clone(),
                    queue: PrioQueue::new(config.engine.prio_config.clone()),
                    stats: Mutex::new(GroupStats::new(group_config.threads_count)),
                },
            )
        })
        .collect();
    let type_groups = config
        .types
        .iter()
        .map(|(job_type, type_config)| (job_type.clone(), type_config.group.clone()))
        .collect();
    let type_timeouts = config
        .types
        .iter()
        .filter_map(|(job_type, type_config)| {
            type_config.timeout.map(|timeout| (job_type.clone(), timeout))
        })
        .collect();

    Topology {
        groups,
        type_groups,
        type_timeouts,
    }
}

fn build_callbacks<R, S>(config: &JobsConfig<R, S>) -> CallbackTable<R, S> {
    let types = config
        .types
        .iter()
        .map(|(job_type, type_config)| {
            (
                job_type.clone(),
                TypeCallbacks {
                    processing: type_config
                        .processing
                        .clone()
                        .or_else(|| config.default_processing.clone()),
                    on_children_finished: type_config
                        .on_children_finished
                        .clone()
                        .or_else(|| config.default_on_children_finished.clone()),
                    on_finished: type_config
                        .on_finished
                        .clone()
                        .or_else(|| config.default_on_finished.clone()),
                },
            )
        })
        .collect();
    CallbackTable { types }
}

pub(super) struct EngineInner<R, S> {
    pub(super) config: Mutex<JobsConfig<R, S>>,
    pub(super) topology: RwLock<Arc<Topology>>,
    pub(super) callbacks: RwLock<Arc<CallbackTable<R, S>>>,
    pub(super) started: AtomicBool,
    pub(super) registry: Mutex<HashMap<JobId, JobHandle<R, S>>>,
    pub(super) next_id: AtomicU64,
    /// Delayed starts: matured `(priority, id)` pairs are started.
    pub(super) delayed: TimerTask<(Priority, JobId)>,
    /// Timeout watchdog: matured ids get a Timeout transition attempt.
    pub(super) timeouts: TimerTask<JobId>,
    /// Group tokens; one token = one `do_action` pass for that group.
    pub(super) pool: WorkerPool<JobGroup>,
}

/// The jobs engine. Cheap to clone; clones share the same engine.
pub struct JobsEngine<R, S> {
    pub(super) inner: Arc<EngineInner<R, S>>,
}

impl<R, S> Clone for JobsEngine<R, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R, S> JobsEngine<R, S>
where
    R: Send + Sync + 'static,
    S: Send + 'static,
{
    /// Build an engine from `config`.
    ///
    /// When `config.engine.threads_count > 0` the workers start right away
    /// (callbacks must then already be in the config); with 0 the engine
    /// waits for an explicit [`JobsEngine::start_threads`].
    pub fn new(config: JobsConfig<R, S>) -> Result<Self, EngineError> {
        config.validate()?;

        let threads_count = config.engine.threads_count;
        let inner = Arc::new(EngineInner {
            topology: RwLock::new(Arc::new(build_topology(&config))),
            callbacks: RwLock::new(Arc::new(build_callbacks(&config))),
            config: Mutex::new(config),
            started: AtomicBool::new(false),
            registry: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            delayed: TimerTask::new(),
            timeouts: TimerTask::new(),
            pool: WorkerPool::new(1),
        });

        let engine = Self { inner };
        if threads_count > 0 {
            engine.start_threads(threads_count);
        }
        Ok(engine)
    }

    /// Replace the whole configuration. Only valid before the first start;
    /// group queues are rebuilt, so do this before submitting jobs.
    pub fn set_config(&self, config: JobsConfig<R, S>) -> Result<(), EngineError> {
        if self.inner.started.load(Ordering::Acquire) {
            return Err(EngineError::AlreadyStarted);
        }
        config.validate()?;

        *self.inner.topology.write().unwrap() = Arc::new(build_topology(&config));
        *self.inner.callbacks.write().unwrap() = Arc::new(build_callbacks(&config));
        *self.inner.config.lock().unwrap() = config;
        Ok(())
    }

    //
    // callback registration (before the first start)
    //

    pub fn config_default_function_processing<F, Fut>(&self, f: F) -> Result<(), EngineError>
    where
        F: Fn(JobsEngine<R, S>, Vec<JobHandle<R, S>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ProcessingConfig> + Send + 'static,
    {
        let f = Arc::new(f);
        self.with_config(move |config| {
            config.default_processing = Some(wrap_processing(f));
        })
    }

    pub fn config_default_function_children_finished<F, Fut>(&self, f: F) -> Result<(), EngineError>
    where
        F: Fn(JobsEngine<R, S>, JobHandle<R, S>, JobHandle<R, S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let f = Arc::new(f);
        self.with_config(move |config| {
            config.default_on_children_finished = Some(wrap_children_finished(f));
        })
    }

    pub fn config_default_function_finished<F, Fut>(&self, f: F) -> Result<(), EngineError>
    where
        F: Fn(JobsEngine<R, S>, Vec<JobHandle<R, S>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let f = Arc::new(f);
        self.with_config(move |config| {
            config.default_on_finished = Some(wrap_finished(f));
        })
    }

    pub fn config_jobs_function_processing<F, Fut>(
        &self,
        job_type: JobType,
        f: F,
    ) -> Result<(), EngineError>
    where
        F: Fn(JobsEngine<R, S>, Vec<JobHandle<R, S>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ProcessingConfig> + Send + 'static,
    {
        let f = Arc::new(f);
        self.with_type_config(job_type, move |type_config| {
            type_config.processing = Some(wrap_processing(f));
        })
    }

    pub fn config_jobs_function_children_finished<F, Fut>(
        &self,
        job_type: JobType,
        f: F,
    ) -> Result<(), EngineError>
    where
        F: Fn(JobsEngine<R, S>, JobHandle<R, S>, JobHandle<R, S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let f = Arc::new(f);
        self.with_type_config(job_type, move |type_config| {
            type_config.on_children_finished = Some(wrap_children_finished(f));
        })
    }

    pub fn config_jobs_function_finished<F, Fut>(
        &self,
        job_type: JobType,
        f: F,
    ) -> Result<(), EngineError>
    where
        F: Fn(JobsEngine<R, S>, Vec<JobHandle<R, S>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let f = Arc::new(f);
        self.with_type_config(job_type, move |type_config| {
            type_config.on_finished = Some(wrap_finished(f));
        })
    }

    fn with_config(
        &self,
        mutate: impl FnOnce(&mut JobsConfig<R, S>),
    ) -> Result<(), EngineError> {
        if self.inner.started.load(Ordering::Acquire) {
            return Err(EngineError::AlreadyStarted);
        }
        let mut config = self.inner.config.lock().unwrap();
        mutate(&mut config);
        *self.inner.callbacks.write().unwrap() = Arc::new(build_callbacks(&config));
        Ok(())
    }

    fn with_type_config(
        &self,
        job_type: JobType,
        mutate: impl FnOnce(&mut super::config::TypeConfig<R, S>),
    ) -> Result<(), EngineError> {
        if self.inner.started.load(Ordering::Acquire) {
            return Err(EngineError::AlreadyStarted);
        }
        let mut config = self.inner.config.lock().unwrap();
        let Some(type_config) = config.types.get_mut(&job_type) else {
            return Err(EngineError::Domain(
                crate::domain::DomainError::UnknownJobType(job_type.as_str().to_string()),
            ));
        };
        mutate(type_config);
        *self.inner.callbacks.write().unwrap() = Arc::new(build_callbacks(&config));
        Ok(())
    }

    //
    // lifecycle
    //

    /// Start the worker tasks, the delayed-start pump and the watchdog.
    /// Idempotent after the first successful call.
    pub fn start_threads(&self, threads_count: usize) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(threads_count, "jobs engine starting");

        // delayed starts feed the group queues
        let inner = Arc::clone(&self.inner);
        self.inner.delayed.start(Arc::new(move |batch| {
            let inner = Arc::clone(&inner);
            Box::pin(async move {
                for (priority, job_id) in batch {
                    inner.jobs_start_one(priority, job_id).await;
                }
            })
        }));

        // matured timeouts become Timeout transition attempts
        let inner = Arc::clone(&self.inner);
        self.inner.timeouts.start(Arc::new(move |batch: Vec<JobId>| {
            let inner = Arc::clone(&inner);
            Box::pin(async move {
                debug!(count = batch.len(), "timeout watchdog fired");
                inner.jobs_state_ids(&batch, JobState::Timeout).await;
            })
        }));

        // group-token workers
        let inner = Arc::clone(&self.inner);
        self.inner.pool.start_threads(
            threads_count,
            Arc::new(move |groups: Vec<JobGroup>| {
                let inner = Arc::clone(&inner);
                Box::pin(async move {
                    for group in groups {
                        let (has_items, delay) = inner.do_action(&group).await;
                        inner.action_end(&group, has_items, delay);
                    }
                })
            }),
        );
    }

    /// Submission surface.
    pub fn queue(&self) -> JobsQueue<R, S> {
        JobsQueue {
            inner: Arc::clone(&self.inner),
        }
    }

    /// State transition surface.
    pub fn state(&self) -> JobsState<R, S> {
        JobsState {
            inner: Arc::clone(&self.inner),
        }
    }

    //
    // engine-level conveniences
    //

    pub fn jobs_get(&self, job_id: JobId) -> Option<JobHandle<R, S>> {
        self.inner.jobs_get(job_id)
    }

    pub async fn jobs_start(&self, priority: Priority, job_id: JobId) -> usize {
        self.inner.jobs_start_one(priority, job_id).await
    }

    pub fn jobs_parent_child(&self, parent_id: JobId, child_id: JobId) -> usize {
        self.inner.jobs_parent_child_ids(parent_id, child_id)
    }

    //
    // sizes
    //

    /// Live jobs in the registry.
    pub fn len(&self) -> usize {
        self.inner.registry.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Group tokens queued for processing.
    pub fn len_processing(&self) -> usize {
        self.inner.pool.len()
    }

    /// Jobs parked in the delayed-start queue.
    pub fn len_delayed(&self) -> usize {
        self.inner.delayed.queue().len()
    }

    pub fn clear(&self) {
        self.inner.registry.lock().unwrap().clear();
        let topology = self.inner.topology();
        for runtime in topology.groups.values() {
            runtime.queue.clear();
        }
        self.inner.delayed.queue().clear();
        self.inner.pool.clear();
    }

    pub fn clear_delayed(&self) {
        self.inner.delayed.queue().clear();
    }

    pub fn clear_processing(&self) {
        self.inner.pool.clear();
    }

    //
    // shutdown
    //

    /// Abort: wake every wait, refuse new work, let in-flight callbacks
    /// finish.
    pub fn signal_exit_force(&self) {
        info!("jobs engine force exit");
        self.inner.pool.signal_exit_force();
        self.inner.timeouts.queue().signal_exit_force();
        self.inner.queue_signal_exit_force();
    }

    /// Seal inputs and let everything drain. The delayed queue seals first;
    /// the group queues follow once it is empty (inside `wait`), so a
    /// scheduled start is never dropped.
    pub fn signal_exit_when_done(&self) {
        self.inner.delayed.queue().signal_exit_when_done();
    }

    /// For processing callbacks: has a force exit been requested?
    pub fn is_exit(&self) -> bool {
        self.inner.delayed.queue().is_exit_force()
    }

    /// Drain and stop: delayed starts, then group queues, then the worker
    /// pool; pending timeouts are discarded at the end.
    pub async fn wait(&self) -> PopResult<()> {
        self.signal_exit_when_done();

        self.inner.queue_wait().await;
        self.inner.pool.wait().await;

        self.inner.timeouts.queue().signal_exit_force();
        self.inner.timeouts.wait().await;

        info!("jobs engine stopped");
        PopResult::Exit
    }

    pub async fn wait_for(&self, timeout: Duration) -> PopResult<()> {
        self.wait_until(Instant::now() + timeout).await
    }

    pub async fn wait_until(&self, deadline: Instant) -> PopResult<()> {
        self.signal_exit_when_done();

        if self.inner.queue_wait_until(deadline).await.is_timeout() {
            return PopResult::Timeout;
        }
        if self.inner.pool.wait_until(deadline).await.is_timeout() {
            return PopResult::Timeout;
        }

        self.inner.timeouts.queue().signal_exit_force();
        self.inner.timeouts.wait().await;

        info!("jobs engine stopped");
        PopResult::Exit
    }
}

fn wrap_processing<R, S, F, Fut>(f: Arc<F>) -> ProcessingFn<R, S>
where
    F: Fn(JobsEngine<R, S>, Vec<JobHandle<R, S>>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ProcessingConfig> + Send + 'static,
{
    Arc::new(move |engine, items| f(engine, items).boxed())
}

fn wrap_children_finished<R, S, F, Fut>(f: Arc<F>) -> ChildrenFinishedFn<R, S>
where
    F: Fn(JobsEngine<R, S>, JobHandle<R, S>, JobHandle<R, S>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |engine, parent, child| f(engine, parent, child).boxed())
}

fn wrap_finished<R, S, F, Fut>(f: Arc<F>) -> FinishedFn<R, S>
where
    F: Fn(JobsEngine<R, S>, Vec<JobHandle<R, S>>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |engine, items| f(engine, items).boxed())
}

fn max_delay(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

impl<R, S> EngineInner<R, S>
where
    R: Send + Sync + 'static,
    S: Send + 'static,
{
    pub(super) fn topology(&self) -> Arc<Topology> {
        Arc::clone(&self.topology.read().unwrap())
    }

    pub(super) fn callbacks(&self) -> Arc<CallbackTable<R, S>> {
        Arc::clone(&self.callbacks.read().unwrap())
    }

    pub(super) fn engine_handle(self: &Arc<Self>) -> JobsEngine<R, S> {
        JobsEngine {
            inner: Arc::clone(self),
        }
    }

    //
    // one worker pass over one group
    //

    pub(super) async fn do_action(
        self: &Arc<Self>,
        group: &JobGroup,
    ) -> (bool, Option<Duration>) {
        let topology = self.topology();
        let Some(runtime) = topology.groups.get(group) else {
            return (false, None);
        };
        let bulk_count = runtime.config.bulk_count.max(1);
        let mut delay = runtime.config.delay_next_request;

        // non-blocking pop: an empty pass just gives the token back
        let ids = match runtime
            .queue
            .wait_pop_front_bulk_for(Duration::ZERO, bulk_count)
            .await
        {
            PopResult::Element(ids) => ids,
            PopResult::Timeout | PopResult::Exit => return (false, None),
        };

        // claim the items; anything already past InProgress (cancelled,
        // timed out, finished by someone else) is skipped
        let items = self.jobs_get_bulk(&ids);
        let mut by_type: HashMap<JobType, Vec<JobHandle<R, S>>> = HashMap::new();
        for item in items {
            item.set_state_in_progress();
            if item.is_state(JobState::InProgress) {
                by_type.entry(item.job_type.clone()).or_default().push(item);
            } else {
                debug!(job_id = item.id, state = %item.state(), "job skipped before processing");
            }
        }

        let callbacks = self.callbacks();
        for (job_type, batch) in by_type {
            let processing = callbacks
                .types
                .get(&job_type)
                .and_then(|type_callbacks| type_callbacks.processing.clone());

            if let Some(processing) = processing {
                let fut = processing(self.engine_handle(), batch.clone());
                match AssertUnwindSafe(fut).catch_unwind().await {
                    Ok(feedback) => {
                        delay = max_delay(delay, feedback.delay_next_request);
                    }
                    Err(panic) => {
                        error!(
                            job_type = %job_type,
                            panic_msg = %panic_message(panic.as_ref()),
                            "processing callback panicked, batch marked failed"
                        );
                        self.jobs_state_items(&batch, JobState::Failed).await;
                    }
                }
            }

            // whatever the callback left InProgress now waits for children
            // (collapsing to Finished when there are none)
            self.jobs_state_items(&batch, JobState::WaitChildren).await;
        }

        (true, delay)
    }

    //
    // hooks from the queue
    //

    /// Called right after a job enters the registry.
    pub(super) fn on_job_added(&self, item: &JobHandle<R, S>) {
        let topology = self.topology();
        if let Some(timeout) = topology.type_timeouts.get(&item.job_type) {
            self.timeouts.queue().push_delay_for(*timeout, item.id);
        }
    }

    /// Called when a start was refused (unknown group or sealed queue).
    pub(super) async fn on_job_cancelled(self: &Arc<Self>, item: JobHandle<R, S>) -> bool {
        warn!(job_id = item.id, job_type = %item.job_type, "job start refused, cancelling");
        self.jobs_state_item(item, JobState::Cancelled, None).await
    }

    //
    // completion cascade
    //

    /// Runs exactly once per job, right after it entered a terminal state.
    pub(super) fn on_completed(self: &Arc<Self>, item: JobHandle<R, S>) -> BoxFuture<'static, ()> {
        let inner = Arc::clone(self);
        Box::pin(async move {
            debug!(job_id = item.id, state = %item.state(), "job completed");
            let callbacks = inner.callbacks();

            if let Some(on_finished) = callbacks
                .types
                .get(&item.job_type)
                .and_then(|type_callbacks| type_callbacks.on_finished.clone())
            {
                let fut = on_finished(inner.engine_handle(), vec![Arc::clone(&item)]);
                if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
                    error!(
                        job_id = item.id,
                        panic_msg = %panic_message(panic.as_ref()),
                        "finished callback panicked"
                    );
                }
            }

            if item.has_parents() {
                // the state is already terminal, so forcing progress to 100
                // cannot re-trigger the cascade
                item.set_progress(100);

                let parents = inner.jobs_get_bulk(&item.parent_ids());
                for parent in parents {
                    let on_children_finished = callbacks
                        .types
                        .get(&parent.job_type)
                        .and_then(|type_callbacks| type_callbacks.on_children_finished.clone());
                    match on_children_finished {
                        Some(on_children_finished) => {
                            let fut = on_children_finished(
                                inner.engine_handle(),
                                Arc::clone(&parent),
                                Arc::clone(&item),
                            );
                            if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
                                error!(
                                    job_id = parent.id,
                                    panic_msg = %panic_message(panic.as_ref()),
                                    "children-finished callback panicked"
                                );
                            }
                        }
                        None => {
                            inner
                                .children_finished_aggregate(parent, Arc::clone(&item))
                                .await
                        }
                    }
                }
            } else {
                // no parents: the job (and transitively its children) leaves
                // the registry
                inner.erase(item.id);
            }
        })
    }

    /// Default children-finished behavior: derive the parent's state and
    /// progress from its children.
    pub(super) async fn children_finished_aggregate(
        self: &Arc<Self>,
        parent: JobHandle<R, S>,
        _child: JobHandle<R, S>,
    ) {
        if parent.is_complete() {
            return;
        }

        let (state, progress) = self.children_states(&parent);
        if state.is_complete() {
            // raw progress write: the terminal transition below is the one
            // that runs the cascade
            parent.set_progress(progress);
            self.jobs_state_item(parent, state, None).await;
        } else {
            self.jobs_progress_item(parent, progress).await;
        }
    }
}
