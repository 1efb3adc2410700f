// Jobs Queue - registry, submissions, linkage and delayed starts
//
// Registering a job and starting it are separate steps: `push_back` only
// stores the job (state None), the `*_and_start` variants also enqueue it
// on its group's priority queue, and the `*_delay_*` variants park it in
// the delayed-start queue until its deadline.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::domain::{JobId, JobItem, JobState, JobType, Priority};
use crate::sync::PopResult;

use super::config::JobHandle;
use super::engine::EngineInner;

/// Submission surface of the engine, obtained through
/// [`JobsEngine::queue`](super::engine::JobsEngine::queue).
pub struct JobsQueue<R, S> {
    pub(super) inner: Arc<EngineInner<R, S>>,
}

impl<R, S> Clone for JobsQueue<R, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R, S> JobsQueue<R, S>
where
    R: Send + Sync + 'static,
    S: Send + 'static,
{
    //
    // register only (job stays in state None until started)
    //

    /// Register a job without starting it. Returns `None` while shutting
    /// down or for an unknown type.
    pub fn push_back(&self, job_type: JobType, request: R) -> Option<JobId> {
        self.inner.jobs_add(job_type, request).map(|item| item.id)
    }

    pub fn push_back_bulk(&self, job_type: JobType, requests: Vec<R>) -> Vec<JobId> {
        requests
            .into_iter()
            .filter_map(|request| self.push_back(job_type.clone(), request))
            .collect()
    }

    //
    // register and start
    //

    /// Register a job and enqueue it at `priority` on its group's queue.
    pub async fn push_back_and_start(
        &self,
        priority: Priority,
        job_type: JobType,
        request: R,
    ) -> Option<JobId> {
        let item = self.inner.jobs_add(job_type, request)?;
        let job_id = item.id;
        if self.inner.jobs_start_item(priority, item).await == 0 {
            return None;
        }
        Some(job_id)
    }

    pub async fn push_back_and_start_bulk(
        &self,
        priority: Priority,
        job_type: JobType,
        requests: Vec<R>,
    ) -> Vec<JobId> {
        let mut job_ids = Vec::with_capacity(requests.len());
        for request in requests {
            if let Some(job_id) = self
                .push_back_and_start(priority, job_type.clone(), request)
                .await
            {
                job_ids.push(job_id);
            }
        }
        job_ids
    }

    //
    // children
    //

    /// Register a child of `parent_id` (bidirectional link, one lock); the
    /// child is not started.
    pub fn push_back_child(
        &self,
        parent_id: JobId,
        job_type: JobType,
        request: R,
    ) -> Option<JobId> {
        self.inner
            .jobs_add_child(parent_id, job_type, request)
            .map(|item| item.id)
    }

    pub fn push_back_child_bulk(
        &self,
        parent_id: JobId,
        job_type: JobType,
        requests: Vec<R>,
    ) -> Vec<JobId> {
        requests
            .into_iter()
            .filter_map(|request| self.push_back_child(parent_id, job_type.clone(), request))
            .collect()
    }

    /// Register a child and start it right away.
    pub async fn push_back_and_start_child(
        &self,
        parent_id: JobId,
        priority: Priority,
        job_type: JobType,
        request: R,
    ) -> Option<JobId> {
        let item = self.inner.jobs_add_child(parent_id, job_type, request)?;
        let job_id = item.id;
        if self.inner.jobs_start_item(priority, item).await == 0 {
            return None;
        }
        Some(job_id)
    }

    //
    // delayed starts
    //

    /// Register a job and schedule its start after `delay`.
    pub async fn push_back_and_start_delay_for(
        &self,
        delay: Duration,
        priority: Priority,
        job_type: JobType,
        request: R,
    ) -> Option<JobId> {
        self.push_back_and_start_delay_until(Instant::now() + delay, priority, job_type, request)
            .await
    }

    /// Register a job and schedule its start at `deadline`.
    pub async fn push_back_and_start_delay_until(
        &self,
        deadline: Instant,
        priority: Priority,
        job_type: JobType,
        request: R,
    ) -> Option<JobId> {
        let item = self.inner.jobs_add(job_type, request)?;
        let job_id = item.id;
        if self
            .inner
            .delayed
            .queue()
            .push_delay_until(deadline, (priority, job_id))
            == 0
        {
            self.inner.on_job_cancelled(item).await;
            return None;
        }
        Some(job_id)
    }

    //
    // starting already-registered jobs
    //

    /// Enqueue a registered job on its group queue. Returns the number of
    /// jobs started; a refused start cancels the job.
    pub async fn jobs_start(&self, priority: Priority, job_id: JobId) -> usize {
        self.inner.jobs_start_one(priority, job_id).await
    }

    pub async fn jobs_start_bulk(&self, priority: Priority, job_ids: &[JobId]) -> usize {
        let mut started = 0;
        for job_id in job_ids {
            started += self.inner.jobs_start_one(priority, *job_id).await;
        }
        started
    }

    pub fn jobs_start_delay_for(
        &self,
        delay: Duration,
        priority: Priority,
        job_id: JobId,
    ) -> usize {
        self.inner
            .delayed
            .queue()
            .push_delay_for(delay, (priority, job_id))
    }

    pub fn jobs_start_delay_until(
        &self,
        deadline: Instant,
        priority: Priority,
        job_id: JobId,
    ) -> usize {
        self.inner
            .delayed
            .queue()
            .push_delay_until(deadline, (priority, job_id))
    }

    //
    // lookup & linkage
    //

    pub fn jobs_get(&self, job_id: JobId) -> Option<JobHandle<R, S>> {
        self.inner.jobs_get(job_id)
    }

    pub fn jobs_get_bulk(&self, job_ids: &[JobId]) -> Vec<JobHandle<R, S>> {
        self.inner.jobs_get_bulk(job_ids)
    }

    /// Link two registered jobs as parent/child. Returns 1 when both exist.
    pub fn jobs_parent_child(&self, parent_id: JobId, child_id: JobId) -> usize {
        self.inner.jobs_parent_child_ids(parent_id, child_id)
    }

    //
    // sizes
    //

    pub fn len(&self) -> usize {
        self.inner.registry.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len_delayed(&self) -> usize {
        self.inner.delayed.queue().len()
    }
}

impl<R, S> EngineInner<R, S>
where
    R: Send + Sync + 'static,
    S: Send + 'static,
{
    fn next_job_id(&self) -> JobId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(super) fn jobs_get(&self, job_id: JobId) -> Option<JobHandle<R, S>> {
        self.registry.lock().unwrap().get(&job_id).cloned()
    }

    pub(super) fn jobs_get_bulk(&self, job_ids: &[JobId]) -> Vec<JobHandle<R, S>> {
        let registry = self.registry.lock().unwrap();
        job_ids
            .iter()
            .filter_map(|job_id| registry.get(job_id).cloned())
            .collect()
    }

    /// Allocate an id, store the item, install the per-type timeout.
    pub(super) fn jobs_add(&self, job_type: JobType, request: R) -> Option<JobHandle<R, S>> {
        if self.delayed.queue().is_exit() {
            return None;
        }
        let topology = self.topology();
        if !topology.type_groups.contains_key(&job_type) {
            warn!(job_type = %job_type, "submission for unknown job type rejected");
            return None;
        }

        let job_id = self.next_job_id();
        let item = Arc::new(JobItem::new(job_id, job_type, request));
        self.registry
            .lock()
            .unwrap()
            .insert(job_id, Arc::clone(&item));

        self.on_job_added(&item);
        debug!(job_id, job_type = %item.job_type, "job registered");
        Some(item)
    }

    /// Register a child and link it to its parent under one registry lock.
    pub(super) fn jobs_add_child(
        &self,
        parent_id: JobId,
        job_type: JobType,
        request: R,
    ) -> Option<JobHandle<R, S>> {
        if self.delayed.queue().is_exit() {
            return None;
        }
        let topology = self.topology();
        if !topology.type_groups.contains_key(&job_type) {
            warn!(job_type = %job_type, "child submission for unknown job type rejected");
            return None;
        }

        let item = {
            let mut registry = self.registry.lock().unwrap();
            let Some(parent) = registry.get(&parent_id).cloned() else {
                debug!(parent_id, "child submission rejected, parent not found");
                return None;
            };

            let job_id = self.next_job_id();
            let item = Arc::new(JobItem::new(job_id, job_type, request));
            registry.insert(job_id, Arc::clone(&item));
            parent.add_child(job_id);
            item.add_parent(parent_id);
            item
        };

        self.on_job_added(&item);
        debug!(job_id = item.id, parent_id, "child job registered");
        Some(item)
    }

    pub(super) async fn jobs_start_one(self: &Arc<Self>, priority: Priority, job_id: JobId) -> usize {
        match self.jobs_get(job_id) {
            Some(item) => self.jobs_start_item(priority, item).await,
            None => 0,
        }
    }

    /// Enqueue on the group queue and schedule a worker; a refused push
    /// cancels the job through the completion cascade.
    pub(super) async fn jobs_start_item(
        self: &Arc<Self>,
        priority: Priority,
        item: JobHandle<R, S>,
    ) -> usize {
        let topology = self.topology();
        let pushed = topology
            .type_groups
            .get(&item.job_type)
            .and_then(|group| topology.groups.get(group))
            .map(|runtime| runtime.queue.push_back(priority, item.id))
            .unwrap_or(0);

        if pushed == 0 {
            self.on_job_cancelled(item).await;
            return 0;
        }

        self.jobs_schedule(&topology, &item.job_type);
        pushed
    }

    pub(super) fn jobs_parent_child_ids(&self, parent_id: JobId, child_id: JobId) -> usize {
        let registry = self.registry.lock().unwrap();
        let (Some(parent), Some(child)) = (registry.get(&parent_id), registry.get(&child_id))
        else {
            return 0;
        };
        parent.add_child(child_id);
        child.add_parent(parent_id);
        1
    }

    /// Remove a job and, transitively, all its children. Anything not yet
    /// terminal is cancelled on the way out (no callback cascade: erase is
    /// the end of a job's life).
    pub(super) fn erase(&self, job_id: JobId) {
        let mut registry = self.registry.lock().unwrap();
        Self::erase_locked(&mut registry, job_id);
    }

    fn erase_locked(registry: &mut HashMap<JobId, JobHandle<R, S>>, job_id: JobId) {
        let Some(item) = registry.remove(&job_id) else {
            return;
        };
        if !item.is_complete() {
            item.set_state(JobState::Cancelled);
        }
        debug!(job_id, "job erased");

        for child_id in item.child_ids() {
            Self::erase_locked(registry, child_id);
        }
    }

    //
    // shutdown plumbing
    //

    pub(super) fn queue_signal_exit_force(&self) {
        self.delayed.queue().signal_exit_force();
        let topology = self.topology();
        for runtime in topology.groups.values() {
            runtime.queue.signal_exit_force();
        }
    }

    /// Drain the delayed queue, then seal and drain every group queue.
    pub(super) async fn queue_wait(&self) {
        self.delayed.wait().await;

        let topology = self.topology();
        for runtime in topology.groups.values() {
            runtime.queue.signal_exit_when_done();
        }
        for runtime in topology.groups.values() {
            runtime.queue.wait_empty().await;
        }
    }

    pub(super) async fn queue_wait_until(&self, deadline: Instant) -> PopResult<()> {
        if self.delayed.wait_until(deadline).await.is_timeout() {
            return PopResult::Timeout;
        }

        let topology = self.topology();
        for runtime in topology.groups.values() {
            runtime.queue.signal_exit_when_done();
        }
        for runtime in topology.groups.values() {
            if tokio::time::timeout_at(deadline, runtime.queue.wait_empty())
                .await
                .is_err()
            {
                return PopResult::Timeout;
            }
        }
        PopResult::Exit
    }
}
