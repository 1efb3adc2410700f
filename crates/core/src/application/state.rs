// Jobs State Controller - every transition goes through here
//
// Transitions are monotonic: a call that does not strictly raise the state
// returns `false`. Two special rules: Timeout loses the race against a job
// that already Finished, and WaitChildren collapses to Finished when there
// are no live children (nothing would ever drive the job forward
// otherwise). Any transition into a terminal state triggers the completion
// cascade exactly once.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use crate::domain::{JobId, JobState};

use super::config::JobHandle;
use super::engine::EngineInner;

/// State transition surface of the engine, obtained through
/// [`JobsEngine::state`](super::engine::JobsEngine::state).
pub struct JobsState<R, S> {
    pub(super) inner: Arc<EngineInner<R, S>>,
}

impl<R, S> Clone for JobsState<R, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R, S> JobsState<R, S>
where
    R: Send + Sync + 'static,
    S: Send + 'static,
{
    //
    // progress & response
    //

    /// Raise the job's progress (0-100). Reaching 100 finishes the job.
    pub async fn jobs_progress(&self, job_id: JobId, progress: u8) -> bool {
        match self.inner.jobs_get(job_id) {
            Some(item) => self.inner.jobs_progress_item(item, progress).await,
            None => false,
        }
    }

    /// Store the job's response without touching its state.
    pub fn jobs_response(&self, job_id: JobId, response: S) -> bool {
        match self.inner.jobs_get(job_id) {
            Some(item) => {
                item.set_response(response);
                true
            }
            None => false,
        }
    }

    //
    // terminal transitions
    //

    pub async fn jobs_finished(&self, job_id: JobId) -> bool {
        self.jobs_state(job_id, JobState::Finished).await
    }

    pub async fn jobs_finished_with(&self, job_id: JobId, response: S) -> bool {
        self.jobs_state_with(job_id, JobState::Finished, response)
            .await
    }

    pub async fn jobs_finished_bulk(&self, job_ids: &[JobId]) -> usize {
        self.jobs_state_bulk(job_ids, JobState::Finished).await
    }

    pub async fn jobs_failed(&self, job_id: JobId) -> bool {
        self.jobs_state(job_id, JobState::Failed).await
    }

    pub async fn jobs_failed_with(&self, job_id: JobId, response: S) -> bool {
        self.jobs_state_with(job_id, JobState::Failed, response).await
    }

    pub async fn jobs_failed_bulk(&self, job_ids: &[JobId]) -> usize {
        self.jobs_state_bulk(job_ids, JobState::Failed).await
    }

    pub async fn jobs_cancelled(&self, job_id: JobId) -> bool {
        self.jobs_state(job_id, JobState::Cancelled).await
    }

    pub async fn jobs_cancelled_with(&self, job_id: JobId, response: S) -> bool {
        self.jobs_state_with(job_id, JobState::Cancelled, response)
            .await
    }

    pub async fn jobs_cancelled_bulk(&self, job_ids: &[JobId]) -> usize {
        self.jobs_state_bulk(job_ids, JobState::Cancelled).await
    }

    pub async fn jobs_timeout(&self, job_id: JobId) -> bool {
        self.jobs_state(job_id, JobState::Timeout).await
    }

    pub async fn jobs_timeout_bulk(&self, job_ids: &[JobId]) -> usize {
        self.jobs_state_bulk(job_ids, JobState::Timeout).await
    }

    /// Park the job until its children complete (collapses to Finished for
    /// a job without children).
    pub async fn jobs_waitforchildren(&self, job_id: JobId) -> bool {
        self.jobs_state(job_id, JobState::WaitChildren).await
    }

    //
    // generic transitions
    //

    pub async fn jobs_state(&self, job_id: JobId, state: JobState) -> bool {
        match self.inner.jobs_get(job_id) {
            Some(item) => self.inner.jobs_state_item(item, state, None).await,
            None => false,
        }
    }

    pub async fn jobs_state_with(&self, job_id: JobId, state: JobState, response: S) -> bool {
        match self.inner.jobs_get(job_id) {
            Some(item) => self.inner.jobs_state_item(item, state, Some(response)).await,
            None => false,
        }
    }

    pub async fn jobs_state_bulk(&self, job_ids: &[JobId], state: JobState) -> usize {
        self.inner.jobs_state_ids(job_ids, state).await
    }

    /// Derive a parent's state and progress from its children: any
    /// unsuccessful terminal child fails the parent; all-Finished finishes
    /// it; otherwise it keeps waiting at the mean of the children's
    /// progress.
    pub fn children_states(&self, parent: &JobHandle<R, S>) -> (JobState, u8) {
        self.inner.children_states(parent)
    }
}

impl<R, S> EngineInner<R, S>
where
    R: Send + Sync + 'static,
    S: Send + 'static,
{
    /// Apply the transition rules; returns whether the state changed and
    /// the state actually set (WaitChildren may collapse to Finished).
    fn apply_state(&self, item: &JobHandle<R, S>, target: JobState) -> (bool, JobState) {
        let mut target = target;

        // without children, waiting would never end
        if target == JobState::WaitChildren && !item.has_children() {
            target = JobState::Finished;
        }

        // the latched advance also settles the watchdog race: a Timeout
        // arriving after Finished is rejected
        (item.advance_state(target), target)
    }

    /// Apply one transition and run the completion cascade when it lands in
    /// a terminal state. Boxed: the cascade can re-enter for parents.
    pub(super) fn jobs_state_item(
        self: &Arc<Self>,
        item: JobHandle<R, S>,
        target: JobState,
        response: Option<S>,
    ) -> BoxFuture<'static, bool> {
        let inner = Arc::clone(self);
        Box::pin(async move {
            if let Some(response) = response {
                item.set_response(response);
            }

            let (changed, set_state) = inner.apply_state(&item, target);
            if !changed {
                return false;
            }

            debug!(job_id = item.id, state = %set_state, "job state changed");
            if set_state.is_complete() {
                inner.on_completed(item).await;
            }
            true
        })
    }

    pub(super) async fn jobs_state_ids(
        self: &Arc<Self>,
        job_ids: &[JobId],
        target: JobState,
    ) -> usize {
        let items = self.jobs_get_bulk(job_ids);
        let mut changed = 0;
        for item in items {
            if self.jobs_state_item(item, target, None).await {
                changed += 1;
            }
        }
        changed
    }

    pub(super) async fn jobs_state_items(
        self: &Arc<Self>,
        items: &[JobHandle<R, S>],
        target: JobState,
    ) -> usize {
        let mut changed = 0;
        for item in items {
            if self.jobs_state_item(Arc::clone(item), target, None).await {
                changed += 1;
            }
        }
        changed
    }

    pub(super) async fn jobs_progress_item(
        self: &Arc<Self>,
        item: JobHandle<R, S>,
        progress: u8,
    ) -> bool {
        let advanced = item.set_progress(progress);
        if progress >= 100 {
            self.jobs_state_item(item, JobState::Finished, None).await;
        }
        advanced
    }

    pub(super) fn children_states(&self, parent: &JobHandle<R, S>) -> (JobState, u8) {
        let children = self.jobs_get_bulk(&parent.child_ids());
        if children.is_empty() {
            return (JobState::Finished, 100);
        }

        let mut progress_sum: u32 = 0;
        let mut completed: usize = 0;
        let mut unsuccessful: usize = 0;

        for child in &children {
            let state = child.state();
            if !state.is_complete() {
                progress_sum += u32::from(child.progress());
                continue;
            }
            progress_sum += 100;
            completed += 1;
            if state != JobState::Finished {
                unsuccessful += 1;
            }
        }

        if unsuccessful > 0 {
            return (JobState::Failed, 100);
        }
        if completed == children.len() {
            return (JobState::Finished, 100);
        }
        (
            JobState::WaitChildren,
            (progress_sum / children.len() as u32) as u8,
        )
    }
}
