// Job Domain Model

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// Job ID, assigned by the engine at registration time.
///
/// Monotonically increasing and unique for the lifetime of an engine
/// instance; 0 is never assigned.
pub type JobId = u64;

/// Job type tag, selects the processing/finished callbacks for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobType(String);

impl JobType {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job group tag, partitions job types into scheduling domains.
///
/// Each group has its own priority queue and its own thread budget.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobGroup(String);

impl JobGroup {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scheduling priority, ordered from most to least urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Critical,
    VeryHigh,
    High,
    Normal,
    Low,
    VeryLow,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Critical => write!(f, "CRITICAL"),
            Priority::VeryHigh => write!(f, "VERY_HIGH"),
            Priority::High => write!(f, "HIGH"),
            Priority::Normal => write!(f, "NORMAL"),
            Priority::Low => write!(f, "LOW"),
            Priority::VeryLow => write!(f, "VERY_LOW"),
        }
    }
}

/// Job state. The order matters: a job may only progress to a higher state.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    None = 0,
    InProgress = 1,
    WaitChildren = 2,
    Finished = 3,
    Timeout = 4,
    Failed = 5,
    Cancelled = 6,
}

impl JobState {
    /// A job is complete once it reached `Finished` or any state past it.
    pub fn is_complete(self) -> bool {
        self >= JobState::Finished
    }

    pub(crate) fn as_u8(self) -> u8 {
        self as u8
    }

    pub(crate) fn from_u8(raw: u8) -> JobState {
        match raw {
            0 => JobState::None,
            1 => JobState::InProgress,
            2 => JobState::WaitChildren,
            3 => JobState::Finished,
            4 => JobState::Timeout,
            5 => JobState::Failed,
            _ => JobState::Cancelled,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::None => write!(f, "NONE"),
            JobState::InProgress => write!(f, "IN_PROGRESS"),
            JobState::WaitChildren => write!(f, "WAIT_CHILDREN"),
            JobState::Finished => write!(f, "FINISHED"),
            JobState::Timeout => write!(f, "TIMEOUT"),
            JobState::Failed => write!(f, "FAILED"),
            JobState::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Parent/child linkage of a job.
///
/// Mutated only while the owning registry lock is held; the per-item mutex
/// keeps the reads safe for everyone else.
#[derive(Debug, Default)]
struct JobLinks {
    parents: Vec<JobId>,
    children: Vec<JobId>,
}

/// A unit of work: id, type, state, progress, request, response slot and
/// the parent/child relationships.
///
/// State and progress are atomics so workers, the watchdog and callbacks can
/// race on them without locks; both only ever move forward.
#[derive(Debug)]
pub struct JobItem<R, S> {
    pub id: JobId,
    pub job_type: JobType,
    state: AtomicU8,
    progress: AtomicU8,
    has_parents: AtomicBool,
    has_children: AtomicBool,
    links: Mutex<JobLinks>,
    pub request: R,
    response: Mutex<Option<S>>,
}

impl<R, S> JobItem<R, S> {
    pub fn new(id: JobId, job_type: JobType, request: R) -> Self {
        Self {
            id,
            job_type,
            state: AtomicU8::new(JobState::None.as_u8()),
            progress: AtomicU8::new(0),
            has_parents: AtomicBool::new(false),
            has_children: AtomicBool::new(false),
            links: Mutex::new(JobLinks::default()),
            request,
            response: Mutex::new(None),
        }
    }

    //
    // state (can only go from a lower to a higher state)
    //

    pub fn state(&self) -> JobState {
        JobState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Advance the state. Returns `false` when `new_state` is not strictly
    /// higher than the current state.
    pub fn set_state(&self, new_state: JobState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >= new_state.as_u8() {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                new_state.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Advance the state like [`JobItem::set_state`], but never out of a
    /// terminal state: completion is latched exactly once, even when two
    /// terminal transitions race.
    pub fn advance_state(&self, new_state: JobState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >= new_state.as_u8() || current >= JobState::Finished.as_u8() {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                new_state.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn set_state_in_progress(&self) -> bool {
        self.set_state(JobState::InProgress)
    }

    pub fn set_state_cancelled(&self) -> bool {
        self.set_state(JobState::Cancelled)
    }

    pub fn is_state(&self, state: JobState) -> bool {
        self.state() == state
    }

    pub fn is_complete(&self) -> bool {
        self.state().is_complete()
    }

    //
    // progress 0-100 (can only increase; 100 implies Finished, enforced by
    // the state controller)
    //

    pub fn progress(&self) -> u8 {
        self.progress.load(Ordering::Acquire)
    }

    /// Raise the progress. Returns `false` when `new_progress` does not
    /// exceed the current value.
    pub fn set_progress(&self, new_progress: u8) -> bool {
        let new_progress = new_progress.min(100);
        let mut current = self.progress.load(Ordering::Acquire);
        loop {
            if current >= new_progress {
                return false;
            }
            match self.progress.compare_exchange_weak(
                current,
                new_progress,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    //
    // parent/child relationships
    //

    /// Record a child link. Caller must hold the registry lock.
    pub(crate) fn add_child(&self, child_id: JobId) {
        self.links.lock().unwrap().children.push(child_id);
        self.has_children.store(true, Ordering::Release);
    }

    /// Record a parent link. Caller must hold the registry lock.
    pub(crate) fn add_parent(&self, parent_id: JobId) {
        self.links.lock().unwrap().parents.push(parent_id);
        self.has_parents.store(true, Ordering::Release);
    }

    pub fn has_children(&self) -> bool {
        self.has_children.load(Ordering::Acquire)
    }

    pub fn has_parents(&self) -> bool {
        self.has_parents.load(Ordering::Acquire)
    }

    pub fn child_ids(&self) -> Vec<JobId> {
        self.links.lock().unwrap().children.clone()
    }

    pub fn parent_ids(&self) -> Vec<JobId> {
        self.links.lock().unwrap().parents.clone()
    }

    //
    // response slot
    //

    pub fn set_response(&self, response: S) {
        *self.response.lock().unwrap() = Some(response);
    }

    pub fn take_response(&self) -> Option<S> {
        self.response.lock().unwrap().take()
    }
}

impl<R, S: Clone> JobItem<R, S> {
    pub fn response(&self) -> Option<S> {
        self.response.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item() -> JobItem<String, String> {
        JobItem::new(1, JobType::new("test"), "req".to_string())
    }

    #[test]
    fn test_state_only_advances() {
        let job = item();
        assert_eq!(job.state(), JobState::None);

        assert!(job.set_state(JobState::InProgress));
        assert!(job.set_state(JobState::Finished));

        // going backwards (or staying put) is rejected
        assert!(!job.set_state(JobState::InProgress));
        assert!(!job.set_state(JobState::Finished));

        // forward past Finished is still allowed by the raw item;
        // the state controller is the one vetoing Timeout-after-Finished
        assert!(job.set_state(JobState::Cancelled));
        assert_eq!(job.state(), JobState::Cancelled);
    }

    #[test]
    fn test_state_ordering_matches_lifecycle() {
        assert!(JobState::None < JobState::InProgress);
        assert!(JobState::InProgress < JobState::WaitChildren);
        assert!(JobState::WaitChildren < JobState::Finished);
        assert!(JobState::Finished < JobState::Timeout);
        assert!(JobState::Timeout < JobState::Failed);
        assert!(JobState::Failed < JobState::Cancelled);

        assert!(!JobState::WaitChildren.is_complete());
        assert!(JobState::Finished.is_complete());
        assert!(JobState::Timeout.is_complete());
        assert!(JobState::Failed.is_complete());
        assert!(JobState::Cancelled.is_complete());
    }

    #[test]
    fn test_advance_state_latches_terminal() {
        let job = item();
        assert!(job.advance_state(JobState::InProgress));
        assert!(job.advance_state(JobState::Finished));

        // once terminal, nothing moves it - not even higher ordinals
        assert!(!job.advance_state(JobState::Timeout));
        assert!(!job.advance_state(JobState::Failed));
        assert!(!job.advance_state(JobState::Cancelled));
        assert_eq!(job.state(), JobState::Finished);
    }

    #[test]
    fn test_progress_only_increases() {
        let job = item();
        assert!(job.set_progress(10));
        assert!(!job.set_progress(10));
        assert!(!job.set_progress(5));
        assert!(job.set_progress(100));
        assert_eq!(job.progress(), 100);

        // values above 100 are clamped
        assert!(!job.set_progress(200));
    }

    #[test]
    fn test_links_and_flags() {
        let parent = item();
        let child = item();
        assert!(!parent.has_children());
        assert!(!child.has_parents());

        parent.add_child(2);
        child.add_parent(1);

        assert!(parent.has_children());
        assert!(child.has_parents());
        assert_eq!(parent.child_ids(), vec![2]);
        assert_eq!(child.parent_ids(), vec![1]);
    }

    #[test]
    fn test_response_slot() {
        let job = item();
        assert_eq!(job.response(), None);
        job.set_response("ok".to_string());
        assert_eq!(job.response(), Some("ok".to_string()));
        assert_eq!(job.take_response(), Some("ok".to_string()));
        assert_eq!(job.response(), None);
    }

    #[test]
    fn test_concurrent_state_advances_once() {
        use std::sync::Arc;

        let job = Arc::new(item());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let job = Arc::clone(&job);
            handles.push(std::thread::spawn(move || {
                job.set_state(JobState::Finished)
            }));
        }
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();

        // exactly one thread wins the CAS
        assert_eq!(wins, 1);
        assert_eq!(job.state(), JobState::Finished);
    }
}
