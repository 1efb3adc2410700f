// Group Admission - per-group budget over the worker pool
//
// Each group may occupy at most `threads_count` workers at once. A group
// token in the pool queue stands for one `do_action` pass; tokens are only
// pushed while the budget has room, and a finished pass re-arms the group
// when it actually processed something (or when a push raced its empty
// pop).

use tokio::time::Duration;

use crate::domain::{JobGroup, JobType};

use super::engine::{EngineInner, Topology};

#[derive(Debug, Clone, Copy)]
pub(super) struct GroupStats {
    pub(super) threads_count: usize,
    pub(super) running: usize,
}

impl GroupStats {
    pub(super) fn new(threads_count: usize) -> Self {
        Self {
            threads_count: threads_count.max(1),
            running: 0,
        }
    }
}

impl<R, S> EngineInner<R, S>
where
    R: Send + Sync + 'static,
    S: Send + 'static,
{
    /// Called whenever a job lands on a group queue.
    pub(super) fn jobs_schedule(&self, topology: &Topology, job_type: &JobType) {
        if let Some(group) = topology.type_groups.get(job_type) {
            self.schedule_group(topology, group, None);
        }
    }

    fn schedule_group(&self, topology: &Topology, group: &JobGroup, delay: Option<Duration>) {
        let Some(runtime) = topology.groups.get(group) else {
            return;
        };

        {
            let mut stats = runtime.stats.lock().unwrap();
            if stats.running >= stats.threads_count {
                // a running pass re-arms the group when it ends
                return;
            }
            stats.running += 1;
        }

        let pushed = match delay {
            Some(delay) if !delay.is_zero() => {
                self.pool.push_back_delay_for(delay, group.clone())
            }
            _ => self.pool.push_back(group.clone()),
        };
        if pushed == 0 {
            // token refused during shutdown; give the slot back
            let mut stats = runtime.stats.lock().unwrap();
            stats.running = stats.running.saturating_sub(1);
        }
    }

    /// A `do_action` pass ended: release the slot and decide on a re-arm.
    pub(super) fn action_end(&self, group: &JobGroup, has_items: bool, delay: Option<Duration>) {
        let topology = self.topology();
        let Some(runtime) = topology.groups.get(group) else {
            return;
        };

        {
            let mut stats = runtime.stats.lock().unwrap();
            stats.running = stats.running.saturating_sub(1);
        }

        // "has items" means this pass processed something, not that the
        // queue is non-empty; the next pass finds out. The second branch
        // picks up a push that raced the empty pop.
        if has_items {
            self.schedule_group(&topology, group, delay);
        } else if !runtime.queue.is_empty() {
            self.schedule_group(&topology, group, None);
        }
    }
}
