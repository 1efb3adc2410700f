// Priority Queue - per-level FIFOs with ratio-based anti-starvation
//
// Levels are served from most to least urgent, but each level only gets
// `ratio` consecutive dequeues before the next one down gets a turn; then
// the cycle restarts at the top. Ratio 0 means "only when everything above
// is empty".

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::debug;

use crate::domain::Priority;

use super::wait::{ExitFlags, PopResult};

/// Priority levels in use and the anti-starvation ratio of each.
///
/// Ordered from most to least urgent. A ratio of N lets a level emit up to
/// N items before ceding one turn to the next level down; 0 parks the level
/// until all higher levels are empty.
#[derive(Debug, Clone)]
pub struct PrioConfig {
    pub levels: Vec<(Priority, u32)>,
}

impl Default for PrioConfig {
    fn default() -> Self {
        Self {
            levels: vec![
                (Priority::Critical, 3),
                (Priority::VeryHigh, 3),
                (Priority::High, 3),
                (Priority::Normal, 3),
                (Priority::Low, 3),
                (Priority::VeryLow, 0),
            ],
        }
    }
}

impl PrioConfig {
    /// Config with a single priority level (ratio 1).
    pub fn single(priority: Priority) -> Self {
        Self {
            levels: vec![(priority, 1)],
        }
    }
}

#[derive(Debug)]
struct Level<T> {
    priority: Priority,
    ratio: u32,
    used: u32,
    items: VecDeque<T>,
}

/// Queue of `T` partitioned by [`Priority`], FIFO within a level.
///
/// Same pop/timeout/cancellation surface as the lock queue. Pushes to a
/// priority that is not configured are rejected and report zero inserted.
#[derive(Debug)]
pub struct PrioQueue<T> {
    levels: Mutex<Vec<Level<T>>>,
    flags: ExitFlags,
    drained: Notify,
}

impl<T> PrioQueue<T> {
    pub fn new(config: PrioConfig) -> Self {
        let mut levels: Vec<Level<T>> = config
            .levels
            .into_iter()
            .map(|(priority, ratio)| Level {
                priority,
                ratio,
                used: 0,
                items: VecDeque::new(),
            })
            .collect();
        // most urgent first, whatever order the config came in
        levels.sort_by_key(|level| level.priority);

        Self {
            levels: Mutex::new(levels),
            flags: ExitFlags::new(),
            drained: Notify::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.levels
            .lock()
            .unwrap()
            .iter()
            .map(|level| level.items.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len_priority(&self, priority: Priority) -> usize {
        self.levels
            .lock()
            .unwrap()
            .iter()
            .find(|level| level.priority == priority)
            .map(|level| level.items.len())
            .unwrap_or(0)
    }

    pub fn clear(&self) {
        let mut levels = self.levels.lock().unwrap();
        for level in levels.iter_mut() {
            level.items.clear();
            level.used = 0;
        }
        drop(levels);
        self.drained.notify_waiters();
    }

    //
    // push
    //

    /// Returns the number of elements inserted (0 for unknown priorities or
    /// while shutting down).
    pub fn push_back(&self, priority: Priority, elem: T) -> usize {
        if self.flags.is_exit() {
            return 0;
        }

        let mut levels = self.levels.lock().unwrap();
        let Some(level) = levels.iter_mut().find(|level| level.priority == priority) else {
            debug!(%priority, "push to unconfigured priority rejected");
            return 0;
        };
        level.items.push_back(elem);
        drop(levels);

        self.flags.notify_one();
        1
    }

    pub fn push_back_bulk(
        &self,
        priority: Priority,
        elems: impl IntoIterator<Item = T>,
    ) -> usize {
        if self.flags.is_exit() {
            return 0;
        }

        let count = {
            let mut levels = self.levels.lock().unwrap();
            let Some(level) = levels.iter_mut().find(|level| level.priority == priority) else {
                debug!(%priority, "bulk push to unconfigured priority rejected");
                return 0;
            };
            let before = level.items.len();
            level.items.extend(elems);
            level.items.len() - before
        };
        if count > 0 {
            self.flags.notify_all();
        }
        count
    }

    //
    // exit
    //

    pub fn signal_exit_force(&self) {
        self.flags.signal_exit_force();
        self.drained.notify_waiters();
    }

    pub fn signal_exit_when_done(&self) {
        self.flags.signal_exit_when_done();
    }

    pub fn is_exit_force(&self) -> bool {
        self.flags.is_exit_force()
    }

    pub fn is_exit_when_done(&self) -> bool {
        self.flags.is_exit_when_done()
    }

    pub fn is_exit(&self) -> bool {
        self.flags.is_exit()
    }

    //
    // pop
    //

    pub async fn wait_pop_front(&self) -> PopResult<T> {
        self.pop_deadline(None, 1)
            .await
            .map_single()
    }

    pub async fn wait_pop_front_for(&self, timeout: Duration) -> PopResult<T> {
        self.pop_deadline(Some(Instant::now() + timeout), 1)
            .await
            .map_single()
    }

    pub async fn wait_pop_front_until(&self, deadline: Instant) -> PopResult<T> {
        self.pop_deadline(Some(deadline), 1).await.map_single()
    }

    pub async fn wait_pop_front_bulk(&self, max_count: usize) -> PopResult<Vec<T>> {
        self.pop_deadline(None, max_count).await
    }

    pub async fn wait_pop_front_bulk_for(
        &self,
        timeout: Duration,
        max_count: usize,
    ) -> PopResult<Vec<T>> {
        self.pop_deadline(Some(Instant::now() + timeout), max_count)
            .await
    }

    pub async fn wait_pop_front_bulk_until(
        &self,
        deadline: Instant,
        max_count: usize,
    ) -> PopResult<Vec<T>> {
        self.pop_deadline(Some(deadline), max_count).await
    }

    async fn pop_deadline(
        &self,
        deadline: Option<Instant>,
        max_count: usize,
    ) -> PopResult<Vec<T>> {
        let max_count = max_count.max(1);
        loop {
            let notified = self.flags.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut levels = self.levels.lock().unwrap();
                if self.flags.is_exit_force() {
                    return PopResult::Exit;
                }

                let mut elems = Vec::new();
                while elems.len() < max_count {
                    match Self::pop_by_ratio(&mut levels) {
                        Some(elem) => elems.push(elem),
                        None => break,
                    }
                }
                if !elems.is_empty() {
                    let now_empty = levels.iter().all(|level| level.items.is_empty());
                    drop(levels);
                    if now_empty {
                        self.drained.notify_waiters();
                    }
                    return PopResult::Element(elems);
                }
                if self.flags.is_exit_when_done() {
                    return PopResult::Exit;
                }
            }

            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return PopResult::Timeout;
                    }
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// One dequeue under the anti-starvation policy.
    fn pop_by_ratio(levels: &mut [Level<T>]) -> Option<T> {
        // serve the most urgent level that still has budget; taking from
        // level i refreshes the budget of everything above it
        for idx in 0..levels.len() {
            if !levels[idx].items.is_empty() && levels[idx].used < levels[idx].ratio {
                levels[idx].used += 1;
                for higher in levels[..idx].iter_mut() {
                    higher.used = 0;
                }
                return levels[idx].items.pop_front();
            }
        }

        // every non-empty level exhausted its budget (or carries ratio 0
        // behind empty higher levels): restart the cycle at the top
        for idx in 0..levels.len() {
            if !levels[idx].items.is_empty() {
                for level in levels.iter_mut() {
                    level.used = 0;
                }
                levels[idx].used = 1;
                return levels[idx].items.pop_front();
            }
        }

        None
    }

    /// Resolve once the queue is empty (or immediately on exit-force).
    pub async fn wait_empty(&self) {
        loop {
            let drained = self.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();

            if self.flags.is_exit_force() || self.is_empty() {
                return;
            }

            drained.await;
        }
    }
}

impl<T> PopResult<Vec<T>> {
    fn map_single(self) -> PopResult<T> {
        match self {
            PopResult::Element(mut elems) => match elems.pop() {
                Some(elem) => PopResult::Element(elem),
                None => PopResult::Timeout,
            },
            PopResult::Timeout => PopResult::Timeout,
            PopResult::Exit => PopResult::Exit,
        }
    }
}
