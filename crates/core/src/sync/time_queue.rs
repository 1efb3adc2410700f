// Time Queue - min-heap of (deadline, payload) with cancellable waits
//
// A blocking pop returns payloads whose deadline has passed; otherwise it
// sleeps until the earliest deadline, re-targeting whenever an earlier
// push or a signal arrives. Exit-when-done still delivers unmatured
// entries at maturity: a scheduled start must be honored even during a
// clean shutdown. Only an empty heap yields Exit.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Mutex;

use tokio::time::{sleep_until, Duration, Instant};

use super::wait::{ExitFlags, PopResult};

#[derive(Debug)]
struct Entry<T> {
    deadline: Instant,
    seq: u64,
    value: T,
}

// Inverted ordering so the BinaryHeap surfaces the earliest deadline;
// insertion sequence breaks ties FIFO.
impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

#[derive(Debug)]
struct Heap<T> {
    entries: BinaryHeap<Entry<T>>,
    next_seq: u64,
}

/// Time-ordered queue of `T`.
#[derive(Debug)]
pub struct TimeQueue<T> {
    heap: Mutex<Heap<T>>,
    flags: ExitFlags,
}

impl<T> Default for TimeQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimeQueue<T> {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(Heap {
                entries: BinaryHeap::new(),
                next_seq: 0,
            }),
            flags: ExitFlags::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.heap.lock().unwrap().entries.clear();
        // waiters re-check and fall asleep without a target (or exit)
        self.flags.notify_all();
    }

    //
    // push
    //

    /// Schedule `value` to mature after `delay`. Returns the number
    /// inserted (0 while shutting down).
    pub fn push_delay_for(&self, delay: Duration, value: T) -> usize {
        self.push_delay_until(Instant::now() + delay, value)
    }

    /// Schedule `value` to mature at `deadline`.
    pub fn push_delay_until(&self, deadline: Instant, value: T) -> usize {
        if self.flags.is_exit() {
            return 0;
        }

        {
            let mut heap = self.heap.lock().unwrap();
            let seq = heap.next_seq;
            heap.next_seq += 1;
            heap.entries.push(Entry {
                deadline,
                seq,
                value,
            });
        }
        // an earlier deadline than the current head must re-target the
        // sleeping waiter
        self.flags.notify_all();
        1
    }

    //
    // exit
    //

    pub fn signal_exit_force(&self) {
        self.flags.signal_exit_force();
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

    /// Block until at least one entry matures; drain up to `max_count`
    /// matured entries in deadline order (ties in insertion order).
    pub async fn wait_pop(&self, max_count: usize) -> PopResult<Vec<T>> {
        self.pop_deadline(None, max_count).await
    }

    pub async fn wait_pop_for(&self, timeout: Duration, max_count: usize) -> PopResult<Vec<T>> {
        self.pop_deadline(Some(Instant::now() + timeout), max_count)
            .await
    }

    pub async fn wait_pop_until(&self, deadline: Instant, max_count: usize) -> PopResult<Vec<T>> {
        self.pop_deadline(Some(deadline), max_count).await
    }

    async fn pop_deadline(
        &self,
        wait_deadline: Option<Instant>,
        max_count: usize,
    ) -> PopResult<Vec<T>> {
        let max_count = max_count.max(1);
        loop {
            let notified = self.flags.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let head_deadline = {
                let mut heap = self.heap.lock().unwrap();
                if self.flags.is_exit_force() {
                    return PopResult::Exit;
                }

                let now = Instant::now();
                let mut matured = Vec::new();
                while matured.len() < max_count {
                    let ready = matches!(heap.entries.peek(), Some(entry) if entry.deadline <= now);
                    if !ready {
                        break;
                    }
                    if let Some(entry) = heap.entries.pop() {
                        matured.push(entry.value);
                    }
                }
                if !matured.is_empty() {
                    return PopResult::Element(matured);
                }
                match heap.entries.peek() {
                    Some(entry) => Some(entry.deadline),
                    None => {
                        if self.flags.is_exit_when_done() {
                            return PopResult::Exit;
                        }
                        None
                    }
                }
            };

            if let Some(wait_deadline) = wait_deadline {
                if Instant::now() >= wait_deadline {
                    return PopResult::Timeout;
                }
            }

            // sleep until whichever comes first: the head maturing, the
            // caller's own deadline, or a notification
            let sleep_target = match (head_deadline, wait_deadline) {
                (Some(head), Some(until)) => Some(head.min(until)),
                (Some(head), None) => Some(head),
                (None, Some(until)) => Some(until),
                (None, None) => None,
            };

            match sleep_target {
                Some(target) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = sleep_until(target) => {}
                    }
                }
                None => notified.await,
            }
        }
    }
}
