// Lock Queue - FIFO queue with cancellable waits
//
// The queue every other piece of the engine sits on: push from anywhere,
// pop with an optional deadline, and the two-stage shutdown protocol
// (exit-when-done drains, exit-force aborts).

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;
use tokio::time::{sleep_until, Duration, Instant};

use super::wait::{ExitFlags, PopResult};

/// FIFO queue of `T` with cancellable blocking pops.
///
/// Pushes arriving after either exit flag are dropped silently and report
/// zero inserted.
#[derive(Debug, Default)]
pub struct LockQueue<T> {
    queue: Mutex<VecDeque<T>>,
    flags: ExitFlags,
    drained: Notify,
}

impl<T> LockQueue<T> {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            flags: ExitFlags::new(),
            drained: Notify::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.queue.lock().unwrap().clear();
        self.drained.notify_waiters();
    }

    //
    // push
    //

    /// Returns the number of elements inserted (0 while shutting down).
    pub fn push_back(&self, elem: T) -> usize {
        if self.flags.is_exit() {
            return 0;
        }

        self.queue.lock().unwrap().push_back(elem);
        self.flags.notify_one();
        1
    }

    /// Bulk push; notifies all waiters. Returns the number inserted.
    pub fn push_back_bulk(&self, elems: impl IntoIterator<Item = T>) -> usize {
        if self.flags.is_exit() {
            return 0;
        }

        let count = {
            let mut queue = self.queue.lock().unwrap();
            let before = queue.len();
            queue.extend(elems);
            queue.len() - before
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

    /// Block until an element is available or the queue shuts down.
    pub async fn wait_pop_front(&self) -> PopResult<T> {
        self.pop_deadline(None).await
    }

    pub async fn wait_pop_front_for(&self, timeout: Duration) -> PopResult<T> {
        self.pop_deadline(Some(Instant::now() + timeout)).await
    }

    pub async fn wait_pop_front_until(&self, deadline: Instant) -> PopResult<T> {
        self.pop_deadline(Some(deadline)).await
    }

    /// Drain up to `max_count` elements in one wakeup.
    ///
    /// If exit-when-done fires while elements remain, whatever was collected
    /// is returned as `Element`; the call after the queue empties returns
    /// `Exit`.
    pub async fn wait_pop_front_bulk(&self, max_count: usize) -> PopResult<Vec<T>> {
        self.pop_bulk_deadline(None, max_count).await
    }

    pub async fn wait_pop_front_bulk_for(
        &self,
        timeout: Duration,
        max_count: usize,
    ) -> PopResult<Vec<T>> {
        self.pop_bulk_deadline(Some(Instant::now() + timeout), max_count)
            .await
    }

    pub async fn wait_pop_front_bulk_until(
        &self,
        deadline: Instant,
        max_count: usize,
    ) -> PopResult<Vec<T>> {
        self.pop_bulk_deadline(Some(deadline), max_count).await
    }

    async fn pop_deadline(&self, deadline: Option<Instant>) -> PopResult<T> {
        loop {
            let notified = self.flags.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut queue = self.queue.lock().unwrap();
                if self.flags.is_exit_force() {
                    return PopResult::Exit;
                }
                if let Some(elem) = queue.pop_front() {
                    let now_empty = queue.is_empty();
                    drop(queue);
                    if now_empty {
                        self.drained.notify_waiters();
                    }
                    return PopResult::Element(elem);
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

    async fn pop_bulk_deadline(
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
                let mut queue = self.queue.lock().unwrap();
                if self.flags.is_exit_force() {
                    return PopResult::Exit;
                }
                if !queue.is_empty() {
                    let take = max_count.min(queue.len());
                    let elems: Vec<T> = queue.drain(..take).collect();
                    let now_empty = queue.is_empty();
                    drop(queue);
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

    /// Resolve once the queue is empty (or immediately on exit-force).
    ///
    /// Used by the drain-ordered shutdown: consumers keep popping while the
    /// caller waits here.
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_fifo_order() {
        let q = LockQueue::new();
        assert_eq!(q.push_back(1), 1);
        assert_eq!(q.push_back(2), 1);
        assert_eq!(q.push_back_bulk(vec![3, 4]), 2);

        assert_eq!(q.wait_pop_front().await, PopResult::Element(1));
        assert_eq!(q.wait_pop_front().await, PopResult::Element(2));
        assert_eq!(
            q.wait_pop_front_bulk(10).await,
            PopResult::Element(vec![3, 4])
        );
        assert_eq!(q.len(), 0);
    }

    #[tokio::test]
    async fn test_pop_blocks_until_push() {
        let q = Arc::new(LockQueue::new());

        let popper = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.wait_pop_front().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        q.push_back(7);

        let got = tokio::time::timeout(Duration::from_secs(2), popper)
            .await
            .expect("pop should wake")
            .unwrap();
        assert_eq!(got, PopResult::Element(7));
    }

    #[tokio::test]
    async fn test_pop_for_times_out() {
        let q: LockQueue<i32> = LockQueue::new();
        let ret = q.wait_pop_front_for(Duration::from_millis(30)).await;
        assert_eq!(ret, PopResult::Timeout);
    }

    #[tokio::test]
    async fn test_zero_timeout_is_non_blocking() {
        let q: LockQueue<i32> = LockQueue::new();
        let started = Instant::now();
        let ret = q.wait_pop_front_for(Duration::ZERO).await;
        assert_eq!(ret, PopResult::Timeout);
        assert!(started.elapsed() < Duration::from_millis(50));

        q.push_back(1);
        assert_eq!(
            q.wait_pop_front_for(Duration::ZERO).await,
            PopResult::Element(1)
        );
    }

    #[tokio::test]
    async fn test_exit_force_wakes_waiters_and_refuses_pushes() {
        let q: Arc<LockQueue<i32>> = Arc::new(LockQueue::new());

        let popper = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.wait_pop_front().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        q.signal_exit_force();

        let got = tokio::time::timeout(Duration::from_secs(2), popper)
            .await
            .expect("waiter should exit")
            .unwrap();
        assert_eq!(got, PopResult::Exit);

        assert_eq!(q.push_back(1), 0);
        assert_eq!(q.push_back_bulk(vec![1, 2]), 0);
        assert_eq!(q.len(), 0);
    }

    #[tokio::test]
    async fn test_exit_when_done_drains_then_exits() {
        let q = LockQueue::new();
        q.push_back(1);
        q.push_back(2);
        q.signal_exit_when_done();

        // pushes after the signal are refused
        assert_eq!(q.push_back(3), 0);

        assert_eq!(q.wait_pop_front().await, PopResult::Element(1));
        assert_eq!(q.wait_pop_front().await, PopResult::Element(2));
        assert_eq!(q.wait_pop_front().await, PopResult::Exit);
        // and stays that way
        assert_eq!(q.wait_pop_front().await, PopResult::Exit);
    }

    #[tokio::test]
    async fn test_bulk_pop_partial_drain_then_exit() {
        let q = LockQueue::new();
        q.push_back_bulk(vec![1, 2, 3]);
        q.signal_exit_when_done();

        assert_eq!(
            q.wait_pop_front_bulk(2).await,
            PopResult::Element(vec![1, 2])
        );
        assert_eq!(q.wait_pop_front_bulk(2).await, PopResult::Element(vec![3]));
        assert_eq!(q.wait_pop_front_bulk(2).await, PopResult::Exit);
    }

    #[tokio::test]
    async fn test_wait_empty() {
        let q = Arc::new(LockQueue::new());
        q.push_back(1);

        let drainer = {
            let q = Arc::clone(&q);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                q.wait_pop_front().await
            })
        };

        tokio::time::timeout(Duration::from_secs(2), q.wait_empty())
            .await
            .expect("wait_empty should resolve after the drain");
        assert!(q.is_empty());
        drainer.await.unwrap();
    }
}
