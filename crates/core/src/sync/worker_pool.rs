// Worker Pool - fixed set of tasks draining a lock queue in batches
//
// Workers bulk-pop up to `bulk_count` items and run the processing
// function on the batch. Delayed pushes go through an embedded timer task
// and re-enter the queue at maturity. A panicking batch is logged and
// dropped; the worker keeps going.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, error};

use super::lock_queue::LockQueue;
use super::timer_task::TimerTask;
use super::wait::PopResult;

/// Batch processing function run on worker tasks.
pub type ProcessFn<T> = Arc<dyn Fn(Vec<T>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Extract something printable out of a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Pool of worker tasks over a [`LockQueue`] of work units.
pub struct WorkerPool<T> {
    queue: Arc<LockQueue<T>>,
    delayed: TimerTask<T>,
    bulk_count: usize,
    started: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new(bulk_count: usize) -> Self {
        Self {
            queue: Arc::new(LockQueue::new()),
            delayed: TimerTask::new(),
            bulk_count: bulk_count.max(1),
            started: AtomicBool::new(false),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&self) {
        self.queue.clear();
    }

    //
    // enqueue work
    //

    pub fn push_back(&self, item: T) -> usize {
        self.queue.push_back(item)
    }

    pub fn push_back_bulk(&self, items: impl IntoIterator<Item = T>) -> usize {
        self.queue.push_back_bulk(items)
    }

    pub fn push_back_delay_for(&self, delay: Duration, item: T) -> usize {
        self.delayed.queue().push_delay_for(delay, item)
    }

    pub fn push_back_delay_until(&self, deadline: Instant, item: T) -> usize {
        self.delayed.queue().push_delay_until(deadline, item)
    }

    //
    // lifecycle
    //

    /// Spawn `threads_count` workers running `process`. Idempotent once the
    /// pool has started.
    pub fn start_threads(&self, threads_count: usize, process: ProcessFn<T>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }

        // matured delayed items re-enter the work queue
        let queue = Arc::clone(&self.queue);
        self.delayed.start(Arc::new(move |batch: Vec<T>| {
            let queue = Arc::clone(&queue);
            Box::pin(async move {
                let count = batch.len();
                let accepted = queue.push_back_bulk(batch);
                if accepted < count {
                    debug!(
                        dropped = count - accepted,
                        "delayed items arrived after shutdown"
                    );
                }
            })
        }));

        let mut handles = self.handles.lock().unwrap();
        for worker_id in 0..threads_count.max(1) {
            let queue = Arc::clone(&self.queue);
            let process = Arc::clone(&process);
            let bulk_count = self.bulk_count;
            handles.push(tokio::spawn(async move {
                debug!(worker_id, "worker started");
                loop {
                    match queue.wait_pop_front_bulk(bulk_count).await {
                        PopResult::Element(batch) => {
                            let guarded =
                                std::panic::AssertUnwindSafe(process(batch)).catch_unwind();
                            if let Err(panic) = guarded.await {
                                error!(
                                    worker_id,
                                    panic_msg = %panic_message(panic.as_ref()),
                                    "worker batch panicked, batch dropped"
                                );
                            }
                        }
                        PopResult::Timeout => continue,
                        PopResult::Exit => break,
                    }
                }
                debug!(worker_id, "worker stopped");
            }));
        }
    }

    //
    // exit
    //

    pub fn signal_exit_force(&self) {
        self.delayed.queue().signal_exit_force();
        self.queue.signal_exit_force();
    }

    pub fn signal_exit_when_done(&self) {
        self.delayed.queue().signal_exit_when_done();
        self.queue.signal_exit_when_done();
    }

    pub fn is_exit(&self) -> bool {
        self.queue.is_exit_force()
    }

    /// Drain delayed items, seal the queue, let workers finish, join them.
    pub async fn wait(&self) -> PopResult<()> {
        // delayed items first so nothing scheduled is dropped
        self.delayed.wait().await;
        self.queue.signal_exit_when_done();

        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock().unwrap());
        for result in futures::future::join_all(handles).await {
            if let Err(err) = result {
                error!(error = %err, "worker join failed");
            }
        }
        PopResult::Exit
    }

    /// Bounded [`WorkerPool::wait`]. On expiry the remaining workers keep
    /// running and a later wait can join them.
    pub async fn wait_until(&self, deadline: Instant) -> PopResult<()> {
        if self.delayed.wait_until(deadline).await.is_timeout() {
            return PopResult::Timeout;
        }
        self.queue.signal_exit_when_done();

        let mut handles: Vec<_> = std::mem::take(&mut *self.handles.lock().unwrap());
        while let Some(mut handle) = handles.pop() {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(_) => {}
                Err(_) => {
                    handles.push(handle);
                    self.handles.lock().unwrap().extend(handles);
                    return PopResult::Timeout;
                }
            }
        }
        PopResult::Exit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counting_process(seen: Arc<Mutex<Vec<u32>>>) -> ProcessFn<u32> {
        Arc::new(move |batch: Vec<u32>| {
            let seen = Arc::clone(&seen);
            Box::pin(async move {
                seen.lock().unwrap().extend(batch);
            })
        })
    }

    #[tokio::test]
    async fn test_pool_processes_pushed_items() {
        let pool = WorkerPool::new(2);
        let seen = Arc::new(Mutex::new(Vec::new()));
        pool.start_threads(2, counting_process(Arc::clone(&seen)));

        for i in 0..10 {
            assert_eq!(pool.push_back(i), 1);
        }

        assert_eq!(pool.wait().await, PopResult::Exit);
        let mut got = seen.lock().unwrap().clone();
        got.sort_unstable();
        assert_eq!(got, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_items_queued_before_start_are_processed() {
        let pool = WorkerPool::new(1);
        let seen = Arc::new(Mutex::new(Vec::new()));

        pool.push_back(1);
        pool.push_back(2);
        pool.start_threads(1, counting_process(Arc::clone(&seen)));

        pool.wait().await;
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_delayed_push_arrives_later() {
        let pool = WorkerPool::new(1);
        let seen = Arc::new(Mutex::new(Vec::new()));
        pool.start_threads(1, counting_process(Arc::clone(&seen)));

        pool.push_back_delay_for(Duration::from_millis(50), 42);
        assert!(seen.lock().unwrap().is_empty());

        // wait drains the delayed item before sealing the queue
        pool.wait().await;
        assert_eq!(*seen.lock().unwrap(), vec![42]);
    }

    #[tokio::test]
    async fn test_start_threads_is_idempotent() {
        let pool = WorkerPool::new(1);
        let seen = Arc::new(Mutex::new(Vec::new()));
        pool.start_threads(1, counting_process(Arc::clone(&seen)));
        pool.start_threads(4, counting_process(Arc::new(Mutex::new(Vec::new()))));

        pool.push_back(5);
        pool.wait().await;
        assert_eq!(*seen.lock().unwrap(), vec![5]);
    }

    #[tokio::test]
    async fn test_panicking_batch_does_not_kill_worker() {
        let pool = WorkerPool::new(1);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let process: ProcessFn<u32> = {
            let seen = Arc::clone(&seen);
            Arc::new(move |batch: Vec<u32>| {
                let seen = Arc::clone(&seen);
                Box::pin(async move {
                    if batch.contains(&13) {
                        panic!("boom");
                    }
                    seen.lock().unwrap().extend(batch);
                })
            })
        };
        pool.start_threads(1, process);

        pool.push_back(13);
        pool.push_back(1);
        pool.wait().await;

        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_force_exit_drops_queued_work() {
        let pool = WorkerPool::new(1);
        let seen = Arc::new(Mutex::new(Vec::new()));

        // no workers yet: queue some work, then abort
        pool.push_back(1);
        pool.signal_exit_force();
        assert_eq!(pool.push_back(2), 0);

        pool.start_threads(1, counting_process(Arc::clone(&seen)));
        assert_eq!(pool.wait().await, PopResult::Exit);
        assert!(seen.lock().unwrap().is_empty());
    }
}
