// Timer Task - background pump draining a time queue
//
// One task loops on the owned time queue and hands every matured batch to
// an async sink. Timeout re-enters the wait; Exit terminates the task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use super::time_queue::TimeQueue;
use super::wait::PopResult;

/// Receives matured payload batches.
pub type TimerSink<T> = Arc<dyn Fn(Vec<T>) -> BoxFuture<'static, ()> + Send + Sync>;

/// A [`TimeQueue`] plus the single task that drains it.
pub struct TimerTask<T> {
    queue: Arc<TimeQueue<T>>,
    started: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> Default for TimerTask<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> TimerTask<T> {
    pub fn new() -> Self {
        Self {
            queue: Arc::new(TimeQueue::new()),
            started: AtomicBool::new(false),
            handle: Mutex::new(None),
        }
    }

    pub fn queue(&self) -> &TimeQueue<T> {
        &self.queue
    }

    /// Spawn the pump task. Idempotent once started.
    pub fn start(&self, sink: TimerSink<T>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }

        let queue = Arc::clone(&self.queue);
        let handle = tokio::spawn(async move {
            debug!("timer task started");
            loop {
                match queue.wait_pop(1).await {
                    PopResult::Element(batch) => sink(batch).await,
                    PopResult::Timeout => continue,
                    PopResult::Exit => break,
                }
            }
            debug!("timer task stopped");
        });
        *self.handle.lock().unwrap() = Some(handle);
    }

    /// Seal the queue and wait for it to drain (pending entries are still
    /// delivered at maturity).
    pub async fn wait(&self) -> PopResult<()> {
        self.queue.signal_exit_when_done();
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        PopResult::Exit
    }

    /// Bounded [`TimerTask::wait`]; on expiry the task keeps running and a
    /// later wait can pick it up again.
    pub async fn wait_until(&self, deadline: Instant) -> PopResult<()> {
        self.queue.signal_exit_when_done();
        let handle = self.handle.lock().unwrap().take();
        match handle {
            None => PopResult::Exit,
            Some(mut handle) => {
                match tokio::time::timeout_at(deadline, &mut handle).await {
                    Ok(_) => PopResult::Exit,
                    Err(_) => {
                        *self.handle.lock().unwrap() = Some(handle);
                        PopResult::Timeout
                    }
                }
            }
        }
    }
}
