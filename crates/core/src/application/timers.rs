// Timers - set_timeout / set_interval facade
//
// A thin wrapper over a dedicated engine instance: one group, two job
// types (one-shot and repeating), every timer a delayed-start job. An
// interval re-schedules itself on each firing; the facade keeps the id the
// user got mapped to the currently scheduled job so clearing works across
// reschedules.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::domain::{JobGroup, JobId, JobType, Priority};
use crate::error::EngineError;
use crate::sync::{PopResult, PrioConfig};

use super::config::{
    EngineConfig, GroupConfig, JobHandle, JobsConfig, ProcessingConfig, ProcessingFn, TypeConfig,
};
use super::constants::TIMER_THREADS;
use super::engine::JobsEngine;

/// Opaque timer id, valid for `clear_timeout` / `clear_interval`.
pub type TimerId = JobId;

/// The function run when a timer fires.
pub type TimerFn = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone)]
struct TimerRequest {
    period: Duration,
    callback: TimerFn,
}

type TimerEngine = JobsEngine<TimerRequest, bool>;
type TimerHandle = JobHandle<TimerRequest, bool>;

fn timeout_type() -> JobType {
    JobType::new("timeout")
}

fn interval_type() -> JobType {
    JobType::new("interval")
}

#[derive(Default)]
struct IntervalMaps {
    /// id returned to the user -> currently scheduled job id
    current_by_user: HashMap<TimerId, JobId>,
    /// currently scheduled job id -> id returned to the user
    user_by_current: HashMap<JobId, TimerId>,
}

/// `set_timeout` / `set_interval` built on the jobs engine.
pub struct Timers {
    engine: TimerEngine,
    intervals: Arc<Mutex<IntervalMaps>>,
}

impl Timers {
    pub fn new() -> Result<Self, EngineError> {
        let group = JobGroup::new("timers");
        let intervals = Arc::new(Mutex::new(IntervalMaps::default()));

        let timeout_processing: ProcessingFn<TimerRequest, bool> =
            Arc::new(|_engine, items: Vec<TimerHandle>| {
                Box::pin(async move {
                    for item in items {
                        (item.request.callback)();
                        item.set_response(true);
                    }
                    ProcessingConfig::default()
                })
            });

        let intervals_cb = Arc::clone(&intervals);
        let interval_processing: ProcessingFn<TimerRequest, bool> =
            Arc::new(move |engine: TimerEngine, items: Vec<TimerHandle>| {
                let intervals = Arc::clone(&intervals_cb);
                Box::pin(async move {
                    for item in items {
                        (item.request.callback)();
                        item.set_response(true);

                        // re-arm unless the interval was cleared meanwhile
                        let user_id = intervals.lock().unwrap().user_by_current.remove(&item.id);
                        let Some(user_id) = user_id else {
                            continue;
                        };

                        let next_id = engine
                            .queue()
                            .push_back_and_start_delay_for(
                                item.request.period,
                                Priority::Normal,
                                interval_type(),
                                item.request.clone(),
                            )
                            .await;
                        let Some(next_id) = next_id else {
                            // engine shutting down, the interval ends here
                            continue;
                        };

                        let stale = {
                            let mut maps = intervals.lock().unwrap();
                            if maps.current_by_user.get(&user_id) == Some(&item.id) {
                                maps.current_by_user.insert(user_id, next_id);
                                maps.user_by_current.insert(next_id, user_id);
                                false
                            } else {
                                true
                            }
                        };
                        if stale {
                            // cleared while this firing was re-scheduling
                            engine.state().jobs_cancelled(next_id).await;
                        }
                    }
                    ProcessingConfig::default()
                })
            });

        let mut timeout_config = TypeConfig::new(group.clone());
        timeout_config.processing = Some(timeout_processing);
        let mut interval_config = TypeConfig::new(group.clone());
        interval_config.processing = Some(interval_processing);

        let config = JobsConfig::new(EngineConfig {
            threads_count: TIMER_THREADS,
            prio_config: PrioConfig::single(Priority::Normal),
        })
        .with_group(group, GroupConfig::new(TIMER_THREADS))
        .with_type(timeout_type(), timeout_config)
        .with_type(interval_type(), interval_config);

        Ok(Self {
            engine: TimerEngine::new(config)?,
            intervals,
        })
    }

    /// Run `f` once after `delay`.
    pub async fn set_timeout(
        &self,
        delay: Duration,
        f: impl Fn() + Send + Sync + 'static,
    ) -> Option<TimerId> {
        let timer_id = self
            .engine
            .queue()
            .push_back_and_start_delay_for(
                delay,
                Priority::Normal,
                timeout_type(),
                TimerRequest {
                    period: delay,
                    callback: Arc::new(f),
                },
            )
            .await;
        debug!(timer_id = ?timer_id, delay_ms = delay.as_millis() as u64, "timeout scheduled");
        timer_id
    }

    /// Cancel a pending timeout. Returns `false` when it already fired (or
    /// never existed).
    pub async fn clear_timeout(&self, timer_id: TimerId) -> bool {
        self.engine.state().jobs_cancelled(timer_id).await
    }

    /// Run `f` every `period` until cleared.
    pub async fn set_interval(
        &self,
        period: Duration,
        f: impl Fn() + Send + Sync + 'static,
    ) -> Option<TimerId> {
        let timer_id = self
            .engine
            .queue()
            .push_back_and_start_delay_for(
                period,
                Priority::Normal,
                interval_type(),
                TimerRequest {
                    period,
                    callback: Arc::new(f),
                },
            )
            .await?;

        let mut maps = self.intervals.lock().unwrap();
        maps.current_by_user.insert(timer_id, timer_id);
        maps.user_by_current.insert(timer_id, timer_id);
        debug!(timer_id, period_ms = period.as_millis() as u64, "interval scheduled");
        Some(timer_id)
    }

    /// Cancel an interval by the id `set_interval` returned, regardless of
    /// how many times it re-scheduled itself since.
    pub async fn clear_interval(&self, timer_id: TimerId) -> bool {
        let current = {
            let mut maps = self.intervals.lock().unwrap();
            let Some(current) = maps.current_by_user.remove(&timer_id) else {
                return false;
            };
            maps.user_by_current.remove(&current);
            current
        };
        self.engine.state().jobs_cancelled(current).await
    }

    //
    // lifecycle passthrough
    //

    pub fn signal_exit_force(&self) {
        self.engine.signal_exit_force();
    }

    pub async fn wait(&self) -> PopResult<()> {
        self.engine.wait().await
    }

    pub async fn wait_for(&self, timeout: Duration) -> PopResult<()> {
        self.engine.wait_for(timeout).await
    }

    pub async fn wait_until(&self, deadline: Instant) -> PopResult<()> {
        self.engine.wait_until(deadline).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_set_timeout_fires_once() {
        let timers = Timers::new().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_cb = Arc::clone(&fired);
        timers
            .set_timeout(Duration::from_millis(30), move || {
                fired_cb.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        timers.signal_exit_force();
        timers.wait().await;
    }

    #[tokio::test]
    async fn test_clear_timeout_before_maturity() {
        let timers = Timers::new().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_cb = Arc::clone(&fired);
        let timer_id = timers
            .set_timeout(Duration::from_millis(200), move || {
                fired_cb.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();

        assert!(timers.clear_timeout(timer_id).await);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        timers.signal_exit_force();
        timers.wait().await;
    }

    #[tokio::test]
    async fn test_interval_fires_until_cleared() {
        let timers = Timers::new().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_cb = Arc::clone(&fired);
        let timer_id = timers
            .set_interval(Duration::from_millis(50), move || {
                fired_cb.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(450)).await;
        let seen = fired.load(Ordering::SeqCst);
        assert!(seen >= 3, "interval fired only {seen} times");

        assert!(timers.clear_interval(timer_id).await);
        let after_clear = fired.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(250)).await;
        // at most one in-flight firing may slip through
        assert!(fired.load(Ordering::SeqCst) <= after_clear + 1);

        timers.signal_exit_force();
        timers.wait().await;
    }
}
