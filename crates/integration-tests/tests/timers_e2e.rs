//! Timers facade end to end: one-shots, intervals, cancellation across
//! reschedules and drain-on-wait.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use jobforge_core::{PopResult, Timers};
use tokio::time::Instant;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_staggered_timeouts_all_fire() {
    init_logging();
    let timers = Timers::new().unwrap();
    let fired = Arc::new(AtomicUsize::new(0));

    for i in 1..=5 {
        let fired = Arc::clone(&fired);
        timers
            .set_timeout(Duration::from_millis(20 * i), move || {
                fired.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
    }

    // wait() drains every pending timer before returning
    assert_eq!(timers.wait().await, PopResult::Exit);
    assert_eq!(fired.load(Ordering::SeqCst), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_wait_blocks_until_pending_timeout_matures() {
    init_logging();
    let timers = Timers::new().unwrap();
    let fired = Arc::new(AtomicUsize::new(0));

    let fired_cb = Arc::clone(&fired);
    let started = Instant::now();
    timers
        .set_timeout(Duration::from_millis(200), move || {
            fired_cb.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();

    assert_eq!(timers.wait().await, PopResult::Exit);
    assert!(started.elapsed() >= Duration::from_millis(150));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_interval_survives_reschedules_until_cleared() {
    init_logging();
    let timers = Timers::new().unwrap();
    let fired = Arc::new(AtomicUsize::new(0));

    let fired_cb = Arc::clone(&fired);
    let interval_id = timers
        .set_interval(Duration::from_millis(40), move || {
            fired_cb.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    let before_clear = fired.load(Ordering::SeqCst);
    assert!(before_clear >= 3, "interval fired only {before_clear} times");

    // clearing by the original id works no matter how often it re-armed
    assert!(timers.clear_interval(interval_id).await);
    // a second clear finds nothing
    assert!(!timers.clear_interval(interval_id).await);

    let after_clear = fired.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(fired.load(Ordering::SeqCst) <= after_clear + 1);

    timers.signal_exit_force();
    timers.wait().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cleared_timeout_never_fires() {
    init_logging();
    let timers = Timers::new().unwrap();
    let fired = Arc::new(AtomicUsize::new(0));

    let fired_cb = Arc::clone(&fired);
    let timer_id = timers
        .set_timeout(Duration::from_millis(150), move || {
            fired_cb.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();

    assert!(timers.clear_timeout(timer_id).await);
    // clearing twice reports nothing to cancel
    assert!(!timers.clear_timeout(timer_id).await);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    timers.signal_exit_force();
    timers.wait().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_wait_for_bounds_a_long_timer() {
    init_logging();
    let timers = Timers::new().unwrap();

    timers
        .set_timeout(Duration::from_secs(30), || {})
        .await
        .unwrap();

    assert_eq!(
        timers.wait_for(Duration::from_millis(50)).await,
        PopResult::Timeout
    );

    timers.signal_exit_force();
    assert_eq!(timers.wait().await, PopResult::Exit);
}
