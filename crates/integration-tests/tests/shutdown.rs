//! Shutdown protocol: drain on exit-when-done, bounded abort on
//! exit-force, refusal of late submissions, idempotent signals and
//! registry accounting under concurrent load.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use jobforge_core::{
    EngineConfig, GroupConfig, JobGroup, JobType, JobsConfig, JobsEngine, PopResult, PrioConfig,
    Priority, ProcessingConfig, TypeConfig,
};
use tokio::time::Instant;

type TestEngine = JobsEngine<String, String>;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn group() -> JobGroup {
    JobGroup::new("default")
}

fn job_type() -> JobType {
    JobType::new("work")
}

fn engine_with(group_threads: usize, work: Duration) -> (TestEngine, Arc<AtomicUsize>) {
    let config = JobsConfig::new(EngineConfig {
        threads_count: 0,
        prio_config: PrioConfig::default(),
    })
    .with_group(group(), GroupConfig::new(group_threads))
    .with_type(job_type(), TypeConfig::new(group()));
    let engine = TestEngine::new(config).unwrap();

    let processed = Arc::new(AtomicUsize::new(0));
    let processed_cb = Arc::clone(&processed);
    engine
        .config_default_function_processing(move |engine: TestEngine, items| {
            let processed = Arc::clone(&processed_cb);
            async move {
                for item in items {
                    if !work.is_zero() {
                        tokio::time::sleep(work).await;
                    }
                    processed.fetch_add(1, Ordering::SeqCst);
                    engine.state().jobs_finished(item.id).await;
                }
                ProcessingConfig::default()
            }
        })
        .unwrap();
    (engine, processed)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_when_done_completes_everything_admitted() {
    init_logging();
    let (engine, processed) = engine_with(2, Duration::from_millis(2));
    engine.start_threads(2);

    for i in 0..50 {
        engine
            .queue()
            .push_back_and_start(Priority::Normal, job_type(), format!("j{i}"))
            .await
            .unwrap();
    }

    assert_eq!(engine.wait().await, PopResult::Exit);
    assert_eq!(processed.load(Ordering::SeqCst), 50);
    assert_eq!(engine.len(), 0);
    assert_eq!(engine.len_delayed(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_force_exit_returns_within_bounded_time() {
    init_logging();
    let (engine, processed) = engine_with(1, Duration::from_millis(50));
    engine.start_threads(1);

    for i in 0..30 {
        engine
            .queue()
            .push_back_and_start(Priority::Normal, job_type(), format!("j{i}"))
            .await
            .unwrap();
    }

    // let it chew on a couple of jobs, then abort
    tokio::time::sleep(Duration::from_millis(120)).await;
    engine.signal_exit_force();

    let aborted_at = Instant::now();
    assert_eq!(engine.wait().await, PopResult::Exit);
    assert!(aborted_at.elapsed() < Duration::from_secs(2));

    // only a fraction was processed; the queue depth did not matter
    assert!(processed.load(Ordering::SeqCst) < 30);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_wait_for_times_out_then_force_exits() {
    init_logging();
    let (engine, _processed) = engine_with(1, Duration::from_millis(500));
    engine.start_threads(1);

    engine
        .queue()
        .push_back_and_start(Priority::Normal, job_type(), "slow".into())
        .await
        .unwrap();

    assert_eq!(
        engine.wait_for(Duration::from_millis(50)).await,
        PopResult::Timeout
    );

    engine.signal_exit_force();
    assert_eq!(engine.wait().await, PopResult::Exit);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_submissions_refused_after_signals() {
    init_logging();
    let (engine, _processed) = engine_with(1, Duration::ZERO);
    engine.start_threads(1);

    engine.signal_exit_when_done();

    // sealed: both plain and delayed submissions report nothing accepted
    assert_eq!(engine.queue().push_back(job_type(), "late".into()), None);
    assert_eq!(
        engine
            .queue()
            .push_back_and_start(Priority::Normal, job_type(), "late".into())
            .await,
        None
    );
    assert_eq!(
        engine
            .queue()
            .push_back_and_start_delay_for(
                Duration::from_millis(5),
                Priority::Normal,
                job_type(),
                "late".into(),
            )
            .await,
        None
    );

    assert_eq!(engine.wait().await, PopResult::Exit);
    assert_eq!(engine.len(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_signals_and_wait_are_idempotent() {
    init_logging();
    let (engine, processed) = engine_with(1, Duration::ZERO);
    engine.start_threads(1);
    // second start is a no-op
    engine.start_threads(8);

    engine
        .queue()
        .push_back_and_start(Priority::Normal, job_type(), "one".into())
        .await
        .unwrap();

    engine.signal_exit_when_done();
    engine.signal_exit_when_done();

    assert_eq!(engine.wait().await, PopResult::Exit);
    assert_eq!(engine.wait().await, PopResult::Exit);
    assert_eq!(processed.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_submissions_all_accounted_for() {
    init_logging();
    let (engine, processed) = engine_with(4, Duration::ZERO);
    engine.start_threads(4);

    let accepted = Arc::new(AtomicUsize::new(0));
    let mut submitters = Vec::new();
    for task in 0..8 {
        let engine = engine.clone();
        let accepted = Arc::clone(&accepted);
        submitters.push(tokio::spawn(async move {
            for i in 0..25 {
                if engine
                    .queue()
                    .push_back_and_start(Priority::Normal, job_type(), format!("t{task}-{i}"))
                    .await
                    .is_some()
                {
                    accepted.fetch_add(1, Ordering::SeqCst);
                }
            }
        }));
    }
    for submitter in submitters {
        submitter.await.unwrap();
    }

    assert_eq!(engine.wait().await, PopResult::Exit);

    // every accepted job was processed and erased through its terminal state
    assert_eq!(accepted.load(Ordering::SeqCst), 200);
    assert_eq!(processed.load(Ordering::SeqCst), 200);
    assert_eq!(engine.len(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_wait_until_deadline_in_the_past_times_out() {
    init_logging();
    let (engine, _processed) = engine_with(1, Duration::from_millis(300));
    engine.start_threads(1);

    engine
        .queue()
        .push_back_and_start(Priority::Normal, job_type(), "busy".into())
        .await
        .unwrap();
    // give the worker a moment to pick the job up
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(
        engine.wait_until(Instant::now()).await,
        PopResult::Timeout
    );

    engine.signal_exit_force();
    assert_eq!(engine.wait().await, PopResult::Exit);
}
