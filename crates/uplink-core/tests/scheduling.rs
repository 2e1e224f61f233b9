//! Upload scheduling: registrations made by the scheduler and how the local
//! runner drives the worker.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::Mutex;
use tokio::time::sleep;

use uplink_core::mock::{MockAuth, MockIngest, RecordingScheduler, StaticProbe};
use uplink_core::{
    BackoffPolicy, Constraints, ExistingWorkPolicy, IMMEDIATE_WORK_NAME, Job, JobScheduler,
    LocalJobRunner, NetworkKind, PERIODIC_WORK_NAME, SharedStore, UploadScheduler, UploadStatus,
    UploadWorker, WorkRequest, WorkResult, WorkState, WorkerOptions,
};
use uplink_store::{Preferences, SensorReading, Store};

fn success() -> WorkResult {
    WorkResult::Success {
        uploaded: 1,
        failed: 0,
        message: "Upload successful".into(),
    }
}

/// A job returning `results` in order, then success forever.
fn scripted_job(runs: Arc<AtomicU32>, results: Vec<WorkResult>) -> Job {
    let results = Arc::new(results);
    Arc::new(move || {
        let runs = Arc::clone(&runs);
        let results = Arc::clone(&results);
        async move {
            let n = runs.fetch_add(1, Ordering::SeqCst) as usize;
            results.get(n).cloned().unwrap_or_else(success)
        }
        .boxed()
    })
}

fn fixed_backoff() -> BackoffPolicy {
    BackoffPolicy::default()
        .initial_delay(Duration::from_secs(30))
        .jitter(false)
}

#[tokio::test]
async fn test_immediate_replaces_pending_run() {
    let jobs = Arc::new(RecordingScheduler::new());
    let scheduler = UploadScheduler::new(jobs.clone());

    scheduler.schedule_immediate(Constraints::default()).await;
    scheduler.schedule_immediate(Constraints::any_network()).await;

    let enqueued = jobs.enqueued().await;
    assert_eq!(enqueued.len(), 2);
    assert!(enqueued.iter().all(|e| e.name == IMMEDIATE_WORK_NAME));
    assert!(enqueued.iter().all(|e| e.policy == ExistingWorkPolicy::Replace));

    let current = jobs.current(IMMEDIATE_WORK_NAME).await.unwrap();
    assert_eq!(current.constraints, Constraints::any_network());
    assert!(!current.is_periodic());
}

#[tokio::test]
async fn test_periodic_interval_floor() {
    let jobs = Arc::new(RecordingScheduler::new());
    let scheduler = UploadScheduler::new(jobs.clone());

    let interval = scheduler.schedule_periodic(5, Constraints::default()).await;
    assert_eq!(interval, Duration::from_secs(15 * 60));

    let interval = scheduler.schedule_periodic(60, Constraints::default()).await;
    assert_eq!(interval, Duration::from_secs(60 * 60));
    let current = jobs.current(PERIODIC_WORK_NAME).await.unwrap();
    assert_eq!(current.interval(), Some(Duration::from_secs(3600)));
}

#[tokio::test]
async fn test_preferences_drive_registration() {
    let jobs = Arc::new(RecordingScheduler::new());
    let scheduler = UploadScheduler::new(jobs.clone());

    let prefs = Preferences {
        wifi_only: false,
        requires_charging: true,
        upload_interval_minutes: 30,
        ..Default::default()
    };
    assert_eq!(
        scheduler.apply_preferences(&prefs).await,
        Some(Duration::from_secs(1800))
    );
    let current = jobs.current(PERIODIC_WORK_NAME).await.unwrap();
    assert!(current.constraints.requires_charging);
    assert!(!current.constraints.wifi_only);

    let disabled = Preferences {
        auto_upload_enabled: false,
        ..prefs
    };
    assert_eq!(scheduler.apply_preferences(&disabled).await, None);
    assert!(jobs.current(PERIODIC_WORK_NAME).await.is_none());
}

#[tokio::test]
async fn test_cancel_all_clears_both_names() {
    let jobs = Arc::new(RecordingScheduler::new());
    let scheduler = UploadScheduler::new(jobs.clone());
    scheduler.schedule_immediate(Constraints::default()).await;
    scheduler.schedule_periodic(15, Constraints::default()).await;

    scheduler.cancel_all().await;

    assert_eq!(
        jobs.cancelled().await,
        vec![IMMEDIATE_WORK_NAME.to_string(), PERIODIC_WORK_NAME.to_string()]
    );
    assert!(!scheduler.is_upload_enqueued().await);
}

#[tokio::test(start_paused = true)]
async fn test_runner_backs_off_after_retry() {
    let runs = Arc::new(AtomicU32::new(0));
    let runner = LocalJobRunner::new(
        scripted_job(Arc::clone(&runs), vec![WorkResult::Retry, WorkResult::Retry]),
        Arc::new(StaticProbe::new(NetworkKind::Wifi, false)),
    );
    let request = WorkRequest::one_shot(Constraints::default(), fixed_backoff());
    runner
        .enqueue_unique("upload", request, ExistingWorkPolicy::Replace)
        .await;

    sleep(Duration::from_secs(1)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    // First backoff is 30 s.
    sleep(Duration::from_secs(28)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    sleep(Duration::from_secs(2)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    // Second backoff doubles to 60 s.
    sleep(Duration::from_secs(58)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    sleep(Duration::from_secs(2)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 3);

    assert_eq!(runner.state("upload").await, Some(WorkState::Succeeded));
}

#[tokio::test(start_paused = true)]
async fn test_periodic_runs_every_interval() {
    let runs = Arc::new(AtomicU32::new(0));
    let runner = Arc::new(LocalJobRunner::new(
        scripted_job(Arc::clone(&runs), Vec::new()),
        Arc::new(StaticProbe::new(NetworkKind::Ethernet, false)),
    ));
    let scheduler = UploadScheduler::new(runner.clone()).with_backoff(fixed_backoff());

    scheduler.schedule_periodic(15, Constraints::default()).await;
    sleep(Duration::from_secs(1)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    sleep(Duration::from_secs(15 * 60)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    // Rescheduling with a longer interval moves the next run out.
    scheduler.schedule_periodic(60, Constraints::default()).await;
    sleep(Duration::from_secs(30 * 60)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    sleep(Duration::from_secs(31 * 60)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 3);

    // Cancelling stops further runs.
    scheduler.cancel_all().await;
    sleep(Duration::from_secs(2 * 60 * 60)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 3);
    assert_eq!(scheduler.periodic_state().await, Some(WorkState::Cancelled));
}

#[tokio::test(start_paused = true)]
async fn test_runner_drives_worker_until_delivered() {
    let store: SharedStore = Arc::new(Mutex::new(Store::open_in_memory().unwrap()));
    let readings: Vec<_> = (0..5)
        .map(|i| SensorReading::new("p1", "accelerometer", 1_000 + i, Default::default()))
        .collect();
    store.lock().await.insert_sensor_readings(&readings).unwrap();

    let ingest = Arc::new(MockIngest::new());
    ingest.set_fail_all(true);
    let worker = Arc::new(UploadWorker::new(
        Arc::clone(&store),
        Arc::new(MockAuth::logged_in("t")),
        ingest.clone(),
        // Batch schedules follow the wall clock, which paused time does not move.
        WorkerOptions {
            backoff: BackoffPolicy::default().initial_delay(Duration::ZERO),
            ..Default::default()
        },
    ));
    let runner = Arc::new(LocalJobRunner::for_worker(
        worker,
        Arc::new(StaticProbe::new(NetworkKind::Wifi, false)),
    ));
    let scheduler = UploadScheduler::new(runner.clone()).with_backoff(fixed_backoff());

    scheduler.schedule_immediate(Constraints::default()).await;
    sleep(Duration::from_secs(1)).await;
    assert_eq!(ingest.call_count().await, 1);
    assert_eq!(
        store.lock().await.count_with_status::<SensorReading>(UploadStatus::Failed).unwrap(),
        5
    );

    ingest.set_fail_all(false);
    sleep(Duration::from_secs(31)).await;
    assert_eq!(ingest.call_count().await, 2);
    assert_eq!(
        store.lock().await.count_with_status::<SensorReading>(UploadStatus::Uploaded).unwrap(),
        5
    );
    assert_eq!(scheduler.immediate_state().await, Some(WorkState::Succeeded));

    runner.shutdown().await;
}
