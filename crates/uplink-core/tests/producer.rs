//! Producer adapter behavior with a scripted sample source.
//!
//! Time is paused, so sample spacing and flush intervals are exact.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::Mutex;
use tokio::time::sleep;

use uplink_core::mock::MockSource;
use uplink_core::{Error, Producer, ProducerOptions, Sample, SharedStore};
use uplink_store::{SensorReading, Store};

fn shared_store() -> SharedStore {
    Arc::new(Mutex::new(Store::open_in_memory().unwrap()))
}

fn samples(count: i64) -> Vec<Sample> {
    (0..count)
        .map(|i| Sample::new(1_000 + i, Default::default()).with_accuracy(3))
        .collect()
}

async fn stored(store: &SharedStore) -> u64 {
    store.lock().await.pending_count::<SensorReading>().unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_unavailable_sensor_fails_to_start() {
    let source = Arc::new(MockSource::new("barometer"));
    source.set_available(false);

    let result = Producer::start(source, shared_store(), ProducerOptions::default()).await;
    assert!(matches!(result, Err(Error::SensorUnavailable(kind)) if kind == "barometer"));
}

#[tokio::test(start_paused = true)]
async fn test_over_rate_samples_are_dropped() {
    // 20 samples 150 ms apart against a 5 Hz limit: every other one is kept.
    let source = Arc::new(
        MockSource::new("accelerometer")
            .with_samples(samples(20))
            .with_spacing(Duration::from_millis(150)),
    );
    let store = shared_store();
    let producer = Producer::start(source, Arc::clone(&store), ProducerOptions::default())
        .await
        .unwrap();

    sleep(Duration::from_secs(4)).await;
    let status = producer.status().await;
    assert_eq!(status.total_collected, 10);
    assert_eq!(status.dropped_by_throttle, 10);
    assert!(status.is_collecting);

    let status = producer.stop().await.unwrap();
    assert!(!status.is_collecting);
    assert_eq!(stored(&store).await, 10);
}

#[tokio::test(start_paused = true)]
async fn test_flush_at_batch_size() {
    let source = Arc::new(
        MockSource::new("accelerometer")
            .with_samples(samples(12))
            .with_spacing(Duration::from_millis(250)),
    );
    let store = shared_store();
    let options = ProducerOptions::builder()
        .batch_size(5)
        .flush_interval(Duration::from_secs(3600))
        .build();
    let producer = Producer::start(source, Arc::clone(&store), options)
        .await
        .unwrap();

    sleep(Duration::from_secs(4)).await;
    // Two full batches written, two samples still in memory.
    assert_eq!(stored(&store).await, 10);
    assert_eq!(producer.status().await.buffered, 2);

    producer.stop().await.unwrap();
    assert_eq!(stored(&store).await, 12);
}

#[tokio::test(start_paused = true)]
async fn test_flush_on_interval() {
    let source = Arc::new(
        MockSource::new("gyroscope")
            .with_samples(samples(3))
            .with_spacing(Duration::from_millis(500)),
    );
    let store = shared_store();
    let options = ProducerOptions::builder()
        .flush_interval(Duration::from_secs(10))
        .build();
    let producer = Producer::start(source, Arc::clone(&store), options)
        .await
        .unwrap();

    sleep(Duration::from_secs(5)).await;
    assert_eq!(stored(&store).await, 0);

    sleep(Duration::from_secs(6)).await;
    assert_eq!(stored(&store).await, 3);
    assert_eq!(producer.status().await.last_sample_at, Some(1_002));

    producer.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stop_flushes_remaining_samples() {
    let source = Arc::new(
        MockSource::new("accelerometer")
            .with_samples(samples(4))
            .with_spacing(Duration::from_millis(300)),
    );
    let store = shared_store();
    let producer = Producer::start(
        Arc::clone(&source) as Arc<dyn uplink_core::SampleSource>,
        Arc::clone(&store),
        ProducerOptions::default(),
    )
    .await
    .unwrap();

    sleep(Duration::from_secs(2)).await;
    assert_eq!(stored(&store).await, 0);

    let status = producer.stop().await.unwrap();
    assert!(source.is_stopped());
    assert_eq!(status.total_collected, 4);
    assert_eq!(status.buffered, 0);

    let rows = store.lock().await.pending::<SensorReading>(10).unwrap();
    assert_eq!(rows.len(), 4);
    let metadata = rows[0].metadata.as_ref().unwrap();
    assert_eq!(metadata["accuracy"], 3);
    assert_eq!(metadata["sampling_rate_hz"], 5);
    assert_eq!(rows[0].owner_id, "participant");
}

#[tokio::test(start_paused = true)]
async fn test_failed_write_lands_on_next_tick() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("telemetry.db");
    let store: SharedStore = Arc::new(Mutex::new(Store::open(&path).unwrap()));

    // A second connection makes every insert fail until the trigger is gone.
    let admin = rusqlite::Connection::open(&path).unwrap();
    admin
        .execute_batch(
            "CREATE TRIGGER reject_readings BEFORE INSERT ON sensor_readings
             BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
        )
        .unwrap();

    let source = Arc::new(
        MockSource::new("accelerometer")
            .with_samples(samples(2))
            .with_spacing(Duration::from_millis(250)),
    );
    let options = ProducerOptions::builder()
        .batch_size(2)
        .flush_interval(Duration::from_secs(1))
        .build();
    let producer = Producer::start(source, Arc::clone(&store), options)
        .await
        .unwrap();

    sleep(Duration::from_secs(1)).await;
    assert_eq!(producer.status().await.buffered, 2);
    assert_eq!(stored(&store).await, 0);

    admin.execute_batch("DROP TRIGGER reject_readings;").unwrap();

    // No new samples arrive; the periodic tick alone retries the write.
    sleep(Duration::from_secs(1)).await;
    assert_eq!(stored(&store).await, 2);
    assert_eq!(producer.status().await.buffered, 0);

    producer.stop().await.unwrap();
}
