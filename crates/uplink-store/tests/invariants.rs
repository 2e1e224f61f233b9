//! Property tests for the queue invariants.

use proptest::prelude::*;

use uplink_store::{Event, SensorReading, Store};
use uplink_types::{UploadStatus, ValueMap};

fn status_strategy() -> impl Strategy<Value = UploadStatus> {
    prop_oneof![
        Just(UploadStatus::Pending),
        Just(UploadStatus::Uploading),
        Just(UploadStatus::Uploaded),
        Just(UploadStatus::Failed),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// A row at or above the retry ceiling never shows up as retry-eligible.
    #[test]
    fn failed_query_respects_retry_ceiling(
        retries in proptest::collection::vec(0u32..8, 1..40),
        max_retries in 0u32..6,
    ) {
        let store = Store::open_in_memory().unwrap();
        let events: Vec<_> = retries
            .iter()
            .enumerate()
            .map(|(i, r)| {
                let mut e = Event::new("p1", "tap", i as i64);
                e.upload_status = UploadStatus::Failed;
                e.retry_count = *r;
                e
            })
            .collect();
        store.insert_events(&events).unwrap();

        let eligible = store.failed::<Event>(max_retries, 1_000).unwrap();
        let expected = retries.iter().filter(|r| **r < max_retries).count();

        prop_assert_eq!(eligible.len(), expected);
        prop_assert!(eligible.iter().all(|e| e.retry_count < max_retries));
        prop_assert!(eligible.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    /// The retention sweep deletes exactly the uploaded rows older than the
    /// cutoff and reports that count.
    #[test]
    fn retention_deletes_only_old_uploaded(
        rows in proptest::collection::vec((0i64..10_000, status_strategy()), 0..60),
        cutoff in 0i64..10_000,
    ) {
        let store = Store::open_in_memory().unwrap();
        let readings: Vec<_> = rows
            .iter()
            .map(|(ts, status)| {
                let mut r = SensorReading::new("p1", "accelerometer", *ts, ValueMap::new());
                r.upload_status = *status;
                r
            })
            .collect();
        store.insert_sensor_readings(&readings).unwrap();

        let expected = rows
            .iter()
            .filter(|(ts, s)| *s == UploadStatus::Uploaded && *ts < cutoff)
            .count();
        let deleted = store.delete_uploaded_before::<SensorReading>(cutoff).unwrap();
        prop_assert_eq!(deleted, expected);

        let remaining = store.sensor_readings_for_owner("p1").unwrap();
        prop_assert_eq!(remaining.len(), rows.len() - expected);
        prop_assert!(remaining
            .iter()
            .all(|r| r.upload_status != UploadStatus::Uploaded || r.timestamp >= cutoff));
    }

    /// Bulk transitions never move a row out of `Uploaded`.
    #[test]
    fn uploaded_rows_are_final(
        initial in proptest::collection::vec(status_strategy(), 1..30),
        target in status_strategy(),
    ) {
        let store = Store::open_in_memory().unwrap();
        let events: Vec<_> = initial
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let mut e = Event::new("p1", "tap", i as i64);
                e.upload_status = *s;
                e
            })
            .collect();
        let ids = store.insert_events(&events).unwrap();

        store.set_status::<Event>(&ids, target).unwrap();

        for (id, before) in ids.iter().zip(&initial) {
            let after = store.get::<Event>(*id).unwrap().unwrap().upload_status;
            if before.can_transition_to(target) {
                prop_assert_eq!(after, target);
            } else {
                prop_assert_eq!(after, *before);
            }
        }
    }
}
