//! One-shot drain of the pending backlog.
//!
//! An [`UploadWorker`] run claims a page of rows per table, sends each group
//! to the ingestion boundary in one call, and records the outcome on both the
//! rows and an upload-queue batch. Runs of one worker never overlap.
//!
//! A failed group keeps its batch. The batch's `scheduled_at` gates the next
//! attempt, which resends the same rows under the same batch ID (and so the
//! same `Idempotency-Key`).

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use uplink_store::{DeviceState, Event, SensorReading, Store, UploadBatch};
use uplink_types::{DataKind, UploadStatus};

use crate::SharedStore;
use crate::backoff::BackoffPolicy;
use crate::error::{Error, Result};
use crate::traits::{AuthProvider, IngestClient};
use crate::util::{days_to_millis, now_millis};

/// Outcome of one worker run, consumed by the job runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum WorkResult {
    /// At least one row was delivered, or there was nothing to deliver.
    Success {
        /// Rows delivered in this run.
        uploaded: u64,
        /// Rows whose group failed in this run.
        failed: u64,
        /// Human-readable summary.
        message: String,
    },
    /// Every group failed; run again after a backoff.
    Retry,
    /// The run could not proceed (no credential, storage fault).
    Failure {
        /// Why the run stopped.
        reason: String,
    },
}

impl WorkResult {
    /// Whether this is a [`WorkResult::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self, WorkResult::Success { .. })
    }

    fn failure(reason: impl Into<String>) -> Self {
        WorkResult::Failure {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for WorkResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkResult::Success {
                uploaded,
                failed,
                message,
            } => write!(f, "{message} ({uploaded} uploaded, {failed} failed)"),
            WorkResult::Retry => write!(f, "All uploads failed, will retry"),
            WorkResult::Failure { reason } => write!(f, "Upload failed: {reason}"),
        }
    }
}

/// Options for an [`UploadWorker`].
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerOptions {
    /// Owner recorded on upload-queue batches.
    pub owner_id: String,
    /// Rows drained per table per run. Default: 100.
    pub page_size: u32,
    /// Failed rows at or above this retry count are no longer retried. Default: 3.
    pub max_retries: u32,
    /// Uploaded rows older than this many days are swept. Default: 7.
    pub retention_days: u32,
    /// Delay applied to a failed batch's next scheduled time (without jitter).
    pub backoff: BackoffPolicy,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            owner_id: "participant".to_string(),
            page_size: 100,
            max_retries: 3,
            retention_days: 7,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Rows sent in one remote call.
#[derive(Debug)]
enum Group {
    Readings { kind: String, rows: Vec<SensorReading> },
    Events(Vec<Event>),
    States(Vec<DeviceState>),
}

impl Group {
    fn data_kind(&self) -> DataKind {
        match self {
            Group::Readings { .. } => DataKind::SensorReadings,
            Group::Events(_) => DataKind::Events,
            Group::States(_) => DataKind::DeviceStates,
        }
    }

    fn label(&self) -> &str {
        match self {
            Group::Readings { kind, .. } => kind,
            Group::Events(_) => "events",
            Group::States(_) => "device_states",
        }
    }

    fn len(&self) -> usize {
        match self {
            Group::Readings { rows, .. } => rows.len(),
            Group::Events(rows) => rows.len(),
            Group::States(rows) => rows.len(),
        }
    }

    fn ids(&self) -> Vec<i64> {
        match self {
            Group::Readings { rows, .. } => rows.iter().map(|r| r.id).collect(),
            Group::Events(rows) => rows.iter().map(|r| r.id).collect(),
            Group::States(rows) => rows.iter().map(|r| r.id).collect(),
        }
    }

    /// Highest retry count among the rows, used as the backoff attempt.
    fn attempt(&self) -> u32 {
        let max = match self {
            Group::Readings { rows, .. } => rows.iter().map(|r| r.retry_count).max(),
            Group::Events(rows) => rows.iter().map(|r| r.retry_count).max(),
            Group::States(rows) => rows.iter().map(|r| r.retry_count).max(),
        };
        max.unwrap_or(0)
    }

    fn set_status(&self, store: &Store, status: UploadStatus) -> uplink_store::Result<usize> {
        let ids = self.ids();
        match self {
            Group::Readings { .. } => store.set_status::<SensorReading>(&ids, status),
            Group::Events(_) => store.set_status::<Event>(&ids, status),
            Group::States(_) => store.set_status::<DeviceState>(&ids, status),
        }
    }

    fn claim(&self, store: &Store, batch_id: &str) -> uplink_store::Result<usize> {
        let ids = self.ids();
        match self {
            Group::Readings { .. } => store.claim_for_batch::<SensorReading>(&ids, batch_id),
            Group::Events(_) => store.claim_for_batch::<Event>(&ids, batch_id),
            Group::States(_) => store.claim_for_batch::<DeviceState>(&ids, batch_id),
        }
    }

    fn set_failed(&self, store: &Store, error: &str) -> uplink_store::Result<usize> {
        let ids = self.ids();
        let status = UploadStatus::Failed;
        match self {
            Group::Readings { .. } => store.set_status_with_error::<SensorReading>(&ids, status, error),
            Group::Events(_) => store.set_status_with_error::<Event>(&ids, status, error),
            Group::States(_) => store.set_status_with_error::<DeviceState>(&ids, status, error),
        }
    }

    fn sweep(&self, store: &Store, cutoff: i64) -> uplink_store::Result<usize> {
        match self {
            Group::Readings { .. } => store.delete_uploaded_before::<SensorReading>(cutoff),
            Group::Events(_) => store.delete_uploaded_before::<Event>(cutoff),
            Group::States(_) => store.delete_uploaded_before::<DeviceState>(cutoff),
        }
    }
}

/// Rebuild the group of a failed batch from its rows still below the retry
/// ceiling. `None` when no such row is left.
fn retry_group(store: &Store, batch: &UploadBatch, max_retries: u32) -> uplink_store::Result<Option<Group>> {
    let batch_id = batch.batch_id.as_str();
    let group = match batch.data_kind {
        DataKind::SensorReadings => {
            let rows = store.batch_items::<SensorReading>(batch_id, max_retries)?;
            rows.first()
                .map(|r| r.sensor_kind.clone())
                .map(|kind| Group::Readings { kind, rows })
        }
        DataKind::Events => {
            let rows = store.batch_items::<Event>(batch_id, max_retries)?;
            (!rows.is_empty()).then_some(Group::Events(rows))
        }
        DataKind::DeviceStates => {
            let rows = store.batch_items::<DeviceState>(batch_id, max_retries)?;
            (!rows.is_empty()).then_some(Group::States(rows))
        }
    };
    Ok(group)
}

/// A group and the upload-queue batch it is sent under.
#[derive(Debug)]
struct Dispatch {
    group: Group,
    /// The failed batch being retried; `None` on a first attempt.
    retry: Option<UploadBatch>,
}

enum GroupOutcome {
    Uploaded(u64),
    Failed(u64),
    Unauthenticated,
}

/// Drains the local backlog to the ingestion boundary.
pub struct UploadWorker {
    store: SharedStore,
    auth: Arc<dyn AuthProvider>,
    client: Arc<dyn IngestClient>,
    options: WorkerOptions,
    run_lock: Mutex<()>,
}

impl fmt::Debug for UploadWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadWorker")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl UploadWorker {
    /// Create a worker.
    pub fn new(
        store: SharedStore,
        auth: Arc<dyn AuthProvider>,
        client: Arc<dyn IngestClient>,
        options: WorkerOptions,
    ) -> Self {
        Self {
            store,
            auth,
            client,
            options,
            run_lock: Mutex::new(()),
        }
    }

    /// The worker's options.
    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    /// Release claims a stopped process left `Uploading`.
    ///
    /// Runs do not do this. Call it once at service startup, while no other
    /// process uploads from the same database.
    pub async fn release_abandoned(&self) -> Result<usize> {
        let released = self.store.lock().await.reset_all_uploading()?;
        Ok(released)
    }

    /// Perform one run. Concurrent calls wait for the previous run to end.
    pub async fn run(&self) -> WorkResult {
        let _guard = self.run_lock.lock().await;
        match self.drain().await {
            Ok(result) => {
                info!("Upload run finished: {}", result);
                result
            }
            Err(e) => {
                error!("Upload run aborted: {}", e);
                WorkResult::failure(e.to_string())
            }
        }
    }

    async fn drain(&self) -> Result<WorkResult> {
        if !self.auth.is_logged_in().await {
            warn!("Not logged in, skipping upload");
            return Ok(WorkResult::failure(Error::Unauthenticated.to_string()));
        }
        let Some(authorization) = self.auth.authorization_header().await else {
            warn!("No usable credential, skipping upload");
            return Ok(WorkResult::failure(Error::Unauthenticated.to_string()));
        };

        let dispatches = self.collect().await?;
        if dispatches.is_empty() {
            debug!("Backlog empty");
            return Ok(WorkResult::Success {
                uploaded: 0,
                failed: 0,
                message: "No data to upload".to_string(),
            });
        }

        let mut uploaded = 0u64;
        let mut failed = 0u64;
        let mut failed_groups = 0usize;
        let total_groups = dispatches.len();

        for dispatch in &dispatches {
            match self.upload_group(&authorization, dispatch).await? {
                GroupOutcome::Uploaded(n) => uploaded += n,
                GroupOutcome::Failed(n) => {
                    failed += n;
                    failed_groups += 1;
                }
                GroupOutcome::Unauthenticated if uploaded > 0 => {
                    self.store
                        .lock()
                        .await
                        .set_last_successful_upload(now_millis())?;
                    return Ok(WorkResult::failure(format!(
                        "{} ({uploaded} rows uploaded before rejection)",
                        Error::Unauthenticated
                    )));
                }
                GroupOutcome::Unauthenticated => {
                    return Ok(WorkResult::failure(Error::Unauthenticated.to_string()));
                }
            }
        }

        if failed_groups == total_groups && uploaded == 0 {
            return Ok(WorkResult::Retry);
        }

        self.store
            .lock()
            .await
            .set_last_successful_upload(now_millis())?;

        let message = if failed_groups == 0 {
            "Upload successful"
        } else {
            "Partial upload success"
        };
        Ok(WorkResult::Success {
            uploaded,
            failed,
            message: message.to_string(),
        })
    }

    /// Due retries first, then fresh groups from the pending rows.
    async fn collect(&self) -> Result<Vec<Dispatch>> {
        let store = self.store.lock().await;

        let WorkerOptions {
            page_size,
            max_retries,
            ..
        } = self.options;

        let mut dispatches = Vec::new();
        for batch in store.failed_batches(now_millis(), max_retries, page_size)? {
            match retry_group(&store, &batch, max_retries)? {
                Some(group) => dispatches.push(Dispatch {
                    group,
                    retry: Some(batch),
                }),
                None => {
                    debug!(batch_id = %batch.batch_id, "No rows left to retry, dropping batch");
                    store.delete_batch(&batch.batch_id)?;
                }
            }
        }
        let retries = dispatches.len();

        let mut by_kind: BTreeMap<String, Vec<SensorReading>> = BTreeMap::new();
        for reading in store.pending::<SensorReading>(page_size)? {
            by_kind.entry(reading.sensor_kind.clone()).or_default().push(reading);
        }
        let mut groups: Vec<Group> = by_kind
            .into_iter()
            .map(|(kind, rows)| Group::Readings { kind, rows })
            .collect();
        let events = store.pending::<Event>(page_size)?;
        if !events.is_empty() {
            groups.push(Group::Events(events));
        }
        let states = store.pending::<DeviceState>(page_size)?;
        if !states.is_empty() {
            groups.push(Group::States(states));
        }
        dispatches.extend(groups.into_iter().map(|group| Dispatch { group, retry: None }));

        debug!(
            groups = dispatches.len(),
            retries,
            rows = dispatches.iter().map(|d| d.group.len()).sum::<usize>(),
            "Collected upload groups"
        );
        Ok(dispatches)
    }

    async fn upload_group(&self, authorization: &str, dispatch: &Dispatch) -> Result<GroupOutcome> {
        let Dispatch { group, retry } = dispatch;
        let count = group.len() as u64;

        let (batch_row, batch_id) = {
            let store = self.store.lock().await;
            let (row, batch_id) = match retry {
                Some(batch) => {
                    store.set_status::<UploadBatch>(&[batch.id], UploadStatus::Uploading)?;
                    (batch.id, batch.batch_id.clone())
                }
                None => {
                    let batch_id = Uuid::new_v4().to_string();
                    let mut batch = UploadBatch::new(
                        &self.options.owner_id,
                        group.data_kind(),
                        &batch_id,
                        u32::try_from(count).unwrap_or(u32::MAX),
                        now_millis(),
                        0,
                    );
                    batch.upload_status = UploadStatus::Uploading;
                    (store.insert_batch(&batch)?, batch_id)
                }
            };
            group.claim(&store, &batch_id)?;
            (row, batch_id)
        };

        debug!(
            group = group.label(),
            batch_id = %batch_id,
            count,
            retry = retry.is_some(),
            "Uploading group"
        );

        let result = match group {
            Group::Readings { kind, rows } => {
                self.client
                    .submit_sensor_readings(authorization, &batch_id, kind, rows)
                    .await
            }
            Group::Events(rows) => self.client.submit_events(authorization, &batch_id, rows).await,
            Group::States(rows) => {
                self.client
                    .submit_device_states(authorization, &batch_id, rows)
                    .await
            }
        };

        let store = self.store.lock().await;
        match result {
            Ok(receipt) => {
                group.set_status(&store, UploadStatus::Uploaded)?;
                store.set_status::<UploadBatch>(&[batch_row], UploadStatus::Uploaded)?;
                let cutoff = now_millis() - days_to_millis(self.options.retention_days);
                let swept = group.sweep(&store, cutoff)?
                    + store.delete_uploaded_before::<UploadBatch>(cutoff)?;
                info!(
                    group = group.label(),
                    batch_id = %batch_id,
                    count,
                    swept,
                    "Uploaded: {}",
                    receipt.message
                );
                Ok(GroupOutcome::Uploaded(count))
            }
            Err(Error::Unauthenticated) => {
                warn!(group = group.label(), "Credential rejected, releasing claimed rows");
                if retry.is_some() {
                    // Back to the failed batch, retry budget untouched
                    group.set_status(&store, UploadStatus::Failed)?;
                    store.set_status::<UploadBatch>(&[batch_row], UploadStatus::Failed)?;
                } else {
                    group.set_status(&store, UploadStatus::Pending)?;
                    store.delete_batch(&batch_id)?;
                }
                Ok(GroupOutcome::Unauthenticated)
            }
            Err(e) => {
                let message = e.to_string();
                warn!(group = group.label(), batch_id = %batch_id, count, "Upload failed: {}", message);
                group.set_failed(&store, &message)?;
                let delay = self.options.backoff.jitter(false).delay_millis(group.attempt());
                store.fail_batch(&batch_id, &message, now_millis() + delay)?;
                Ok(GroupOutcome::Failed(count))
            }
        }
    }
}
