//! Data models for queued rows.

use serde::{Deserialize, Serialize};

use uplink_types::{DataKind, EpochMillis, NetworkKind, UploadStatus, ValueMap};

/// A sensor reading awaiting (or past) upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    /// Database row ID (0 until inserted).
    pub id: i64,
    /// Participant/owner identifier.
    pub owner_id: String,
    /// Sensor kind tag, e.g. `accelerometer`.
    pub sensor_kind: String,
    /// Capture time in epoch milliseconds.
    pub timestamp: EpochMillis,
    /// Measured values.
    pub payload: ValueMap,
    /// Optional capture metadata (accuracy, sampling rate, ...).
    pub metadata: Option<ValueMap>,
    /// Upload status.
    pub upload_status: UploadStatus,
    /// Number of failed upload attempts.
    pub retry_count: u32,
    /// Error text from the last failed attempt.
    pub error_message: Option<String>,
}

impl SensorReading {
    /// Create a new pending reading.
    pub fn new(owner_id: &str, sensor_kind: &str, timestamp: EpochMillis, payload: ValueMap) -> Self {
        Self {
            id: 0,
            owner_id: owner_id.to_string(),
            sensor_kind: sensor_kind.to_string(),
            timestamp,
            payload,
            metadata: None,
            upload_status: UploadStatus::Pending,
            retry_count: 0,
            error_message: None,
        }
    }

    /// Attach capture metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: ValueMap) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// A discrete user or app event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Database row ID (0 until inserted).
    pub id: i64,
    /// Participant/owner identifier.
    pub owner_id: String,
    /// Event kind tag, e.g. `app_opened`.
    pub event_kind: String,
    /// Event time in epoch milliseconds.
    pub timestamp: EpochMillis,
    /// Optional structured properties.
    pub properties: Option<ValueMap>,
    /// Upload status.
    pub upload_status: UploadStatus,
    /// Number of failed upload attempts.
    pub retry_count: u32,
    /// Error text from the last failed attempt.
    pub error_message: Option<String>,
}

impl Event {
    /// Create a new pending event.
    pub fn new(owner_id: &str, event_kind: &str, timestamp: EpochMillis) -> Self {
        Self {
            id: 0,
            owner_id: owner_id.to_string(),
            event_kind: event_kind.to_string(),
            timestamp,
            properties: None,
            upload_status: UploadStatus::Pending,
            retry_count: 0,
            error_message: None,
        }
    }

    /// Attach structured properties.
    #[must_use]
    pub fn with_properties(mut self, properties: ValueMap) -> Self {
        self.properties = Some(properties);
        self
    }
}

/// A periodic snapshot of device conditions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    /// Database row ID (0 until inserted).
    pub id: i64,
    /// Participant/owner identifier.
    pub owner_id: String,
    /// Snapshot time in epoch milliseconds.
    pub timestamp: EpochMillis,
    /// Battery level (0-100).
    pub battery_level: u8,
    /// Whether the device was charging.
    pub is_charging: bool,
    /// Network connectivity at snapshot time.
    pub network_kind: NetworkKind,
    /// Available storage in bytes.
    pub available_storage: u64,
    /// Whether the screen was on.
    pub is_screen_on: bool,
    /// Device orientation (portrait, landscape).
    pub orientation: Option<String>,
    /// Additional state information.
    pub extra_info: Option<ValueMap>,
    /// Upload status.
    pub upload_status: UploadStatus,
    /// Number of failed upload attempts.
    pub retry_count: u32,
    /// Error text from the last failed attempt.
    pub error_message: Option<String>,
}

impl DeviceState {
    /// Create a new pending snapshot. The battery level is clamped to 100.
    pub fn new(
        owner_id: &str,
        timestamp: EpochMillis,
        battery_level: u8,
        is_charging: bool,
        network_kind: NetworkKind,
    ) -> Self {
        Self {
            id: 0,
            owner_id: owner_id.to_string(),
            timestamp,
            battery_level: battery_level.min(100),
            is_charging,
            network_kind,
            available_storage: 0,
            is_screen_on: false,
            orientation: None,
            extra_info: None,
            upload_status: UploadStatus::Pending,
            retry_count: 0,
            error_message: None,
        }
    }
}

/// A row of the upload queue: a named grouping of item rows of one kind.
///
/// The batch does not own its items; they carry their own status. The batch
/// tracks coordinated retry (scheduled time, retry count, priority).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadBatch {
    /// Database row ID (0 until inserted).
    pub id: i64,
    /// Participant/owner identifier.
    pub owner_id: String,
    /// Kind of the grouped items.
    pub data_kind: DataKind,
    /// Globally unique client-generated batch identifier.
    pub batch_id: String,
    /// Number of items grouped under this batch.
    pub item_count: u32,
    /// Creation time in epoch milliseconds.
    pub created_at: EpochMillis,
    /// Earliest time the batch is eligible for an attempt.
    pub scheduled_at: EpochMillis,
    /// Upload status.
    pub upload_status: UploadStatus,
    /// Number of failed upload attempts.
    pub retry_count: u32,
    /// Error text from the last failed attempt.
    pub error_message: Option<String>,
    /// Drain priority; higher drains first.
    pub priority: i32,
}

impl UploadBatch {
    /// Create a pending batch created at `now` and eligible after `delay_ms`.
    pub fn new(
        owner_id: &str,
        data_kind: DataKind,
        batch_id: &str,
        item_count: u32,
        now: EpochMillis,
        delay_ms: i64,
    ) -> Self {
        Self {
            id: 0,
            owner_id: owner_id.to_string(),
            data_kind,
            batch_id: batch_id.to_string(),
            item_count,
            created_at: now,
            scheduled_at: now.saturating_add(delay_ms.max(0)),
            upload_status: UploadStatus::Pending,
            retry_count: 0,
            error_message: None,
            priority: 0,
        }
    }

    /// Set the drain priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Number of pending rows per table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCounts {
    pub sensor_readings: u64,
    pub events: u64,
    pub device_states: u64,
    pub upload_batches: u64,
}

impl PendingCounts {
    /// Pending item rows, excluding batch rows.
    pub fn items(&self) -> u64 {
        self.sensor_readings + self.events + self.device_states
    }
}

/// Rows removed by a retention sweep, per table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeCounts {
    pub sensor_readings: usize,
    pub events: usize,
    pub device_states: usize,
    pub upload_batches: usize,
}

impl PurgeCounts {
    /// Total rows removed.
    pub fn total(&self) -> usize {
        self.sensor_readings + self.events + self.device_states + self.upload_batches
    }
}
