//! Core types for queued telemetry records.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// Opaque structured value map carried by readings, events and device states.
pub type ValueMap = serde_json::Map<String, serde_json::Value>;

/// Milliseconds since the Unix epoch.
pub type EpochMillis = i64;

/// Upload lifecycle of a queued row.
///
/// Every record kind (sensor readings, events, device states and upload
/// batches) moves through the same machine:
///
/// ```text
/// Pending ──► Uploading ──► Uploaded
///    ▲            │
///    │            ▼
///    └──────── Failed ──► Uploading (while retry_count < max_retries)
/// ```
///
/// The integer codes are the persisted representation and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum UploadStatus {
    /// Not yet transmitted and not being attempted.
    #[default]
    Pending = 0,
    /// Claimed by the upload worker for an in-flight remote call.
    Uploading = 1,
    /// Accepted by the remote endpoint. Terminal.
    Uploaded = 2,
    /// Last attempt failed; eligible for retry until the retry ceiling.
    Failed = 3,
}

impl UploadStatus {
    /// All statuses in code order.
    pub const ALL: [UploadStatus; 4] = [
        UploadStatus::Pending,
        UploadStatus::Uploading,
        UploadStatus::Uploaded,
        UploadStatus::Failed,
    ];

    /// The persisted integer code.
    #[must_use]
    pub fn code(self) -> i64 {
        self as u8 as i64
    }

    /// Returns `true` for [`UploadStatus::Uploaded`], the only state with no
    /// outgoing transition.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, UploadStatus::Uploaded)
    }

    /// Whether a row in this state may move to `next`.
    ///
    /// Staying in the same state is only allowed for `Uploaded`, so that
    /// re-marking a confirmed row is an idempotent no-op rather than an error.
    ///
    /// # Examples
    ///
    /// ```
    /// use uplink_types::UploadStatus;
    ///
    /// assert!(UploadStatus::Pending.can_transition_to(UploadStatus::Uploading));
    /// assert!(UploadStatus::Uploading.can_transition_to(UploadStatus::Failed));
    /// assert!(!UploadStatus::Uploaded.can_transition_to(UploadStatus::Failed));
    /// assert!(!UploadStatus::Pending.can_transition_to(UploadStatus::Uploaded));
    /// ```
    #[must_use]
    pub fn can_transition_to(self, next: UploadStatus) -> bool {
        use UploadStatus::*;
        matches!(
            (self, next),
            (Pending, Uploading)
                | (Failed, Uploading)
                | (Uploading, Uploaded)
                | (Uploading, Failed)
                | (Uploading, Pending)
                | (Uploaded, Uploaded)
        )
    }

    /// Statuses from which a row may move to `next`.
    #[must_use]
    pub fn sources_of(next: UploadStatus) -> Vec<UploadStatus> {
        Self::ALL
            .into_iter()
            .filter(|s| s.can_transition_to(next))
            .collect()
    }

    /// Lowercase name used in logs and CLI output.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Uploaded => "uploaded",
            UploadStatus::Failed => "failed",
        }
    }
}

impl TryFrom<i64> for UploadStatus {
    type Error = ParseError;

    fn try_from(code: i64) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(UploadStatus::Pending),
            1 => Ok(UploadStatus::Uploading),
            2 => Ok(UploadStatus::Uploaded),
            3 => Ok(UploadStatus::Failed),
            _ => Err(ParseError::InvalidStatus(code)),
        }
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The three item kinds that are uploaded, as tagged on upload batch rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    /// Rows of the `sensor_readings` table.
    SensorReadings,
    /// Rows of the `events` table.
    Events,
    /// Rows of the `device_states` table.
    DeviceStates,
}

impl DataKind {
    /// All item kinds.
    pub const ALL: [DataKind; 3] = [
        DataKind::SensorReadings,
        DataKind::Events,
        DataKind::DeviceStates,
    ];

    /// Persisted tag.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            DataKind::SensorReadings => "sensor_readings",
            DataKind::Events => "events",
            DataKind::DeviceStates => "device_states",
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sensor_readings" => Ok(DataKind::SensorReadings),
            "events" => Ok(DataKind::Events),
            "device_states" => Ok(DataKind::DeviceStates),
            other => Err(ParseError::UnknownDataKind(other.to_string())),
        }
    }
}

/// Network connectivity as recorded in device-state snapshots and as seen by
/// upload constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkKind {
    /// Unmetered connection.
    Wifi,
    /// Metered mobile connection.
    Cellular,
    /// Wired or other unmetered connection.
    Ethernet,
    /// No connectivity.
    #[default]
    None,
}

impl NetworkKind {
    /// Persisted tag.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            NetworkKind::Wifi => "wifi",
            NetworkKind::Cellular => "cellular",
            NetworkKind::Ethernet => "ethernet",
            NetworkKind::None => "none",
        }
    }

    /// Whether any connection is available.
    #[must_use]
    pub fn is_connected(self) -> bool {
        !matches!(self, NetworkKind::None)
    }

    /// Whether the connection is unmetered.
    #[must_use]
    pub fn is_unmetered(self) -> bool {
        matches!(self, NetworkKind::Wifi | NetworkKind::Ethernet)
    }
}

impl fmt::Display for NetworkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NetworkKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wifi" => Ok(NetworkKind::Wifi),
            "cellular" => Ok(NetworkKind::Cellular),
            "ethernet" => Ok(NetworkKind::Ethernet),
            "none" => Ok(NetworkKind::None),
            other => Err(ParseError::UnknownNetworkKind(other.to_string())),
        }
    }
}

/// Conditions under which an upload run may start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraints {
    /// Only run on an unmetered connection.
    pub wifi_only: bool,
    /// Only run while the device is charging.
    pub requires_charging: bool,
}

impl Default for Constraints {
    fn default() -> Self {
        Self {
            wifi_only: true,
            requires_charging: false,
        }
    }
}

impl Constraints {
    /// Constraints that are always satisfied while connected.
    #[must_use]
    pub fn any_network() -> Self {
        Self {
            wifi_only: false,
            requires_charging: false,
        }
    }

    /// Check the constraints against observed conditions.
    ///
    /// # Examples
    ///
    /// ```
    /// use uplink_types::{Constraints, NetworkKind};
    ///
    /// let c = Constraints { wifi_only: true, requires_charging: false };
    /// assert!(c.is_satisfied_by(NetworkKind::Wifi, false));
    /// assert!(!c.is_satisfied_by(NetworkKind::Cellular, true));
    /// assert!(!Constraints::any_network().is_satisfied_by(NetworkKind::None, true));
    /// ```
    #[must_use]
    pub fn is_satisfied_by(&self, network: NetworkKind, charging: bool) -> bool {
        if !network.is_connected() {
            return false;
        }
        if self.wifi_only && !network.is_unmetered() {
            return false;
        }
        !self.requires_charging || charging
    }
}

/// One raw sample pushed by a sensor source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Capture time in epoch milliseconds.
    pub timestamp: EpochMillis,
    /// Measured values, e.g. `{"x": 0.5, "y": 0.2, "z": 9.8}`.
    pub values: ValueMap,
    /// Platform accuracy indicator, if the source reports one.
    pub accuracy: Option<i32>,
}

impl Sample {
    /// Create a sample with no accuracy indicator.
    pub fn new(timestamp: EpochMillis, values: ValueMap) -> Self {
        Self {
            timestamp,
            values,
            accuracy: None,
        }
    }

    /// Attach an accuracy indicator.
    #[must_use]
    pub fn with_accuracy(mut self, accuracy: i32) -> Self {
        self.accuracy = Some(accuracy);
        self
    }
}
