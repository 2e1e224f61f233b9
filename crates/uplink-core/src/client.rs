//! HTTP client for the remote ingestion API.
//!
//! [`ApiClient`] implements [`IngestClient`] over `reqwest`. Every request is
//! a JSON `POST` carrying `Authorization` and `Idempotency-Key` headers.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use uplink_core::{ApiClient, IngestClient};
//!
//! # async fn example() -> uplink_core::Result<()> {
//! let client = ApiClient::new("https://api.example.org/v1", "default-study", Duration::from_secs(30))?;
//! let receipt = client
//!     .submit_events("Bearer <token>", "4f1c5c9e-batch", &[])
//!     .await?;
//! println!("{}", receipt.message);
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use tracing::debug;

use uplink_store::{DeviceState, Event, SensorReading};
use uplink_types::{EpochMillis, ValueMap};

use crate::error::{Error, Result};
use crate::traits::{IngestClient, IngestReceipt};

/// Header carrying the batch ID so the remote can drop duplicates.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

// ==========================================================================
// Request Types
// ==========================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SensorDataRequest<'a> {
    sensor_type: &'a str,
    study_code: &'a str,
    readings: Vec<SensorDataPoint<'a>>,
}

#[derive(Debug, Serialize)]
struct SensorDataPoint<'a> {
    timestamp: EpochMillis,
    data: &'a ValueMap,
    accuracy: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EventRequest<'a> {
    study_code: &'a str,
    events: Vec<EventItem<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EventItem<'a> {
    event_type: &'a str,
    timestamp: EpochMillis,
    metadata: Option<&'a ValueMap>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeviceStateRequest<'a> {
    study_code: &'a str,
    states: Vec<DeviceStateItem>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeviceStateItem {
    timestamp: EpochMillis,
    battery_level: u8,
    is_charging: bool,
    network_type: &'static str,
    storage_available: u64,
    is_screen_on: bool,
    device_info: ValueMap,
}

impl From<&DeviceState> for DeviceStateItem {
    fn from(state: &DeviceState) -> Self {
        let mut device_info = state.extra_info.clone().unwrap_or_default();
        if let Some(orientation) = &state.orientation {
            device_info.insert(
                "orientation".to_string(),
                serde_json::Value::String(orientation.clone()),
            );
        }
        Self {
            timestamp: state.timestamp,
            battery_level: state.battery_level,
            is_charging: state.is_charging,
            network_type: state.network_kind.as_str(),
            storage_available: state.available_storage,
            is_screen_on: state.is_screen_on,
            device_info,
        }
    }
}

// ==========================================================================
// ApiClient Implementation
// ==========================================================================

/// `reqwest`-backed ingestion client.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    study_code: String,
    timeout: Duration,
}

fn normalize_base_url(base_url: &str) -> Result<String> {
    let base_url = base_url.trim_end_matches('/').to_string();
    if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
        return Err(Error::invalid_config(format!(
            "URL must start with http:// or https://, got: {}",
            base_url
        )));
    }
    Ok(base_url)
}

impl ApiClient {
    /// Create a client with a per-request timeout.
    pub fn new(base_url: &str, study_code: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::invalid_config(format!("HTTP client: {e}")))?;
        Self::with_client(base_url, study_code, timeout, client)
    }

    /// Create a client with a custom reqwest Client.
    pub fn with_client(
        base_url: &str,
        study_code: &str,
        timeout: Duration,
        client: Client,
    ) -> Result<Self> {
        Ok(Self {
            client,
            base_url: normalize_base_url(base_url)?,
            study_code: study_code.to_string(),
            timeout,
        })
    }

    /// Get the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Get the study code sent with every request.
    pub fn study_code(&self) -> &str {
        &self.study_code
    }

    async fn post<B: Serialize>(
        &self,
        path: &str,
        authorization: &str,
        batch_id: &str,
        body: &B,
    ) -> Result<IngestReceipt> {
        let url = format!("{}/{}", self.base_url, path);
        let payload = serde_json::to_vec(body)?;

        debug!(%url, batch_id, bytes = payload.len(), "POST");

        let response = self
            .client
            .post(&url)
            .header(AUTHORIZATION, authorization)
            .header(IDEMPOTENCY_HEADER, batch_id)
            .header(CONTENT_TYPE, "application/json")
            .body(payload)
            .send()
            .await
            .map_err(|e| self.transport_error(&url, e))?;

        self.handle_response(&url, response).await
    }

    fn transport_error(&self, url: &str, err: reqwest::Error) -> Error {
        if err.is_timeout() {
            Error::timeout(format!("POST {url}"), self.timeout)
        } else {
            Error::network(url, err.to_string())
        }
    }

    async fn handle_response(&self, url: &str, response: reqwest::Response) -> Result<IngestReceipt> {
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| self.transport_error(url, e))?;

        if status == StatusCode::UNAUTHORIZED {
            return Err(Error::Unauthenticated);
        }

        if status.is_success() {
            if body.iter().all(u8::is_ascii_whitespace) {
                return Ok(IngestReceipt::default());
            }
            return Ok(serde_json::from_slice(&body)?);
        }

        let message = serde_json::from_slice::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| {
                v.get("error")
                    .or_else(|| v.get("message"))
                    .and_then(|e| e.as_str())
                    .map(String::from)
            })
            .unwrap_or_else(|| status.to_string());

        Err(Error::Api {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl IngestClient for ApiClient {
    async fn submit_sensor_readings(
        &self,
        authorization: &str,
        batch_id: &str,
        sensor_kind: &str,
        readings: &[SensorReading],
    ) -> Result<IngestReceipt> {
        let body = SensorDataRequest {
            sensor_type: sensor_kind,
            study_code: &self.study_code,
            readings: readings
                .iter()
                .map(|r| SensorDataPoint {
                    timestamp: r.timestamp,
                    data: &r.payload,
                    accuracy: r
                        .metadata
                        .as_ref()
                        .and_then(|m| m.get("accuracy"))
                        .and_then(|a| a.as_i64()),
                })
                .collect(),
        };
        self.post("data/sensor", authorization, batch_id, &body).await
    }

    async fn submit_events(
        &self,
        authorization: &str,
        batch_id: &str,
        events: &[Event],
    ) -> Result<IngestReceipt> {
        let body = EventRequest {
            study_code: &self.study_code,
            events: events
                .iter()
                .map(|e| EventItem {
                    event_type: &e.event_kind,
                    timestamp: e.timestamp,
                    metadata: e.properties.as_ref(),
                })
                .collect(),
        };
        self.post("data/event", authorization, batch_id, &body).await
    }

    async fn submit_device_states(
        &self,
        authorization: &str,
        batch_id: &str,
        states: &[DeviceState],
    ) -> Result<IngestReceipt> {
        let body = DeviceStateRequest {
            study_code: &self.study_code,
            states: states.iter().map(DeviceStateItem::from).collect(),
        };
        self.post("data/device-state", authorization, batch_id, &body)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uplink_types::NetworkKind;

    #[test]
    fn test_client_creation() {
        let client = ApiClient::new("http://localhost:8080", "s1", Duration::from_secs(5)).unwrap();
        assert_eq!(client.base_url(), "http://localhost:8080");
        assert_eq!(client.study_code(), "s1");
    }

    #[test]
    fn test_client_normalizes_url() {
        let client = ApiClient::new("https://api.test/v1/", "s1", Duration::from_secs(5)).unwrap();
        assert_eq!(client.base_url(), "https://api.test/v1");
    }

    #[test]
    fn test_client_invalid_url() {
        let result = ApiClient::new("api.test", "s1", Duration::from_secs(5));
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_sensor_body_shape() {
        let payload = json!({"x": 1.5}).as_object().cloned().unwrap();
        let metadata = json!({"accuracy": 2, "sampling_rate_hz": 5})
            .as_object()
            .cloned()
            .unwrap();
        let reading = SensorReading::new("p1", "accelerometer", 1_000, payload).with_metadata(metadata);
        let body = SensorDataRequest {
            sensor_type: "accelerometer",
            study_code: "s1",
            readings: vec![SensorDataPoint {
                timestamp: reading.timestamp,
                data: &reading.payload,
                accuracy: Some(2),
            }],
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(
            value,
            json!({
                "sensorType": "accelerometer",
                "studyCode": "s1",
                "readings": [{"timestamp": 1000, "data": {"x": 1.5}, "accuracy": 2}]
            })
        );
    }

    #[test]
    fn test_device_state_item_merges_orientation() {
        let mut state = DeviceState::new("p1", 5, 42, true, NetworkKind::Cellular);
        state.orientation = Some("landscape".into());
        state.extra_info = json!({"model": "Pixel"}).as_object().cloned();

        let value = serde_json::to_value(DeviceStateItem::from(&state)).unwrap();
        assert_eq!(value["networkType"], "cellular");
        assert_eq!(value["batteryLevel"], 42);
        assert_eq!(value["deviceInfo"]["orientation"], "landscape");
        assert_eq!(value["deviceInfo"]["model"], "Pixel");
    }
}
