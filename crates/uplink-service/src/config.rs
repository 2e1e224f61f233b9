//! Service configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use uplink_core::{BackoffPolicy, ProducerOptions, WorkerOptions};

/// Service configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Local queue settings.
    pub storage: StorageConfig,
    /// Ingestion API settings.
    pub api: ApiConfig,
    /// Upload worker settings.
    pub upload: UploadConfig,
    /// Producer settings for `run --simulate`.
    pub producer: ProducerConfig,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Save configuration to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration and return every problem found.
    ///
    /// # Example
    ///
    /// ```
    /// use uplink_service::Config;
    ///
    /// let config = Config::default();
    /// assert!(config.validate().is_ok());
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        errors.extend(self.storage.validate());
        errors.extend(self.api.validate());
        errors.extend(self.upload.validate());
        errors.extend(self.producer.validate());

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Options for the upload worker.
    pub fn worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            owner_id: self.upload.owner_id.clone(),
            page_size: self.upload.page_size,
            max_retries: self.upload.max_retries,
            retention_days: self.storage.retention_days,
            backoff: self.upload.backoff(),
        }
    }

    /// Options for the producer adapter.
    pub fn producer_options(&self) -> ProducerOptions {
        ProducerOptions::builder()
            .owner_id(self.upload.owner_id.clone())
            .sampling_rate_hz(self.producer.sampling_rate_hz)
            .batch_size(self.producer.batch_size)
            .flush_interval(Duration::from_secs(self.producer.flush_interval_secs))
            .channel_capacity(self.producer.channel_capacity)
            .max_retained(self.producer.max_retained)
            .build()
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file path.
    pub path: PathBuf,
    /// Uploaded rows older than this many days are purged.
    pub retention_days: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: uplink_store::default_db_path(),
            retention_days: 7,
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.path.as_os_str().is_empty() {
            errors.push(ValidationError::new(
                "storage.path",
                "database path cannot be empty",
            ));
        }
        if self.retention_days == 0 {
            errors.push(ValidationError::new(
                "storage.retention_days",
                "retention must be at least 1 day",
            ));
        }

        errors
    }
}

/// Ingestion API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL of the ingestion API, including any version prefix.
    pub base_url: String,
    /// Study code sent with sensor uploads.
    pub study_code: String,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// File holding the persisted bearer tokens.
    pub token_file: PathBuf,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080/v1".to_string(),
            study_code: "default-study".to_string(),
            timeout_secs: 30,
            token_file: default_token_path(),
        }
    }
}

impl ApiConfig {
    /// Request timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Validate API configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.base_url.is_empty() {
            errors.push(ValidationError::new(
                "api.base_url",
                "base URL cannot be empty",
            ));
        } else if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://")
        {
            errors.push(ValidationError::new(
                "api.base_url",
                format!(
                    "invalid base URL '{}': must start with http:// or https://",
                    self.base_url
                ),
            ));
        }
        if self.study_code.trim().is_empty() {
            errors.push(ValidationError::new(
                "api.study_code",
                "study code cannot be empty",
            ));
        }
        if self.timeout_secs == 0 {
            errors.push(ValidationError::new(
                "api.timeout_secs",
                "timeout must be at least 1 second",
            ));
        }
        if self.token_file.as_os_str().is_empty() {
            errors.push(ValidationError::new(
                "api.token_file",
                "token file path cannot be empty",
            ));
        }

        errors
    }
}

/// Upload worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Owner recorded on collected rows and upload batches.
    pub owner_id: String,
    /// Rows drained per table per run.
    pub page_size: u32,
    /// Failed rows at this retry count are no longer sent.
    pub max_retries: u32,
    /// First delay after a failed run, in seconds.
    pub initial_backoff_secs: u64,
    /// Upper bound on the delay between failed runs, in seconds.
    pub max_backoff_secs: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        let backoff = BackoffPolicy::default();
        Self {
            owner_id: "participant".to_string(),
            page_size: 100,
            max_retries: 3,
            initial_backoff_secs: backoff.initial_delay.as_secs(),
            max_backoff_secs: backoff.max_delay.as_secs(),
        }
    }
}

/// Maximum rows per table in one upload run.
pub const MAX_PAGE_SIZE: u32 = 10_000;

impl UploadConfig {
    /// Backoff policy between failed runs.
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::default()
            .initial_delay(Duration::from_secs(self.initial_backoff_secs))
            .max_delay(Duration::from_secs(self.max_backoff_secs))
    }

    /// Validate upload configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.owner_id.trim().is_empty() {
            errors.push(ValidationError::new(
                "upload.owner_id",
                "owner id cannot be empty",
            ));
        }
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            errors.push(ValidationError::new(
                "upload.page_size",
                format!(
                    "page size {} is out of range (1-{})",
                    self.page_size, MAX_PAGE_SIZE
                ),
            ));
        }
        if self.initial_backoff_secs == 0 {
            errors.push(ValidationError::new(
                "upload.initial_backoff_secs",
                "initial backoff must be at least 1 second",
            ));
        }
        if self.max_backoff_secs < self.initial_backoff_secs {
            errors.push(ValidationError::new(
                "upload.max_backoff_secs",
                format!(
                    "max backoff {}s is shorter than initial backoff {}s",
                    self.max_backoff_secs, self.initial_backoff_secs
                ),
            ));
        }

        errors
    }
}

/// Producer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// Sensor kind recorded on produced readings.
    pub sensor_kind: String,
    /// Target sampling rate in Hz.
    pub sampling_rate_hz: u32,
    /// Flush after this many samples.
    pub batch_size: usize,
    /// Flush at least this often, in seconds.
    pub flush_interval_secs: u64,
    /// Capacity of the sample channel.
    pub channel_capacity: usize,
    /// Readings kept in memory after failed writes.
    pub max_retained: usize,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        let options = ProducerOptions::default();
        Self {
            sensor_kind: "accelerometer".to_string(),
            sampling_rate_hz: options.sampling_rate_hz,
            batch_size: options.batch_size,
            flush_interval_secs: options.flush_interval.as_secs(),
            channel_capacity: options.channel_capacity,
            max_retained: options.max_retained,
        }
    }
}

/// Maximum producer sampling rate in Hz.
pub const MAX_SAMPLING_RATE_HZ: u32 = 200;

impl ProducerConfig {
    /// Validate producer configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.sensor_kind.trim().is_empty() {
            errors.push(ValidationError::new(
                "producer.sensor_kind",
                "sensor kind cannot be empty",
            ));
        }
        if self.sampling_rate_hz == 0 || self.sampling_rate_hz > MAX_SAMPLING_RATE_HZ {
            errors.push(ValidationError::new(
                "producer.sampling_rate_hz",
                format!(
                    "sampling rate {} Hz is out of range (1-{})",
                    self.sampling_rate_hz, MAX_SAMPLING_RATE_HZ
                ),
            ));
        }
        if self.batch_size == 0 {
            errors.push(ValidationError::new(
                "producer.batch_size",
                "batch size must be at least 1",
            ));
        }
        if self.flush_interval_secs == 0 {
            errors.push(ValidationError::new(
                "producer.flush_interval_secs",
                "flush interval must be at least 1 second",
            ));
        }
        if self.channel_capacity == 0 {
            errors.push(ValidationError::new(
                "producer.channel_capacity",
                "channel capacity must be at least 1",
            ));
        }
        if self.max_retained < self.batch_size {
            errors.push(ValidationError::new(
                "producer.max_retained",
                format!(
                    "max retained {} is smaller than batch size {}",
                    self.max_retained, self.batch_size
                ),
            ));
        }

        errors
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// The field path (e.g., `api.base_url`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl ValidationError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("uplink")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    config_dir().join("uplink.toml")
}

/// Default bearer token file path.
pub fn default_token_path() -> PathBuf {
    config_dir().join("tokens.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.storage.path, uplink_store::default_db_path());
        assert_eq!(config.storage.retention_days, 7);
        assert_eq!(config.api.study_code, "default-study");
        assert_eq!(config.upload.page_size, 100);
        assert_eq!(config.producer.sensor_kind, "accelerometer");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backoff_from_upload_config() {
        let upload = UploadConfig {
            initial_backoff_secs: 10,
            max_backoff_secs: 60,
            ..Default::default()
        };
        let backoff = upload.backoff().jitter(false);
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_secs(10));
        assert_eq!(backoff.delay_for_attempt(5), Duration::from_secs(60));
    }

    #[test]
    fn test_worker_options_mapping() {
        let mut config = Config::default();
        config.upload.owner_id = "p-17".to_string();
        config.upload.page_size = 250;
        config.storage.retention_days = 3;

        let options = config.worker_options();
        assert_eq!(options.owner_id, "p-17");
        assert_eq!(options.page_size, 250);
        assert_eq!(options.retention_days, 3);
        assert_eq!(options.max_retries, 3);
    }

    #[test]
    fn test_producer_options_mapping() {
        let mut config = Config::default();
        config.producer.sampling_rate_hz = 20;
        config.producer.flush_interval_secs = 2;

        let options = config.producer_options();
        assert_eq!(options.owner_id, "participant");
        assert_eq!(options.sampling_rate_hz, 20);
        assert_eq!(options.flush_interval, Duration::from_secs(2));
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_api_base_url_scheme() {
        let api = ApiConfig {
            base_url: "ftp://example.org".to_string(),
            ..Default::default()
        };
        let errors = api.validate();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "api.base_url");
    }

    #[test]
    fn test_upload_backoff_order() {
        let upload = UploadConfig {
            initial_backoff_secs: 600,
            max_backoff_secs: 60,
            ..Default::default()
        };
        let errors = upload.validate();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "upload.max_backoff_secs");
    }

    #[test]
    fn test_producer_rate_bounds() {
        let producer = ProducerConfig {
            sampling_rate_hz: 0,
            ..Default::default()
        };
        assert!(
            producer
                .validate()
                .iter()
                .any(|e| e.field == "producer.sampling_rate_hz")
        );
    }

    #[test]
    fn test_validation_error_display() {
        let err = ConfigError::Validation(vec![
            ValidationError::new("api.base_url", "base URL cannot be empty"),
            ValidationError::new("upload.page_size", "page size 0 is out of range (1-10000)"),
        ]);
        let text = err.to_string();
        assert!(text.contains("  - api.base_url: base URL cannot be empty"));
        assert!(text.contains("  - upload.page_size"));
    }

    #[test]
    fn test_default_paths() {
        assert!(default_config_path().ends_with("uplink/uplink.toml"));
        assert!(default_token_path().ends_with("uplink/tokens.json"));
    }
}
