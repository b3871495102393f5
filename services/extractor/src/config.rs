use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main configuration for the extractor service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// S3 configuration
    pub s3: S3Config,
    /// SQS configuration
    pub sqs: SqsConfig,
    /// Job pipeline configuration
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// Bucket holding uploaded videos and generated archives
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Key prefix for uploaded source videos
    #[serde(default = "default_video_prefix")]
    pub video_prefix: String,
    /// Key prefix for generated archives
    #[serde(default = "default_archive_prefix")]
    pub archive_prefix: String,
    /// Presigned URL expiration in seconds
    #[serde(default = "default_presigned_url_expiry_secs")]
    pub presigned_url_expiry_secs: u64,
    /// Multipart upload threshold in bytes (5MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes (5MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

/// SQS queue configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SqsConfig {
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for LocalStack, ElasticMQ, etc.)
    pub endpoint_url: Option<String>,
    /// Queue holding pending video extraction jobs
    pub source_queue_url: String,
    /// Queue receiving archive-ready jobs
    pub downstream_queue_url: String,
    /// Queue receiving jobs that exhausted their retries
    pub dead_letter_queue_url: Option<String>,
    /// Maximum messages per receive call (1-10)
    #[serde(default = "default_max_messages")]
    pub max_messages: i32,
    /// Long-poll wait time in seconds (0-20)
    #[serde(default = "default_wait_time_secs")]
    pub wait_time_secs: i32,
    /// Visibility timeout applied to received messages in seconds
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: i32,
}

/// Job pipeline configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Number of frames extracted per video
    #[serde(default = "default_frame_count")]
    pub frame_count: u32,
    /// Interval between poll cycles in seconds
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Upper bound for one job, from download to acknowledgement
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
    /// Jobs processed concurrently within one cycle
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Attempts before a poison job is dead-lettered
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Attempts before a transiently failing job is dead-lettered
    #[serde(default = "default_max_transient_attempts")]
    pub max_transient_attempts: u32,
    /// Root directory for per-job workspaces
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,
    /// ffmpeg executable
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    /// ffprobe executable
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: String,
}

/// API configuration for the upload and download endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Maximum accepted upload size in bytes
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

/// Configuration validation errors
#[derive(Debug, Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

// Default value functions
fn default_service_name() -> String {
    "extractor-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_video_prefix() -> String {
    "videos".to_string()
}

fn default_archive_prefix() -> String {
    "archives".to_string()
}

fn default_presigned_url_expiry_secs() -> u64 {
    3600
}

fn default_multipart_threshold() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_part_size() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_max_messages() -> i32 {
    5
}

fn default_wait_time_secs() -> i32 {
    10
}

fn default_visibility_timeout_secs() -> i32 {
    900
}

fn default_frame_count() -> u32 {
    4
}

fn default_poll_interval_secs() -> u64 {
    10
}

fn default_job_timeout_secs() -> u64 {
    600
}

fn default_concurrency() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    3
}

fn default_max_transient_attempts() -> u32 {
    25
}

fn default_workspace_root() -> PathBuf {
    std::env::temp_dir().join("extractor")
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe_path() -> String {
    "ffprobe".to_string()
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_max_upload_bytes() -> usize {
    512 * 1024 * 1024 // 512MB
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "extractor-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/extractor").required(false))
            .add_source(config::File::with_name("/etc/framezip/extractor").required(false))
            // Override with environment variables
            // EXTRACTOR__SQS__SOURCE_QUEUE_URL -> sqs.source_queue_url
            .add_source(
                config::Environment::with_prefix("EXTRACTOR")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.s3.bucket.is_empty() {
            return Err(ConfigValidationError::MissingField("s3.bucket".to_string()));
        }

        if self.sqs.source_queue_url.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "sqs.source_queue_url".to_string(),
            ));
        }

        if self.sqs.downstream_queue_url.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "sqs.downstream_queue_url".to_string(),
            ));
        }

        if !(1..=10).contains(&self.sqs.max_messages) {
            return Err(ConfigValidationError::InvalidValue {
                field: "sqs.max_messages".to_string(),
                message: "Must be between 1 and 10".to_string(),
            });
        }

        if !(0..=20).contains(&self.sqs.wait_time_secs) {
            return Err(ConfigValidationError::InvalidValue {
                field: "sqs.wait_time_secs".to_string(),
                message: "Must be between 0 and 20".to_string(),
            });
        }

        // A message must stay invisible for as long as a job may run,
        // otherwise it is redelivered while still being processed.
        if self.sqs.visibility_timeout_secs <= 0
            || self.sqs.visibility_timeout_secs as u64 <= self.pipeline.job_timeout_secs
        {
            return Err(ConfigValidationError::InvalidValue {
                field: "sqs.visibility_timeout_secs".to_string(),
                message: format!(
                    "Must be greater than pipeline.job_timeout_secs ({})",
                    self.pipeline.job_timeout_secs
                ),
            });
        }

        if self.pipeline.frame_count == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "pipeline.frame_count".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if self.pipeline.poll_interval_secs == 0 || self.pipeline.job_timeout_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "pipeline.poll_interval_secs".to_string(),
                message: "Poll interval and job timeout must be greater than 0".to_string(),
            });
        }

        if self.pipeline.concurrency == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "pipeline.concurrency".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if self.pipeline.max_attempts == 0 || self.pipeline.max_transient_attempts == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "pipeline.max_attempts".to_string(),
                message: "Attempt limits must be greater than 0".to_string(),
            });
        }

        if self.s3.part_size_bytes < 5 * 1024 * 1024 {
            return Err(ConfigValidationError::InvalidValue {
                field: "s3.part_size_bytes".to_string(),
                message: "S3 requires parts of at least 5MB".to_string(),
            });
        }

        Ok(())
    }

    /// Get the poll interval as Duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.pipeline.poll_interval_secs)
    }

    /// Get the per-job timeout as Duration
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.pipeline.job_timeout_secs)
    }

    /// Get presigned URL expiry as Duration
    pub fn presigned_url_expiry(&self) -> Duration {
        Duration::from_secs(self.s3.presigned_url_expiry_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_count: default_frame_count(),
            poll_interval_secs: default_poll_interval_secs(),
            job_timeout_secs: default_job_timeout_secs(),
            concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            max_transient_attempts: default_max_transient_attempts(),
            workspace_root: default_workspace_root(),
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            max_upload_bytes: default_max_upload_bytes(),
            cors_enabled: default_true(),
            cors_origins: Vec::new(),
        }
    }
}
