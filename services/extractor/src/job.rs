//! Queue message bodies and job status transitions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status carried in every job message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Never attempted
    #[default]
    Pending,
    /// Currently being worked on
    Processing,
    /// Last attempt failed, eligible for retry
    Error,
}

impl Status {
    /// Whether a job in this status may be picked up by a cycle
    pub fn is_eligible(self) -> bool {
        matches!(self, Status::Pending | Status::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "PENDING",
            Status::Processing => "PROCESSING",
            Status::Error => "ERROR",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A video waiting for frame extraction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionJob {
    /// Storage key of the source video
    pub video_path: String,
    #[serde(default)]
    pub status: Status,
    /// Failed attempts so far
    #[serde(default)]
    pub attempts: u32,
    /// Error text of the most recent failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ExtractionJob {
    pub fn new(video_path: impl Into<String>) -> Self {
        Self {
            video_path: video_path.into(),
            status: Status::Pending,
            attempts: 0,
            last_error: None,
        }
    }

    /// A job without a source key can never succeed.
    pub fn is_valid(&self) -> bool {
        !self.video_path.trim().is_empty()
    }

    /// The job as it is re-sent after a failed attempt.
    pub fn failed(&self, error: impl Into<String>) -> Self {
        Self {
            video_path: self.video_path.clone(),
            status: Status::Error,
            attempts: self.attempts.saturating_add(1),
            last_error: Some(error.into()),
        }
    }
}

/// An archive waiting for the next pipeline stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveReadyJob {
    #[serde(default)]
    pub status: Status,
    /// Storage key of the frame archive
    pub zip_path: String,
}

impl ArchiveReadyJob {
    pub fn new(zip_path: impl Into<String>) -> Self {
        Self {
            status: Status::Pending,
            zip_path: zip_path.into(),
        }
    }
}

/// Any body that can travel on a job queue.
///
/// The variant is decided by which path field the body carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobMessage {
    Extraction(ExtractionJob),
    ArchiveReady(ArchiveReadyJob),
}

impl JobMessage {
    pub fn status(&self) -> Status {
        match self {
            JobMessage::Extraction(job) => job.status,
            JobMessage::ArchiveReady(job) => job.status,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            JobMessage::Extraction(_) => "extraction",
            JobMessage::ArchiveReady(_) => "archive_ready",
        }
    }
}

impl From<ExtractionJob> for JobMessage {
    fn from(job: ExtractionJob) -> Self {
        JobMessage::Extraction(job)
    }
}

impl From<ArchiveReadyJob> for JobMessage {
    fn from(job: ArchiveReadyJob) -> Self {
        JobMessage::ArchiveReady(job)
    }
}

/// One delivery of a message, identified by its queue handle.
///
/// The handle is only valid for acknowledging this delivery; a redelivery of
/// the same job arrives with a different handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub handle: String,
    pub message: JobMessage,
}

impl Delivery {
    pub fn new(handle: impl Into<String>, message: impl Into<JobMessage>) -> Self {
        Self {
            handle: handle.into(),
            message: message.into(),
        }
    }
}
