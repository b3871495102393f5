//! Extractor Service - frame extraction workers for uploaded videos
//!
//! Pulls extraction jobs from a queue, turns each referenced video into a
//! ZIP of still frames, and hands the archive to the next stage:
//!
//! ```text
//!  source queue ──► Poller ──► Pipeline::run_cycle
//!                                 │
//!        ┌────────────────────────┼───────────────────────────┐
//!        ▼                        ▼                           ▼
//!  ObjectStorage.get     FrameExtractor.extract      Archiver.compress
//!  (source video)        (ffmpeg, into Workspace)    (ZIP of frames)
//!        │                                                    │
//!        └──► ObjectStorage.put archive, delete video ◄───────┘
//!                                 │
//!                                 ▼
//!                   ack delivery, downstream queue
//! ```
//!
//! Failed jobs are re-sent with status `ERROR` and retried on later cycles.
//! The HTTP API in [`api`] offers the same extraction synchronously and an
//! upload endpoint that feeds the queue.
//!
//! # Example
//!
//! ```rust,no_run
//! use extractor_service::{
//!     queue::sqs_client, Config, FfmpegFrameExtractor, Pipeline, PipelineSettings, S3Storage,
//!     SqsQueue, ZipArchiver,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let client = sqs_client(&config.sqs).await;
//!
//!     let pipeline = Pipeline::new(
//!         Arc::new(S3Storage::new(&config.s3).await),
//!         Arc::new(SqsQueue::new(client.clone(), &config.sqs.source_queue_url, &config.sqs)),
//!         Arc::new(SqsQueue::new(client, &config.sqs.downstream_queue_url, &config.sqs)),
//!         Arc::new(FfmpegFrameExtractor::new("ffmpeg", "ffprobe")),
//!         Arc::new(ZipArchiver::default()),
//!         PipelineSettings::from_config(&config),
//!     );
//!
//!     let report = pipeline.run_cycle().await;
//!     println!("completed {} jobs", report.completed);
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod archive;
pub mod config;
pub mod job;
pub mod media;
pub mod orchestrator;
pub mod poller;
pub mod queue;
pub mod storage;
pub mod workspace;

// Re-export main types
pub use archive::{ArchiveError, Archiver, ZipArchiver};
pub use config::{Config, ConfigValidationError};
pub use job::{ArchiveReadyJob, Delivery, ExtractionJob, JobMessage, Status};
pub use media::{FfmpegFrameExtractor, FrameExtractor, MediaError};
pub use orchestrator::{CycleReport, JobOutcome, Pipeline, PipelineError, PipelineSettings};
pub use poller::Poller;
pub use queue::{MessageQueue, QueueError, SqsQueue};
pub use storage::{ObjectStorage, S3Storage, StorageError};
pub use workspace::{Workspace, WorkspaceError};
