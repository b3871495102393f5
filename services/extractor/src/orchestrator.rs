//! Job pipeline: one bounded processing cycle over the source queue.
//!
//! For every eligible extraction job in a received batch:
//!
//! 1. download the source video
//! 2. allocate a workspace
//! 3. stage the video in it
//! 4. extract frames
//! 5. compress the frames
//! 6. upload the archive
//! 7. delete the source video
//! 8. acknowledge the delivery
//! 9. remove the workspace
//! 10. publish an archive-ready job downstream
//!
//! A failure in steps 1-8 re-sends the job with status `ERROR` (or to the
//! dead-letter queue once its attempts are exhausted). The exception is a
//! failure after step 7: the video is gone, so the stored archive is
//! forwarded downstream instead of retrying. Nothing escapes
//! [`Pipeline::run_cycle`].

use crate::archive::{ArchiveError, Archiver, ARCHIVE_CONTENT_TYPE};
use crate::config::Config;
use crate::job::{ArchiveReadyJob, Delivery, ExtractionJob, JobMessage};
use crate::media::{FrameExtractor, MediaError};
use crate::queue::{MessageQueue, QueueError};
use crate::storage::{object_key, ObjectStorage, StorageError};
use crate::workspace::{Workspace, WorkspaceError};
use futures::stream::{self, StreamExt};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

/// Errors that fail a single job
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Job timed out after {0:?}")]
    Timeout(Duration),
}

/// How a failed job should be retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Infrastructure hiccup, likely to pass
    Transient,
    /// The input itself is bad and will fail again
    Poison,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::Poison => "poison",
        }
    }
}

impl PipelineError {
    pub fn kind(&self) -> FailureKind {
        let transient = match self {
            PipelineError::InvalidJob(_) => false,
            PipelineError::Storage(StorageError::NotFound(_)) => false,
            PipelineError::Storage(_) => true,
            PipelineError::Workspace(_) => true,
            PipelineError::Media(e) => e.is_transient(),
            PipelineError::Archive(e) => e.is_transient(),
            PipelineError::Queue(_) => true,
            PipelineError::Timeout(_) => true,
        };

        if transient {
            FailureKind::Transient
        } else {
            FailureKind::Poison
        }
    }
}

/// Tunables for the job pipeline
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub frame_count: u32,
    pub job_timeout: Duration,
    pub concurrency: usize,
    pub max_attempts: u32,
    pub max_transient_attempts: u32,
    pub workspace_root: PathBuf,
    pub archive_prefix: String,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            frame_count: config.pipeline.frame_count,
            job_timeout: config.job_timeout(),
            concurrency: config.pipeline.concurrency,
            max_attempts: config.pipeline.max_attempts,
            max_transient_attempts: config.pipeline.max_transient_attempts,
            workspace_root: config.pipeline.workspace_root.clone(),
            archive_prefix: config.s3.archive_prefix.clone(),
        }
    }

    fn attempt_limit(&self, kind: FailureKind) -> u32 {
        match kind {
            FailureKind::Poison => self.max_attempts,
            FailureKind::Transient => self.max_transient_attempts,
        }
    }
}

/// What happened to one delivery during a cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Not eligible; left untouched in the queue
    Skipped,
    /// Archive stored and delivery acknowledged
    Completed { archive_key: String, published: bool },
    /// Re-sent to the source queue with status `ERROR`
    Requeued,
    /// Attempts exhausted; moved to the dead-letter queue
    DeadLettered,
    /// The failure could not be recorded; the delivery will reappear
    Abandoned,
}

/// Summary of one cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub received: usize,
    pub skipped: usize,
    pub completed: usize,
    pub requeued: usize,
    pub dead_lettered: usize,
    pub abandoned: usize,
}

impl CycleReport {
    fn record(&mut self, outcome: &JobOutcome) {
        match outcome {
            JobOutcome::Skipped => self.skipped += 1,
            JobOutcome::Completed { .. } => self.completed += 1,
            JobOutcome::Requeued => self.requeued += 1,
            JobOutcome::DeadLettered => self.dead_lettered += 1,
            JobOutcome::Abandoned => self.abandoned += 1,
        }
    }
}

/// Result of steps 1-8 for a job
struct Processed {
    workspace: Workspace,
    archive_key: String,
}

/// How far a job got, readable after its future was dropped
#[derive(Debug, Default)]
struct Progress {
    archive_key: Option<String>,
    video_deleted: bool,
}

impl Progress {
    /// The stored archive, once the source video is gone and a retry can no longer succeed
    fn orphaned_archive(self) -> Option<String> {
        if self.video_deleted {
            self.archive_key
        } else {
            None
        }
    }
}

/// Drives extraction jobs from the source queue to the downstream queue
pub struct Pipeline {
    storage: Arc<dyn ObjectStorage>,
    source_queue: Arc<dyn MessageQueue>,
    downstream_queue: Arc<dyn MessageQueue>,
    dead_letter_queue: Option<Arc<dyn MessageQueue>>,
    extractor: Arc<dyn FrameExtractor>,
    archiver: Arc<dyn Archiver>,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        storage: Arc<dyn ObjectStorage>,
        source_queue: Arc<dyn MessageQueue>,
        downstream_queue: Arc<dyn MessageQueue>,
        extractor: Arc<dyn FrameExtractor>,
        archiver: Arc<dyn Archiver>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            storage,
            source_queue,
            downstream_queue,
            dead_letter_queue: None,
            extractor,
            archiver,
            settings,
        }
    }

    /// Route jobs that exhausted their attempts to this queue
    pub fn with_dead_letter_queue(mut self, queue: Arc<dyn MessageQueue>) -> Self {
        self.dead_letter_queue = Some(queue);
        self
    }

    /// Receive one batch and process it to completion.
    ///
    /// Jobs run concurrently, bounded by `settings.concurrency`. The call
    /// returns only after every job in the batch has finished.
    #[instrument(skip(self))]
    pub async fn run_cycle(&self) -> CycleReport {
        let started = Instant::now();

        let deliveries = match self.source_queue.receive_batch().await {
            Ok(deliveries) => deliveries,
            Err(e) => {
                error!(error = %e, "Failed to receive jobs");
                metrics::counter!("extractor.queue.receive_errors").increment(1);
                return CycleReport::default();
            }
        };

        let mut report = CycleReport {
            received: deliveries.len(),
            ..Default::default()
        };

        if deliveries.is_empty() {
            debug!("No jobs received");
            return report;
        }

        let outcomes: Vec<JobOutcome> = stream::iter(deliveries)
            .map(|delivery| self.handle_delivery(delivery))
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;

        for outcome in &outcomes {
            report.record(outcome);
        }

        metrics::histogram!("extractor.cycle.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        info!(
            received = report.received,
            completed = report.completed,
            skipped = report.skipped,
            requeued = report.requeued,
            dead_lettered = report.dead_lettered,
            abandoned = report.abandoned,
            "Cycle finished"
        );

        report
    }

    async fn handle_delivery(&self, delivery: Delivery) -> JobOutcome {
        let Delivery { handle, message } = delivery;

        let job = match message {
            JobMessage::Extraction(job) if job.status.is_eligible() => job,
            other => {
                // Stays in the queue and is re-evaluated next cycle
                debug!(kind = other.kind(), status = %other.status(), "Skipping job");
                metrics::counter!("extractor.jobs.skipped").increment(1);
                return JobOutcome::Skipped;
            }
        };

        let started = Instant::now();
        let mut progress = Progress::default();
        let result = tokio::time::timeout(
            self.settings.job_timeout,
            self.process(&handle, &job, &mut progress),
        )
        .await
        .unwrap_or_else(|_| {
            metrics::counter!("extractor.jobs.timed_out").increment(1);
            Err(PipelineError::Timeout(self.settings.job_timeout))
        });

        let outcome = match result {
            Ok(processed) => self.complete(&job, processed).await,
            Err(e) => match progress.orphaned_archive() {
                Some(archive_key) => self.forward_unacknowledged(&handle, &job, archive_key, e).await,
                None => self.fail(&handle, &job, e).await,
            },
        };

        metrics::histogram!("extractor.job.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        outcome
    }

    /// Steps 1-8; any error here sends the job down the failure path.
    #[instrument(skip(self, handle, job, progress), fields(video_path = %job.video_path, attempts = job.attempts))]
    async fn process(
        &self,
        handle: &str,
        job: &ExtractionJob,
        progress: &mut Progress,
    ) -> Result<Processed, PipelineError> {
        if !job.is_valid() {
            return Err(PipelineError::InvalidJob("empty video path".to_string()));
        }

        let video = self.storage.get(&job.video_path).await?;

        let workspace = Workspace::prepare(&self.settings.workspace_root)?;
        let staged = workspace.stage_video(&job.video_path, &video)?;
        drop(video);

        self.extractor
            .extract(&staged, workspace.images_dir(), self.settings.frame_count)
            .await?;

        let archive = self.archiver.compress(workspace.images_dir()).await?;

        let archive_key = object_key(
            &self.settings.archive_prefix,
            &format!("{}.zip", workspace.token()),
        );
        self.storage
            .put(&archive_key, archive, ARCHIVE_CONTENT_TYPE)
            .await?;
        progress.archive_key = Some(archive_key.clone());

        self.storage.delete(&job.video_path).await?;
        progress.video_deleted = true;

        self.source_queue.delete(handle).await?;

        Ok(Processed {
            workspace,
            archive_key,
        })
    }

    /// Steps 9-10. The delivery is already acknowledged, so failures are only reported.
    async fn complete(&self, job: &ExtractionJob, processed: Processed) -> JobOutcome {
        let Processed {
            workspace,
            archive_key,
        } = processed;

        if let Err(e) = workspace.cleanup() {
            warn!(error = %e, "Failed to remove workspace");
        }

        let published = self.publish(job, &archive_key).await;

        info!(video_path = %job.video_path, archive_key = %archive_key, "Job completed");
        metrics::counter!("extractor.jobs.completed").increment(1);

        JobOutcome::Completed {
            archive_key,
            published,
        }
    }

    /// The archive is stored and the source video deleted, but the delivery
    /// was never acknowledged. Re-running the job would only hit a missing
    /// video, so the archive is forwarded instead.
    async fn forward_unacknowledged(
        &self,
        handle: &str,
        job: &ExtractionJob,
        archive_key: String,
        error: PipelineError,
    ) -> JobOutcome {
        warn!(
            error = %error,
            video_path = %job.video_path,
            archive_key = %archive_key,
            "Job interrupted after its video was consumed; forwarding archive"
        );
        metrics::counter!("extractor.jobs.unacknowledged").increment(1);

        if let Err(e) = self.source_queue.delete(handle).await {
            // The redelivery will fail on the missing video and end up dead-lettered
            error!(error = %e, video_path = %job.video_path, "Failed to acknowledge delivery");
        }

        let published = self.publish(job, &archive_key).await;
        metrics::counter!("extractor.jobs.completed").increment(1);

        JobOutcome::Completed {
            archive_key,
            published,
        }
    }

    /// Step 10
    async fn publish(&self, job: &ExtractionJob, archive_key: &str) -> bool {
        let next = JobMessage::from(ArchiveReadyJob::new(archive_key));
        match self.downstream_queue.send(&next).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    error = %e,
                    video_path = %job.video_path,
                    archive_key = %archive_key,
                    "Failed to publish archive-ready job"
                );
                metrics::counter!("extractor.jobs.publish_failed").increment(1);
                false
            }
        }
    }

    /// Re-send the job as failed, then drop the original delivery.
    async fn fail(&self, handle: &str, job: &ExtractionJob, error: PipelineError) -> JobOutcome {
        let kind = error.kind();
        let failed = job.failed(error.to_string());
        let limit = self.settings.attempt_limit(kind);

        let (target, outcome) = match &self.dead_letter_queue {
            Some(dead_letter) if failed.attempts >= limit => (dead_letter, JobOutcome::DeadLettered),
            _ => (&self.source_queue, JobOutcome::Requeued),
        };

        error!(
            error = %error,
            kind = kind.as_str(),
            video_path = %job.video_path,
            attempts = failed.attempts,
            outcome = ?outcome,
            "Job failed"
        );
        metrics::counter!("extractor.jobs.failed", "kind" => kind.as_str()).increment(1);

        if let Err(e) = target.send(&JobMessage::from(failed)).await {
            // Keep the original delivery; it becomes visible again after the timeout
            error!(error = %e, video_path = %job.video_path, "Failed to record job failure");
            metrics::counter!("extractor.jobs.abandoned").increment(1);
            return JobOutcome::Abandoned;
        }

        if let Err(e) = self.source_queue.delete(handle).await {
            warn!(
                error = %e,
                video_path = %job.video_path,
                "Failed to delete original delivery after re-sending"
            );
        }

        match outcome {
            JobOutcome::DeadLettered => {
                metrics::counter!("extractor.jobs.dead_lettered").increment(1)
            }
            _ => metrics::counter!("extractor.jobs.requeued").increment(1),
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{MockArchiver, ZipArchiver};
    use crate::job::Status;
    use crate::media::MockFrameExtractor;
    use crate::queue::MockMessageQueue;
    use crate::storage::MockObjectStorage;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct MemoryStorage {
        objects: Mutex<HashMap<String, (Vec<u8>, String)>>,
    }

    impl MemoryStorage {
        fn with_object(key: &str, data: &[u8]) -> Self {
            let storage = Self::default();
            storage
                .objects
                .lock()
                .unwrap()
                .insert(key.to_string(), (data.to_vec(), "video/mp4".to_string()));
            storage
        }

        fn keys(&self) -> Vec<String> {
            let mut keys: Vec<String> = self.objects.lock().unwrap().keys().cloned().collect();
            keys.sort();
            keys
        }

        fn content_type(&self, key: &str) -> Option<String> {
            self.objects.lock().unwrap().get(key).map(|(_, ct)| ct.clone())
        }
    }

    #[async_trait]
    impl ObjectStorage for MemoryStorage {
        async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
            self.objects
                .lock()
                .unwrap()
                .get(key)
                .map(|(data, _)| data.clone())
                .ok_or_else(|| StorageError::NotFound(key.to_string()))
        }

        async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), StorageError> {
            self.objects
                .lock()
                .unwrap()
                .insert(key.to_string(), (body, content_type.to_string()));
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<(), StorageError> {
            self.objects.lock().unwrap().remove(key);
            Ok(())
        }

        async fn presigned_url(&self, key: &str, _expires_in: Duration) -> Result<String, StorageError> {
            Ok(format!("memory://{}", key))
        }
    }

    #[derive(Default)]
    struct MemoryQueue {
        visible: Mutex<Vec<Delivery>>,
        sent: Mutex<Vec<JobMessage>>,
        deleted: Mutex<Vec<String>>,
        reject_deletes: bool,
        stall_next_delete: AtomicBool,
    }

    impl MemoryQueue {
        fn with_jobs(jobs: Vec<(&str, JobMessage)>) -> Self {
            let queue = Self::default();
            *queue.visible.lock().unwrap() = jobs
                .into_iter()
                .map(|(handle, message)| Delivery::new(handle, message))
                .collect();
            queue
        }

        fn sent(&self) -> Vec<JobMessage> {
            self.sent.lock().unwrap().clone()
        }

        fn deleted(&self) -> Vec<String> {
            self.deleted.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessageQueue for MemoryQueue {
        async fn receive_batch(&self) -> Result<Vec<Delivery>, QueueError> {
            Ok(std::mem::take(&mut *self.visible.lock().unwrap()))
        }

        async fn delete(&self, handle: &str) -> Result<(), QueueError> {
            if self.stall_next_delete.swap(false, Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            if self.reject_deletes {
                return Err(QueueError::DeleteFailed {
                    queue: "videos".to_string(),
                    message: "receipt handle expired".to_string(),
                });
            }
            self.deleted.lock().unwrap().push(handle.to_string());
            Ok(())
        }

        async fn send(&self, message: &JobMessage) -> Result<(), QueueError> {
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    enum ExtractorMode {
        Succeed,
        Fail,
        Hang,
    }

    /// Writes one small file per requested frame
    struct FakeExtractor {
        mode: ExtractorMode,
        calls: Mutex<Vec<(PathBuf, u32)>>,
    }

    impl FakeExtractor {
        fn new(mode: ExtractorMode) -> Self {
            Self {
                mode,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl FrameExtractor for FakeExtractor {
        async fn extract(
            &self,
            video: &Path,
            output_dir: &Path,
            frame_count: u32,
        ) -> Result<(), MediaError> {
            self.calls
                .lock()
                .unwrap()
                .push((video.to_path_buf(), frame_count));

            match self.mode {
                ExtractorMode::Fail => {
                    return Err(MediaError::FrameCountUnsatisfied {
                        expected: frame_count,
                        produced: 0,
                    });
                }
                ExtractorMode::Hang => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
                ExtractorMode::Succeed => {}
            }

            assert!(video.is_file(), "video should be staged before extraction");
            for i in 1..=frame_count {
                std::fs::write(output_dir.join(format!("frame-{}.png", i)), b"png")?;
            }
            Ok(())
        }
    }

    struct Harness {
        _root: TempDir,
        workspace_root: PathBuf,
        storage: Arc<MemoryStorage>,
        source: Arc<MemoryQueue>,
        downstream: Arc<MemoryQueue>,
        dead_letter: Arc<MemoryQueue>,
        extractor: Arc<FakeExtractor>,
    }

    impl Harness {
        fn new(storage: MemoryStorage, source: MemoryQueue, mode: ExtractorMode) -> Self {
            let root = TempDir::new().unwrap();
            Self {
                workspace_root: root.path().to_path_buf(),
                _root: root,
                storage: Arc::new(storage),
                source: Arc::new(source),
                downstream: Arc::new(MemoryQueue::default()),
                dead_letter: Arc::new(MemoryQueue::default()),
                extractor: Arc::new(FakeExtractor::new(mode)),
            }
        }

        fn settings(&self) -> PipelineSettings {
            settings(self.workspace_root.clone())
        }

        fn pipeline(&self, settings: PipelineSettings) -> Pipeline {
            Pipeline::new(
                self.storage.clone(),
                self.source.clone(),
                self.downstream.clone(),
                self.extractor.clone(),
                Arc::new(ZipArchiver::default()),
                settings,
            )
        }

        fn workspace_entries(&self) -> usize {
            std::fs::read_dir(&self.workspace_root)
                .map(|entries| entries.count())
                .unwrap_or(0)
        }
    }

    fn settings(workspace_root: PathBuf) -> PipelineSettings {
        PipelineSettings {
            frame_count: 4,
            job_timeout: Duration::from_secs(30),
            concurrency: 4,
            max_attempts: 3,
            max_transient_attempts: 5,
            workspace_root,
            archive_prefix: "archives".to_string(),
        }
    }

    fn pending(video_path: &str) -> JobMessage {
        JobMessage::from(ExtractionJob::new(video_path))
    }

    fn extraction(message: &JobMessage) -> &ExtractionJob {
        match message {
            JobMessage::Extraction(job) => job,
            other => panic!("expected extraction job, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_success_path() {
        let harness = Harness::new(
            MemoryStorage::with_object("videos/a.mp4", b"video bytes"),
            MemoryQueue::with_jobs(vec![("rh-1", pending("videos/a.mp4"))]),
            ExtractorMode::Succeed,
        );

        let report = harness.pipeline(harness.settings()).run_cycle().await;

        assert_eq!(report.received, 1);
        assert_eq!(report.completed, 1);

        // Source video replaced by exactly one archive
        let keys = harness.storage.keys();
        assert_eq!(keys.len(), 1);
        let archive_key = &keys[0];
        assert!(archive_key.starts_with("archives/") && archive_key.ends_with(".zip"));
        assert_eq!(
            harness.storage.content_type(archive_key).as_deref(),
            Some(ARCHIVE_CONTENT_TYPE)
        );

        // Delivery acknowledged, nothing re-sent
        assert_eq!(harness.source.deleted(), vec!["rh-1".to_string()]);
        assert!(harness.source.sent().is_empty());

        // One archive-ready job downstream
        assert_eq!(
            harness.downstream.sent(),
            vec![JobMessage::from(ArchiveReadyJob::new(archive_key.clone()))]
        );

        // Four frames requested, workspace gone
        let calls = harness.extractor.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, 4);
        assert_eq!(calls[0].0.extension().unwrap(), "mp4");
        assert_eq!(harness.workspace_entries(), 0);
    }

    #[tokio::test]
    async fn test_archive_contains_all_frames() {
        let harness = Harness::new(
            MemoryStorage::with_object("videos/a.mp4", b"video bytes"),
            MemoryQueue::with_jobs(vec![("rh-1", pending("videos/a.mp4"))]),
            ExtractorMode::Succeed,
        );

        harness.pipeline(harness.settings()).run_cycle().await;

        let archive_key = harness.storage.keys().remove(0);
        let archive = harness.storage.get(&archive_key).await.unwrap();
        let zip = zip::ZipArchive::new(std::io::Cursor::new(archive)).unwrap();
        let mut names: Vec<&str> = zip.file_names().collect();
        names.sort();
        assert_eq!(
            names,
            vec!["frame-1.png", "frame-2.png", "frame-3.png", "frame-4.png"]
        );
    }

    #[tokio::test]
    async fn test_storage_failure_requeues_as_error() {
        let harness = Harness::new(
            MemoryStorage::default(),
            MemoryQueue::with_jobs(vec![("rh-1", pending("videos/a.mp4"))]),
            ExtractorMode::Succeed,
        );

        let report = harness.pipeline(harness.settings()).run_cycle().await;

        assert_eq!(report.requeued, 1);
        let sent = harness.source.sent();
        assert_eq!(sent.len(), 1);
        let job = extraction(&sent[0]);
        assert_eq!(job.status, Status::Error);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.video_path, "videos/a.mp4");
        assert!(job.last_error.as_deref().unwrap().contains("videos/a.mp4"));

        // Original delivery replaced by the re-sent copy
        assert_eq!(harness.source.deleted(), vec!["rh-1".to_string()]);

        assert!(harness.storage.keys().is_empty());
        assert!(harness.downstream.sent().is_empty());
        assert!(harness.extractor.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failure_in_one_job_does_not_block_others() {
        let harness = Harness::new(
            MemoryStorage::with_object("videos/b.mp4", b"video bytes"),
            MemoryQueue::with_jobs(vec![
                ("rh-a", pending("videos/a.mp4")),
                ("rh-b", pending("videos/b.mp4")),
            ]),
            ExtractorMode::Succeed,
        );

        let report = harness.pipeline(harness.settings()).run_cycle().await;

        assert_eq!(report.completed, 1);
        assert_eq!(report.requeued, 1);
        assert_eq!(harness.downstream.sent().len(), 1);

        let sent = harness.source.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(extraction(&sent[0]).video_path, "videos/a.mp4");

        let mut deleted = harness.source.deleted();
        deleted.sort();
        assert_eq!(deleted, vec!["rh-a".to_string(), "rh-b".to_string()]);
    }

    #[tokio::test]
    async fn test_workspace_removed_after_failure() {
        let harness = Harness::new(
            MemoryStorage::with_object("videos/a.mp4", b"video bytes"),
            MemoryQueue::with_jobs(vec![("rh-1", pending("videos/a.mp4"))]),
            ExtractorMode::Fail,
        );

        let report = harness.pipeline(harness.settings()).run_cycle().await;

        assert_eq!(report.requeued, 1);
        assert_eq!(harness.workspace_entries(), 0);
        // Source video kept for the retry
        assert_eq!(harness.storage.keys(), vec!["videos/a.mp4".to_string()]);
    }

    #[tokio::test]
    async fn test_error_status_job_is_retried() {
        let retry = ExtractionJob::new("videos/a.mp4").failed("earlier failure");
        let harness = Harness::new(
            MemoryStorage::with_object("videos/a.mp4", b"video bytes"),
            MemoryQueue::with_jobs(vec![("rh-2", JobMessage::from(retry))]),
            ExtractorMode::Succeed,
        );

        let report = harness.pipeline(harness.settings()).run_cycle().await;

        assert_eq!(report.completed, 1);
        assert_eq!(harness.downstream.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_poison_job_dead_lettered_at_limit() {
        let mut job = ExtractionJob::new("videos/a.mp4");
        job.status = Status::Error;
        job.attempts = 2;

        let harness = Harness::new(
            MemoryStorage::default(),
            MemoryQueue::with_jobs(vec![("rh-1", JobMessage::from(job))]),
            ExtractorMode::Succeed,
        );
        let pipeline = harness
            .pipeline(harness.settings())
            .with_dead_letter_queue(harness.dead_letter.clone());

        let report = pipeline.run_cycle().await;

        assert_eq!(report.dead_lettered, 1);
        assert!(harness.source.sent().is_empty());
        assert_eq!(harness.source.deleted(), vec!["rh-1".to_string()]);

        let dead = harness.dead_letter.sent();
        assert_eq!(dead.len(), 1);
        assert_eq!(extraction(&dead[0]).attempts, 3);
        assert_eq!(extraction(&dead[0]).status, Status::Error);
    }

    #[tokio::test]
    async fn test_without_dead_letter_queue_jobs_are_always_requeued() {
        let mut job = ExtractionJob::new("videos/a.mp4");
        job.attempts = 10;

        let harness = Harness::new(
            MemoryStorage::default(),
            MemoryQueue::with_jobs(vec![("rh-1", JobMessage::from(job))]),
            ExtractorMode::Succeed,
        );

        let report = harness.pipeline(harness.settings()).run_cycle().await;

        assert_eq!(report.requeued, 1);
        assert_eq!(extraction(&harness.source.sent()[0]).attempts, 11);
    }

    #[tokio::test]
    async fn test_transient_failures_use_separate_limit() {
        let mut job = ExtractionJob::new("videos/a.mp4");
        job.status = Status::Error;
        job.attempts = 3;

        let harness = Harness::new(
            MemoryStorage::with_object("videos/a.mp4", b"video bytes"),
            MemoryQueue::with_jobs(vec![("rh-1", JobMessage::from(job))]),
            ExtractorMode::Hang,
        );
        let mut settings = harness.settings();
        settings.job_timeout = Duration::from_millis(50);
        let pipeline = harness
            .pipeline(settings)
            .with_dead_letter_queue(harness.dead_letter.clone());

        let report = pipeline.run_cycle().await;

        // Timeouts are transient: 4 attempts is below the transient limit of 5
        assert_eq!(report.requeued, 1);
        assert!(harness.dead_letter.sent().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_requeues_and_cleans_up() {
        let harness = Harness::new(
            MemoryStorage::with_object("videos/a.mp4", b"video bytes"),
            MemoryQueue::with_jobs(vec![("rh-1", pending("videos/a.mp4"))]),
            ExtractorMode::Hang,
        );
        let mut settings = harness.settings();
        settings.job_timeout = Duration::from_millis(50);

        let report = harness.pipeline(settings).run_cycle().await;

        assert_eq!(report.requeued, 1);
        let sent = harness.source.sent();
        let job = extraction(&sent[0]);
        assert_eq!(job.status, Status::Error);
        assert!(job.last_error.as_deref().unwrap().contains("timed out"));
        assert_eq!(harness.workspace_entries(), 0);
        assert!(harness.downstream.sent().is_empty());
    }

    #[tokio::test]
    async fn test_unacknowledged_job_forwards_archive() {
        let mut source = MemoryQueue::with_jobs(vec![("rh-1", pending("videos/a.mp4"))]);
        source.reject_deletes = true;
        let harness = Harness::new(
            MemoryStorage::with_object("videos/a.mp4", b"video bytes"),
            source,
            ExtractorMode::Succeed,
        );

        let report = harness.pipeline(harness.settings()).run_cycle().await;

        assert_eq!(report.completed, 1);
        assert_eq!(report.requeued, 0);

        // No extraction job is re-sent for a video that no longer exists
        assert!(harness.source.sent().is_empty());
        assert!(harness.source.deleted().is_empty());

        let keys = harness.storage.keys();
        assert_eq!(keys.len(), 1);
        assert!(keys[0].starts_with("archives/"));
        assert_eq!(
            harness.downstream.sent(),
            vec![JobMessage::from(ArchiveReadyJob::new(keys[0].clone()))]
        );
        assert_eq!(harness.workspace_entries(), 0);
    }

    #[tokio::test]
    async fn test_timeout_after_video_deleted_forwards_archive() {
        let source = MemoryQueue::with_jobs(vec![("rh-1", pending("videos/a.mp4"))]);
        source.stall_next_delete.store(true, Ordering::SeqCst);
        let harness = Harness::new(
            MemoryStorage::with_object("videos/a.mp4", b"video bytes"),
            source,
            ExtractorMode::Succeed,
        );
        let mut settings = harness.settings();
        settings.job_timeout = Duration::from_millis(200);

        let report = harness.pipeline(settings).run_cycle().await;

        assert_eq!(report.completed, 1);
        assert!(harness.source.sent().is_empty());
        // Acknowledged on the second attempt
        assert_eq!(harness.source.deleted(), vec!["rh-1".to_string()]);
        assert_eq!(harness.downstream.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_failure_before_video_deleted_still_requeues() {
        let mut storage = MockObjectStorage::new();
        storage
            .expect_get()
            .times(1)
            .returning(|_| Ok(b"video bytes".to_vec()));
        storage.expect_put().times(1).returning(|_, _, _| Ok(()));
        storage.expect_delete().times(1).returning(|key| {
            Err(StorageError::DeleteFailed {
                key: key.to_string(),
                message: "slow down".to_string(),
            })
        });

        let source = Arc::new(MemoryQueue::with_jobs(vec![("rh-1", pending("videos/a.mp4"))]));
        let downstream = Arc::new(MemoryQueue::default());
        let tmp = TempDir::new().unwrap();
        let pipeline = Pipeline::new(
            Arc::new(storage),
            source.clone(),
            downstream.clone(),
            Arc::new(FakeExtractor::new(ExtractorMode::Succeed)),
            Arc::new(ZipArchiver::default()),
            settings(tmp.path().to_path_buf()),
        );

        let report = pipeline.run_cycle().await;

        assert_eq!(report.requeued, 1);
        assert_eq!(extraction(&source.sent()[0]).status, Status::Error);
        assert!(downstream.sent().is_empty());
    }

    #[tokio::test]
    async fn test_batch_jobs_run_concurrently() {
        let harness = Harness::new(
            MemoryStorage::with_object("videos/a.mp4", b"video bytes"),
            MemoryQueue::with_jobs(vec![
                ("rh-1", pending("videos/a.mp4")),
                ("rh-2", pending("videos/a.mp4")),
            ]),
            ExtractorMode::Hang,
        );
        let mut settings = harness.settings();
        settings.job_timeout = Duration::from_millis(200);
        settings.concurrency = 2;

        let started = Instant::now();
        let report = harness.pipeline(settings).run_cycle().await;
        let elapsed = started.elapsed();

        assert_eq!(report.requeued, 2);
        // Sequential execution would take at least two timeouts
        assert!(elapsed < Duration::from_millis(380), "cycle took {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_zero_concurrency_still_processes() {
        let harness = Harness::new(
            MemoryStorage::with_object("videos/a.mp4", b"video bytes"),
            MemoryQueue::with_jobs(vec![("rh-1", pending("videos/a.mp4"))]),
            ExtractorMode::Succeed,
        );
        let mut settings = harness.settings();
        settings.concurrency = 0;

        let report = tokio::time::timeout(
            Duration::from_secs(5),
            harness.pipeline(settings).run_cycle(),
        )
        .await
        .expect("cycle should finish");

        assert_eq!(report.completed, 1);
    }

    #[tokio::test]
    async fn test_invalid_job_fails_without_download() {
        let mut storage = MockObjectStorage::new();
        storage.expect_get().never();

        let mut source = MockMessageQueue::new();
        source
            .expect_receive_batch()
            .times(1)
            .returning(|| Ok(vec![Delivery::new("rh-1", ExtractionJob::new(""))]));
        source
            .expect_send()
            .withf(|message| message.status() == Status::Error)
            .times(1)
            .returning(|_| Ok(()));
        source
            .expect_delete()
            .withf(|handle| handle.to_string() == "rh-1")
            .times(1)
            .returning(|_| Ok(()));

        let tmp = TempDir::new().unwrap();
        let pipeline = Pipeline::new(
            Arc::new(storage),
            Arc::new(source),
            Arc::new(MockMessageQueue::new()),
            Arc::new(MockFrameExtractor::new()),
            Arc::new(MockArchiver::new()),
            settings(tmp.path().to_path_buf()),
        );

        assert_eq!(pipeline.run_cycle().await.requeued, 1);
    }

    #[tokio::test]
    async fn test_ineligible_jobs_are_left_untouched() {
        let mut processing = ExtractionJob::new("videos/a.mp4");
        processing.status = Status::Processing;

        let mut source = MockMessageQueue::new();
        source.expect_receive_batch().times(1).returning(move || {
            Ok(vec![
                Delivery::new("rh-1", processing.clone()),
                Delivery::new("rh-2", ArchiveReadyJob::new("archives/x.zip")),
            ])
        });
        source.expect_delete().never();
        source.expect_send().never();

        let mut downstream = MockMessageQueue::new();
        downstream.expect_send().never();

        let mut storage = MockObjectStorage::new();
        storage.expect_get().never();
        storage.expect_put().never();
        storage.expect_delete().never();

        let mut extractor = MockFrameExtractor::new();
        extractor.expect_extract().never();

        let mut archiver = MockArchiver::new();
        archiver.expect_compress().never();

        let tmp = TempDir::new().unwrap();
        let pipeline = Pipeline::new(
            Arc::new(storage),
            Arc::new(source),
            Arc::new(downstream),
            Arc::new(extractor),
            Arc::new(archiver),
            settings(tmp.path().to_path_buf()),
        );

        let report = pipeline.run_cycle().await;

        assert_eq!(report.received, 2);
        assert_eq!(report.skipped, 2);
    }

    #[tokio::test]
    async fn test_receive_failure_ends_cycle_quietly() {
        let mut source = MockMessageQueue::new();
        source.expect_receive_batch().times(1).returning(|| {
            Err(QueueError::ReceiveFailed {
                queue: "videos".to_string(),
                message: "connection reset".to_string(),
            })
        });

        let tmp = TempDir::new().unwrap();
        let pipeline = Pipeline::new(
            Arc::new(MockObjectStorage::new()),
            Arc::new(source),
            Arc::new(MockMessageQueue::new()),
            Arc::new(MockFrameExtractor::new()),
            Arc::new(MockArchiver::new()),
            settings(tmp.path().to_path_buf()),
        );

        assert_eq!(pipeline.run_cycle().await, CycleReport::default());
    }

    #[tokio::test]
    async fn test_unrecorded_failure_keeps_original_delivery() {
        let mut storage = MockObjectStorage::new();
        storage.expect_get().times(1).returning(|key| {
            Err(StorageError::DownloadFailed {
                key: key.to_string(),
                message: "timeout".to_string(),
            })
        });

        let mut source = MockMessageQueue::new();
        source
            .expect_receive_batch()
            .times(1)
            .returning(|| Ok(vec![Delivery::new("rh-1", ExtractionJob::new("videos/a.mp4"))]));
        source.expect_send().times(1).returning(|_| {
            Err(QueueError::SendFailed {
                queue: "videos".to_string(),
                message: "throttled".to_string(),
            })
        });
        source.expect_delete().never();

        let tmp = TempDir::new().unwrap();
        let pipeline = Pipeline::new(
            Arc::new(storage),
            Arc::new(source),
            Arc::new(MockMessageQueue::new()),
            Arc::new(MockFrameExtractor::new()),
            Arc::new(MockArchiver::new()),
            settings(tmp.path().to_path_buf()),
        );

        assert_eq!(pipeline.run_cycle().await.abandoned, 1);
    }

    #[tokio::test]
    async fn test_publish_failure_still_completes() {
        let mut downstream = MockMessageQueue::new();
        downstream.expect_send().times(1).returning(|_| {
            Err(QueueError::SendFailed {
                queue: "archives".to_string(),
                message: "throttled".to_string(),
            })
        });

        let tmp = TempDir::new().unwrap();
        let storage = Arc::new(MemoryStorage::with_object("videos/a.mp4", b"video bytes"));
        let source = Arc::new(MemoryQueue::with_jobs(vec![("rh-1", pending("videos/a.mp4"))]));
        let pipeline = Pipeline::new(
            storage.clone(),
            source.clone(),
            Arc::new(downstream),
            Arc::new(FakeExtractor::new(ExtractorMode::Succeed)),
            Arc::new(ZipArchiver::default()),
            settings(tmp.path().to_path_buf()),
        );

        let report = pipeline.run_cycle().await;

        assert_eq!(report.completed, 1);
        assert!(source.sent().is_empty());
        assert_eq!(source.deleted(), vec!["rh-1".to_string()]);
    }

    #[test]
    fn test_failure_classification() {
        assert_eq!(
            PipelineError::Storage(StorageError::NotFound("k".to_string())).kind(),
            FailureKind::Poison
        );
        assert_eq!(
            PipelineError::Storage(StorageError::DownloadFailed {
                key: "k".to_string(),
                message: "reset".to_string(),
            })
            .kind(),
            FailureKind::Transient
        );
        assert_eq!(
            PipelineError::Timeout(Duration::from_secs(1)).kind(),
            FailureKind::Transient
        );
        assert_eq!(
            PipelineError::Archive(ArchiveError::EmptySource(PathBuf::from("x"))).kind(),
            FailureKind::Poison
        );
        assert_eq!(
            PipelineError::InvalidJob("empty".to_string()).kind(),
            FailureKind::Poison
        );
    }
}
