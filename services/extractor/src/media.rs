//! Frame extraction through ffmpeg.
//!
//! Frames are grabbed at evenly spaced points of the video: for `count`
//! frames the i-th (0-based) is taken at `duration * (i + 1) / (count + 1)`,
//! so neither the very first nor the very last frame is used. Output files are
//! named `frame-1.png` .. `frame-N.png`.

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, instrument};

/// Errors raised while extracting frames
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("{program} could not be started: {source}")]
    Spawn { program: String, source: io::Error },

    #[error("{program} failed with status {status:?}: {stderr}")]
    CommandFailed {
        program: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("Invalid video file {path}: {message}")]
    InvalidVideo { path: PathBuf, message: String },

    #[error("Frame count must be greater than zero")]
    InvalidFrameCount,

    #[error("Expected {expected} frames but only {produced} were produced")]
    FrameCountUnsatisfied { expected: u32, produced: u32 },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl MediaError {
    /// Whether retrying the same input could succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, MediaError::Spawn { .. } | MediaError::Io(_))
    }
}

/// Turns a video file into still images
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FrameExtractor: Send + Sync {
    /// Write exactly `frame_count` images of `video` into `output_dir`.
    async fn extract(
        &self,
        video: &Path,
        output_dir: &Path,
        frame_count: u32,
    ) -> Result<(), MediaError>;
}

/// Frame extractor backed by the ffmpeg and ffprobe executables
#[derive(Debug, Clone)]
pub struct FfmpegFrameExtractor {
    ffmpeg: String,
    ffprobe: String,
}

impl FfmpegFrameExtractor {
    pub fn new(ffmpeg: impl Into<String>, ffprobe: impl Into<String>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    /// Read the container duration in seconds
    async fn probe_duration(&self, video: &Path) -> Result<f64, MediaError> {
        let args = vec![
            "-v".to_string(),
            "error".to_string(),
            "-show_entries".to_string(),
            "format=duration".to_string(),
            "-of".to_string(),
            "default=noprint_wrappers=1:nokey=1".to_string(),
            video.display().to_string(),
        ];

        let stdout = run_command(&self.ffprobe, &args).await.map_err(|e| match e {
            MediaError::CommandFailed { stderr, .. } => MediaError::InvalidVideo {
                path: video.to_path_buf(),
                message: stderr,
            },
            other => other,
        })?;

        parse_duration(&stdout).ok_or_else(|| MediaError::InvalidVideo {
            path: video.to_path_buf(),
            message: format!("unreadable duration {:?}", stdout.trim()),
        })
    }

    async fn grab_frame(&self, video: &Path, at: f64, output: &Path) -> Result<(), MediaError> {
        let args = vec![
            "-y".to_string(),
            "-v".to_string(),
            "error".to_string(),
            "-ss".to_string(),
            format!("{:.3}", at),
            "-i".to_string(),
            video.display().to_string(),
            "-frames:v".to_string(),
            "1".to_string(),
            output.display().to_string(),
        ];

        run_command(&self.ffmpeg, &args).await?;
        Ok(())
    }
}

#[async_trait]
impl FrameExtractor for FfmpegFrameExtractor {
    #[instrument(skip(self), fields(video = %video.display()))]
    async fn extract(
        &self,
        video: &Path,
        output_dir: &Path,
        frame_count: u32,
    ) -> Result<(), MediaError> {
        if frame_count == 0 {
            return Err(MediaError::InvalidFrameCount);
        }

        let duration = self.probe_duration(video).await?;
        let outputs: Vec<PathBuf> = (1..=frame_count)
            .map(|i| output_dir.join(frame_file_name(i)))
            .collect();

        for (at, output) in frame_timestamps(duration, frame_count).into_iter().zip(&outputs) {
            debug!(at = at, output = %output.display(), "Grabbing frame");
            self.grab_frame(video, at, output).await?;
        }

        // ffmpeg exits cleanly when seeking past the last decodable frame
        let produced = outputs.iter().filter(|path| path.is_file()).count() as u32;
        if produced < frame_count {
            return Err(MediaError::FrameCountUnsatisfied {
                expected: frame_count,
                produced,
            });
        }

        info!(frames = frame_count, duration_secs = duration, "Frames extracted");
        Ok(())
    }
}

/// Seek positions, in seconds, of `count` evenly spaced frames
pub fn frame_timestamps(duration: f64, count: u32) -> Vec<f64> {
    let step = duration / f64::from(count + 1);
    (1..=count).map(|i| step * f64::from(i)).collect()
}

/// File name of the i-th frame, 1-based
pub fn frame_file_name(index: u32) -> String {
    format!("frame-{}.png", index)
}

fn parse_duration(output: &str) -> Option<f64> {
    let duration: f64 = output.trim().parse().ok()?;
    (duration.is_finite() && duration > 0.0).then_some(duration)
}

/// Run a program to completion, returning stdout or a descriptive error
async fn run_command(program: &str, args: &[String]) -> Result<String, MediaError> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| MediaError::Spawn {
            program: program.to_string(),
            source,
        })?;

    if !output.status.success() {
        return Err(MediaError::CommandFailed {
            program: program.to_string(),
            status: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
