//! HTTP surface: health probes, uploads, and archive download links.
//!
//! | Route | Purpose |
//! |-------|---------|
//! | `GET /health` | liveness |
//! | `GET /ready` | workspace root is writable |
//! | `POST /upload` | extract frames synchronously, respond with the ZIP |
//! | `POST /api/v1/videos` | store a video and enqueue an extraction job |
//! | `GET /api/v1/archives/url?key=` | presigned download URL for an archive |

use crate::archive::{Archiver, ARCHIVE_CONTENT_TYPE};
use crate::config::{ApiConfig, Config};
use crate::job::{ExtractionJob, JobMessage};
use crate::media::FrameExtractor;
use crate::queue::MessageQueue;
use crate::storage::{object_key, sanitize_key_component, video_content_type, ObjectStorage};
use crate::workspace::{create_folder, extension_of, new_id, Workspace};
use anyhow::{Context, Result};
use axum::{
    extract::{DefaultBodyLimit, Multipart, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

/// Multipart field carrying the video
const VIDEO_FIELD: &str = "video";

/// Download name of synchronously produced archives
const ARCHIVE_FILE_NAME: &str = "frames.zip";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn ObjectStorage>,
    pub source_queue: Arc<dyn MessageQueue>,
    pub extractor: Arc<dyn FrameExtractor>,
    pub archiver: Arc<dyn Archiver>,
    pub workspace_root: PathBuf,
    pub frame_count: u32,
    pub video_prefix: String,
    pub archive_prefix: String,
    pub presigned_url_expiry: Duration,
}

impl AppState {
    pub fn new(
        config: &Config,
        storage: Arc<dyn ObjectStorage>,
        source_queue: Arc<dyn MessageQueue>,
        extractor: Arc<dyn FrameExtractor>,
        archiver: Arc<dyn Archiver>,
    ) -> Self {
        Self {
            storage,
            source_queue,
            extractor,
            archiver,
            workspace_root: config.pipeline.workspace_root.clone(),
            frame_count: config.pipeline.frame_count,
            video_prefix: config.s3.video_prefix.clone(),
            archive_prefix: config.s3.archive_prefix.clone(),
            presigned_url_expiry: config.presigned_url_expiry(),
        }
    }
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>, code: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.to_string(),
        }),
    )
}

/// Response to an accepted asynchronous upload
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    /// Storage key of the uploaded video
    pub video_path: String,
    pub job: ExtractionJob,
}

/// Query parameters for archive URLs
#[derive(Debug, Deserialize)]
pub struct ArchiveUrlQuery {
    pub key: String,
}

/// Presigned URL response
#[derive(Debug, Serialize)]
pub struct ArchiveUrlResponse {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// Uploaded video read from a multipart body
struct UploadedVideo {
    file_name: String,
    data: Vec<u8>,
}

impl UploadedVideo {
    fn extension(&self) -> String {
        sanitize_key_component(extension_of(&self.file_name)).to_lowercase()
    }
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/upload", post(extract_upload))
        .route("/api/v1/videos", post(submit_video))
        .route("/api/v1/archives/url", get(archive_url))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "extractor-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match create_folder(&state.workspace_root) {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "workspace": "writable"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "workspace": "unavailable",
                "error": e.to_string()
            })),
        ),
    }
}

/// Extract frames from an uploaded video and respond with the archive
#[instrument(skip(state, multipart))]
async fn extract_upload(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let video = read_video(multipart).await?;

    let workspace = Workspace::prepare(&state.workspace_root).map_err(|e| {
        error!(error = %e, "Failed to prepare workspace");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to prepare workspace", "WORKSPACE_ERROR")
    })?;

    let staged = workspace
        .stage_video(&video.file_name, &video.data)
        .map_err(|e| {
            error!(error = %e, "Failed to stage video");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to stage video", "WORKSPACE_ERROR")
        })?;
    drop(video);

    state
        .extractor
        .extract(&staged, workspace.images_dir(), state.frame_count)
        .await
        .map_err(|e| {
            warn!(error = %e, "Frame extraction failed");
            if e.is_transient() {
                api_error(StatusCode::INTERNAL_SERVER_ERROR, "Frame extraction failed", "EXTRACTION_ERROR")
            } else {
                api_error(StatusCode::UNPROCESSABLE_ENTITY, e.to_string(), "INVALID_VIDEO")
            }
        })?;

    let archive = state
        .archiver
        .compress(workspace.images_dir())
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to build archive");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to build archive", "ARCHIVE_ERROR")
        })?;

    if let Err(e) = workspace.cleanup() {
        warn!(error = %e, "Failed to remove workspace");
    }

    info!(size_bytes = archive.len(), "Archive served");

    Ok((
        [
            (header::CONTENT_TYPE, ARCHIVE_CONTENT_TYPE.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", ARCHIVE_FILE_NAME),
            ),
        ],
        archive,
    )
        .into_response())
}

/// Store an uploaded video and enqueue it for extraction
#[instrument(skip(state, multipart))]
async fn submit_video(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let video = read_video(multipart).await?;

    let extension = video.extension();
    let file_name = if extension.is_empty() {
        new_id()
    } else {
        format!("{}.{}", new_id(), extension)
    };
    let video_path = object_key(&state.video_prefix, &file_name);

    state
        .storage
        .put(&video_path, video.data, video_content_type(&extension))
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to store video");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to store video", "UPLOAD_ERROR")
        })?;

    let job = ExtractionJob::new(video_path.clone());
    if let Err(e) = state.source_queue.send(&JobMessage::from(job.clone())).await {
        error!(error = %e, video_path = %video_path, "Failed to enqueue job");

        // Without a job nothing would ever process or delete the video
        if let Err(e) = state.storage.delete(&video_path).await {
            warn!(error = %e, video_path = %video_path, "Failed to remove orphaned video");
        }

        return Err(api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "Failed to enqueue job",
            "QUEUE_ERROR",
        ));
    }

    info!(video_path = %video_path, "Extraction job submitted");
    metrics::counter!("extractor.api.submitted").increment(1);

    Ok((StatusCode::ACCEPTED, Json(SubmitResponse { video_path, job })))
}

/// Get a presigned download URL for an archive
#[instrument(skip(state))]
async fn archive_url(
    State(state): State<AppState>,
    Query(params): Query<ArchiveUrlQuery>,
) -> Result<Json<ArchiveUrlResponse>, ApiError> {
    let prefix = format!("{}/", state.archive_prefix.trim_end_matches('/'));
    if !params.key.starts_with(&prefix) || params.key.contains("..") {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "Key is not an archive",
            "INVALID_KEY",
        ));
    }

    let url = state
        .storage
        .presigned_url(&params.key, state.presigned_url_expiry)
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to generate presigned URL");
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to generate presigned URL",
                "PRESIGN_ERROR",
            )
        })?;

    let expires_at = Utc::now()
        + chrono::Duration::from_std(state.presigned_url_expiry)
            .unwrap_or_else(|_| chrono::Duration::zero());

    Ok(Json(ArchiveUrlResponse { url, expires_at }))
}

/// Read the video field from a multipart body
async fn read_video(mut multipart: Multipart) -> Result<UploadedVideo, ApiError> {
    while let Some(field) = multipart.next_field().await.map_err(|e| {
        api_error(StatusCode::BAD_REQUEST, e.body_text(), "INVALID_MULTIPART")
    })? {
        if field.name() != Some(VIDEO_FIELD) {
            continue;
        }

        let file_name = field.file_name().unwrap_or_default().to_string();
        let data = field.bytes().await.map_err(|e| {
            api_error(StatusCode::BAD_REQUEST, e.body_text(), "INVALID_MULTIPART")
        })?;

        if data.is_empty() {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                "Video file is empty",
                "EMPTY_VIDEO",
            ));
        }

        return Ok(UploadedVideo {
            file_name,
            data: data.to_vec(),
        });
    }

    Err(api_error(
        StatusCode::BAD_REQUEST,
        format!("Missing multipart field '{}'", VIDEO_FIELD),
        "MISSING_VIDEO",
    ))
}

/// Start the API server, stopping when `shutdown` resolves
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting extractor API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}
