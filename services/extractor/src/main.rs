use anyhow::{Context, Result};
use extractor_service::api::{start_api_server, AppState};
use extractor_service::queue::sqs_client;
use extractor_service::{
    Config, FfmpegFrameExtractor, MessageQueue, Pipeline, PipelineSettings, Poller, S3Storage,
    SqsQueue, ZipArchiver,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Extra time granted to an in-flight cycle on shutdown beyond the job timeout
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    config.validate().context("Invalid configuration")?;

    info!(
        service = %config.service.name,
        "Starting Extractor Service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let storage = Arc::new(S3Storage::new(&config.s3).await);

    let client = sqs_client(&config.sqs).await;
    let source_queue: Arc<dyn MessageQueue> = Arc::new(SqsQueue::new(
        client.clone(),
        &config.sqs.source_queue_url,
        &config.sqs,
    ));
    let downstream_queue = Arc::new(SqsQueue::new(
        client.clone(),
        &config.sqs.downstream_queue_url,
        &config.sqs,
    ));

    let extractor = Arc::new(FfmpegFrameExtractor::new(
        &config.pipeline.ffmpeg_path,
        &config.pipeline.ffprobe_path,
    ));
    let archiver = Arc::new(ZipArchiver::default());

    let mut pipeline = Pipeline::new(
        storage.clone(),
        source_queue.clone(),
        downstream_queue,
        extractor.clone(),
        archiver.clone(),
        PipelineSettings::from_config(&config),
    );

    if let Some(ref dead_letter_url) = config.sqs.dead_letter_queue_url {
        info!(queue = %dead_letter_url, "Dead-letter queue enabled");
        pipeline = pipeline.with_dead_letter_queue(Arc::new(SqsQueue::new(
            client,
            dead_letter_url,
            &config.sqs,
        )));
    } else {
        warn!("No dead-letter queue configured; failed jobs are retried indefinitely");
    }

    let poller = Poller::new(Arc::new(pipeline), config.poll_interval());

    // Create API state
    let api_state = AppState::new(&config, storage, source_queue, extractor, archiver);

    let shutdown = CancellationToken::new();

    // Spawn poller task
    let poller_shutdown = shutdown.clone();
    let mut poller_handle = tokio::spawn(async move {
        poller.run(poller_shutdown).await;
    });

    // Spawn API server task
    let api_config = config.api.clone();
    let api_shutdown = shutdown.clone();
    let api_handle = tokio::spawn(async move {
        let stop = async move { api_shutdown.cancelled().await };
        if let Err(e) = start_api_server(api_state, &api_config, stop).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Extractor service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down extractor service");

    shutdown.cancel();

    // Let the current cycle finish; its jobs are bounded by the job timeout
    let grace = config.job_timeout() + SHUTDOWN_GRACE;
    if tokio::time::timeout(grace, &mut poller_handle).await.is_err() {
        warn!("Poll cycle did not finish in time; aborting");
        poller_handle.abort();
    }

    if tokio::time::timeout(SHUTDOWN_GRACE, api_handle).await.is_err() {
        warn!("API server did not stop in time");
    }

    info!("Extractor service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
