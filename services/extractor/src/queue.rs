use crate::config::SqsConfig;
use crate::job::{Delivery, JobMessage};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_sqs::config::Builder as SqsConfigBuilder;
use aws_sdk_sqs::types::Message;
use aws_sdk_sqs::Client as SqsClient;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Errors returned by work queue operations
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Receive from {queue} failed: {message}")]
    ReceiveFailed { queue: String, message: String },

    #[error("Send to {queue} failed: {message}")]
    SendFailed { queue: String, message: String },

    #[error("Delete from {queue} failed: {message}")]
    DeleteFailed { queue: String, message: String },

    #[error("Failed to serialize message: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Durable at-least-once message channel
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Receive the next batch of deliveries; empty when the queue is idle.
    async fn receive_batch(&self) -> Result<Vec<Delivery>, QueueError>;

    /// Acknowledge a delivery so it is never redelivered.
    async fn delete(&self, handle: &str) -> Result<(), QueueError>;

    /// Enqueue a new message.
    async fn send(&self, message: &JobMessage) -> Result<(), QueueError>;
}

/// Build one SQS client to be shared by every queue
pub async fn sqs_client(config: &SqsConfig) -> SqsClient {
    let aws_config = aws_config::defaults(BehaviorVersion::latest())
        .region(aws_config::Region::new(config.region.clone()))
        .load()
        .await;

    let mut sqs_config_builder = SqsConfigBuilder::from(&aws_config);

    // Configure custom endpoint for LocalStack/ElasticMQ
    if let Some(ref endpoint_url) = config.endpoint_url {
        sqs_config_builder = sqs_config_builder.endpoint_url(endpoint_url);
    }

    info!(region = %config.region, "SQS client initialized");

    SqsClient::from_conf(sqs_config_builder.build())
}

/// A single SQS queue addressed by URL
pub struct SqsQueue {
    client: SqsClient,
    queue_url: String,
    max_messages: i32,
    wait_time_secs: i32,
    visibility_timeout_secs: i32,
}

impl SqsQueue {
    pub fn new(client: SqsClient, queue_url: impl Into<String>, config: &SqsConfig) -> Self {
        Self {
            client,
            queue_url: queue_url.into(),
            max_messages: config.max_messages,
            wait_time_secs: config.wait_time_secs,
            visibility_timeout_secs: config.visibility_timeout_secs,
        }
    }

    /// Convert an SQS message into a delivery, skipping ones we cannot read
    fn convert_message(&self, message: &Message) -> Option<Delivery> {
        let Some(handle) = message.receipt_handle() else {
            warn!(queue = %self.queue_url, "Message without receipt handle");
            return None;
        };

        match decode_body(message.body().unwrap_or_default()) {
            Ok(job) => Some(Delivery::new(handle, job)),
            Err(e) => {
                // Left in place for the queue's redrive policy
                warn!(
                    queue = %self.queue_url,
                    message_id = message.message_id().unwrap_or_default(),
                    error = %e,
                    "Skipping undecodable message"
                );
                metrics::counter!("extractor.queue.undecodable").increment(1);
                None
            }
        }
    }
}

#[async_trait]
impl MessageQueue for SqsQueue {
    #[instrument(skip(self), fields(queue = %self.queue_url))]
    async fn receive_batch(&self) -> Result<Vec<Delivery>, QueueError> {
        let response = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(self.max_messages)
            .wait_time_seconds(self.wait_time_secs)
            .visibility_timeout(self.visibility_timeout_secs)
            .send()
            .await
            .map_err(|e| QueueError::ReceiveFailed {
                queue: self.queue_url.clone(),
                message: e.to_string(),
            })?;

        let deliveries: Vec<Delivery> = response
            .messages()
            .iter()
            .filter_map(|message| self.convert_message(message))
            .collect();

        debug!(count = deliveries.len(), "Received messages");
        Ok(deliveries)
    }

    #[instrument(skip(self, handle), fields(queue = %self.queue_url))]
    async fn delete(&self, handle: &str) -> Result<(), QueueError> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(handle)
            .send()
            .await
            .map_err(|e| QueueError::DeleteFailed {
                queue: self.queue_url.clone(),
                message: e.to_string(),
            })?;

        Ok(())
    }

    #[instrument(skip(self, message), fields(queue = %self.queue_url, kind = message.kind()))]
    async fn send(&self, message: &JobMessage) -> Result<(), QueueError> {
        let body = serde_json::to_string(message)?;

        self.client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(body)
            .send()
            .await
            .map_err(|e| QueueError::SendFailed {
                queue: self.queue_url.clone(),
                message: e.to_string(),
            })?;

        debug!(status = %message.status(), "Message sent");
        Ok(())
    }
}

/// Decode a queue message body; a missing body reads as an empty object
fn decode_body(body: &str) -> Result<JobMessage, serde_json::Error> {
    let body = if body.trim().is_empty() { "{}" } else { body };
    serde_json::from_str(body)
}
