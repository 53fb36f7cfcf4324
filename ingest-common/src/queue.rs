//! Queue gateway: receive bounded batches of opaque messages and acknowledge them by handle.
//!
//! Unacknowledged messages come back after the queue's visibility timeout; this is what
//! gives the worker at-least-once delivery.

use std::collections::VecDeque;

use async_trait::async_trait;
use aws_sdk_sqs::error::DisplayErrorContext;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("receive failed with: {0}")]
    ReceiveError(String),
    #[error("acknowledge failed with: {0}")]
    AcknowledgeError(String),
}

/// Opaque token identifying one delivery of a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AckHandle(String);

impl AckHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A message as received, owned by the queue until acknowledged.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    /// Queue-assigned id, only used for logging.
    pub id: Option<String>,
    pub body: String,
    pub handle: AckHandle,
}

#[async_trait]
pub trait QueueGateway: Send + Sync {
    /// Receive up to `max_messages`, waiting at most `wait_seconds` for the first one.
    /// A wait that times out yields an empty batch, not an error.
    async fn receive(
        &self,
        max_messages: i32,
        wait_seconds: i32,
    ) -> Result<Vec<RawMessage>, QueueError>;

    /// Remove a received message from the queue.
    async fn acknowledge(&self, handle: &AckHandle) -> Result<(), QueueError>;
}

/// Gateway backed by an AWS SQS queue.
pub struct SqsQueue {
    client: aws_sdk_sqs::Client,
    queue_url: String,
}

impl SqsQueue {
    pub fn new(client: aws_sdk_sqs::Client, queue_url: &str) -> Self {
        Self {
            client,
            queue_url: queue_url.to_owned(),
        }
    }
}

#[async_trait]
impl QueueGateway for SqsQueue {
    async fn receive(
        &self,
        max_messages: i32,
        wait_seconds: i32,
    ) -> Result<Vec<RawMessage>, QueueError> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max_messages)
            .wait_time_seconds(wait_seconds)
            .send()
            .await
            .map_err(|error| QueueError::ReceiveError(DisplayErrorContext(&error).to_string()))?;

        let messages = output
            .messages
            .unwrap_or_default()
            .into_iter()
            .filter_map(|message| {
                let Some(handle) = message.receipt_handle else {
                    warn!(
                        message_id = ?message.message_id,
                        "received message without receipt handle"
                    );
                    return None;
                };
                Some(RawMessage {
                    id: message.message_id,
                    body: message.body.unwrap_or_default(),
                    handle: AckHandle(handle),
                })
            })
            .collect();

        Ok(messages)
    }

    async fn acknowledge(&self, handle: &AckHandle) -> Result<(), QueueError> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(handle.as_str())
            .send()
            .await
            .map_err(|error| {
                QueueError::AcknowledgeError(DisplayErrorContext(&error).to_string())
            })?;

        Ok(())
    }
}

#[derive(Default)]
struct MockState {
    next_id: u64,
    deliveries: u64,
    available: VecDeque<(String, String)>,
    in_flight: Vec<RawMessage>,
    acknowledged: Vec<String>,
    receive_error: Option<QueueError>,
    fail_acknowledge: bool,
}

/// In-memory queue for tests - always available, no conditional compilation needed.
///
/// Received messages stay in flight until acknowledged; `expire_visibility` puts the
/// unacknowledged ones back, the way a visibility timeout would.
#[derive(Default)]
pub struct MockQueue {
    state: Mutex<MockState>,
}

impl MockQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a message body, returning its message id.
    pub async fn push(&self, body: impl Into<String>) -> String {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let id = format!("message-{}", state.next_id);
        state.available.push_back((id.clone(), body.into()));
        id
    }

    /// Make every following `receive` fail with `error`, or succeed again with `None`.
    pub async fn fail_receive(&self, error: Option<QueueError>) {
        self.state.lock().await.receive_error = error;
    }

    pub async fn fail_acknowledge(&self, fail: bool) {
        self.state.lock().await.fail_acknowledge = fail;
    }

    /// Ids of acknowledged messages, in acknowledgment order.
    pub async fn acknowledged(&self) -> Vec<String> {
        self.state.lock().await.acknowledged.clone()
    }

    /// Ids of received messages that were not acknowledged yet.
    pub async fn in_flight(&self) -> Vec<String> {
        self.state
            .lock()
            .await
            .in_flight
            .iter()
            .filter_map(|message| message.id.clone())
            .collect()
    }

    /// Make in-flight messages available again.
    pub async fn expire_visibility(&self) {
        let mut state = self.state.lock().await;
        let expired: Vec<RawMessage> = state.in_flight.drain(..).collect();
        for message in expired.into_iter().rev() {
            if let Some(id) = message.id {
                state.available.push_front((id, message.body));
            }
        }
    }
}

#[async_trait]
impl QueueGateway for MockQueue {
    async fn receive(
        &self,
        max_messages: i32,
        _wait_seconds: i32,
    ) -> Result<Vec<RawMessage>, QueueError> {
        let mut state = self.state.lock().await;
        if let Some(error) = &state.receive_error {
            return Err(error.clone());
        }

        let count = usize::try_from(max_messages).unwrap_or(0);
        let mut received = Vec::new();
        while received.len() < count {
            let Some((id, body)) = state.available.pop_front() else {
                break;
            };
            state.deliveries += 1;
            let message = RawMessage {
                handle: AckHandle(format!("{}/{}", id, state.deliveries)),
                id: Some(id),
                body,
            };
            state.in_flight.push(message.clone());
            received.push(message);
        }

        Ok(received)
    }

    async fn acknowledge(&self, handle: &AckHandle) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if state.fail_acknowledge {
            return Err(QueueError::AcknowledgeError("injected failure".to_owned()));
        }

        let Some(position) = state.in_flight.iter().position(|m| &m.handle == handle) else {
            return Err(QueueError::AcknowledgeError(format!(
                "unknown receipt handle {}",
                handle.as_str()
            )));
        };
        let message = state.in_flight.remove(position);
        if let Some(id) = message.id {
            state.acknowledged.push(id);
        }

        Ok(())
    }
}
