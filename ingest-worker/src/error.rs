use ingest_common::queue::QueueError;
use thiserror::Error;

/// Errors that end a drain. Per-message and commit failures are batch outcomes instead.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("failed to receive messages: {0}")]
    QueueError(#[from] QueueError),
}
