use std::time;

use health::HealthHandle;
use ingest_common::{
    expand::{transform, Expansion},
    metrics::{
        ACKNOWLEDGE_FAILURES, BATCHES_TOTAL, BATCH_ROWS, COMMIT_DURATION, COMMIT_FAILURES,
        MESSAGES_ACKNOWLEDGED, MESSAGES_RECEIVED, MESSAGES_REJECTED, RECEIVE_FAILURES,
        ROWS_COMMITTED,
    },
    queue::{AckHandle, QueueGateway},
    sink::{RowSink, SinkError},
};
use tracing::{debug, error, info, warn};

use crate::error::WorkerError;

/// A received message that produced no rows. It is left unacknowledged.
#[derive(Debug)]
pub struct Rejected {
    pub message_id: Option<String>,
    /// Either `Expansion::Skipped` or `Expansion::Invalid`.
    pub expansion: Expansion,
}

/// What happened to one received batch.
#[derive(Debug)]
pub enum BatchOutcome {
    /// The receive returned no messages.
    Empty,
    /// Messages arrived but none produced rows, so nothing was written.
    NothingStaged {
        received: usize,
        rejected: Vec<Rejected>,
    },
    /// The transaction failed. No row is durable and no message was acknowledged.
    RolledBack {
        received: usize,
        staged_rows: usize,
        error: SinkError,
        rejected: Vec<Rejected>,
    },
    /// Every staged row is durable. `acknowledged` may fall short of the staged
    /// messages when deletes fail; those come back and are written again.
    Committed {
        received: usize,
        rows: usize,
        acknowledged: usize,
        rejected: Vec<Rejected>,
    },
}

impl BatchOutcome {
    pub fn rows_committed(&self) -> usize {
        match self {
            BatchOutcome::Committed { rows, .. } => *rows,
            BatchOutcome::Empty
            | BatchOutcome::NothingStaged { .. }
            | BatchOutcome::RolledBack { .. } => 0,
        }
    }
}

/// Totals of one drain.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainSummary {
    pub batches: usize,
    pub rows: usize,
}

/// A worker that moves batches from a queue into a sink, acknowledging a message
/// only once its rows are committed.
pub struct BatchWorker<'p, Q, S> {
    /// The queue we receive messages from.
    queue: &'p Q,
    /// Where rows are committed.
    sink: &'p S,
    /// Maximum messages per receive.
    batch_size: i32,
    /// Long-poll wait per receive.
    wait_seconds: i32,
    /// Pause between drains.
    poll_interval: time::Duration,
    /// The liveness check handle, reported after every batch.
    liveness: HealthHandle,
}

impl<'p, Q, S> BatchWorker<'p, Q, S>
where
    Q: QueueGateway,
    S: RowSink,
{
    pub fn new(
        queue: &'p Q,
        sink: &'p S,
        batch_size: i32,
        wait_seconds: i32,
        poll_interval: time::Duration,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            queue,
            sink,
            batch_size,
            wait_seconds,
            poll_interval,
            liveness,
        }
    }

    /// Receive one batch, commit the rows of every valid message in a single
    /// transaction, then acknowledge exactly the messages that contributed rows.
    pub async fn process_batch(&self) -> Result<BatchOutcome, WorkerError> {
        let messages = self
            .queue
            .receive(self.batch_size, self.wait_seconds)
            .await?;
        if messages.is_empty() {
            return Ok(BatchOutcome::Empty);
        }

        let received = messages.len();
        metrics::counter!(BATCHES_TOTAL).increment(1);
        metrics::counter!(MESSAGES_RECEIVED).increment(received as u64);

        let mut staged = Vec::new();
        let mut handles: Vec<&AckHandle> = Vec::with_capacity(received);
        let mut rejected = Vec::new();

        for message in &messages {
            match transform(&message.body) {
                Expansion::Rows(rows) => {
                    staged.extend(rows);
                    handles.push(&message.handle);
                }
                expansion => {
                    match &expansion {
                        Expansion::Invalid(reason) => warn!(
                            message_id = ?message.id,
                            reason = expansion.reason(),
                            "rejected message: {}",
                            reason
                        ),
                        _ => debug!(
                            message_id = ?message.id,
                            reason = expansion.reason(),
                            "message has no items"
                        ),
                    }
                    metrics::counter!(MESSAGES_REJECTED, "reason" => expansion.reason())
                        .increment(1);
                    rejected.push(Rejected {
                        message_id: message.id.clone(),
                        expansion,
                    });
                }
            }
        }

        if staged.is_empty() {
            debug!(received, "no rows staged, skipping commit");
            return Ok(BatchOutcome::NothingStaged { received, rejected });
        }

        let staged_rows = staged.len();
        let started = tokio::time::Instant::now();
        let committed = self.sink.commit(&staged).await;
        metrics::histogram!(COMMIT_DURATION).record(started.elapsed().as_secs_f64());

        if let Err(error) = committed {
            error!(
                rows = staged_rows,
                messages = handles.len(),
                "failed to commit batch, leaving messages for redelivery: {}",
                error
            );
            metrics::counter!(COMMIT_FAILURES).increment(1);
            return Ok(BatchOutcome::RolledBack {
                received,
                staged_rows,
                error,
                rejected,
            });
        }

        metrics::counter!(ROWS_COMMITTED).increment(staged_rows as u64);
        metrics::histogram!(BATCH_ROWS).record(staged_rows as f64);

        let acknowledged = self.acknowledge(&handles).await;
        info!(
            rows = staged_rows,
            messages = handles.len(),
            acknowledged,
            rejected = rejected.len(),
            "committed batch"
        );

        Ok(BatchOutcome::Committed {
            received,
            rows: staged_rows,
            acknowledged,
            rejected,
        })
    }

    /// Acknowledge committed messages one by one. A failed acknowledgment only
    /// means a duplicate later, so it does not stop the others.
    async fn acknowledge(&self, handles: &[&AckHandle]) -> usize {
        let mut acknowledged = 0;
        for handle in handles {
            match self.queue.acknowledge(handle).await {
                Ok(()) => acknowledged += 1,
                Err(error) => {
                    warn!("failed to acknowledge committed message: {}", error);
                    metrics::counter!(ACKNOWLEDGE_FAILURES).increment(1);
                }
            }
        }
        metrics::counter!(MESSAGES_ACKNOWLEDGED).increment(acknowledged as u64);
        acknowledged
    }

    /// Process batches until one commits no rows.
    pub async fn drain(&self) -> Result<DrainSummary, WorkerError> {
        let mut summary = DrainSummary::default();
        loop {
            let outcome = self.process_batch().await?;
            self.liveness.report_healthy().await;

            let rows = outcome.rows_committed();
            if rows == 0 {
                return Ok(summary);
            }
            summary.batches += 1;
            summary.rows += rows;
        }
    }

    /// Drain, then wait `poll_interval`, forever.
    pub async fn run(&self) {
        loop {
            match self.drain().await {
                Ok(summary) if summary.rows > 0 => info!(
                    batches = summary.batches,
                    rows = summary.rows,
                    "drained queue"
                ),
                Ok(_) => debug!("queue empty"),
                Err(error) => {
                    error!("drain failed: {}", error);
                    metrics::counter!(RECEIVE_FAILURES).increment(1);
                }
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use health::HealthRegistry;
    use ingest_common::expand::{InvalidReason, SkipReason};
    use ingest_common::normalize::NormalizeError;
    use ingest_common::queue::{MockQueue, QueueError};
    use ingest_common::sink::MemorySink;
    use serde_json::json;

    async fn liveness() -> HealthHandle {
        HealthRegistry::new("liveness")
            .register("drain".to_owned(), ::time::Duration::seconds(30))
            .await
    }

    async fn worker<'p>(
        queue: &'p MockQueue,
        sink: &'p MemorySink,
        batch_size: i32,
    ) -> BatchWorker<'p, MockQueue, MemorySink> {
        BatchWorker::new(
            queue,
            sink,
            batch_size,
            0,
            time::Duration::from_millis(10),
            liveness().await,
        )
    }

    fn purchase(user_id: &str, product_ids: &[&str]) -> String {
        let items: Vec<serde_json::Value> = product_ids
            .iter()
            .map(|id| json!({"item_id": id, "item_name": format!("Product {id}"), "price": 9.5}))
            .collect();
        json!({
            "event_timestamp": 1_700_000_000_000_000_i64,
            "user_id": user_id,
            "event_name": "purchase",
            "platform": "ios",
            "items": items,
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_malformed_message_is_not_acknowledged() {
        let queue = MockQueue::new();
        let sink = MemorySink::new();
        let first = queue.push(purchase("u-1", &["A"])).await;
        let malformed = queue.push("{not json").await;
        let third = queue.push(purchase("u-3", &["C"])).await;

        let outcome = worker(&queue, &sink, 10).await.process_batch().await.unwrap();

        match &outcome {
            BatchOutcome::Committed {
                received,
                rows,
                acknowledged,
                rejected,
            } => {
                assert_eq!(*received, 3);
                assert_eq!(*rows, 2);
                assert_eq!(*acknowledged, 2);
                assert_eq!(rejected.len(), 1);
                assert_eq!(rejected[0].message_id.as_ref(), Some(&malformed));
                assert!(matches!(
                    rejected[0].expansion,
                    Expansion::Invalid(InvalidReason::Payload(NormalizeError::Malformed(_)))
                ));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(queue.acknowledged().await, vec![first, third]);
        assert_eq!(queue.in_flight().await, vec![malformed]);

        let rows = sink.rows().await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].user_id.as_deref(), Some("u-1"));
        assert_eq!(rows[1].product_id.as_deref(), Some("C"));
    }

    #[tokio::test]
    async fn test_rows_from_every_item_share_one_commit() {
        let queue = MockQueue::new();
        let sink = MemorySink::new();
        queue.push(purchase("u-1", &["A", "B", "C"])).await;
        queue.push(purchase("u-2", &["D"])).await;

        let outcome = worker(&queue, &sink, 10).await.process_batch().await.unwrap();

        assert_eq!(outcome.rows_committed(), 4);
        assert_eq!(sink.commits().await, 1);
        assert_eq!(queue.acknowledged().await.len(), 2);
    }

    #[tokio::test]
    async fn test_commit_failure_acknowledges_nothing() {
        let queue = MockQueue::new();
        let sink = MemorySink::new();
        for user in ["u-1", "u-2", "u-3"] {
            queue.push(purchase(user, &["A"])).await;
        }
        let worker = worker(&queue, &sink, 10).await;

        sink.fail_commits(Some("connection reset")).await;
        let outcome = worker.process_batch().await.unwrap();

        assert!(matches!(
            outcome,
            BatchOutcome::RolledBack {
                received: 3,
                staged_rows: 3,
                error: SinkError::Unavailable(_),
                ..
            }
        ));
        assert!(queue.acknowledged().await.is_empty());
        assert_eq!(queue.in_flight().await.len(), 3);
        assert!(sink.rows().await.is_empty());

        // Redelivered after the visibility timeout, and written once the sink recovers.
        sink.fail_commits(None).await;
        queue.expire_visibility().await;
        let retried = worker.process_batch().await.unwrap();

        assert_eq!(retried.rows_committed(), 3);
        assert_eq!(queue.acknowledged().await.len(), 3);
        assert!(queue.in_flight().await.is_empty());
    }

    #[tokio::test]
    async fn test_empty_queue() {
        let queue = MockQueue::new();
        let sink = MemorySink::new();

        let outcome = worker(&queue, &sink, 10).await.process_batch().await.unwrap();

        assert!(matches!(outcome, BatchOutcome::Empty));
        assert_eq!(outcome.rows_committed(), 0);
        assert_eq!(sink.commits().await, 0);
    }

    #[tokio::test]
    async fn test_batch_without_rows_skips_commit() {
        let queue = MockQueue::new();
        let sink = MemorySink::new();
        let no_items = queue
            .push(json!({"event_timestamp": 1_700_000_000, "user_id": "u-1"}).to_string())
            .await;
        let no_timestamp = queue
            .push(json!({"user_id": "u-2", "items": [{"item_id": "A"}]}).to_string())
            .await;

        let outcome = worker(&queue, &sink, 10).await.process_batch().await.unwrap();

        match &outcome {
            BatchOutcome::NothingStaged { received, rejected } => {
                assert_eq!(*received, 2);
                assert!(matches!(
                    rejected[0].expansion,
                    Expansion::Skipped(SkipReason::ItemsMissing)
                ));
                assert!(matches!(
                    rejected[1].expansion,
                    Expansion::Invalid(InvalidReason::MissingTimestamp)
                ));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(sink.commits().await, 0);
        assert_eq!(queue.in_flight().await, vec![no_items, no_timestamp]);
    }

    #[tokio::test]
    async fn test_acknowledge_failure_keeps_rows_committed() {
        let queue = MockQueue::new();
        let sink = MemorySink::new();
        queue.push(purchase("u-1", &["A", "B"])).await;
        queue.fail_acknowledge(true).await;

        let outcome = worker(&queue, &sink, 10).await.process_batch().await.unwrap();

        assert!(matches!(
            outcome,
            BatchOutcome::Committed {
                rows: 2,
                acknowledged: 0,
                ..
            }
        ));
        assert_eq!(sink.rows().await.len(), 2);
        assert_eq!(queue.in_flight().await.len(), 1);
    }

    #[tokio::test]
    async fn test_receive_failure_is_an_error() {
        let queue = MockQueue::new();
        let sink = MemorySink::new();
        queue.push(purchase("u-1", &["A"])).await;
        queue
            .fail_receive(Some(QueueError::ReceiveError("throttled".to_owned())))
            .await;

        let result = worker(&queue, &sink, 10).await.process_batch().await;

        assert!(matches!(
            result,
            Err(WorkerError::QueueError(QueueError::ReceiveError(_)))
        ));
        assert_eq!(sink.commits().await, 0);
    }

    #[tokio::test]
    async fn test_drain_until_no_rows() {
        let queue = MockQueue::new();
        let sink = MemorySink::new();
        for i in 0..25 {
            queue.push(purchase(&format!("u-{i}"), &["A"])).await;
        }

        let summary = worker(&queue, &sink, 10).await.drain().await.unwrap();

        assert_eq!(summary, DrainSummary { batches: 3, rows: 25 });
        assert_eq!(queue.acknowledged().await.len(), 25);
        assert_eq!(sink.commits().await, 3);
    }

    #[tokio::test]
    async fn test_drain_stops_at_rollback() {
        let queue = MockQueue::new();
        let sink = MemorySink::new();
        for i in 0..3 {
            queue.push(purchase(&format!("u-{i}"), &["A"])).await;
        }
        sink.fail_commits(Some("read only")).await;

        let summary = worker(&queue, &sink, 2).await.drain().await.unwrap();

        assert_eq!(summary, DrainSummary::default());
        assert_eq!(queue.in_flight().await.len(), 2);
    }
}
