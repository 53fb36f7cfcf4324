use axum::Router;
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

pub const BATCHES_TOTAL: &str = "ingest_batches_total";
pub const MESSAGES_RECEIVED: &str = "ingest_messages_received_total";
pub const MESSAGES_REJECTED: &str = "ingest_messages_rejected_total";
pub const MESSAGES_ACKNOWLEDGED: &str = "ingest_messages_acknowledged_total";
pub const ACKNOWLEDGE_FAILURES: &str = "ingest_acknowledge_failures_total";
pub const ROWS_COMMITTED: &str = "ingest_rows_committed_total";
pub const COMMIT_FAILURES: &str = "ingest_commit_failures_total";
pub const RECEIVE_FAILURES: &str = "ingest_receive_failures_total";
pub const COMMIT_DURATION: &str = "ingest_commit_duration_seconds";
pub const BATCH_ROWS: &str = "ingest_batch_rows";

/// Bind a `TcpListener` on the provided bind address to serve a `Router` on it.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

/// Install the global Prometheus recorder. Can only succeed once per process.
pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];
    const ROW_COUNTS: &[f64] = &[1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0];

    PrometheusBuilder::new()
        .set_buckets(EXPONENTIAL_SECONDS)?
        .set_buckets_for_metric(Matcher::Full(BATCH_ROWS.to_owned()), ROW_COUNTS)?
        .install_recorder()
}
