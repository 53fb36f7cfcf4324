//! Drain analytics events from an SQS queue into the `fact_events` table.
use aws_config::retry::RetryConfig;
use aws_config::timeout::TimeoutConfig;
use aws_config::{BehaviorVersion, Region};
use envconfig::Envconfig;
use eyre::{Result, WrapErr};
use futures::future::{select, Either};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use health::HealthRegistry;
use ingest_common::{
    metrics::{serve, setup_metrics_recorder},
    queue::SqsQueue,
    sink::{PgSink, DEFAULT_TABLE},
};
use ingest_worker::config::{Config, SqsConfig};
use ingest_worker::handlers::app;
use ingest_worker::worker::BatchWorker;

async fn sqs_client(config: &SqsConfig) -> aws_sdk_sqs::Client {
    let timeouts = TimeoutConfig::builder()
        .connect_timeout(config.connect_timeout.0)
        .read_timeout(config.read_timeout.0)
        .build();

    let mut loader = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(config.region.clone()))
        .timeout_config(timeouts)
        .retry_config(RetryConfig::standard().with_max_attempts(config.max_attempts));
    if let Some(endpoint_url) = &config.endpoint_url {
        loader = loader.endpoint_url(endpoint_url);
    }

    aws_sdk_sqs::Client::new(&loader.load().await)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::init_from_env().wrap_err("invalid configuration")?;

    let sink = PgSink::new(
        DEFAULT_TABLE,
        &config.database_url,
        config.max_pg_connections,
        config.pg_acquire_timeout.0,
        config.commit_timeout.0,
    )
    .await
    .wrap_err("failed to connect to postgres")?;

    if config.run_migrations {
        sqlx::migrate!("../migrations")
            .run(sink.pool())
            .await
            .wrap_err("failed to run migrations")?;
    }

    let queue = SqsQueue::new(sqs_client(&config.sqs).await, config.queue_url.as_str());

    let liveness = HealthRegistry::new("liveness");
    let deadline = time::Duration::try_from(config.liveness_deadline.0)
        .wrap_err("invalid liveness deadline")?;
    let worker_liveness = liveness.register("drain".to_owned(), deadline).await;

    let worker = BatchWorker::new(
        &queue,
        &sink,
        config.batch_size.get(),
        config.receive_wait_seconds.get(),
        config.poll_interval.0,
        worker_liveness,
    );

    let recorder_handle = setup_metrics_recorder().wrap_err("failed to install metrics recorder")?;
    let router = app(Some(recorder_handle), liveness);
    let bind = config.bind();

    info!(
        queue_url = config.queue_url.as_str(),
        bind = %bind,
        batch_size = config.batch_size.get(),
        "starting ingest worker"
    );

    let http_server = Box::pin(serve(router, &bind));
    let worker_loop = Box::pin(worker.run());

    match select(http_server, worker_loop).await {
        Either::Left((listen_result, _)) => {
            listen_result.wrap_err("http server failed")?;
            error!("http server exited");
        }
        Either::Right((_, _)) => error!("worker loop exited"),
    }

    Ok(())
}
