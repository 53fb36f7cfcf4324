use axum::{routing, Router};
use health::HealthRegistry;
use metrics_exporter_prometheus::PrometheusHandle;

pub fn app(metrics: Option<PrometheusHandle>, liveness: HealthRegistry) -> Router {
    Router::new()
        .route("/", routing::get(index))
        .route(
            "/_liveness",
            routing::get(move || std::future::ready(liveness.get_status())),
        )
        .route(
            "/metrics",
            routing::get(move || match metrics {
                Some(ref recorder_handle) => std::future::ready(recorder_handle.render()),
                None => std::future::ready("no metrics recorder installed".to_owned()),
            }),
        )
}

pub async fn index() -> &'static str {
    "ingest worker"
}
