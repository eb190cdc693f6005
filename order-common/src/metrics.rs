//! The status server every order service runs next to its main loop:
//! Prometheus scraping plus the liveness and readiness probes.
use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    routing::get, Router,
};
use health::HealthRegistry;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use tokio_util::sync::CancellationToken;

const LATENCY_SECONDS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];
const BATCH_SIZES: &[f64] = &[1.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0];

/// Install the global Prometheus recorder. Must run once, before the first
/// metric is recorded; a second install is a startup bug.
pub fn setup_metrics_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .set_buckets(LATENCY_SECONDS)
        .expect("invalid latency buckets")
        .set_buckets_for_metric(
            Matcher::Full("order_pipeline_batch_size".to_owned()),
            BATCH_SIZES,
        )
        .expect("invalid batch size buckets")
        .install_recorder()
        .expect("failed to install metrics recorder")
}

/// Routes for `/`, `/_liveness`, `/_readiness` and `/metrics`. Readiness only
/// says the process is up and serving.
pub fn status_router(
    service: &'static str,
    liveness: HealthRegistry,
    recorder: PrometheusHandle,
) -> Router {
    Router::new()
        .route("/", get(move || std::future::ready(service)))
        .route("/_readiness", get(move || std::future::ready(service)))
        .route(
            "/_liveness",
            get(move || std::future::ready(liveness.get_status())),
        )
        .route("/metrics", get(move || std::future::ready(recorder.render())))
        .layer(axum::middleware::from_fn(track_metrics))
}

/// Serve `router` on `bind` until `shutdown` is cancelled.
pub async fn serve(
    router: Router,
    bind: &str,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

/// Request counter and latency histogram, labelled by route template.
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = match req.extensions().get::<MatchedPath>() {
        Some(matched_path) => matched_path.as_str().to_owned(),
        None => req.uri().path().to_owned(),
    };
    let method = req.method().to_string();

    let response = next.run(req).await;

    let labels = [
        ("method", method),
        ("path", path),
        ("status", response.status().as_u16().to_string()),
    ];
    metrics::counter!("order_http_requests_total", &labels).increment(1);
    metrics::histogram!("order_http_request_duration_seconds", &labels)
        .record(start.elapsed().as_secs_f64());

    response
}
