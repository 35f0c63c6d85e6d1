//! Scrape endpoint: `GET /metrics` and `GET /healthz`.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use log::{error, info};
use prometheus::TEXT_FORMAT;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::exporter::SchedExporter;
use crate::probes::Tracing;

struct AppState {
    exporter: Arc<SchedExporter>,
    tracing: Arc<Tracing>,
}

pub fn router(exporter: Arc<SchedExporter>, tracing: Arc<Tracing>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(Arc::new(AppState { exporter, tracing }))
}

/// Serve until `cancel` fires.
pub async fn serve(
    addr: &str,
    exporter: Arc<SchedExporter>,
    tracing: Arc<Tracing>,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("listening on {addr}"))?;
    info!(
        "Metrics server listening on {}",
        listener.local_addr().context("getting local address")?
    );

    axum::serve(listener, router(exporter, tracing))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("metrics server")
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.exporter.render() {
        Ok(text) => (StatusCode::OK, [(header::CONTENT_TYPE, TEXT_FORMAT)], text).into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "encoding error").into_response()
        }
    }
}

async fn healthz_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.tracing.have_tracing() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "no tracepoints attached")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SchedCache;
    use crate::decode::SchedLatencyEvent;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    fn app(cache: Arc<SchedCache>) -> Router {
        let exporter = Arc::new(SchedExporter::new(cache).unwrap());
        router(exporter, Arc::new(Tracing::new()))
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let cache = Arc::new(SchedCache::new());
        cache.update(&SchedLatencyEvent {
            pid: 42,
            tid: 42,
            delay_ns: 1_000,
            ts: 1,
            preempted_pid: 0,
            preempted_comm: String::new(),
            is_preempt: false,
            comm: "sshd".to_string(),
        });

        let response = app(cache)
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains(r#"sched_latencies{comm="sshd",pid="42"} 1000"#), "{text}");
    }

    #[tokio::test]
    async fn test_healthz_without_links_is_unavailable() {
        let response = app(Arc::new(SchedCache::new()))
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_unknown_path() {
        let response = app(Arc::new(SchedCache::new()))
            .oneshot(Request::get("/debug/vars").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
