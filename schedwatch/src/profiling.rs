//! On-demand CPU profiles of the collector itself.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use axum::Router;
use axum::extract::Query;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use log::{error, info};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const DEFAULT_PROFILE_SECONDS: u64 = 30;
const MAX_PROFILE_SECONDS: u64 = 300;
const SAMPLE_FREQUENCY: i32 = 100;

#[derive(Debug, Deserialize)]
struct ProfileQuery {
    seconds: Option<u64>,
}

impl ProfileQuery {
    fn duration(&self) -> Duration {
        let seconds = self
            .seconds
            .unwrap_or(DEFAULT_PROFILE_SECONDS)
            .clamp(1, MAX_PROFILE_SECONDS);
        Duration::from_secs(seconds)
    }
}

pub fn router() -> Router {
    Router::new()
        .route("/debug/pprof/profile", get(profile_handler))
        .route("/debug/pprof/flamegraph", get(flamegraph_handler))
}

pub async fn serve(addr: &str, cancel: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("listening on {addr}"))?;
    info!("pprof server listening on {}", addr);

    axum::serve(listener, router())
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("pprof server")
}

fn collect(duration: Duration) -> Result<pprof::Report> {
    let guard = pprof::ProfilerGuardBuilder::default()
        .frequency(SAMPLE_FREQUENCY)
        .build()
        .map_err(|e| anyhow!("building profiler: {e}"))?;

    std::thread::sleep(duration);

    guard
        .report()
        .build()
        .map_err(|e| anyhow!("building report: {e}"))
}

fn respond(
    result: Result<Result<Vec<u8>>, tokio::task::JoinError>,
    content_type: &'static str,
) -> Response {
    match result {
        Ok(Ok(body)) => {
            (StatusCode::OK, [(header::CONTENT_TYPE, content_type)], body).into_response()
        }
        Ok(Err(e)) => {
            error!("pprof: {:#}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
        Err(e) => {
            error!("pprof task failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "task failed").into_response()
        }
    }
}

async fn profile_handler(Query(query): Query<ProfileQuery>) -> Response {
    let duration = query.duration();
    let result = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
        use pprof::protos::Message;

        let profile = collect(duration)?
            .pprof()
            .map_err(|e| anyhow!("generating pprof: {e}"))?;
        let mut buf = Vec::with_capacity(profile.encoded_len());
        profile
            .encode(&mut buf)
            .map_err(|e| anyhow!("encoding protobuf: {e}"))?;
        Ok(buf)
    })
    .await;

    respond(result, "application/octet-stream")
}

async fn flamegraph_handler(Query(query): Query<ProfileQuery>) -> Response {
    let duration = query.duration();
    let result = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
        let mut body = Vec::new();
        collect(duration)?
            .flamegraph(&mut body)
            .map_err(|e| anyhow!("generating flamegraph: {e}"))?;
        Ok(body)
    })
    .await;

    respond(result, "image/svg+xml")
}
