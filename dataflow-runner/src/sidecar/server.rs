//! The sidecar HTTP interface.
//!
//! Serves on the fixed sidecar port: the readiness probe, the pre-stop hook
//! used by the kubelet, the egress `/messages` route for the main container,
//! and one authenticated ingress route per HTTP source. TLS provisioning is
//! an external concern; the listener speaks plain HTTP on the fixed port.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use axum::body::Bytes;
use axum::extract::{Extension, Path};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::{routing::get, routing::post, AddExtensionLayer, Router};
use futures::prelude::*;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::sidecar::hooks::PreStopHooks;
use crate::sidecar::sink::FanOutSink;
use crate::sidecar::source::HttpSourceHandler;
use dataflow_core::meta::Meta;
use dataflow_core::PORT_SIDECAR;

/// The URN attached to egress messages which arrive without metadata.
const URN_HTTP_OUT: &str = "urn:dataflow:http:out";

/// Shared state of the sidecar server.
pub struct ServerState {
    pub fan_out: Arc<FanOutSink>,
    pub http_sources: HashMap<String, HttpSourceHandler>,
    pub hooks: Arc<PreStopHooks>,
    pub metrics: PrometheusHandle,
}

/// Spawn the sidecar HTTP server.
pub fn spawn_server(state: Arc<ServerState>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<Result<()>> {
    let app = Router::new()
        .route("/ready", get(ready))
        .route("/pre-stop", get(pre_stop))
        .route("/messages", post(messages))
        .route("/sources/:source", post(source_ingress))
        .route("/metrics", get(prometheus_scrape))
        .layer(AddExtensionLayer::new(state));
    let server = axum::Server::bind(&([0, 0, 0, 0], PORT_SIDECAR).into())
        .serve(app.into_make_service())
        .with_graceful_shutdown(async move {
            let _res = shutdown.recv().await;
        });
    tracing::info!("sidecar server is listening at 0.0.0.0:{}", PORT_SIDECAR);
    tokio::spawn(server.map_err(anyhow::Error::from))
}

/// Handle readiness probes.
async fn ready() -> StatusCode {
    StatusCode::OK
}

/// Handle Prometheus metrics scraping.
async fn prometheus_scrape(Extension(state): Extension<Arc<ServerState>>) -> String {
    state.metrics.render()
}

/// Handle the kubelet's pre-stop hook: close sources, then sinks, in LIFO order.
async fn pre_stop(Extension(state): Extension<Arc<ServerState>>) -> StatusCode {
    tracing::info!("pre-stop requested");
    state.hooks.run().await;
    StatusCode::OK
}

/// Handle an egress message from the main container.
async fn messages(Extension(state): Extension<Arc<ServerState>>, headers: HeaderMap, body: Bytes) -> StatusCode {
    let meta = Meta::extract(&headers).unwrap_or_else(|_err| Meta::new(URN_HTTP_OUT, uuid::Uuid::new_v4().to_string(), chrono::Utc::now()));
    match state.fan_out.sink(&meta, &body).await {
        Ok(()) => StatusCode::OK,
        Err(err) => {
            tracing::error!(error = ?err, "failed to send message from main to sink");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Handle an ingress message for an HTTP source.
async fn source_ingress(
    Extension(state): Extension<Arc<ServerState>>,
    Path(source): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let handler = match state.http_sources.get(&source) {
        Some(handler) => handler,
        None => return StatusCode::NOT_FOUND,
    };
    let authorized = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(|value| value == handler.authorization)
        .unwrap_or(false);
    if !authorized {
        return StatusCode::UNAUTHORIZED;
    }
    let meta = Meta::extract(&headers)
        .unwrap_or_else(|_err| Meta::new(handler.urn.clone(), uuid::Uuid::new_v4().to_string(), chrono::Utc::now()));
    match (handler.process)(meta, body.to_vec()).await {
        Ok(()) => StatusCode::OK,
        Err(err) => {
            tracing::error!(error = ?err, source = %source, "failed to process message");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
