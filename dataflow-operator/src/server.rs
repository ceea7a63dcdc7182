//! The operator's HTTP surface.
//!
//! One small server per operator pod: a liveness probe and the Prometheus
//! render of the global recorder. Reconciliation itself has no inbound API;
//! everything else flows through the Kubernetes watch streams.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::Extension;
use axum::http::StatusCode;
use axum::{routing::get, AddExtensionLayer, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::Config;

/// The operator's HTTP server, exposing liveness & metrics.
pub struct AppServer {
    /// The application's runtime config.
    config: Arc<Config>,
    /// A handle to the global Prometheus recorder.
    metrics: PrometheusHandle,
    /// A channel used for triggering graceful shutdown.
    shutdown: broadcast::Sender<()>,
}

impl AppServer {
    /// Create a new instance.
    pub fn new(config: Arc<Config>, metrics: PrometheusHandle, shutdown: broadcast::Sender<()>) -> Self {
        Self { config, metrics, shutdown }
    }

    /// Spawn this server.
    pub fn spawn(self) -> JoinHandle<Result<()>> {
        let mut shutdown_rx = self.shutdown.subscribe();
        let app = Router::new()
            .route("/healthz", get(healthz))
            .route("/metrics", get(metrics_render))
            .layer(AddExtensionLayer::new(self.metrics));
        let addr = ([0, 0, 0, 0], self.config.metrics_port).into();
        tracing::info!(%addr, "operator http server starting");
        tokio::spawn(async move {
            axum::Server::bind(&addr)
                .serve(app.into_make_service())
                .with_graceful_shutdown(async move {
                    let _res = shutdown_rx.recv().await;
                })
                .await
                .context("error running operator http server")
        })
    }
}

/// Handle liveness probes.
async fn healthz() -> StatusCode {
    StatusCode::OK
}

/// Handle Prometheus metrics scraping.
async fn metrics_render(Extension(metrics): Extension<PrometheusHandle>) -> String {
    metrics.render()
}
