//! Source adapters.
//!
//! Sources deliver messages into the step's process callback, which wraps
//! the ingress bridge in the retry engine. Every source exposes `close`;
//! sources which can report backlog additionally expose a pending handle,
//! sampled on the lead replica only.

mod cron;
mod http;
mod kafka;

pub use http::HttpSourceHandler;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use rand::Rng;
use tokio::sync::broadcast;

use crate::config::Config;
use crate::sidecar::bridge::MainBridge;
use crate::sidecar::hooks::PreStopHooks;
use crate::sidecar::monitor::Monitor;
use crate::sidecar::retry::{RetryError, RetryPolicy};
use crate::sidecar::status::{ConnectorKind, StatusRegistry};
use dataflow_core::backoff::Backoff;
use dataflow_core::connector::SourceBackend;
use dataflow_core::crd::StepSpec;
use dataflow_core::meta::Meta;

/// The timeout applied to pending queries.
const PENDING_TIMEOUT: Duration = Duration::from_secs(3);

/// The process callback invoked by a source for each message.
pub type Process = Arc<dyn Fn(Meta, Vec<u8>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A single ingress connector.
#[async_trait]
pub trait Source: Send + Sync {
    /// The declared name of this source.
    fn name(&self) -> &str;

    /// Release broker resources, draining any in-flight consumers.
    async fn close(&self) -> Result<()>;

    /// The backlog-reporting capability of this source, if any.
    fn pending_handle(&self) -> Option<Arc<dyn HasPending>> {
        None
    }
}

/// The optional backlog-reporting capability of a source.
#[async_trait]
pub trait HasPending: Send + Sync {
    /// The number of messages available but not yet committed by this consumer group.
    async fn get_pending(&self) -> Result<u64>;
}

/// Construct all sources of the given spec.
///
/// Each source's callback is wrapped in the retry engine; close hooks are
/// registered after the sinks so that LIFO shutdown stops ingress first.
/// Returns the route handlers of any HTTP sources for the sidecar server.
#[allow(clippy::too_many_arguments)]
pub async fn connect_sources(
    config: &Arc<Config>,
    spec: &StepSpec,
    mut tokens: HashMap<String, String>,
    status: Arc<StatusRegistry>,
    monitor: Arc<Monitor>,
    hooks: Arc<PreStopHooks>,
    to_main: Arc<MainBridge>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<HashMap<String, HttpSourceHandler>> {
    let mut routes = HashMap::new();
    for source_spec in spec.sources.iter() {
        let source_name = source_spec.name.clone();
        let urn = source_spec.urn(&config.namespace, &config.pipeline_name, &spec.name);
        tracing::info!(source = %source_name, urn = %urn, "connecting source");
        let process = process_with_retry(&source_name, source_spec.retry.clone(), status.clone(), to_main.clone(), shutdown_tx.clone());

        let source: Arc<dyn Source> = match &source_spec.backend {
            SourceBackend::Kafka(kafka_spec) => {
                Arc::new(kafka::KafkaSource::new(config, &source_name, &urn, &spec.name, kafka_spec, monitor.clone(), process).await?)
            }
            SourceBackend::Http(_http_spec) => {
                let token = tokens
                    .remove(&source_name)
                    .with_context(|| format!("no bearer token generated for http source {}", source_name))?;
                let (source, handler) = http::HttpSource::new(&source_name, &urn, token, process);
                routes.insert(source_name.clone(), handler);
                Arc::new(source)
            }
            SourceBackend::Cron(cron_spec) => Arc::new(cron::CronSource::new(&source_name, &urn, cron_spec, process)?),
        };

        let hook_source = source.clone();
        hooks
            .push(format!("source/{}", source_name), Box::pin(async move { hook_source.close().await }))
            .await;

        // Pending is authoritative only on the lead replica; followers never sample it.
        if config.lead_replica() {
            if let Some(pending) = source.pending_handle() {
                spawn_pending_sampler(config, source_name, pending, status.clone(), shutdown_tx.clone())?;
            }
        }
    }
    Ok(routes)
}

/// Wrap the ingress bridge in the retry engine & status accounting for one source.
fn process_with_retry(
    source_name: &str,
    backoff: Backoff,
    status: Arc<StatusRegistry>,
    to_main: Arc<MainBridge>,
    shutdown_tx: broadcast::Sender<()>,
) -> Process {
    let source_name = source_name.to_string();
    Arc::new(move |meta: Meta, data: Vec<u8>| {
        let source_name = source_name.clone();
        let policy = RetryPolicy::new(backoff.clone());
        let status = status.clone();
        let to_main = to_main.clone();
        let mut shutdown = shutdown_tx.subscribe();
        Box::pin(async move {
            status.incr_total(ConnectorKind::Source, &source_name, data.len() as u64, &data);
            let attempt_meta = meta;
            let attempt_data = data;
            let outcome = policy
                .execute(&mut shutdown, move || {
                    let to_main = to_main.clone();
                    let meta = attempt_meta.clone();
                    let data = attempt_data.clone();
                    Box::pin(async move { to_main.send(&meta, &data).await })
                })
                .await;
            match outcome {
                Ok(retries) => {
                    status.incr_source_retries(&source_name, retries);
                    Ok(())
                }
                Err(RetryError::Canceled) => Err(RetryError::Canceled.into()),
                Err(RetryError::Exhausted { attempts, last }) => {
                    status.incr_source_retries(&source_name, attempts.saturating_sub(1));
                    status.incr_error(ConnectorKind::Source, &source_name, &last.to_string());
                    Err(last)
                }
            }
        })
    })
}

/// Spawn the pending sampler loop of one source on the lead replica.
fn spawn_pending_sampler(
    config: &Arc<Config>,
    source_name: String,
    pending: Arc<dyn HasPending>,
    status: Arc<StatusRegistry>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<()> {
    let interval = config.update_interval()?;
    let mut shutdown = shutdown_tx.subscribe();
    tokio::spawn(async move {
        loop {
            // 20% jitter keeps replicas of different steps from sampling in lockstep.
            let spread = rand::thread_rng().gen_range(-0.2..=0.2);
            tokio::select! {
                _ = tokio::time::sleep(interval.mul_f64(1.0 + spread)) => (),
                _ = shutdown.recv() => return,
            }
            match tokio::time::timeout(PENDING_TIMEOUT, pending.get_pending()).await {
                Ok(Ok(count)) => {
                    tracing::debug!(source = %source_name, pending = count, "sampled pending");
                    status.set_pending(&source_name, count);
                }
                Ok(Err(err)) => tracing::error!(error = ?err, source = %source_name, "error sampling pending"),
                Err(_elapsed) => tracing::error!(source = %source_name, "pending query timed out"),
            }
        }
    });
    Ok(())
}
