//! Sink adapters.
//!
//! Sinks are constructed at startup and combined into a single fan-out sink.
//! The fan-out is synchronous and all-or-nothing per message: the first sink
//! error aborts the write, leaving the message uncommitted upstream.

mod http;
mod kafka;
mod log;

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::sidecar::hooks::PreStopHooks;
use crate::sidecar::status::{ConnectorKind, StatusRegistry};
use dataflow_core::crd::StepSpec;
use dataflow_core::connector::SinkBackend;
use dataflow_core::meta::Meta;

/// A single egress connector.
#[async_trait]
pub trait Sink: Send + Sync {
    /// The declared name of this sink.
    fn name(&self) -> &str;

    /// Write one message.
    async fn sink(&self, meta: &Meta, data: &[u8]) -> Result<()>;

    /// Release any resources held by this sink.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// The combined sink fed by the egress bridges.
pub struct FanOutSink {
    sinks: Vec<Arc<dyn Sink>>,
    status: Arc<StatusRegistry>,
}

impl FanOutSink {
    /// Write one message to every sink, stopping at the first failure.
    pub async fn sink(&self, meta: &Meta, data: &[u8]) -> Result<()> {
        for sink in self.sinks.iter() {
            self.status.incr_total(ConnectorKind::Sink, sink.name(), data.len() as u64, data);
            if let Err(err) = sink.sink(meta, data).await {
                self.status.incr_error(ConnectorKind::Sink, sink.name(), &err.to_string());
                return Err(err).with_context(|| format!("error writing message to sink {}", sink.name()));
            }
        }
        Ok(())
    }
}

/// Construct all sinks of the given spec and combine them into a fan-out.
///
/// A close hook is registered per sink; sources register later, so LIFO
/// ordering closes every source before the first sink.
pub async fn connect_sinks(spec: &StepSpec, status: Arc<StatusRegistry>, hooks: &PreStopHooks) -> Result<FanOutSink> {
    let mut sinks: Vec<Arc<dyn Sink>> = vec![];
    for sink_spec in spec.sinks.iter() {
        tracing::info!(sink = %sink_spec.name, "connecting sink");
        let sink: Arc<dyn Sink> = match &sink_spec.backend {
            SinkBackend::Kafka(kafka_spec) => Arc::new(kafka::KafkaSink::new(&sink_spec.name, kafka_spec)?),
            SinkBackend::Http(http_spec) => Arc::new(http::HttpSink::new(&sink_spec.name, http_spec)?),
            SinkBackend::Log(log_spec) => Arc::new(log::LogSink::new(&sink_spec.name, log_spec)),
        };
        let hook_sink = sink.clone();
        hooks
            .push(format!("sink/{}", sink_spec.name), Box::pin(async move { hook_sink.close().await }))
            .await;
        sinks.push(sink);
    }
    Ok(FanOutSink { sinks, status })
}
