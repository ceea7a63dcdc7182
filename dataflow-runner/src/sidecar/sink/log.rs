//! Log sink.

use anyhow::Result;
use async_trait::async_trait;

use crate::sidecar::sink::Sink;
use dataflow_core::connector::LogSink as LogSinkSpec;
use dataflow_core::meta::Meta;

pub struct LogSink {
    name: String,
    truncate: Option<usize>,
}

impl LogSink {
    /// Create a new instance.
    pub fn new(name: &str, spec: &LogSinkSpec) -> Self {
        Self {
            name: name.to_string(),
            truncate: spec.truncate.map(|t| t as usize),
        }
    }
}

#[async_trait]
impl Sink for LogSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn sink(&self, meta: &Meta, data: &[u8]) -> Result<()> {
        let data = match self.truncate {
            Some(limit) if data.len() > limit => &data[..limit],
            _ => data,
        };
        tracing::info!(
            sink = %self.name,
            source = %meta.source,
            id = %meta.id,
            time = %meta.time,
            msg = %String::from_utf8_lossy(data),
            "message",
        );
        Ok(())
    }
}
