//! Kafka sink.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;

use crate::sidecar::sink::Sink;
use dataflow_core::connector::KafkaSink as KafkaSinkSpec;
use dataflow_core::meta::Meta;

pub struct KafkaSink {
    name: String,
    topic: String,
    send_async: bool,
    message_timeout: Duration,
    producer: FutureProducer,
}

impl KafkaSink {
    /// Create a new instance, establishing the broker connection.
    pub fn new(name: &str, spec: &KafkaSinkSpec) -> Result<Self> {
        let url = spec.url.as_deref().context("kafka sink has no broker url, set one or create the broker secret")?;
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", url)
            .set("acks", spec.acks.as_str())
            .set("linger.ms", spec.linger_ms().to_string())
            .set("message.timeout.ms", spec.message_timeout_ms.to_string())
            .set("enable.idempotence", "true")
            .set("compression.type", "lz4")
            .create()
            .context("error creating kafka producer")?;
        tracing::info!(sink = %name, url = %url, topic = %spec.topic, "connected kafka sink");
        Ok(Self {
            name: name.to_string(),
            topic: spec.topic.clone(),
            send_async: spec.send_async,
            message_timeout: Duration::from_millis(spec.message_timeout_ms),
            producer,
        })
    }
}

#[async_trait]
impl Sink for KafkaSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn sink(&self, meta: &Meta, data: &[u8]) -> Result<()> {
        let record = FutureRecord::to(&self.topic).key(meta.id.as_str()).payload(data);
        if self.send_async {
            // Fire-and-forget: delivery failures are logged, not surfaced.
            match self.producer.send_result(record) {
                Ok(delivery) => {
                    let (name, topic) = (self.name.clone(), self.topic.clone());
                    tokio::spawn(async move {
                        match delivery.await {
                            Ok(Err((err, _msg))) => tracing::error!(error = ?err, sink = %name, topic = %topic, "async kafka delivery failed"),
                            Err(_canceled) => tracing::error!(sink = %name, topic = %topic, "async kafka delivery canceled"),
                            _ => (),
                        }
                    });
                    Ok(())
                }
                Err((err, _record)) => Err(err).context("error enqueueing kafka message"),
            }
        } else {
            self.producer
                .send(record, Timeout::After(self.message_timeout))
                .await
                .map_err(|(err, _msg)| err)
                .context("error publishing kafka message")?;
            Ok(())
        }
    }

    async fn close(&self) -> Result<()> {
        tracing::info!(sink = %self.name, "flushing kafka producer");
        self.producer.flush(Timeout::After(self.message_timeout));
        Ok(())
    }
}
