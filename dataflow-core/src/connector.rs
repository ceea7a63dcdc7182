//! Source & sink connector variants.
//!
//! Sources and sinks are tagged variants over the supported backends, each
//! carrying a shared `name` used for status keying. A source additionally
//! computes a stable URN which identifies it across restarts and replicas.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::backoff::Backoff;

fn default_connector_name() -> String {
    "default".into()
}

/// An ingress connector of a step.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
pub struct Source {
    /// The name of this source, unique within its step.
    #[serde(default = "default_connector_name")]
    pub name: String,
    /// The backend of this source.
    #[serde(flatten)]
    pub backend: SourceBackend,
    /// The retry policy applied to messages from this source.
    #[serde(default)]
    pub retry: Backoff,
}

impl Source {
    /// The stable URN of this source, used for cross-replica coordination.
    pub fn urn(&self, namespace: &str, pipeline: &str, step: &str) -> String {
        match &self.backend {
            SourceBackend::Kafka(kafka) => format!("urn:dataflow:kafka:{}:{}", kafka.url.as_deref().unwrap_or("default"), kafka.topic),
            SourceBackend::Http(_) => format!("urn:dataflow:http:https://{}-{}.{}.svc/sources/{}", pipeline, step, namespace, self.name),
            SourceBackend::Cron(cron) => format!("urn:dataflow:cron:{}", cron.schedule),
        }
    }
}

/// The supported source backends.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum SourceBackend {
    /// Consume a topic of a partitioned message broker.
    Kafka(KafkaSource),
    /// Accept messages over an authenticated HTTP endpoint.
    Http(HttpSource),
    /// Emit a message on a cron schedule.
    Cron(CronSource),
}

/// A partitioned message-broker source.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KafkaSource {
    /// The broker bootstrap URL. When unset, it is resolved from the
    /// `dataflow-kafka-default` secret at sidecar startup.
    #[serde(default)]
    pub url: Option<String>,
    /// The topic to consume.
    pub topic: String,
    /// Where to begin consuming when no committed offset exists.
    #[serde(default)]
    pub start_offset: StartOffset,
}

/// The position from which a new consumer group begins.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
pub enum StartOffset {
    First,
    Last,
}

impl Default for StartOffset {
    fn default() -> Self {
        StartOffset::Last
    }
}

/// An HTTP ingress source.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HttpSource {
    /// Override the name of the service created for this source.
    #[serde(default)]
    pub service_name: Option<String>,
}

/// A cron source.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CronSource {
    /// A five-field cron schedule.
    pub schedule: String,
    /// The strftime layout used to format the emitted timestamp message.
    #[serde(default = "CronSource::default_layout")]
    pub layout: String,
}

impl CronSource {
    fn default_layout() -> String {
        "%Y-%m-%dT%H:%M:%SZ".into()
    }
}

/// An egress connector of a step.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
pub struct Sink {
    /// The name of this sink, unique within its step.
    #[serde(default = "default_connector_name")]
    pub name: String,
    /// The backend of this sink.
    #[serde(flatten)]
    pub backend: SinkBackend,
}

/// The supported sink backends.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum SinkBackend {
    /// Produce to a topic of a partitioned message broker.
    Kafka(KafkaSink),
    /// POST each message to an HTTP endpoint.
    Http(HttpSink),
    /// Log each message. Useful for debugging and tests.
    Log(LogSink),
}

/// A partitioned message-broker sink.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KafkaSink {
    /// The broker bootstrap URL. When unset, it is resolved from the
    /// `dataflow-kafka-default` secret at sidecar startup.
    #[serde(default)]
    pub url: Option<String>,
    /// The topic to produce to.
    pub topic: String,
    /// When true, publishes are not awaited per message.
    #[serde(default, rename = "async")]
    pub send_async: bool,
    /// The producer ack policy.
    #[serde(default = "KafkaSink::default_acks")]
    pub acks: String,
    /// The producer linger in milliseconds.
    #[serde(default)]
    pub linger_ms: Option<u64>,
    /// The per-message delivery timeout in milliseconds.
    #[serde(default = "KafkaSink::default_message_timeout_ms")]
    pub message_timeout_ms: u64,
}

impl KafkaSink {
    fn default_acks() -> String {
        "all".into()
    }

    fn default_message_timeout_ms() -> u64 {
        30_000
    }

    /// The effective linger, honoring the async default.
    pub fn linger_ms(&self) -> u64 {
        match self.linger_ms {
            Some(linger) => linger,
            None if self.send_async => 5,
            None => 0,
        }
    }
}

/// An HTTP sink.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HttpSink {
    /// The URL to POST each message to.
    pub url: String,
    /// Skip TLS verification for this sink.
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

/// A log sink.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LogSink {
    /// Truncate logged messages to this many bytes.
    #[serde(default)]
    pub truncate: Option<u64>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn source_yaml_shape_matches_tagged_variant() -> anyhow::Result<()> {
        let source: Source = serde_yaml::from_str(
            r#"
name: in
kafka:
  topic: input-topic
  startOffset: First
"#,
        )?;
        assert_eq!(source.name, "in");
        match &source.backend {
            SourceBackend::Kafka(kafka) => {
                assert_eq!(kafka.topic, "input-topic");
                assert_eq!(kafka.start_offset, StartOffset::First);
                assert_eq!(kafka.url, None);
            }
            other => panic!("expected a kafka source, got {:?}", other),
        }
        assert_eq!(source.retry.steps, 20);
        Ok(())
    }

    #[test]
    fn source_name_defaults() -> anyhow::Result<()> {
        let source: Source = serde_yaml::from_str("{http: {}}")?;
        assert_eq!(source.name, "default");
        Ok(())
    }

    #[test]
    fn kafka_urn_is_stable() {
        let source = Source {
            name: "default".into(),
            backend: SourceBackend::Kafka(KafkaSource {
                url: Some("kafka-broker:9092".into()),
                topic: "topic-a".into(),
                start_offset: StartOffset::Last,
            }),
            retry: Default::default(),
        };
        let urn = source.urn("ns", "pl", "main");
        assert_eq!(urn, "urn:dataflow:kafka:kafka-broker:9092:topic-a");
        assert_eq!(urn, source.urn("other-ns", "other-pl", "other"));
    }

    #[test]
    fn http_urn_keys_on_step_and_name() {
        let source = Source {
            name: "default".into(),
            backend: SourceBackend::Http(Default::default()),
            retry: Default::default(),
        };
        assert_eq!(source.urn("ns", "pl", "main"), "urn:dataflow:http:https://pl-main.ns.svc/sources/default");
    }

    #[test]
    fn kafka_sink_linger_defaults() {
        let mut sink: KafkaSink = serde_yaml::from_str("topic: t").unwrap();
        assert_eq!(sink.linger_ms(), 0);
        sink.send_async = true;
        assert_eq!(sink.linger_ms(), 5);
        sink.linger_ms = Some(42);
        assert_eq!(sink.linger_ms(), 42);
    }
}
