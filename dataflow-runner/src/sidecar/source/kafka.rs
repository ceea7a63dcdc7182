//! Partitioned broker source.
//!
//! Subscribes to a topic with a fixed consumer group and delivers every
//! message of every assigned partition to the process callback, surviving
//! rebalance & replica restart. One poll loop feeds bounded per-partition
//! channels; one consumer task per partition processes, marks & commits in
//! offset order. Offsets are committed only after the callback succeeds, so
//! failures leave messages uncommitted for redelivery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Context, Result};
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use chrono::TimeZone;
use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::message::{Message, OwnedMessage};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::sidecar::monitor::Monitor;
use crate::sidecar::source::{HasPending, Process, Source};
use dataflow_core::connector::{KafkaSource as KafkaSourceSpec, StartOffset};
use dataflow_core::crd::consumer_group_id;
use dataflow_core::meta::Meta;

/// The capacity of each per-partition channel.
const PARTITION_CHANNEL_CAPACITY: usize = 256;
/// The timeout of a single poll call; shutdown blocks for at most this long.
const POLL_TIMEOUT: Duration = Duration::from_secs(5);
/// The timeout of broker metadata queries made by the pending calculation.
const METADATA_TIMEOUT: Duration = Duration::from_secs(3);

type SharedConsumer = Arc<ArcSwapOption<BaseConsumer<SourceContext>>>;
type PartitionChannels = Arc<StdMutex<HashMap<i32, mpsc::Sender<OwnedMessage>>>>;
type ConsumerTasks = Arc<StdMutex<Vec<JoinHandle<()>>>>;

/// The rebalance-handling context installed into the consumer.
///
/// Rebalance callbacks fire on the poll thread: assignment allocates a
/// bounded channel & spawns a consumer task for each new partition;
/// revocation closes the channel, which drains & terminates the task.
pub struct SourceContext {
    source_name: String,
    urn: String,
    topic: String,
    monitor: Arc<Monitor>,
    process: Process,
    consumer: SharedConsumer,
    channels: PartitionChannels,
    tasks: ConsumerTasks,
    runtime: tokio::runtime::Handle,
}

impl ClientContext for SourceContext {}

impl ConsumerContext for SourceContext {
    fn post_rebalance(&self, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                for elem in partitions.elements() {
                    self.assigned(elem.partition());
                }
            }
            Rebalance::Revoke(partitions) => {
                for elem in partitions.elements() {
                    self.revoked(elem.partition());
                }
            }
            Rebalance::Error(err) => tracing::error!(error = %err, source = %self.source_name, "rebalance error"),
        }
    }
}

impl SourceContext {
    fn assigned(&self, partition: i32) {
        let mut channels = self.channels.lock().expect("partition channel mutex poisoned");
        if channels.contains_key(&partition) {
            return;
        }
        self.monitor.assigned(&self.urn, partition);
        let (tx, rx) = mpsc::channel(PARTITION_CHANNEL_CAPACITY);
        channels.insert(partition, tx);
        let task = self.runtime.spawn(consume_partition(
            self.source_name.clone(),
            self.urn.clone(),
            self.topic.clone(),
            partition,
            self.monitor.clone(),
            self.process.clone(),
            self.consumer.clone(),
            rx,
        ));
        self.tasks.lock().expect("consumer task mutex poisoned").push(task);
    }

    fn revoked(&self, partition: i32) {
        let mut channels = self.channels.lock().expect("partition channel mutex poisoned");
        if channels.remove(&partition).is_some() {
            tracing::info!(source = %self.source_name, partition, "closed partition channel");
        }
        self.monitor.revoked(&self.urn, partition);
    }
}

/// A partitioned broker source adapter.
pub struct KafkaSource {
    name: String,
    stop: Arc<AtomicBool>,
    consumer: SharedConsumer,
    channels: PartitionChannels,
    tasks: ConsumerTasks,
    poll_handle: Mutex<Option<JoinHandle<()>>>,
}

impl KafkaSource {
    /// Create a new instance, subscribing & starting the poll loop.
    pub async fn new(
        config: &Arc<Config>,
        name: &str,
        urn: &str,
        step_name: &str,
        spec: &KafkaSourceSpec,
        monitor: Arc<Monitor>,
        process: Process,
    ) -> Result<Self> {
        let url = spec
            .url
            .as_deref()
            .context("kafka source has no broker url, set one or create the broker secret")?;
        let group_id = consumer_group_id(&config.cluster, &config.namespace, &config.pipeline_name, step_name, name);

        let consumer_holder: SharedConsumer = Arc::new(ArcSwapOption::const_empty());
        let channels: PartitionChannels = Default::default();
        let tasks: ConsumerTasks = Default::default();
        let context = SourceContext {
            source_name: name.to_string(),
            urn: urn.to_string(),
            topic: spec.topic.clone(),
            monitor,
            process,
            consumer: consumer_holder.clone(),
            channels: channels.clone(),
            tasks: tasks.clone(),
            runtime: tokio::runtime::Handle::current(),
        };

        let auto_offset_reset = match spec.start_offset {
            StartOffset::First => "earliest",
            StartOffset::Last => "latest",
        };
        let consumer: BaseConsumer<SourceContext> = ClientConfig::new()
            .set("bootstrap.servers", url)
            .set("group.id", group_id.as_str())
            .set("group.instance.id", format!("{}-{}", group_id, config.replica))
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", auto_offset_reset)
            .create_with_context(context)
            .context("error creating kafka consumer")?;
        let consumer = Arc::new(consumer);
        consumer_holder.store(Some(consumer.clone()));
        consumer
            .subscribe(&[spec.topic.as_str()])
            .with_context(|| format!("error subscribing to topic {}", spec.topic))?;
        tracing::info!(source = %name, url = %url, topic = %spec.topic, group = %group_id, "connected kafka source");

        let stop = Arc::new(AtomicBool::new(false));
        let poll_handle = spawn_poll_loop(name.to_string(), consumer, channels.clone(), stop.clone());

        Ok(Self {
            name: name.to_string(),
            stop,
            consumer: consumer_holder,
            channels,
            tasks,
            poll_handle: Mutex::new(Some(poll_handle)),
        })
    }
}

#[async_trait]
impl Source for KafkaSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn close(&self) -> Result<()> {
        tracing::info!(source = %self.name, "closing partition channels");
        self.stop.store(true, Ordering::SeqCst);
        self.channels.lock().expect("partition channel mutex poisoned").clear();

        tracing::info!(source = %self.name, "waiting for partition consumers to finish");
        let tasks = std::mem::take(&mut *self.tasks.lock().expect("consumer task mutex poisoned"));
        for task in tasks {
            let _res = task.await;
        }

        if let Some(handle) = self.poll_handle.lock().await.take() {
            let _res = handle.await;
        }
        tracing::info!(source = %self.name, "closing consumer");
        self.consumer.store(None);
        Ok(())
    }

    fn pending_handle(&self) -> Option<Arc<dyn HasPending>> {
        Some(Arc::new(KafkaPending {
            consumer: self.consumer.clone(),
        }))
    }
}

/// The backlog calculation over committed offsets & high watermarks.
///
/// Only partitions assigned to the calling replica contribute; a lead
/// replica which is not assigned every partition under-reports pending.
/// The scaling math tolerates this.
struct KafkaPending {
    consumer: SharedConsumer,
}

#[async_trait]
impl HasPending for KafkaPending {
    async fn get_pending(&self) -> Result<u64> {
        let consumer = self.consumer.load_full().context("consumer is closed")?;
        tokio::task::spawn_blocking(move || {
            let assignment = consumer.assignment().context("error fetching partition assignment")?;
            let committed = consumer
                .committed_offsets(assignment, METADATA_TIMEOUT)
                .context("error fetching committed offsets")?;
            let mut pending = 0i64;
            for elem in committed.elements() {
                let (low, high) = consumer
                    .fetch_watermarks(elem.topic(), elem.partition(), METADATA_TIMEOUT)
                    .context("error fetching watermarks")?;
                let offset = match elem.offset() {
                    Offset::Offset(offset) => offset,
                    _ => low,
                };
                if high - offset > 0 {
                    pending += high - offset;
                }
            }
            Ok(pending as u64)
        })
        .await
        .context("pending query task failed")?
    }
}

/// Spawn the blocking poll loop feeding the partition channels.
fn spawn_poll_loop(
    source_name: String,
    consumer: Arc<BaseConsumer<SourceContext>>,
    channels: PartitionChannels,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        tracing::info!(source = %source_name, "starting poll loop");
        while !stop.load(Ordering::SeqCst) {
            match consumer.poll(POLL_TIMEOUT) {
                Some(Ok(msg)) => {
                    let partition = msg.partition();
                    let msg = msg.detach();
                    let tx = channels.lock().expect("partition channel mutex poisoned").get(&partition).cloned();
                    match tx {
                        Some(tx) => {
                            // The channel may close mid-send during a revocation
                            // race; the message is redelivered after rebalance.
                            if tx.blocking_send(msg).is_err() {
                                tracing::debug!(source = %source_name, partition, "partition channel closed, dropping message");
                            }
                        }
                        None => tracing::debug!(source = %source_name, partition, "no channel for partition, dropping message"),
                    }
                }
                Some(Err(err)) => tracing::error!(error = ?err, source = %source_name, "poll error"),
                None => (),
            }
        }
        tracing::info!(source = %source_name, "poll loop stopped");
    })
}

/// Consume one partition in offset order.
#[allow(clippy::too_many_arguments)]
async fn consume_partition(
    source_name: String,
    urn: String,
    topic: String,
    partition: i32,
    monitor: Arc<Monitor>,
    process: Process,
    consumer: SharedConsumer,
    mut rx: mpsc::Receiver<OwnedMessage>,
) {
    tracing::info!(source = %source_name, partition, "consuming partition");
    while let Some(msg) = rx.recv().await {
        let offset = msg.offset();
        if !monitor.accept(&source_name, &urn, partition, offset) {
            continue;
        }
        let time = msg
            .timestamp()
            .to_millis()
            .and_then(|millis| chrono::Utc.timestamp_millis_opt(millis).single())
            .unwrap_or_else(chrono::Utc::now);
        let meta = Meta::new(urn.clone(), format!("{}-{}", partition, offset), time);
        let payload = msg.payload().unwrap_or_default().to_vec();
        match (process)(meta, payload).await {
            Ok(()) => {
                monitor.mark(&urn, partition, offset);
                if let Some(consumer) = consumer.load_full() {
                    let mut tpl = TopicPartitionList::new();
                    let res = tpl
                        .add_partition_offset(&topic, partition, Offset::Offset(offset + 1))
                        .map_err(anyhow::Error::from)
                        .and_then(|()| consumer.commit(&tpl, CommitMode::Async).map_err(anyhow::Error::from));
                    if let Err(err) = res {
                        tracing::error!(error = ?err, source = %source_name, partition, offset, "failed to commit message");
                    }
                }
            }
            // Not committed; the broker redelivers the message.
            Err(err) => tracing::error!(error = ?err, source = %source_name, partition, offset, "failed to process message"),
        }
    }
    tracing::info!(source = %source_name, partition, "done consuming partition");
}
