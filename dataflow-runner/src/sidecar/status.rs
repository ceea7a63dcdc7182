//! Step status accounting & patching.
//!
//! A single mutex guards the in-memory status aggregate; sources & sinks
//! update their counters through it. A patcher loop snapshots the aggregate
//! every update interval and, when it differs from the last patched copy,
//! issues a JSON merge patch against the Step status subresource. Only the
//! rows owned by this replica are patched; pending is written by the lead
//! replica alone and zeroed locally after each successful patch so a stale
//! value cannot confuse the scaler between peeks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use kube::api::{Api, Patch, PatchParams};
use kube::client::Client;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::Config;
use dataflow_core::crd::{Step, StepStatus};

/// The maximum number of recent errors retained per connector.
const RECENT_ERRORS_LIMIT: usize = 4;
/// The maximum length of a last-message preview.
const PREVIEW_LIMIT: usize = 32;

const METRIC_SOURCES_TOTAL: &str = "dataflow_sources_total";
const METRIC_SOURCES_TOTAL_BYTES: &str = "dataflow_sources_total_bytes";
const METRIC_SOURCES_ERRORS: &str = "dataflow_sources_errors";
const METRIC_SOURCES_RETRIES: &str = "dataflow_sources_retries";
const METRIC_SOURCES_PENDING: &str = "dataflow_sources_pending";
const METRIC_SINKS_TOTAL: &str = "dataflow_sinks_total";
const METRIC_SINKS_ERRORS: &str = "dataflow_sinks_errors";

/// Which side of the step a connector sits on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectorKind {
    Source,
    Sink,
}

struct Inner {
    status: StepStatus,
    last_sent: Option<StepStatus>,
    interval_counts: HashMap<(ConnectorKind, String), u64>,
}

/// The mutex-guarded status aggregate of this replica.
pub struct StatusRegistry {
    step_name: String,
    replica: String,
    lead_replica: bool,
    inner: Mutex<Inner>,
}

impl StatusRegistry {
    /// Create a new instance.
    pub fn new(step_name: impl Into<String>, replica: u32) -> Self {
        metrics::register_counter!(METRIC_SOURCES_TOTAL, metrics::Unit::Count, "total messages received from sources");
        metrics::register_counter!(METRIC_SOURCES_TOTAL_BYTES, metrics::Unit::Bytes, "total bytes received from sources");
        metrics::register_counter!(METRIC_SOURCES_ERRORS, metrics::Unit::Count, "messages which exhausted their retries");
        metrics::register_counter!(METRIC_SOURCES_RETRIES, metrics::Unit::Count, "message processing retries");
        metrics::register_gauge!(METRIC_SOURCES_PENDING, metrics::Unit::Count, "messages pending at sources");
        metrics::register_counter!(METRIC_SINKS_TOTAL, metrics::Unit::Count, "total messages written to sinks");
        metrics::register_counter!(METRIC_SINKS_ERRORS, metrics::Unit::Count, "sink write failures");
        Self {
            step_name: step_name.into(),
            replica: replica.to_string(),
            lead_replica: replica == 0,
            inner: Mutex::new(Inner {
                status: StepStatus::default(),
                last_sent: None,
                interval_counts: HashMap::new(),
            }),
        }
    }

    fn with_lock<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> T {
        let mut inner = self.inner.lock().expect("status mutex poisoned");
        f(&mut inner)
    }

    /// Record a message observed by a connector.
    pub fn incr_total(&self, kind: ConnectorKind, name: &str, bytes: u64, preview: &[u8]) {
        match kind {
            ConnectorKind::Source => {
                metrics::counter!(METRIC_SOURCES_TOTAL, 1, "name" => name.to_string());
                metrics::counter!(METRIC_SOURCES_TOTAL_BYTES, bytes, "name" => name.to_string());
            }
            ConnectorKind::Sink => metrics::counter!(METRIC_SINKS_TOTAL, 1, "name" => name.to_string()),
        }
        let preview = preview_of(preview);
        self.with_lock(|inner| {
            *inner.interval_counts.entry((kind, name.to_string())).or_default() += 1;
            let replica = self.replica.clone();
            match kind {
                ConnectorKind::Source => {
                    let row = inner.status.source_statuses.entry(name.to_string()).or_default();
                    let metrics = row.metrics.entry(replica).or_default();
                    metrics.total += 1;
                    metrics.total_bytes += bytes;
                    row.last_message = Some(preview);
                }
                ConnectorKind::Sink => {
                    let row = inner.status.sink_statuses.entry(name.to_string()).or_default();
                    let metrics = row.metrics.entry(replica).or_default();
                    metrics.total += 1;
                    metrics.total_bytes += bytes;
                    row.last_message = Some(preview);
                }
            }
        })
    }

    /// Record retry attempts of a source message.
    pub fn incr_source_retries(&self, name: &str, retries: u64) {
        if retries == 0 {
            return;
        }
        metrics::counter!(METRIC_SOURCES_RETRIES, retries, "name" => name.to_string());
        self.with_lock(|inner| {
            let row = inner.status.source_statuses.entry(name.to_string()).or_default();
            row.metrics.entry(self.replica.clone()).or_default().retries += retries;
        })
    }

    /// Record a message which exhausted its retries.
    pub fn incr_error(&self, kind: ConnectorKind, name: &str, error: &str) {
        match kind {
            ConnectorKind::Source => metrics::counter!(METRIC_SOURCES_ERRORS, 1, "name" => name.to_string()),
            ConnectorKind::Sink => metrics::counter!(METRIC_SINKS_ERRORS, 1, "name" => name.to_string()),
        }
        let error = preview_error(error);
        self.with_lock(|inner| {
            let (metrics, recent_errors) = match kind {
                ConnectorKind::Source => {
                    let row = inner.status.source_statuses.entry(name.to_string()).or_default();
                    (row.metrics.entry(self.replica.clone()).or_default(), &mut row.recent_errors)
                }
                ConnectorKind::Sink => {
                    let row = inner.status.sink_statuses.entry(name.to_string()).or_default();
                    (row.metrics.entry(self.replica.clone()).or_default(), &mut row.recent_errors)
                }
            };
            metrics.errors += 1;
            recent_errors.push(error);
            if recent_errors.len() > RECENT_ERRORS_LIMIT {
                let excess = recent_errors.len() - RECENT_ERRORS_LIMIT;
                recent_errors.drain(0..excess);
            }
        })
    }

    /// Record a pending sample. Only meaningful on the lead replica.
    pub fn set_pending(&self, name: &str, pending: u64) {
        if !self.lead_replica {
            return;
        }
        metrics::gauge!(METRIC_SOURCES_PENDING, pending as f64, "name" => name.to_string());
        self.with_lock(|inner| {
            let row = inner.status.source_statuses.entry(name.to_string()).or_default();
            row.last_pending = row.pending;
            row.pending = Some(pending);
        })
    }

    /// Snapshot the current status if it differs from the last patched copy.
    ///
    /// Rates are computed over the given interval from the per-connector
    /// message counts observed since the previous snapshot commit.
    pub fn snapshot(&self, interval: Duration) -> Option<StepStatus> {
        let secs = interval.as_secs_f64().max(f64::EPSILON);
        self.with_lock(|inner| {
            let counts = inner.interval_counts.clone();
            let replica = self.replica.clone();
            for ((kind, name), count) in counts {
                let rate = count as f64 / secs;
                match kind {
                    ConnectorKind::Source => {
                        let row = inner.status.source_statuses.entry(name).or_default();
                        row.metrics.entry(replica.clone()).or_default().rate = rate;
                    }
                    ConnectorKind::Sink => {
                        let row = inner.status.sink_statuses.entry(name).or_default();
                        row.metrics.entry(replica.clone()).or_default().rate = rate;
                    }
                }
            }
            if inner.last_sent.as_ref() == Some(&inner.status) {
                return None;
            }
            Some(inner.status.clone())
        })
    }

    /// Commit a successfully patched snapshot: remember it, zero pending
    /// locally & reset the interval counters.
    pub fn committed(&self, sent: StepStatus) {
        self.with_lock(|inner| {
            inner.last_sent = Some(sent);
            inner.interval_counts.clear();
            for row in inner.status.source_statuses.values_mut() {
                if let Some(pending) = row.pending {
                    row.last_pending = Some(pending);
                    row.pending = Some(0);
                }
                for metrics in row.metrics.values_mut() {
                    metrics.rate = 0.0;
                }
            }
            for row in inner.status.sink_statuses.values_mut() {
                for metrics in row.metrics.values_mut() {
                    metrics.rate = 0.0;
                }
            }
        })
    }

    /// Spawn the status patcher loop.
    pub fn spawn_patcher(self: Arc<Self>, client: Client, config: Arc<Config>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<Result<()>> {
        let registry = self;
        tokio::spawn(async move {
            let api: Api<Step> = Api::namespaced(client, &config.namespace);
            let interval = config.update_interval().context("invalid update interval")?;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => (),
                    _ = shutdown.recv() => break,
                }
                let snapshot = match registry.snapshot(interval) {
                    Some(snapshot) => snapshot,
                    None => continue,
                };
                let patch = Patch::Merge(serde_json::json!({
                    "status": {
                        "sourceStatuses": snapshot.source_statuses,
                        "sinkStatuses": snapshot.sink_statuses,
                    }
                }));
                tracing::debug!(step = %registry.step_name, "patching step status");
                match api.patch_status(&registry.step_name, &PatchParams::default(), &patch).await {
                    Ok(_step) => registry.committed(snapshot),
                    Err(err) => tracing::error!(error = ?err, step = %registry.step_name, "failed to patch step status"),
                }
            }
            Ok(())
        })
    }
}

/// Truncate a payload into a short UTF-8 preview.
fn preview_of(data: &[u8]) -> String {
    let text = String::from_utf8_lossy(data);
    if text.len() > PREVIEW_LIMIT {
        format!("{}...", text.chars().take(PREVIEW_LIMIT).collect::<String>())
    } else {
        text.into_owned()
    }
}

fn preview_error(error: &str) -> String {
    if error.len() > 256 {
        format!("{}...", error.chars().take(256).collect::<String>())
    } else {
        error.to_string()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const INTERVAL: Duration = Duration::from_secs(15);

    #[test]
    fn snapshot_only_on_diff() {
        let registry = StatusRegistry::new("pl-main", 0);
        assert!(registry.snapshot(INTERVAL).is_some(), "the initial empty status has never been sent");
        let first = registry.snapshot(INTERVAL).expect("snapshot before any commit");
        registry.committed(first);
        assert!(registry.snapshot(INTERVAL).is_none(), "an unchanged status must not re-patch");

        registry.incr_total(ConnectorKind::Source, "in", 7, b"foo-bar");
        let snapshot = registry.snapshot(INTERVAL).expect("a counted message changes the status");
        let row = snapshot.source_statuses.get("in").expect("expected source row");
        let metrics = row.metrics.get("0").expect("expected replica row");
        assert_eq!(metrics.total, 1);
        assert_eq!(metrics.total_bytes, 7);
        assert_eq!(row.last_message.as_deref(), Some("foo-bar"));
    }

    #[test]
    fn pending_zeroes_after_commit() {
        let registry = StatusRegistry::new("pl-main", 0);
        registry.set_pending("in", 42);
        let snapshot = registry.snapshot(INTERVAL).expect("expected snapshot");
        assert_eq!(snapshot.source_statuses.get("in").and_then(|row| row.pending), Some(42));
        registry.committed(snapshot);
        let next = registry.snapshot(INTERVAL).expect("zeroing changes the status");
        let row = next.source_statuses.get("in").expect("expected source row");
        assert_eq!(row.pending, Some(0), "pending must be zeroed locally after a successful patch");
        assert_eq!(row.last_pending, Some(42));
    }

    #[test]
    fn followers_do_not_write_pending() {
        let registry = StatusRegistry::new("pl-main", 1);
        registry.set_pending("in", 42);
        registry.incr_total(ConnectorKind::Source, "in", 1, b"x");
        let snapshot = registry.snapshot(INTERVAL).expect("expected snapshot");
        assert_eq!(snapshot.source_statuses.get("in").and_then(|row| row.pending), None);
    }

    #[test]
    fn recent_errors_are_bounded() {
        let registry = StatusRegistry::new("pl-main", 0);
        for i in 0..10 {
            registry.incr_error(ConnectorKind::Source, "in", &format!("error {}", i));
        }
        let snapshot = registry.snapshot(INTERVAL).expect("expected snapshot");
        let row = snapshot.source_statuses.get("in").expect("expected source row");
        assert_eq!(row.recent_errors.len(), RECENT_ERRORS_LIMIT);
        assert_eq!(row.recent_errors.last().map(String::as_str), Some("error 9"));
        assert_eq!(row.metrics.get("0").map(|metrics| metrics.errors), Some(10));
    }

    #[test]
    fn rates_derive_from_interval_counts() {
        let registry = StatusRegistry::new("pl-main", 0);
        for _ in 0..30 {
            registry.incr_total(ConnectorKind::Sink, "out", 1, b"m");
        }
        let snapshot = registry.snapshot(INTERVAL).expect("expected snapshot");
        let metrics = snapshot.sink_statuses.get("out").and_then(|row| row.metrics.get("0")).expect("expected sink metrics");
        assert!((metrics.rate - 2.0).abs() < f64::EPSILON, "expected 30 msgs / 15s = 2/s, got {}", metrics.rate);
    }
}
