//! Step CRD.
//!
//! A Step is a single node of a pipeline graph and the unit of deployment:
//! the Pipeline reconciler creates one Step CR per declared step, and the
//! Step reconciler converges pods & services for it. The `Step` resource
//! exposes the scale subresource so that both `kubectl scale` and the
//! autoscaler drive `.spec.replicas`.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::connector::{Sink, Source};

pub type Step = StepCRD; // Mostly to resolve a Rust Analyzer issue.

/// CRD spec for the Step resource.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    struct = "StepCRD",
    status = "StepStatus",
    group = "dataflow.rs",
    version = "v1alpha1",
    kind = "Step",
    namespaced,
    derive = "PartialEq",
    apiextensions = "v1",
    shortname = "step",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Reason","type":"string","jsonPath":".status.reason"}"#,
    printcolumn = r#"{"name":"Message","type":"string","jsonPath":".status.message"}"#,
    printcolumn = r#"{"name":"Desired","type":"string","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Current","type":"string","jsonPath":".status.replicas"}"#,
    scale = r#"{"specReplicasPath":".spec.replicas","statusReplicasPath":".status.replicas","labelSelectorPath":".status.selector"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct StepSpec {
    /// The name of this step, unique within its pipeline.
    pub name: String,
    /// The number of replicas to run.
    ///
    /// Owned by the scale subresource; the Pipeline reconciler never overwrites it.
    #[serde(default = "StepSpec::default_replicas")]
    pub replicas: u32,
    /// The processing applied to each message.
    #[serde(flatten)]
    pub processor: Processor,
    /// The sources feeding this step.
    #[serde(default)]
    pub sources: Vec<Source>,
    /// The sinks receiving this step's output.
    #[serde(default)]
    pub sinks: Vec<Sink>,
    /// The autoscaling policy of this step.
    #[serde(default)]
    pub scale: Option<ScaleSpec>,
    /// Completion of a terminator step cascades termination across the pipeline.
    #[serde(default)]
    pub terminator: bool,
    /// Resource requests for the main container.
    #[serde(default)]
    pub resources: BTreeMap<String, String>,
}

impl StepSpec {
    fn default_replicas() -> u32 {
        1
    }

    /// A copy of this spec with `replicas` reset, used for pod-spec hashing so
    /// that scaling does not churn pods.
    pub fn without_replicas(&self) -> Self {
        let mut spec = self.clone();
        spec.replicas = Self::default_replicas();
        spec
    }

    /// Validate this spec, ensuring that it conforms to application requirements.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        let mut source_names = BTreeSet::new();
        for source in self.sources.iter() {
            if !source_names.insert(source.name.as_str()) {
                errors.push(format!("source '{}' of step '{}' is a duplicate and must be renamed", source.name, self.name));
            }
        }
        let mut sink_names = BTreeSet::new();
        for sink in self.sinks.iter() {
            if !sink_names.insert(sink.name.as_str()) {
                errors.push(format!("sink '{}' of step '{}' is a duplicate and must be renamed", sink.name, self.name));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl StepCRD {
    /// The deterministic name of the pod backing the given replica.
    pub fn pod_name(&self, replica: u32) -> String {
        format!("{}-{}", self.metadata.name.as_deref().unwrap_or_default(), replica)
    }

    /// The name of the headless service used for peer discovery.
    pub fn headless_service_name(&self) -> String {
        format!("step-{}", self.metadata.name.as_deref().unwrap_or_default())
    }
}

/// The fixed consumer group id of a partitioned broker source.
pub fn consumer_group_id(cluster: &str, namespace: &str, pipeline: &str, step: &str, source: &str) -> String {
    format!("{}-{}-{}-{}-{}", cluster, namespace, pipeline, step, source)
}

/// The processing kind of a step; exactly one.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum Processor {
    /// Pass each message through unchanged.
    Cat(CatSpec),
    /// Run an arbitrary container as the main process.
    Container(ContainerSpec),
    /// Transform each message with an expression over `msg`.
    Map(String),
    /// Drop messages for which the expression is false.
    Filter(String),
    /// Drop recently seen duplicate messages.
    Dedupe(DedupeSpec),
    /// Collect messages into per-key groups, emitting complete groups.
    Group(GroupSpec),
    /// Fetch the main process from a git repository.
    Git(GitSpec),
}

/// A passthrough processor.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
pub struct CatSpec {}

/// An arbitrary container processor.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    /// The image to run.
    pub image: String,
    /// The container command.
    #[serde(default)]
    pub command: Vec<String>,
    /// The container args.
    #[serde(default)]
    pub args: Vec<String>,
    /// Additional environment for the container.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Use the FIFO pair rather than the HTTP loopback.
    #[serde(default)]
    pub fifo: bool,
}

/// A dedupe processor.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DedupeSpec {
    /// The expression computing a message's uniqueness key.
    #[serde(default = "DedupeSpec::default_uid")]
    pub uid: String,
    /// The maximum number of keys retained.
    #[serde(default = "DedupeSpec::default_max_size")]
    pub max_size: u64,
}

impl DedupeSpec {
    fn default_uid() -> String {
        "sha256(msg)".into()
    }

    fn default_max_size() -> u64 {
        1_000_000
    }
}

/// A group-by processor.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GroupSpec {
    /// The expression computing a message's group key.
    pub key: String,
    /// The expression deciding whether a message completes its group.
    pub end_of_group: String,
    /// The output encoding of a completed group.
    #[serde(default)]
    pub format: GroupFormat,
}

/// The output encoding of a completed group.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum GroupFormat {
    /// A JSON array of base64 encoded payloads.
    JsonBytesArray,
    /// A JSON array of UTF-8 strings.
    JsonStringArray,
}

impl Default for GroupFormat {
    fn default() -> Self {
        GroupFormat::JsonStringArray
    }
}

/// A git-sourced processor.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GitSpec {
    /// The image used to run the checked-out code.
    pub image: String,
    /// The command run within the checkout.
    #[serde(default)]
    pub command: Vec<String>,
    /// The repository URL.
    pub url: String,
    /// The branch to check out.
    #[serde(default = "GitSpec::default_branch")]
    pub branch: String,
    /// The path within the repository to use as the working dir.
    #[serde(default = "GitSpec::default_path")]
    pub path: String,
}

impl GitSpec {
    fn default_branch() -> String {
        "main".into()
    }

    fn default_path() -> String {
        ".".into()
    }
}

/// The autoscaling policy of a step.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScaleSpec {
    /// An expression over `{c, P, p, minmax}` computing the desired replica count.
    #[serde(default)]
    pub desired_replicas: Option<String>,
    /// A duration expression gating consecutive scaling operations; may
    /// reference `default_scaling_delay`.
    #[serde(default)]
    pub scaling_delay: Option<String>,
    /// A duration expression gating peeks from zero replicas; may reference
    /// `default_peek_delay`.
    #[serde(default)]
    pub peek_delay: Option<String>,
}

/// The lifecycle phase of a step.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum StepPhase {
    Unknown,
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl Default for StepPhase {
    fn default() -> Self {
        StepPhase::Unknown
    }
}

impl StepPhase {
    /// Check if this phase is terminal.
    pub fn completed(&self) -> bool {
        matches!(self, StepPhase::Succeeded | StepPhase::Failed)
    }

    /// The total order used for aggregation, where the worst phase ranks lowest.
    fn rank(&self) -> u8 {
        match self {
            StepPhase::Failed => 0,
            StepPhase::Running => 1,
            StepPhase::Succeeded => 2,
            StepPhase::Pending => 3,
            StepPhase::Unknown => 4,
        }
    }
}

/// A step phase paired with its reason & message, foldable across replicas.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StepPhaseMessage {
    pub phase: StepPhase,
    pub reason: String,
    pub message: String,
}

impl StepPhaseMessage {
    /// Create a new instance.
    pub fn new(phase: StepPhase, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            phase,
            reason: reason.into(),
            message: message.into(),
        }
    }

    /// Fold the given phase into this one, keeping the worst of the two.
    pub fn min(self, other: Self) -> Self {
        if self.phase.rank() <= other.phase.rank() {
            self
        } else {
            other
        }
    }
}

/// CRD status object, patched periodically by reconciler & sidecars alike.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StepStatus {
    /// The aggregate phase of this step's replicas.
    #[serde(default)]
    pub phase: StepPhase,
    /// The reason for the current phase.
    #[serde(default)]
    pub reason: String,
    /// A human readable message accompanying the current phase.
    #[serde(default)]
    pub message: String,
    /// The currently observed replica count.
    #[serde(default)]
    pub replicas: u32,
    /// The label selector matching this step's pods, used by the scale subresource.
    #[serde(default)]
    pub selector: Option<String>,
    /// The time of the last scaling operation.
    #[serde(default)]
    pub last_scaled_at: Option<DateTime<Utc>>,
    /// Per-source status rows, keyed by source name.
    #[serde(default)]
    pub source_statuses: BTreeMap<String, SourceStatus>,
    /// Per-sink status rows, keyed by sink name.
    #[serde(default)]
    pub sink_statuses: BTreeMap<String, SinkStatus>,
}

impl StepStatus {
    /// The total pending count across all sources.
    ///
    /// Pending is authoritative only on the lead replica, which is the only
    /// writer of these fields.
    pub fn get_pending(&self) -> u64 {
        self.source_statuses.values().filter_map(|status| status.pending).sum()
    }

    /// The previously sampled pending count across all sources.
    pub fn get_last_pending(&self) -> u64 {
        self.source_statuses.values().filter_map(|status| status.last_pending).sum()
    }
}

/// Observed state of a single source.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SourceStatus {
    /// Per-replica counters, keyed by replica index.
    #[serde(default)]
    pub metrics: BTreeMap<String, ConnectorMetrics>,
    /// Messages available at the source but not yet committed by this consumer group.
    ///
    /// Written only by the lead replica.
    #[serde(default)]
    pub pending: Option<u64>,
    /// The previous pending sample, retained for delta computation.
    #[serde(default)]
    pub last_pending: Option<u64>,
    /// A bounded ring of recent processing errors.
    #[serde(default)]
    pub recent_errors: Vec<String>,
    /// A preview of the most recently observed message.
    #[serde(default)]
    pub last_message: Option<String>,
}

/// Observed state of a single sink.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SinkStatus {
    /// Per-replica counters, keyed by replica index.
    #[serde(default)]
    pub metrics: BTreeMap<String, ConnectorMetrics>,
    /// A bounded ring of recent sink errors.
    #[serde(default)]
    pub recent_errors: Vec<String>,
    /// A preview of the most recently written message.
    #[serde(default)]
    pub last_message: Option<String>,
}

/// Counters of a single connector on a single replica.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorMetrics {
    /// Total messages observed.
    #[serde(default)]
    pub total: u64,
    /// Total bytes observed.
    #[serde(default)]
    pub total_bytes: u64,
    /// Messages per second over the last update interval.
    #[serde(default)]
    pub rate: f64,
    /// Messages which exhausted their retries.
    #[serde(default)]
    pub errors: u64,
    /// Retry attempts.
    #[serde(default)]
    pub retries: u64,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::connector::{SourceBackend, StartOffset};

    fn spec_fixture() -> StepSpec {
        serde_yaml::from_str(
            r#"
name: main
map: "bytes('hi! ' + string(msg))"
sources:
  - name: in
    kafka:
      topic: topic-a
sinks:
  - name: out
    log: {}
"#,
        )
        .expect("error parsing step spec fixture")
    }

    #[test]
    fn spec_parses_flattened_processor() {
        let spec = spec_fixture();
        assert_eq!(spec.replicas, 1);
        match &spec.processor {
            Processor::Map(expression) => assert_eq!(expression, "bytes('hi! ' + string(msg))"),
            other => panic!("expected a map processor, got {:?}", other),
        }
        match &spec.sources[0].backend {
            SourceBackend::Kafka(kafka) => {
                assert_eq!(kafka.topic, "topic-a");
                assert_eq!(kafka.start_offset, StartOffset::Last);
            }
            other => panic!("expected a kafka source, got {:?}", other),
        }
    }

    #[test]
    fn without_replicas_is_stable_across_scaling() {
        let mut a = spec_fixture();
        let mut b = spec_fixture();
        a.replicas = 1;
        b.replicas = 4;
        assert_eq!(a.without_replicas(), b.without_replicas());
        let a_json = serde_json::to_string(&a.without_replicas()).unwrap();
        let b_json = serde_json::to_string(&b.without_replicas()).unwrap();
        assert_eq!(a_json, b_json, "canonical JSON must be identical for hashing");
    }

    #[test]
    fn duplicate_source_names_are_rejected() {
        let mut spec = spec_fixture();
        let mut dup = spec.sources[0].clone();
        dup.backend = SourceBackend::Http(Default::default());
        spec.sources.push(dup);
        let errors = spec.validate().expect_err("expected validation failure");
        assert!(errors[0].contains("duplicate"), "unexpected error: {}", errors[0]);
    }

    #[test]
    fn duplicate_sink_names_are_rejected() {
        let mut spec = spec_fixture();
        let dup = spec.sinks[0].clone();
        spec.sinks.push(dup);
        assert!(spec.validate().is_err());
    }

    macro_rules! step_phase_min_test {
        ($name:ident, $a:expr, $b:expr, $expect:expr) => {
            #[test]
            fn $name() {
                let output = StepPhaseMessage::new($a, "", "").min(StepPhaseMessage::new($b, "", ""));
                assert!(
                    $expect == output.phase,
                    "expected min of {:?} and {:?} to be {:?}, got {:?}",
                    $a,
                    $b,
                    $expect,
                    output.phase,
                );
            }
        };
    }

    step_phase_min_test!(failed_beats_all, StepPhase::Failed, StepPhase::Running, StepPhase::Failed);
    step_phase_min_test!(running_beats_succeeded, StepPhase::Succeeded, StepPhase::Running, StepPhase::Running);
    step_phase_min_test!(succeeded_beats_pending, StepPhase::Pending, StepPhase::Succeeded, StepPhase::Succeeded);
    step_phase_min_test!(pending_beats_unknown, StepPhase::Unknown, StepPhase::Pending, StepPhase::Pending);

    #[test]
    fn min_keeps_reason_of_winner() {
        let folded = StepPhaseMessage::new(StepPhase::Running, "", "")
            .min(StepPhaseMessage::new(StepPhase::Failed, "CrashLoopBackOff", "pod main-0 is crash looping"));
        assert_eq!(folded.phase, StepPhase::Failed);
        assert_eq!(folded.reason, "CrashLoopBackOff");
    }

    #[test]
    fn pending_sums_sources() {
        let mut status = StepStatus::default();
        status.source_statuses.insert(
            "a".into(),
            SourceStatus {
                pending: Some(5),
                last_pending: Some(2),
                ..Default::default()
            },
        );
        status.source_statuses.insert(
            "b".into(),
            SourceStatus {
                pending: Some(7),
                ..Default::default()
            },
        );
        assert_eq!(status.get_pending(), 12);
        assert_eq!(status.get_last_pending(), 2);
    }

    #[test]
    fn consumer_group_id_shape() {
        assert_eq!(consumer_group_id("c", "ns", "pl", "main", "in"), "c-ns-pl-main-in");
    }
}
