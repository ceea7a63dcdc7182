//! Pipeline CRD.
//!
//! The code here is used to generate the actual CRD used in K8s. See demos/crd.rs.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::step::StepSpec;
use crate::crd::{is_rfc_1123_label, RequiredMetadata};

pub type Pipeline = PipelineCRD; // Mostly to resolve a Rust Analyzer issue.

/// The condition type indicating that a pipeline has running steps.
pub const CONDITION_RUNNING: &str = "Running";
/// The condition type indicating that a pipeline has reached a terminal phase.
pub const CONDITION_COMPLETED: &str = "Completed";
/// The condition type indicating that a terminator step has completed.
pub const CONDITION_TERMINATING: &str = "Terminating";

/// CRD spec for the Pipeline resource.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    struct = "PipelineCRD",
    status = "PipelineStatus",
    group = "dataflow.rs",
    version = "v1alpha1",
    kind = "Pipeline",
    namespaced,
    derive = "PartialEq",
    apiextensions = "v1",
    shortname = "pl",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Message","type":"string","jsonPath":".status.message"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSpec {
    /// The steps of this pipeline.
    pub steps: Vec<StepSpec>,
    /// Seconds to wait after the pipeline reaches a terminal phase before it is deleted.
    #[serde(default = "PipelineSpec::default_deletion_delay_seconds")]
    pub deletion_delay_seconds: u64,
}

impl PipelineSpec {
    fn default_deletion_delay_seconds() -> u64 {
        600
    }

    /// Check if this pipeline declares a step of the given name.
    pub fn has_step(&self, name: &str) -> bool {
        self.steps.iter().any(|step| step.name == name)
    }
}

/// The lifecycle phase of a pipeline.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum PipelinePhase {
    Unknown,
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl Default for PipelinePhase {
    fn default() -> Self {
        PipelinePhase::Unknown
    }
}

impl PipelinePhase {
    /// Check if this phase is terminal.
    pub fn completed(&self) -> bool {
        matches!(self, PipelinePhase::Succeeded | PipelinePhase::Failed)
    }

    /// The total order used for aggregation, where the worst phase ranks lowest.
    fn rank(&self) -> u8 {
        match self {
            PipelinePhase::Failed => 0,
            PipelinePhase::Running => 1,
            PipelinePhase::Succeeded => 2,
            PipelinePhase::Pending => 3,
            PipelinePhase::Unknown => 4,
        }
    }

    /// Return the worst of the two phases under the aggregation ordering.
    pub fn min(self, other: Self) -> Self {
        if self.rank() <= other.rank() {
            self
        } else {
            other
        }
    }
}

/// A status condition of a pipeline.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// The condition type.
    #[serde(rename = "type")]
    pub type_: String,
    /// The condition status, `True` or `False`.
    pub status: String,
    /// The reason for this condition.
    pub reason: String,
}

/// CRD status object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStatus {
    /// The aggregate phase of this pipeline.
    #[serde(default)]
    pub phase: PipelinePhase,
    /// A human readable summary of child step phases.
    #[serde(default)]
    pub message: String,
    /// Status conditions derived from the aggregate phase.
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// The time at which this status last changed.
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

impl PipelineStatus {
    /// Set or clear the given condition type based on `active`.
    pub fn set_condition(&mut self, type_: &str, active: bool) {
        self.conditions.retain(|condition| condition.type_ != type_);
        if active {
            self.conditions.push(Condition {
                type_: type_.into(),
                status: "True".into(),
                reason: type_.into(),
            });
        }
    }
}

impl PipelineCRD {
    /// Validate this object, ensuring that it conforms to application requirements.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.spec.steps.is_empty() {
            errors.push(format!("pipeline {} must declare at least one step", self.name()));
        }

        let mut names = BTreeSet::new();
        for step in self.spec.steps.iter() {
            if !is_rfc_1123_label(&step.name) {
                errors.push(format!(
                    "step '{}' of pipeline {} must be a RFC 1123 label consisting of lower case alphanumeric characters or '-', and must start and end with an alphanumeric character",
                    step.name,
                    self.name()
                ));
            }
            if !names.insert(step.name.as_str()) {
                errors.push(format!("step '{}' of pipeline {} is a duplicate and must be renamed", step.name, self.name()));
            }
            if let Err(step_errors) = step.validate() {
                errors.extend(step_errors);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    macro_rules! phase_min_test {
        ($name:ident, $a:expr, $b:expr, $expect:expr) => {
            #[test]
            fn $name() {
                let output = PipelinePhase::min($a, $b);
                assert!(
                    $expect == output,
                    "expected min of {:?} and {:?} to be {:?}, got {:?}",
                    $a,
                    $b,
                    $expect,
                    output,
                );
            }
        };
    }

    phase_min_test!(failed_beats_running, PipelinePhase::Failed, PipelinePhase::Running, PipelinePhase::Failed);
    phase_min_test!(running_beats_succeeded, PipelinePhase::Succeeded, PipelinePhase::Running, PipelinePhase::Running);
    phase_min_test!(succeeded_beats_pending, PipelinePhase::Pending, PipelinePhase::Succeeded, PipelinePhase::Succeeded);
    phase_min_test!(pending_beats_unknown, PipelinePhase::Unknown, PipelinePhase::Pending, PipelinePhase::Pending);
    phase_min_test!(unknown_is_identity, PipelinePhase::Unknown, PipelinePhase::Unknown, PipelinePhase::Unknown);

    #[test]
    fn completed_is_terminal_only() {
        assert!(PipelinePhase::Succeeded.completed());
        assert!(PipelinePhase::Failed.completed());
        assert!(!PipelinePhase::Running.completed());
        assert!(!PipelinePhase::Pending.completed());
        assert!(!PipelinePhase::Unknown.completed());
    }

    #[test]
    fn set_condition_toggles() {
        let mut status = PipelineStatus::default();
        status.set_condition(CONDITION_RUNNING, true);
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].type_, CONDITION_RUNNING);
        status.set_condition(CONDITION_RUNNING, true);
        assert_eq!(status.conditions.len(), 1, "setting an active condition must not duplicate it");
        status.set_condition(CONDITION_RUNNING, false);
        assert!(status.conditions.is_empty());
    }
}
