//! Dataflow CRDs.
//!
//! References:
//! - https://kubernetes.io/docs/tasks/extend-kubernetes/custom-resources/custom-resource-definitions/
//! - https://kubernetes.io/docs/tasks/extend-kubernetes/custom-resources/custom-resource-definitions/#additional-printer-columns
//! - https://kubernetes.io/docs/reference/kubectl/jsonpath/

mod pipeline;
mod step;

use kube::Resource;

pub use pipeline::{Condition, Pipeline, PipelineCRD, PipelinePhase, PipelineSpec, PipelineStatus, CONDITION_COMPLETED, CONDITION_RUNNING, CONDITION_TERMINATING};
pub use step::{
    consumer_group_id, ConnectorMetrics, ContainerSpec, DedupeSpec, GitSpec, GroupFormat, GroupSpec, Processor, ScaleSpec, SinkStatus, SourceStatus, Step,
    StepCRD, StepPhase, StepPhaseMessage, StepSpec, StepStatus,
};

/// A convenience trait built around the fact that all implementors
/// must have the following attributes.
pub trait RequiredMetadata {
    /// The namespace of this object.
    fn namespace(&self) -> &str;

    /// The name of this object.
    fn name(&self) -> &str;
}

impl RequiredMetadata for Pipeline {
    fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }
}

impl RequiredMetadata for Step {
    fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }
}

/// Check that the given name is a valid RFC 1123 label.
pub(crate) fn is_rfc_1123_label(name: &str) -> bool {
    if name.is_empty() || name.len() > 63 {
        return false;
    }
    let valid_edge = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
    let first = name.chars().next().map(valid_edge).unwrap_or(false);
    let last = name.chars().last().map(valid_edge).unwrap_or(false);
    first && last && name.chars().all(|c| valid_edge(c) || c == '-')
}

#[cfg(test)]
mod test {
    use super::*;

    macro_rules! rfc_1123_label_test {
        ($name:ident, $pat:literal, $expect:literal) => {
            #[test]
            fn $name() {
                let output = is_rfc_1123_label($pat);
                assert!(
                    $expect == output,
                    "match for pattern {} expected to be {} but got {}",
                    $pat,
                    $expect,
                    output,
                );
            }
        };
    }

    rfc_1123_label_test!(basic_match, "my-step", true);
    rfc_1123_label_test!(basic_mismatch, "my_step", false);
    rfc_1123_label_test!(empty_mismatch, "", false);
    rfc_1123_label_test!(leading_dash_mismatch, "-step", false);
    rfc_1123_label_test!(trailing_dash_mismatch, "step-", false);
    rfc_1123_label_test!(uppercase_mismatch, "Step", false);
}
