//! A script used to generate the CRDs used by this project.
//!
//! Any time a CRD spec changes, this script can be run to ensure that the CRDs are up-to-date and
//! ready to be synced with the cluster.

use anyhow::{Context, Result};
use dataflow_core::crd::{Pipeline, Step};
use kube::CustomResourceExt;

fn main() -> Result<()> {
    let canon = std::fs::canonicalize("..").context("error getting canonical path of current dir")?;
    let crds_path = canon.join("k8s").join("crds");

    let pipeline = Pipeline::crd();
    let pipeline_yaml = serde_yaml::to_string(&pipeline).context("error serializing Pipeline CRD to yaml")?;
    std::fs::write(crds_path.join("pipeline.yaml"), &pipeline_yaml).with_context(|| format!("error writing Pipeline CRD to {:?}", &crds_path))?;
    println!("Pipeline CRD written to {:?}", &crds_path);

    let step = Step::crd();
    let step_yaml = serde_yaml::to_string(&step).context("error serializing Step CRD to yaml")?;
    std::fs::write(crds_path.join("step.yaml"), &step_yaml).with_context(|| format!("error writing Step CRD to {:?}", &crds_path))?;
    println!("Step CRD written to {:?}", &crds_path);

    Ok(())
}
