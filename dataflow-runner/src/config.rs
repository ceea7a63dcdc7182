//! Runtime configuration.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use dataflow_core::crd::Step;
use dataflow_core::expr;

/// Runtime configuration data, seeded by the operator into every system container.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    #[serde(default)]
    pub rust_log: String,
    /// The name of the cluster, used to build stable consumer group ids.
    pub cluster: String,
    /// The Kubernetes namespace of this pod.
    pub namespace: String,
    /// The name of the pipeline to which this pod belongs.
    pub pipeline_name: String,
    /// The name of the pod on which this instance is running.
    pub pod: String,
    /// The replica index of this pod within its step.
    pub replica: u32,
    /// The JSON serialized Step resource, without managed fields.
    pub step: String,
    /// The interval at which status is patched & pending sampled, as a duration literal.
    #[serde(default = "Config::default_update_interval")]
    pub update_interval: String,
    /// The port on which Prometheus metrics are served.
    #[serde(default = "Config::default_metrics_port")]
    pub metrics_port: u16,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routine just parses the runtime environment and builds the application
    /// config from that.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        // Fail fast on malformed payloads rather than at first use.
        let _ = config.step()?;
        let _ = config.update_interval()?;
        Ok(config)
    }

    fn default_update_interval() -> String {
        "15s".into()
    }

    fn default_metrics_port() -> u16 {
        9090
    }

    /// The Step resource this replica belongs to.
    pub fn step(&self) -> Result<Step> {
        serde_json::from_str(&self.step).context("error parsing STEP from env")
    }

    /// The update interval as a duration.
    pub fn update_interval(&self) -> Result<Duration> {
        expr::parse_duration(&self.update_interval).context("invalid UPDATE_INTERVAL")
    }

    /// Whether this replica is the lead replica of its step.
    ///
    /// The lead replica is uniquely responsible for pending reporting.
    pub fn lead_replica(&self) -> bool {
        self.replica == 0
    }

    /// Build an instance for use in tests.
    #[cfg(test)]
    pub fn new_test(step_yaml: &str) -> std::sync::Arc<Self> {
        let spec: dataflow_core::crd::StepSpec = serde_yaml::from_str(step_yaml).expect("error parsing test step spec");
        let name = format!("test-{}", spec.name);
        let mut step = dataflow_core::crd::StepCRD::new(&name, spec);
        step.metadata.namespace = Some("default".into());
        std::sync::Arc::new(Self {
            rust_log: "".into(),
            cluster: "test-cluster".into(),
            namespace: "default".into(),
            pipeline_name: "test".into(),
            pod: format!("{}-0", name),
            replica: 0,
            step: serde_json::to_string(&step).expect("error serializing test step"),
            update_interval: Self::default_update_interval(),
            metrics_port: Self::default_metrics_port(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use dataflow_core::crd::Processor;

    #[test]
    fn step_round_trips_through_env_payload() -> Result<()> {
        let config = Config::new_test("{name: main, cat: {}}");
        let step = config.step()?;
        assert_eq!(step.spec.name, "main");
        assert!(matches!(step.spec.processor, Processor::Cat(_)));
        assert_eq!(config.update_interval()?, Duration::from_secs(15));
        assert!(config.lead_replica());
        Ok(())
    }
}
