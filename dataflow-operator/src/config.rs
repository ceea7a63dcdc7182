//! Runtime configuration.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use dataflow_core::expr;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The port on which Prometheus metrics are served.
    pub metrics_port: u16,

    /// The name of the cluster, used to build stable consumer group ids.
    pub cluster: String,
    /// The Kubernetes namespace watched by this operator.
    pub namespace: String,
    /// The name of the pod on which this instance is running.
    pub pod_name: String,

    /// The image used for the init & sidecar containers and the built-in processors.
    pub runner_image: String,
    /// The image pull policy applied to generated containers.
    #[serde(default = "Config::default_pull_policy")]
    pub pull_policy: String,

    /// The interval in seconds at which sidecars patch status & sample pending.
    #[serde(default = "Config::default_update_interval_seconds")]
    pub update_interval_seconds: u64,
    /// The default minimum delay between scaling operations, as a duration literal.
    #[serde(default = "Config::default_scaling_delay")]
    pub default_scaling_delay: String,
    /// The default delay before a zero-replica step is woken to re-measure
    /// pending, as a duration literal.
    #[serde(default = "Config::default_peek_delay")]
    pub default_peek_delay: String,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routine just parses the runtime environment and builds the application
    /// config from that. In the future, this may take into account an optional config file as
    /// well.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        // Surface malformed delay literals at boot rather than at first reconcile.
        let _ = config.scaling_delay()?;
        let _ = config.peek_delay()?;
        Ok(config)
    }

    fn default_pull_policy() -> String {
        "IfNotPresent".into()
    }

    fn default_update_interval_seconds() -> u64 {
        15
    }

    fn default_scaling_delay() -> String {
        "1m".into()
    }

    fn default_peek_delay() -> String {
        "4m".into()
    }

    /// The update interval as a duration.
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_seconds)
    }

    /// The default scaling delay as a duration.
    pub fn scaling_delay(&self) -> Result<Duration> {
        expr::parse_duration(&self.default_scaling_delay).context("invalid DEFAULT_SCALING_DELAY")
    }

    /// The default peek delay as a duration.
    pub fn peek_delay(&self) -> Result<Duration> {
        expr::parse_duration(&self.default_peek_delay).context("invalid DEFAULT_PEEK_DELAY")
    }

    /// Build an instance for use in tests.
    #[cfg(test)]
    pub fn new_test() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            rust_log: "".into(),
            metrics_port: 9090,
            cluster: "test-cluster".into(),
            namespace: "default".into(),
            pod_name: "dataflow-operator-0".into(),
            runner_image: "dataflow/runner:latest".into(),
            pull_policy: Self::default_pull_policy(),
            update_interval_seconds: Self::default_update_interval_seconds(),
            default_scaling_delay: Self::default_scaling_delay(),
            default_peek_delay: Self::default_peek_delay(),
        })
    }
}
