//! Step autoscaling.
//!
//! The autoscaler evaluates a user-supplied expression over the current
//! replica count, the pending count & the pending delta, then applies three
//! guards in order: the scaling-delay gate, the zero-replica peek rule, and
//! ±1 damping. Pending samples are maintained by a per-step cache loop which
//! is started on demand and stopped when the step is deleted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use kube::api::Api;
use kube::client::Client;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::Config;
use dataflow_core::crd::{RequiredMetadata, Step};
use dataflow_core::expr::{self, Env, Value};

/// Compute the desired replica count for the given step.
///
/// `samples` carries `(pending, last_pending)` from the pending cache.
/// Expression-evaluation failures surface as errors; no silent zero.
pub(super) fn desired_replicas(step: &Step, samples: (u64, u64), config: &Config) -> Result<i64> {
    let status = step.status.clone().unwrap_or_default();
    let scale = step.spec.scale.clone().unwrap_or_default();
    let current = i64::from(status.replicas);

    let scaling_delay = eval_delay(scale.scaling_delay.as_deref(), "default_scaling_delay", config.scaling_delay()?)?;
    let peek_delay = eval_delay(scale.peek_delay.as_deref(), "default_peek_delay", config.peek_delay()?)?;

    let mut desired = current;
    if let Some(expression) = scale.desired_replicas.as_deref() {
        let (pending, last_pending) = samples;
        let mut env = Env::new();
        env.insert("c".into(), Value::Int(i64::from(status.replicas)));
        env.insert("P".into(), Value::Int(pending as i64));
        env.insert("p".into(), Value::Int(pending as i64 - last_pending as i64));
        desired = expr::eval_int(expression, &env).with_context(|| format!("failed to evaluate {:?}", expression))?;
        tracing::debug!(
            step = step.name(),
            c = current,
            P = pending,
            p = pending as i64 - last_pending as i64,
            d = desired,
            "desired replicas"
        );
    }

    // Gate consecutive scaling operations.
    let since_scaled = since_last_scaled(step);
    if since_scaled < scaling_delay {
        return Ok(current);
    }

    // Do we need to peek? Current & desired replicas must both be zero.
    if current <= 0 && desired == 0 && since_scaled > peek_delay {
        return Ok(1);
    }

    // Prevent violent scale-up and scale-down by only scaling by 1 each time.
    if desired > current {
        Ok(current + 1)
    } else if desired < current {
        Ok(current - 1)
    } else {
        Ok(desired)
    }
}

/// The requeue delay for the given step, if any.
///
/// A step idle at zero replicas has no pod events to wake it, so the
/// reconciler requeues after the scaling delay to drive the peek loop.
pub(super) fn requeue_after(step: &Step, config: &Config) -> Result<Option<Duration>> {
    if step.spec.replicas != 0 || step.spec.scale.is_none() {
        return Ok(None);
    }
    let scale = step.spec.scale.clone().unwrap_or_default();
    let delay = eval_delay(scale.scaling_delay.as_deref(), "default_scaling_delay", config.scaling_delay()?)?;
    Ok(Some(delay))
}

/// Evaluate an optional duration expression, falling back to the given default.
fn eval_delay(expression: Option<&str>, default_var: &str, default: Duration) -> Result<Duration> {
    let expression = match expression {
        Some(expression) => expression,
        None => return Ok(default),
    };
    let mut env = Env::new();
    env.insert(default_var.into(), Value::Duration(default));
    expr::eval_duration(expression, &env).with_context(|| format!("failed to evaluate {:?}", expression))
}

/// Time since the step last scaled, saturating to a large value when never scaled.
fn since_last_scaled(step: &Step) -> Duration {
    step.status
        .as_ref()
        .and_then(|status| status.last_scaled_at)
        .and_then(|scaled_at| (chrono::Utc::now() - scaled_at).to_std().ok())
        .unwrap_or(Duration::MAX)
}

/// Per-step pending samples, maintained by background sampling loops.
pub struct PendingCache {
    client: Client,
    config: Arc<Config>,
    entries: Mutex<HashMap<String, PendingEntry>>,
}

struct PendingEntry {
    samples: Arc<Mutex<(u64, u64)>>,
    handle: JoinHandle<()>,
}

impl PendingCache {
    /// Create a new instance.
    pub fn new(client: Client, config: Arc<Config>) -> Self {
        Self {
            client,
            config,
            entries: Mutex::new(Default::default()),
        }
    }

    /// Ensure a sampling loop is running for the given step.
    pub async fn ensure_watch(&self, step: &Step) {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(step.name()) {
            return;
        }
        tracing::debug!(step = step.name(), "starting pending cache loop");
        let samples = Arc::new(Mutex::new((0u64, 0u64)));
        let handle = tokio::spawn(Self::sample_loop(
            self.client.clone(),
            self.config.clone(),
            step.name().to_string(),
            samples.clone(),
        ));
        entries.insert(step.name().to_string(), PendingEntry { samples, handle });
    }

    /// Stop the sampling loop of the given step, if running.
    pub async fn stop_watch(&self, name: &str) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.remove(name) {
            tracing::debug!(step = %name, "stopping pending cache loop");
            entry.handle.abort();
        }
    }

    /// Stop all sampling loops.
    pub async fn stop_all(&self) {
        let mut entries = self.entries.lock().await;
        for (_name, entry) in entries.drain() {
            entry.handle.abort();
        }
    }

    /// The latest `(pending, last_pending)` samples of the given step.
    pub async fn get(&self, name: &str) -> (u64, u64) {
        let entries = self.entries.lock().await;
        match entries.get(name) {
            Some(entry) => *entry.samples.lock().await,
            None => (0, 0),
        }
    }

    async fn sample_loop(client: Client, config: Arc<Config>, name: String, samples: Arc<Mutex<(u64, u64)>>) {
        let api: Api<Step> = Api::namespaced(client, &config.namespace);
        let mut interval = tokio::time::interval(config.update_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let step = match api.get(&name).await {
                Ok(step) => step,
                Err(err) => {
                    tracing::debug!(error = ?err, step = %name, "error sampling step pending");
                    continue;
                }
            };
            let pending = step.status.as_ref().map(|status| status.get_pending()).unwrap_or(0);
            let mut samples = samples.lock().await;
            *samples = (pending, samples.0);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use dataflow_core::crd::{ScaleSpec, StepCRD, StepSpec, StepStatus};

    fn step_fixture(replicas: u32, desired_expr: &str, last_scaled_secs_ago: i64) -> Step {
        let spec: StepSpec = serde_yaml::from_str(&format!(
            r#"
name: main
replicas: {}
cat: {{}}
"#,
            replicas
        ))
        .expect("error parsing step spec fixture");
        let mut step = StepCRD::new("pl-main", spec);
        step.spec.scale = Some(ScaleSpec {
            desired_replicas: Some(desired_expr.into()),
            scaling_delay: Some("'1m'".into()),
            peek_delay: Some("'4m'".into()),
        });
        step.status = Some(StepStatus {
            replicas,
            last_scaled_at: Some(chrono::Utc::now() - chrono::Duration::seconds(last_scaled_secs_ago)),
            ..Default::default()
        });
        step
    }

    #[test]
    fn scaling_delay_gates_changes() -> anyhow::Result<()> {
        let step = step_fixture(2, "10", 10);
        let desired = desired_replicas(&step, (0, 0), &Config::new_test())?;
        assert_eq!(desired, 2, "a recently scaled step must not change");
        Ok(())
    }

    #[test]
    fn damping_limits_scale_up_to_one() -> anyhow::Result<()> {
        let step = step_fixture(2, "10", 120);
        let desired = desired_replicas(&step, (0, 0), &Config::new_test())?;
        assert_eq!(desired, 3);
        Ok(())
    }

    #[test]
    fn damping_limits_scale_down_to_one() -> anyhow::Result<()> {
        let step = step_fixture(4, "0", 120);
        let desired = desired_replicas(&step, (0, 0), &Config::new_test())?;
        assert_eq!(desired, 3);
        Ok(())
    }

    #[test]
    fn fixed_point_is_stable() -> anyhow::Result<()> {
        let step = step_fixture(3, "3", 120);
        let desired = desired_replicas(&step, (0, 0), &Config::new_test())?;
        assert_eq!(desired, 3);
        Ok(())
    }

    #[test]
    fn peek_wakes_a_zero_replica_step() -> anyhow::Result<()> {
        // Past the peek delay, pending unknown (expression yields 0): wake one replica.
        let step = step_fixture(0, "P", 600);
        let desired = desired_replicas(&step, (0, 0), &Config::new_test())?;
        assert_eq!(desired, 1);
        Ok(())
    }

    #[test]
    fn no_peek_before_peek_delay() -> anyhow::Result<()> {
        // Past scaling delay but before peek delay: stay at zero.
        let step = step_fixture(0, "P", 120);
        let desired = desired_replicas(&step, (0, 0), &Config::new_test())?;
        assert_eq!(desired, 0);
        Ok(())
    }

    #[test]
    fn pending_drives_the_expression() -> anyhow::Result<()> {
        let step = step_fixture(1, "minmax(0, 4, P / 250)", 120);
        let desired = desired_replicas(&step, (1000, 900), &Config::new_test())?;
        assert_eq!(desired, 2, "desired 4 must be damped to current+1");
        Ok(())
    }

    #[test]
    fn expression_errors_surface() {
        let step = step_fixture(1, "'not an int'", 120);
        assert!(desired_replicas(&step, (0, 0), &Config::new_test()).is_err());
    }

    #[test]
    fn requeue_only_at_zero_replicas() -> anyhow::Result<()> {
        let config = Config::new_test();
        let idle = step_fixture(0, "P", 120);
        assert_eq!(requeue_after(&idle, &config)?, Some(Duration::from_secs(60)));
        let busy = step_fixture(2, "P", 120);
        assert_eq!(requeue_after(&busy, &config)?, None);
        Ok(())
    }
}
