//! The Dataflow runner.
//!
//! One binary, three roles, selected by the first argument:
//! - `init` prepares the shared volume (FIFOs, git checkout) and exits;
//! - `sidecar` runs the per-replica streaming dispatcher;
//! - any built-in processor kind (`cat`, `map`, `filter`, `dedupe`, `group`)
//!   runs as the main container speaking the loopback contract.

mod builtin;
mod config;
mod init;
mod sidecar;

use std::io::Write;
use std::mem::MaybeUninit;
use std::sync::{Arc, Once};

use anyhow::{bail, Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusRecorder};
use tracing_subscriber::prelude::*;

use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Setup tracing/logging system.
    tracing_subscriber::registry()
        // Filter spans based on the RUST_LOG env var.
        .with(tracing_subscriber::EnvFilter::from_default_env())
        // Send a copy of all spans to stdout in compact form.
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_ansi(true)
        )
        // Install this registry as the global tracing registry.
        .try_init()
        .context("error initializing logging/tracing system")?;

    let cfg = Arc::new(Config::new()?);
    let recorder = get_metrics_recorder(&cfg);
    metrics::set_recorder(recorder).context("error setting prometheus metrics recorder")?;

    let role = std::env::args().nth(1).unwrap_or_default();
    tracing::info!(
        role = %role,
        pipeline = %cfg.pipeline_name,
        pod = %cfg.pod,
        replica = cfg.replica,
        "starting Dataflow runner",
    );
    let res = match role.as_str() {
        "init" => init::run(&cfg).await,
        "sidecar" => sidecar::run(cfg.clone()).await,
        "cat" | "map" | "filter" | "dedupe" | "group" => builtin::run(cfg.clone(), &role).await,
        other => bail!("unknown runner role {:?}", other),
    };
    if let Err(err) = &res {
        tracing::error!(error = ?err, role = %role, "runner failed");
    }

    // Ensure any pending output is flushed.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    res
}

/// Get a handle to the metrics recorder, initializing it as needed.
pub fn get_metrics_recorder(config: &Config) -> &'static PrometheusRecorder {
    static mut RECORDER: MaybeUninit<PrometheusRecorder> = MaybeUninit::uninit();
    static ONCE: Once = Once::new();
    unsafe {
        ONCE.call_once(|| {
            RECORDER.write(
                PrometheusBuilder::new()
                    .idle_timeout(metrics_util::MetricKindMask::ALL, Some(std::time::Duration::from_secs(60 * 60)))
                    .add_global_label("namespace", config.namespace.clone())
                    .add_global_label("pipeline", config.pipeline_name.clone())
                    .add_global_label("pod", config.pod.clone())
                    .add_global_label("replica", format!("{}", config.replica))
                    .build(),
            );
        });
        RECORDER.assume_init_ref()
    }
}
