//! The sidecar dispatcher.
//!
//! Wires sources through the retry engine into the user container and fans
//! the container's output to the sinks. Startup is strictly ordered; any
//! failure is fatal for the replica (exit code 1). Shutdown runs the
//! pre-stop hooks in LIFO registration order: sources close first, stopping
//! ingress, then the sinks.

mod bridge;
mod hooks;
mod monitor;
mod retry;
mod server;
mod sink;
mod source;
mod status;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use futures::stream::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, Patch, PatchParams};
use kube::client::Client;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::config::Config;
use crate::sidecar::hooks::PreStopHooks;
use crate::sidecar::monitor::Monitor;
use crate::sidecar::server::ServerState;
use crate::sidecar::status::StatusRegistry;
use dataflow_core::connector::{SinkBackend, SourceBackend};
use dataflow_core::crd::StepSpec;
use dataflow_core::ShutdownError;

/// The name of the secret carrying the default broker configuration.
const BROKER_SECRET: &str = "dataflow-kafka-default";
/// The secret key carrying the broker bootstrap URL.
const BROKER_SECRET_KEY_URL: &str = "url";

pub async fn run(config: Arc<Config>) -> Result<()> {
    // 1. Unmarshal & validate the step spec from the environment.
    let step = config.step()?;
    let step_name = step.metadata.name.clone().context("step has no name")?;
    let mut spec = step.spec.clone();
    spec.validate()
        .map_err(|errors| anyhow!("invalid step spec: {}", errors.join("; ")))?;
    tracing::info!(step = %step_name, replica = config.replica, "sidecar starting");

    let client = Client::try_default().await.context("error initializing K8s client")?;
    let (shutdown_tx, _) = broadcast::channel(1);
    let fatal = Arc::new(AtomicBool::new(false));

    // 2. Enrich the spec by resolving broker secrets into concrete URLs.
    enrich_spec(&client, &config, &mut spec).await?;

    // 3. Construct all sinks & combine them into the fan-out.
    let status = Arc::new(StatusRegistry::new(&step_name, config.replica));
    let hooks = Arc::new(PreStopHooks::default());
    let fan_out = Arc::new(sink::connect_sinks(&spec, status.clone(), &hooks).await?);

    // 4. Egress bridge from the user container: the FIFO scanner; the HTTP
    //    `POST /messages` route is served below.
    let egress = bridge::spawn_fifo_egress(fan_out.clone(), fatal.clone(), shutdown_tx.clone());

    // 5. Ingress bridge to the user container.
    let to_main = Arc::new(bridge::MainBridge::connect(&spec).await?);

    // 6. Generate & persist per-source bearer tokens.
    let tokens = ensure_source_tokens(&client, &config, &step_name, &spec).await?;

    // 7. Construct all sources, each callback wrapped in the retry engine.
    //    Their close hooks register after the sink hooks, so LIFO shutdown
    //    stops ingress first.
    let monitor = Arc::new(Monitor::new());
    let http_sources = source::connect_sources(
        &config,
        &spec,
        tokens,
        status.clone(),
        monitor,
        hooks.clone(),
        to_main,
        shutdown_tx.clone(),
    )
    .await?;

    // 8. Status patcher & the sidecar server.
    let patcher = status.spawn_patcher(client.clone(), config.clone(), shutdown_tx.subscribe());
    let server_state = Arc::new(ServerState {
        fan_out,
        http_sources,
        hooks: hooks.clone(),
        metrics: crate::get_metrics_recorder(&config).handle(),
    });
    let server = server::spawn_server(server_state, shutdown_tx.subscribe());

    tracing::info!("sidecar ready");

    // Wait for a shutdown trigger.
    let mut signals = StreamMap::new();
    signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
    signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));
    let mut shutdown_rx = BroadcastStream::new(shutdown_tx.subscribe());
    tokio::select! {
        Some((_, sig)) = signals.next() => {
            tracing::info!(signal = ?sig, "signal received, beginning graceful shutdown");
        }
        _ = shutdown_rx.next() => (),
    }

    // Run pre-stop hooks; a no-op if the kubelet's pre-stop already did.
    hooks.run().await;
    let _res = shutdown_tx.send(());

    if let Err(err) = patcher.await.context("error joining status patcher").and_then(|res| res) {
        tracing::error!(error = ?err, "error shutting down status patcher");
    }
    if let Err(err) = server.await.context("error joining sidecar server").and_then(|res| res) {
        tracing::error!(error = ?err, "error shutting down sidecar server");
    }
    if let Err(err) = egress.await {
        tracing::error!(error = ?err, "error joining egress bridge");
    }

    if fatal.load(Ordering::SeqCst) {
        return Err(ShutdownError(anyhow!("sidecar failed on an unrecovered I/O error")).into());
    }
    tracing::info!("sidecar shutdown complete");
    Ok(())
}

/// Resolve per-backend secrets into concrete URLs on the spec.
async fn enrich_spec(client: &Client, config: &Config, spec: &mut StepSpec) -> Result<()> {
    let needs_broker = spec
        .sources
        .iter()
        .any(|source| matches!(&source.backend, SourceBackend::Kafka(kafka) if kafka.url.is_none()))
        || spec
            .sinks
            .iter()
            .any(|sink| matches!(&sink.backend, SinkBackend::Kafka(kafka) if kafka.url.is_none()));
    if !needs_broker {
        return Ok(());
    }

    let api: Api<Secret> = Api::namespaced(client.clone(), &config.namespace);
    let secret = api
        .get(BROKER_SECRET)
        .await
        .with_context(|| format!("error fetching broker secret {}", BROKER_SECRET))?;
    let url = secret
        .data
        .as_ref()
        .and_then(|data| data.get(BROKER_SECRET_KEY_URL))
        .map(|value| String::from_utf8_lossy(&value.0).to_string())
        .with_context(|| format!("broker secret {} has no {:?} key", BROKER_SECRET, BROKER_SECRET_KEY_URL))?;

    for source in spec.sources.iter_mut() {
        if let SourceBackend::Kafka(kafka) = &mut source.backend {
            if kafka.url.is_none() {
                kafka.url = Some(url.clone());
            }
        }
    }
    for sink in spec.sinks.iter_mut() {
        if let SinkBackend::Kafka(kafka) = &mut sink.backend {
            if kafka.url.is_none() {
                kafka.url = Some(url.clone());
            }
        }
    }
    Ok(())
}

/// Ensure a bearer token exists in the step-scoped secret for every HTTP
/// source, returning the tokens keyed by source name.
async fn ensure_source_tokens(client: &Client, config: &Config, step_name: &str, spec: &StepSpec) -> Result<HashMap<String, String>> {
    let http_sources: Vec<_> = spec
        .sources
        .iter()
        .filter(|source| matches!(source.backend, SourceBackend::Http(_)))
        .map(|source| source.name.clone())
        .collect();
    if http_sources.is_empty() {
        return Ok(HashMap::new());
    }

    let api: Api<Secret> = Api::namespaced(client.clone(), &config.namespace);
    let existing = match api.get(step_name).await {
        Ok(secret) => Some(secret),
        Err(kube::Error::Api(err)) if err.code == http::StatusCode::NOT_FOUND => None,
        Err(err) => return Err(err).with_context(|| format!("error fetching step secret {}", step_name)),
    };

    let mut tokens = HashMap::new();
    let mut missing = HashMap::new();
    for source in http_sources {
        let key = format!("sources.{}.http.authorization", source);
        let known = existing
            .as_ref()
            .and_then(|secret| secret.data.as_ref())
            .and_then(|data| data.get(&key))
            .map(|value| String::from_utf8_lossy(&value.0).to_string());
        match known {
            Some(token) => {
                tokens.insert(source, token);
            }
            None => {
                let token: String = rand::thread_rng().sample_iter(&Alphanumeric).take(32).map(char::from).collect();
                missing.insert(key, token.clone());
                tokens.insert(source, token);
            }
        }
    }
    if missing.is_empty() {
        return Ok(tokens);
    }

    match existing {
        Some(_secret) => {
            let patch = Patch::Merge(serde_json::json!({ "stringData": missing }));
            api.patch(step_name, &PatchParams::default(), &patch)
                .await
                .with_context(|| format!("error patching step secret {}", step_name))?;
        }
        None => {
            let mut secret = Secret::default();
            secret.metadata.name = Some(step_name.to_string());
            secret.metadata.namespace = Some(config.namespace.clone());
            secret.string_data = Some(missing.into_iter().collect());
            match api.create(&Default::default(), &secret).await {
                Ok(_secret) => (),
                // Another replica won the race; its tokens are authoritative.
                Err(kube::Error::Api(err)) if err.code == http::StatusCode::CONFLICT => {
                    let secret = api
                        .get(step_name)
                        .await
                        .with_context(|| format!("error re-fetching step secret {}", step_name))?;
                    for (source, token) in tokens.iter_mut() {
                        let key = format!("sources.{}.http.authorization", source);
                        if let Some(value) = secret.data.as_ref().and_then(|data| data.get(&key)) {
                            *token = String::from_utf8_lossy(&value.0).to_string();
                        }
                    }
                }
                Err(err) => return Err(err).with_context(|| format!("error creating step secret {}", step_name)),
            }
        }
    }
    Ok(tokens)
}
