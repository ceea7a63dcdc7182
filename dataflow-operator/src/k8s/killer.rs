//! Container killer.
//!
//! A thin contract over the pod exec subresource: run the kill command
//! recorded in the pod's per-container kill annotation. Used for terminator
//! propagation and for shutting down sidecars once the main container has
//! exited cleanly.

use std::sync::Arc;

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams};
use kube::client::Client;

use crate::config::Config;
use dataflow_core::ANNOTATION_KILL_CMD;

/// The kill command used when a pod carries no kill annotation for the container.
const DEFAULT_KILL_CMD: &[&str] = &["sh", "-c", "kill 1"];

/// Kills individual containers of managed pods via the exec subresource.
pub struct ContainerKiller {
    client: Client,
    config: Arc<Config>,
}

impl ContainerKiller {
    /// Create a new instance.
    pub fn new(client: Client, config: Arc<Config>) -> Self {
        Self { client, config }
    }

    /// Kill the named container of the given pod.
    #[tracing::instrument(level = "debug", skip(self, pod, container))]
    pub async fn kill_container(&self, pod: &Pod, container: &str) -> Result<()> {
        let pod_name = pod.metadata.name.as_deref().context("pod has no name")?;
        let command = pod
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(&format!("{}{}", ANNOTATION_KILL_CMD, container)))
            .and_then(|raw| serde_json::from_str::<Vec<String>>(raw).ok())
            .unwrap_or_else(|| DEFAULT_KILL_CMD.iter().map(|part| part.to_string()).collect());
        tracing::info!(pod = %pod_name, container = %container, command = ?command, "killing container");

        let api: Api<Pod> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let params = AttachParams::default().container(container).stdout(false).stderr(false);
        api.exec(pod_name, command, &params)
            .await
            .with_context(|| format!("error killing container {} of pod {}", container, pod_name))?;
        Ok(())
    }
}
