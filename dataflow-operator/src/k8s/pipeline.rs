//! Pipeline reconciliation.
//!
//! Converges the child Steps of a Pipeline with its declared spec, aggregates
//! child phases into the pipeline phase, propagates terminator-step completion
//! by killing main containers across the pipeline, and deletes the pipeline
//! once it has sat in a terminal phase for its configured deletion delay.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, Patch, PatchParams};
use tokio::time::timeout;

use crate::k8s::{is_api_code, pipeline_owner_ref, Controller, ReconcileTask, API_TIMEOUT};
use dataflow_core::crd::{
    Pipeline, PipelinePhase, RequiredMetadata, Step, StepCRD, StepPhase, CONDITION_COMPLETED, CONDITION_RUNNING, CONDITION_TERMINATING,
};
use dataflow_core::{CTR_MAIN, LABEL_PIPELINE_NAME, LABEL_STEP_NAME};

impl Controller {
    /// Reconcile the named Pipeline.
    #[tracing::instrument(level = "debug", skip(self, name))]
    pub(super) async fn reconcile_pipeline(&self, name: Arc<String>) -> Result<()> {
        let api: Api<Pipeline> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let pipeline = match self.fetch_pipeline(&api, &name).await? {
            Some(pipeline) => pipeline,
            None => return Ok(()), // Deleted; children follow via owner references.
        };
        if pipeline.metadata.deletion_timestamp.is_some() {
            return Ok(());
        }

        // Auto-delete the pipeline once it has been terminal for its deletion delay.
        let status = pipeline.status.clone().unwrap_or_default();
        if status.phase.completed() {
            let delay = Duration::from_secs(pipeline.spec.deletion_delay_seconds);
            let deadline = status.last_updated.unwrap_or_else(chrono::Utc::now)
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(600));
            let now = chrono::Utc::now();
            if now > deadline {
                tracing::info!(pipeline = %name, "deleting pipeline after deletion delay");
                let res = timeout(API_TIMEOUT, api.delete(&name, &Default::default()))
                    .await
                    .context("timeout while deleting pipeline")?;
                if let Err(err) = res {
                    if !is_api_code(&err, http::StatusCode::NOT_FOUND) {
                        return Err(err).context("error deleting pipeline");
                    }
                }
                return Ok(());
            }
            // Wake again at the deadline; nothing else re-triggers an idle terminal pipeline.
            if let Ok(remaining) = (deadline - now).to_std() {
                self.spawn_task_after(ReconcileTask::Pipeline(name.clone()), remaining);
            }
        }

        tracing::debug!(pipeline = %name, "reconciling pipeline");
        self.upsert_steps(&pipeline).await?;

        // List all children & converge them against the declared steps.
        let steps_api: Api<Step> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let selector = format!("{}={}", LABEL_PIPELINE_NAME, pipeline.name());
        let params = ListParams::default().labels(&selector);
        let children = timeout(API_TIMEOUT, steps_api.list(&params))
            .await
            .context("timeout while listing steps")?
            .context("error listing steps")?;

        let mut new_status = status.clone();
        new_status.phase = PipelinePhase::Unknown;
        let (mut pending, mut running, mut succeeded, mut failed) = (0, 0, 0, 0);
        let mut terminate = false;
        for child in children.items.iter() {
            let step_name = child.spec.name.as_str();
            if !pipeline.spec.has_step(step_name) {
                // This happens when a pipeline changes and a step is removed.
                tracing::info!(pipeline = %name, step = %step_name, "deleting excess step");
                let res = timeout(API_TIMEOUT, steps_api.delete(child.name(), &Default::default()))
                    .await
                    .context("timeout while deleting excess step")?;
                if let Err(err) = res {
                    if !is_api_code(&err, http::StatusCode::NOT_FOUND) {
                        return Err(err).context("error deleting excess step");
                    }
                }
                continue;
            }
            let child_status = child.status.clone().unwrap_or_default();
            let child_phase = match child_status.phase {
                StepPhase::Unknown | StepPhase::Pending => {
                    pending += 1;
                    PipelinePhase::Pending
                }
                StepPhase::Running => {
                    running += 1;
                    PipelinePhase::Running
                }
                StepPhase::Succeeded => {
                    succeeded += 1;
                    PipelinePhase::Succeeded
                }
                StepPhase::Failed => {
                    failed += 1;
                    PipelinePhase::Failed
                }
            };
            new_status.phase = new_status.phase.min(child_phase);
            terminate = terminate || (child_status.phase.completed() && child.spec.terminator);
        }

        // A pipeline which is already terminal has nothing left to terminate.
        if new_status.phase.completed() {
            terminate = false;
        }

        let mut parts = vec![];
        for (count, label) in [(pending, "pending"), (running, "running"), (succeeded, "succeeded"), (failed, "failed")] {
            if count > 0 {
                parts.push(format!("{} {}", count, label));
            }
        }
        if terminate {
            parts.push("terminating".into());
        }
        new_status.message = parts.join(", ");

        new_status.set_condition(CONDITION_RUNNING, new_status.phase == PipelinePhase::Running);
        new_status.set_condition(CONDITION_COMPLETED, new_status.phase.completed());
        new_status.set_condition(CONDITION_TERMINATING, terminate);

        if terminate {
            self.terminate_pipeline_pods(&pipeline).await?;
        }

        if new_status != status {
            new_status.last_updated = Some(chrono::Utc::now());
            tracing::info!(pipeline = %name, phase = ?new_status.phase, message = %new_status.message, "updating pipeline status");
            let patch = Patch::Merge(serde_json::json!({ "status": new_status }));
            let res = timeout(API_TIMEOUT, api.patch_status(pipeline.name(), &PatchParams::default(), &patch))
                .await
                .context("timeout while updating pipeline status")?;
            if let Err(err) = res {
                // Conflict is ok, we will reconcile again soon.
                if !is_api_code(&err, http::StatusCode::CONFLICT) {
                    return Err(err).context("error updating pipeline status");
                }
            }
        }

        Ok(())
    }

    /// Fetch the target pipeline, mapping 404 to `None`.
    async fn fetch_pipeline(&self, api: &Api<Pipeline>, name: &str) -> Result<Option<Pipeline>> {
        timeout(API_TIMEOUT, api.get(name))
            .await
            .context("timeout while fetching pipeline")?
            .map(Some)
            .or_else(|err| {
                if is_api_code(&err, http::StatusCode::NOT_FOUND) {
                    Ok(None)
                } else {
                    Err(err)
                }
            })
            .context("error fetching pipeline")
    }

    /// Create or update the child Step of each declared step spec.
    #[tracing::instrument(level = "debug", skip(self, pipeline))]
    async fn upsert_steps(&self, pipeline: &Pipeline) -> Result<()> {
        let api: Api<Step> = Api::namespaced(self.client.clone(), &self.config.namespace);
        for spec in pipeline.spec.steps.iter() {
            let full_name = format!("{}-{}", pipeline.name(), spec.name);
            let mut step = StepCRD::new(&full_name, spec.clone());
            step.metadata.namespace = Some(self.config.namespace.clone());
            let labels = step.metadata.labels.get_or_insert_with(Default::default);
            labels.insert(LABEL_PIPELINE_NAME.into(), pipeline.name().into());
            labels.insert(LABEL_STEP_NAME.into(), spec.name.clone());
            step.metadata.owner_references = Some(vec![pipeline_owner_ref(pipeline)]);

            let res = timeout(API_TIMEOUT, api.create(&Default::default(), &step))
                .await
                .context("timeout while creating step")?;
            match res {
                Ok(_created) => {
                    tracing::info!(step = %full_name, "step created");
                }
                Err(err) if is_api_code(&err, http::StatusCode::CONFLICT) => {
                    let mut old = timeout(API_TIMEOUT, api.get(&full_name))
                        .await
                        .context("timeout while fetching existing step")?
                        .context("error fetching existing step")?;
                    // Replicas are owned by the scale subresource; never overwrite them here.
                    let mut desired = spec.clone();
                    desired.replicas = old.spec.replicas;
                    if old.spec != desired {
                        tracing::info!(step = %full_name, "updating step due to changed spec");
                        old.spec = desired;
                        let res = timeout(API_TIMEOUT, api.replace(&full_name, &Default::default(), &old))
                            .await
                            .context("timeout while updating step")?;
                        if let Err(err) = res {
                            // Ignore conflicts, we will be reconciling again shortly if this happens.
                            if !is_api_code(&err, http::StatusCode::CONFLICT) {
                                return Err(err).context("error updating step");
                            }
                        }
                    }
                }
                Err(err) => return Err(err).with_context(|| format!("error creating step {}", full_name)),
            }
        }
        Ok(())
    }

    /// Kill the main container of every pod in the pipeline, triggering
    /// graceful shutdown of the remaining steps.
    #[tracing::instrument(level = "debug", skip(self, pipeline))]
    async fn terminate_pipeline_pods(&self, pipeline: &Pipeline) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let selector = format!("{}={}", LABEL_PIPELINE_NAME, pipeline.name());
        let params = ListParams::default().labels(&selector);
        let pods = timeout(API_TIMEOUT, api.list(&params))
            .await
            .context("timeout while listing pipeline pods")?
            .context("error listing pipeline pods")?;
        for pod in pods.items.iter() {
            let has_main = pod
                .status
                .as_ref()
                .and_then(|status| status.container_statuses.as_ref())
                .map(|statuses| statuses.iter().any(|status| status.name == CTR_MAIN))
                .unwrap_or(false);
            if !has_main {
                continue;
            }
            if let Err(err) = self.killer.kill_container(pod, CTR_MAIN).await {
                tracing::error!(error = ?err, pod = ?pod.metadata.name, container = CTR_MAIN, "failed to kill container");
            }
        }
        Ok(())
    }
}
