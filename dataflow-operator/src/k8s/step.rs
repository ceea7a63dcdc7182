//! Step reconciliation.
//!
//! Converges the Pods & Services of a Step with its spec: applies the
//! autoscaler's decision through the scale subresource, creates the
//! deterministically named replica pods, trims excess & stale pods by
//! comparing the pod-spec hash annotation, infers the step phase from pod
//! statuses, and patches the status subresource on change.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource, HTTPGetAction, Handler, Lifecycle, ObjectFieldSelector,
    ObjectReference, Pod, PodSecurityContext, PodSpec, Probe, ResourceRequirements, SecretVolumeSource, SecurityContext, Service, ServicePort, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::Resource;
use sha2::{Digest, Sha256};
use tokio::time::timeout;

use crate::k8s::{is_api_code, set_canonical_labels, step_owner_ref, Controller, ReconcileTask, API_TIMEOUT};
use dataflow_core::crd::{GitSpec, Processor, RequiredMetadata, Step, StepPhase, StepPhaseMessage, StepSpec};
use dataflow_core::connector::SourceBackend;
use dataflow_core::{
    ANNOTATION_HASH, ANNOTATION_KILL_CMD, ANNOTATION_REPLICA, CTR_INIT, CTR_MAIN, CTR_SIDECAR, ENV_CLUSTER, ENV_NAMESPACE, ENV_PIPELINE_NAME, ENV_POD,
    ENV_REPLICA, ENV_STEP, ENV_UPDATE_INTERVAL, LABEL_PIPELINE_NAME, LABEL_STEP_NAME, PATH_VAR_RUN, PATH_WORKING_DIR, PORT_MAIN, PORT_SIDECAR,
};

/// The finalizer owned by the step reconciler, guarding pending-cache teardown.
const STEP_FINALIZER: &str = "dataflow.rs/step-controller";
/// The name of the shared volume carrying the FIFOs.
const VAR_VOLUME_NAME: &str = "var-run-dataflow";
/// The name of the volume carrying SSH credentials for git steps.
const SSH_VOLUME_NAME: &str = "ssh";
/// Container-status reasons which indicate an irrecoverable pod failure.
const FAILED_WAITING_REASONS: &[&str] = &["ImagePullBackOff", "ErrImagePull", "CrashLoopBackOff"];

impl Controller {
    /// Reconcile the named Step.
    #[tracing::instrument(level = "debug", skip(self, name))]
    pub(super) async fn reconcile_step(&self, name: Arc<String>) -> Result<()> {
        let api: Api<Step> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let step = match self.fetch_step(&api, &name).await? {
            Some(step) => step,
            None => {
                self.pending_cache.stop_watch(&name).await;
                return Ok(());
            }
        };

        if step.metadata.deletion_timestamp.is_some() {
            self.pending_cache.stop_watch(&name).await;
            self.remove_finalizer(&api, &step).await?;
            return Ok(());
        }

        let pipeline_name = step
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(LABEL_PIPELINE_NAME))
            .cloned()
            .unwrap_or_default();
        let step_name = step.spec.name.clone();
        tracing::debug!(step = %name, "reconciling step");

        // Apply the autoscaler's decision first; a scale patch re-triggers reconciliation.
        let status = step.status.clone().unwrap_or_default();
        if step.spec.scale.as_ref().and_then(|scale| scale.desired_replicas.as_ref()).is_some() {
            self.ensure_finalizer(&api, &step).await?;
            self.pending_cache.ensure_watch(&step).await;
            let samples = self.pending_cache.get(&name).await;
            let desired = crate::k8s::scaling::desired_replicas(&step, samples, &self.config)?;
            if desired != i64::from(step.spec.replicas) {
                tracing::info!(step = %name, current = step.spec.replicas, desired, "auto-scaling step");
                let patch = Patch::Merge(serde_json::json!({ "spec": { "replicas": desired } }));
                timeout(API_TIMEOUT, api.patch_scale(step.name(), &PatchParams::default(), &patch))
                    .await
                    .context("timeout while scaling step")?
                    .context("error scaling step")?;
                return Ok(());
            }
        }

        let current_replicas = status.replicas;
        let desired_replicas = step.spec.replicas;
        let mut new_status = status.clone();
        if current_replicas != desired_replicas || status.selector.is_none() {
            tracing::info!(step = %name, current_replicas, desired_replicas, "replicas changed");
            new_status.replicas = desired_replicas;
            new_status.last_scaled_at = Some(chrono::Utc::now());
            let reason = if desired_replicas > current_replicas { "ScaleUp" } else { "ScaleDown" };
            self.record_event(step_object_ref(&step), reason, format!("Scaling from {} to {}", current_replicas, desired_replicas))
                .await;
        }

        let selector = format!("{}={},{}={}", LABEL_PIPELINE_NAME, pipeline_name, LABEL_STEP_NAME, step_name);
        new_status.selector = Some(selector.clone());
        let hash = pod_spec_hash(&self.config.runner_image, &step.spec)?;
        let mut phase = StepPhaseMessage::default();

        // Converge pods for each desired replica; creation is idempotent.
        let pods_api: Api<Pod> = Api::namespaced(self.client.clone(), &self.config.namespace);
        for replica in 0..desired_replicas {
            let pod_name = step.pod_name(replica);
            let pod = build_pod(&self.config, &step, &pipeline_name, replica, &hash)?;
            let res = timeout(API_TIMEOUT, pods_api.create(&Default::default(), &pod))
                .await
                .context("timeout while creating pod")?;
            match res {
                Ok(_pod) => tracing::info!(pod = %pod_name, "pod created"),
                Err(err) if is_api_code(&err, http::StatusCode::CONFLICT) => (), // Already exists.
                Err(err) => {
                    phase = phase.min(StepPhaseMessage::new(
                        StepPhase::Failed,
                        "",
                        format!("failed to create pod {}: {}", pod_name, err),
                    ));
                }
            }
        }

        // Converge services: always the headless peer-discovery service, plus
        // one per source which accepts inbound traffic.
        let mut services = BTreeMap::new();
        services.insert(
            step.headless_service_name(),
            build_service(&self.config, &step, &pipeline_name, step.headless_service_name(), true),
        );
        for source in step.spec.sources.iter() {
            if let SourceBackend::Http(http) = &source.backend {
                let service_name = http.service_name.clone().unwrap_or_else(|| format!("{}-{}", pipeline_name, step_name));
                services.insert(service_name.clone(), build_service(&self.config, &step, &pipeline_name, service_name, false));
            }
        }
        let services_api: Api<Service> = Api::namespaced(self.client.clone(), &self.config.namespace);
        for (service_name, service) in services {
            let res = timeout(API_TIMEOUT, services_api.create(&Default::default(), &service))
                .await
                .context("timeout while creating service")?;
            match res {
                Ok(_service) => tracing::info!(service = %service_name, "service created"),
                Err(err) if is_api_code(&err, http::StatusCode::CONFLICT) => (), // Already exists.
                Err(err) => {
                    phase = phase.min(StepPhaseMessage::new(
                        StepPhase::Failed,
                        "",
                        format!("failed to create service {}: {}", service_name, err),
                    ));
                }
            }
        }

        // Trim excess & stale pods, folding the phase of the survivors.
        let params = ListParams::default().labels(&selector);
        let pods = timeout(API_TIMEOUT, pods_api.list(&params))
            .await
            .context("timeout while listing pods")?
            .context("error listing pods")?;
        for pod in pods.items.iter() {
            let pod_name = pod.metadata.name.as_deref().unwrap_or_default();
            let annotations = pod.metadata.annotations.clone().unwrap_or_default();
            let replica: u32 = annotations
                .get(ANNOTATION_REPLICA)
                .and_then(|replica| replica.parse().ok())
                .with_context(|| format!("failed to parse replica of pod {}", pod_name))?;
            let pod_hash = annotations.get(ANNOTATION_HASH).cloned().unwrap_or_default();
            if replica >= desired_replicas || pod_hash != hash {
                tracing::info!(pod = %pod_name, "deleting excess pod");
                let res = timeout(API_TIMEOUT, pods_api.delete(pod_name, &Default::default()))
                    .await
                    .context("timeout while deleting excess pod")?;
                if let Err(err) = res {
                    if !is_api_code(&err, http::StatusCode::NOT_FOUND) {
                        phase = phase.min(StepPhaseMessage::new(
                            StepPhase::Failed,
                            "",
                            format!("failed to delete excess pod {}: {}", pod_name, err),
                        ));
                    }
                }
                continue;
            }

            phase = phase.min(infer_phase(pod));

            // If the main container has terminated cleanly, kill the remaining
            // containers so the pod itself can complete.
            if main_container_terminated(pod) {
                for status in pod.status.iter().flat_map(|status| status.container_statuses.iter().flatten()) {
                    if status.name != CTR_MAIN {
                        if let Err(err) = self.killer.kill_container(pod, &status.name).await {
                            tracing::error!(error = ?err, pod = %pod_name, container = %status.name, "failed to kill container");
                        }
                    }
                }
            }
        }

        new_status.phase = phase.phase;
        new_status.reason = phase.reason;
        new_status.message = phase.message;

        if new_status != status {
            tracing::info!(step = %name, phase = ?new_status.phase, "updating step status");
            let patch = Patch::Merge(serde_json::json!({ "status": new_status }));
            let res = timeout(API_TIMEOUT, api.patch_status(step.name(), &PatchParams::default(), &patch))
                .await
                .context("timeout while updating step status")?;
            if let Err(err) = res {
                // Conflict is ok, we will reconcile again soon.
                if !is_api_code(&err, http::StatusCode::CONFLICT) {
                    return Err(err).context("error updating step status");
                }
            }
        }

        // An idle step at zero replicas has nothing to trigger its next peek,
        // so requeue explicitly.
        if let Some(delay) = crate::k8s::scaling::requeue_after(&step, &self.config)? {
            tracing::debug!(step = %name, delay = ?delay, "requeueing idle step");
            self.spawn_task_after(ReconcileTask::Step(name), delay);
        }

        Ok(())
    }

    /// Fetch the target step, mapping 404 to `None`.
    async fn fetch_step(&self, api: &Api<Step>, name: &str) -> Result<Option<Step>> {
        timeout(API_TIMEOUT, api.get(name))
            .await
            .context("timeout while fetching step")?
            .map(Some)
            .or_else(|err| {
                if is_api_code(&err, http::StatusCode::NOT_FOUND) {
                    Ok(None)
                } else {
                    Err(err)
                }
            })
            .context("error fetching step")
    }

    /// Ensure the reconciler's finalizer is present on the given step.
    async fn ensure_finalizer(&self, api: &Api<Step>, step: &Step) -> Result<()> {
        let mut finalizers = step.metadata.finalizers.clone().unwrap_or_default();
        if finalizers.iter().any(|finalizer| finalizer == STEP_FINALIZER) {
            return Ok(());
        }
        finalizers.push(STEP_FINALIZER.into());
        let patch = Patch::Merge(serde_json::json!({ "metadata": { "finalizers": finalizers } }));
        let res = timeout(API_TIMEOUT, api.patch(step.name(), &PatchParams::default(), &patch))
            .await
            .context("timeout while adding step finalizer")?;
        match res {
            Ok(_step) => Ok(()),
            Err(err) if is_api_code(&err, http::StatusCode::CONFLICT) => Ok(()),
            Err(err) => Err(err).context("error adding step finalizer"),
        }
    }

    /// Remove the reconciler's finalizer from the given step, if present.
    async fn remove_finalizer(&self, api: &Api<Step>, step: &Step) -> Result<()> {
        let finalizers = step.metadata.finalizers.clone().unwrap_or_default();
        if !finalizers.iter().any(|finalizer| finalizer == STEP_FINALIZER) {
            return Ok(());
        }
        let finalizers: Vec<_> = finalizers.into_iter().filter(|finalizer| finalizer != STEP_FINALIZER).collect();
        let patch = Patch::Merge(serde_json::json!({ "metadata": { "finalizers": finalizers } }));
        let res = timeout(API_TIMEOUT, api.patch(step.name(), &PatchParams::default(), &patch))
            .await
            .context("timeout while removing step finalizer")?;
        match res {
            Ok(_step) => Ok(()),
            Err(err) if is_api_code(&err, http::StatusCode::NOT_FOUND) => Ok(()),
            Err(err) => Err(err).context("error removing step finalizer"),
        }
    }
}

/// Build the pod backing the given replica of the given step.
pub(super) fn build_pod(config: &crate::config::Config, step: &Step, pipeline_name: &str, replica: u32, hash: &str) -> Result<Pod> {
    let pod_name = step.pod_name(replica);
    let mut pod = Pod::default();

    // Build metadata.
    let labels = pod.meta_mut().labels.get_or_insert_with(Default::default);
    set_canonical_labels(labels);
    labels.insert(LABEL_PIPELINE_NAME.into(), pipeline_name.into());
    labels.insert(LABEL_STEP_NAME.into(), step.spec.name.clone());
    let annotations = pod.meta_mut().annotations.get_or_insert_with(Default::default);
    annotations.insert(ANNOTATION_REPLICA.into(), replica.to_string());
    annotations.insert(ANNOTATION_HASH.into(), hash.into());
    annotations.insert("kubectl.kubernetes.io/default-container".into(), CTR_MAIN.into());
    let kill_cmd = serde_json::to_string(&["sh", "-c", "kill 1"]).context("error serializing kill command")?;
    annotations.insert(format!("{}{}", ANNOTATION_KILL_CMD, CTR_MAIN), kill_cmd.clone());
    annotations.insert(format!("{}{}", ANNOTATION_KILL_CMD, CTR_SIDECAR), kill_cmd);
    pod.meta_mut().namespace = Some(config.namespace.clone());
    pod.meta_mut().name = Some(pod_name);
    pod.meta_mut().owner_references = Some(vec![step_owner_ref(step)]);

    // Shared volumes.
    let is_git = matches!(step.spec.processor, Processor::Git(_));
    let mut volumes = vec![Volume {
        name: VAR_VOLUME_NAME.into(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }];
    if is_git {
        volumes.push(Volume {
            name: SSH_VOLUME_NAME.into(),
            secret: Some(SecretVolumeSource {
                secret_name: Some("ssh".into()),
                default_mode: Some(0o644),
                ..Default::default()
            }),
            ..Default::default()
        });
    }
    let var_mount = VolumeMount {
        name: VAR_VOLUME_NAME.into(),
        mount_path: PATH_VAR_RUN.into(),
        ..Default::default()
    };

    let env = build_env(config, step, pipeline_name, replica)?;
    let drop_all = SecurityContext {
        capabilities: Some(Capabilities {
            drop: Some(vec!["all".into()]),
            ..Default::default()
        }),
        allow_privilege_escalation: Some(false),
        ..Default::default()
    };

    let mut init_mounts = vec![var_mount.clone()];
    if is_git {
        init_mounts.push(VolumeMount {
            name: SSH_VOLUME_NAME.into(),
            read_only: Some(true),
            mount_path: "/.ssh".into(),
            ..Default::default()
        });
    }
    let init = Container {
        name: CTR_INIT.into(),
        image: Some(config.runner_image.clone()),
        image_pull_policy: Some(config.pull_policy.clone()),
        args: Some(vec!["init".into()]),
        env: Some(env.clone()),
        volume_mounts: Some(init_mounts),
        security_context: Some(drop_all.clone()),
        ..Default::default()
    };

    let sidecar = Container {
        name: CTR_SIDECAR.into(),
        image: Some(config.runner_image.clone()),
        image_pull_policy: Some(config.pull_policy.clone()),
        args: Some(vec!["sidecar".into()]),
        env: Some(env.clone()),
        volume_mounts: Some(vec![var_mount.clone()]),
        ports: Some(vec![ContainerPort {
            container_port: i32::from(PORT_SIDECAR),
            ..Default::default()
        }]),
        readiness_probe: Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/ready".into()),
                port: IntOrString::Int(i32::from(PORT_SIDECAR)),
                ..Default::default()
            }),
            ..Default::default()
        }),
        lifecycle: Some(Lifecycle {
            pre_stop: Some(Handler {
                http_get: Some(HTTPGetAction {
                    path: Some("/pre-stop?source=kubernetes".into()),
                    port: IntOrString::Int(i32::from(PORT_SIDECAR)),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }),
        security_context: Some(drop_all.clone()),
        ..Default::default()
    };

    let main = build_main_container(config, &step.spec, &env, &var_mount, &drop_all);

    // Build spec.
    let spec = pod.spec.get_or_insert_with(Default::default);
    *spec = PodSpec {
        volumes: Some(volumes),
        security_context: Some(PodSecurityContext {
            run_as_non_root: Some(true),
            run_as_user: Some(9653),
            ..Default::default()
        }),
        priority_class_name: if replica == 0 { Some("lead-replica".into()) } else { None },
        hostname: Some(step.pod_name(replica)),
        subdomain: Some(step.headless_service_name()),
        init_containers: Some(vec![init]),
        containers: vec![sidecar, main],
        ..Default::default()
    };

    Ok(pod)
}

/// Build the main container for the given step spec.
fn build_main_container(config: &crate::config::Config, spec: &StepSpec, env: &[EnvVar], var_mount: &VolumeMount, drop_all: &SecurityContext) -> Container {
    let resources = if spec.resources.is_empty() {
        None
    } else {
        Some(ResourceRequirements {
            requests: Some(spec.resources.iter().map(|(key, val)| (key.clone(), Quantity(val.clone()))).collect()),
            ..Default::default()
        })
    };
    let mut main = Container {
        name: CTR_MAIN.into(),
        image_pull_policy: Some(config.pull_policy.clone()),
        volume_mounts: Some(vec![var_mount.clone()]),
        security_context: Some(drop_all.clone()),
        resources,
        ports: Some(vec![ContainerPort {
            container_port: i32::from(PORT_MAIN),
            ..Default::default()
        }]),
        ..Default::default()
    };
    match &spec.processor {
        Processor::Container(container) => {
            main.image = Some(container.image.clone());
            if !container.command.is_empty() {
                main.command = Some(container.command.clone());
            }
            if !container.args.is_empty() {
                main.args = Some(container.args.clone());
            }
            if !container.env.is_empty() {
                main.env = Some(
                    container
                        .env
                        .iter()
                        .map(|(name, value)| EnvVar {
                            name: name.clone(),
                            value: Some(value.clone()),
                            ..Default::default()
                        })
                        .collect(),
                );
            }
        }
        Processor::Git(GitSpec { image, command, .. }) => {
            main.image = Some(image.clone());
            if !command.is_empty() {
                main.command = Some(command.clone());
            }
            main.working_dir = Some(PATH_WORKING_DIR.into());
            main.env = Some(env.to_vec());
        }
        builtin => {
            let kind = match builtin {
                Processor::Cat(_) => "cat",
                Processor::Map(_) => "map",
                Processor::Filter(_) => "filter",
                Processor::Dedupe(_) => "dedupe",
                Processor::Group(_) => "group",
                _ => unreachable!("container & git kinds handled above"),
            };
            main.image = Some(config.runner_image.clone());
            main.args = Some(vec![kind.into()]);
            main.env = Some(env.to_vec());
        }
    }
    main
}

/// Build the environment seeded into the system containers.
fn build_env(config: &crate::config::Config, step: &Step, pipeline_name: &str, replica: u32) -> Result<Vec<EnvVar>> {
    let mut step_json = step.clone();
    step_json.metadata.managed_fields = None;
    let step_json = serde_json::to_string(&step_json).context("error serializing step for env")?;
    let mut env = vec![
        EnvVar {
            name: ENV_CLUSTER.into(),
            value: Some(config.cluster.clone()),
            ..Default::default()
        },
        EnvVar {
            name: ENV_NAMESPACE.into(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: "metadata.namespace".into(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        },
        EnvVar {
            name: ENV_POD.into(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: "metadata.name".into(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        },
        EnvVar {
            name: ENV_PIPELINE_NAME.into(),
            value: Some(pipeline_name.into()),
            ..Default::default()
        },
        EnvVar {
            name: ENV_REPLICA.into(),
            value: Some(replica.to_string()),
            ..Default::default()
        },
        EnvVar {
            name: ENV_STEP.into(),
            value: Some(step_json),
            ..Default::default()
        },
        EnvVar {
            name: ENV_UPDATE_INTERVAL.into(),
            value: Some(format!("{}s", config.update_interval_seconds)),
            ..Default::default()
        },
    ];
    // Pass tracing config straight through to the runtime containers.
    for (key, value) in std::env::vars() {
        if key.starts_with("JAEGER_") {
            env.push(EnvVar {
                name: key,
                value: Some(value),
                ..Default::default()
            });
        }
    }
    Ok(env)
}

/// Build a service fronting the given step's pods.
pub(super) fn build_service(config: &crate::config::Config, step: &Step, pipeline_name: &str, service_name: String, is_headless: bool) -> Service {
    tracing::debug!(step = step.name(), service = %service_name, "creating a new service for step");

    // Build metadata.
    let mut service = Service::default();
    let labels = service.meta_mut().labels.get_or_insert_with(Default::default);
    set_canonical_labels(labels);
    labels.insert(LABEL_PIPELINE_NAME.into(), pipeline_name.into());
    labels.insert(LABEL_STEP_NAME.into(), step.spec.name.clone());
    service.meta_mut().namespace = Some(config.namespace.clone());
    service.meta_mut().name = Some(service_name);
    service.meta_mut().owner_references = Some(vec![step_owner_ref(step)]);

    // Build spec.
    let spec = service.spec.get_or_insert_with(Default::default);
    let selector = spec.selector.get_or_insert_with(Default::default);
    selector.insert(LABEL_PIPELINE_NAME.into(), pipeline_name.into());
    selector.insert(LABEL_STEP_NAME.into(), step.spec.name.clone());
    let port = if is_headless {
        spec.cluster_ip = Some("None".into());
        i32::from(PORT_SIDECAR)
    } else {
        443
    };
    spec.ports = Some(vec![ServicePort {
        port,
        target_port: Some(IntOrString::Int(i32::from(PORT_SIDECAR))),
        protocol: Some("TCP".into()),
        ..Default::default()
    }]);

    service
}

/// Hash the inputs which determine a pod's shape.
///
/// Replicas are excluded so that scaling does not re-create pods.
pub(super) fn pod_spec_hash(runner_image: &str, spec: &StepSpec) -> Result<String> {
    let canonical = serde_json::to_vec(&serde_json::json!({
        "runnerImage": runner_image,
        "stepSpec": spec.without_replicas(),
    }))
    .context("error serializing pod spec hash inputs")?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}

/// Check whether the pod's main container has terminated with exit code 0.
pub(super) fn main_container_terminated(pod: &Pod) -> bool {
    pod.status
        .iter()
        .flat_map(|status| status.container_statuses.iter().flatten())
        .any(|status| {
            status.name == CTR_MAIN
                && status
                    .state
                    .as_ref()
                    .and_then(|state| state.terminated.as_ref())
                    .map(|terminated| terminated.exit_code == 0)
                    .unwrap_or(false)
        })
}

/// Check whether every container of the pod reports ready.
fn pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.container_statuses.as_ref())
        .map(|statuses| !statuses.is_empty() && statuses.iter().all(|status| status.ready))
        .unwrap_or(false)
}

/// Derive a step phase from the given pod's status.
///
/// A pod only counts as Running once every container reports ready; a
/// running pod with an unready container folds in as Pending.
pub(super) fn infer_phase(pod: &Pod) -> StepPhaseMessage {
    let pod_name = pod.metadata.name.as_deref().unwrap_or_default();
    let statuses = pod
        .status
        .iter()
        .flat_map(|status| status.container_statuses.iter().flatten().chain(status.init_container_statuses.iter().flatten()));
    for status in statuses {
        if let Some(waiting) = status.state.as_ref().and_then(|state| state.waiting.as_ref()) {
            let reason = waiting.reason.as_deref().unwrap_or_default();
            if FAILED_WAITING_REASONS.contains(&reason) {
                return StepPhaseMessage::new(
                    StepPhase::Failed,
                    reason,
                    format!("container {} of pod {} is waiting: {}", status.name, pod_name, reason),
                );
            }
        }
        if let Some(terminated) = status.state.as_ref().and_then(|state| state.terminated.as_ref()) {
            if status.name == CTR_MAIN {
                if terminated.exit_code == 0 {
                    return StepPhaseMessage::new(StepPhase::Succeeded, "", "");
                }
                return StepPhaseMessage::new(
                    StepPhase::Failed,
                    "Error",
                    format!("main container of pod {} exited with code {}", pod_name, terminated.exit_code),
                );
            }
        }
    }
    match pod.status.as_ref().and_then(|status| status.phase.as_deref()) {
        Some("Running") if pod_ready(pod) => StepPhaseMessage::new(StepPhase::Running, "", ""),
        Some("Running") | Some("Pending") => StepPhaseMessage::new(StepPhase::Pending, "", ""),
        Some("Succeeded") => StepPhaseMessage::new(StepPhase::Succeeded, "", ""),
        Some("Failed") => StepPhaseMessage::new(StepPhase::Failed, "", format!("pod {} failed", pod_name)),
        _ => StepPhaseMessage::new(StepPhase::Unknown, "", ""),
    }
}

/// Build an object reference for event recording against the given step.
fn step_object_ref(step: &Step) -> ObjectReference {
    ObjectReference {
        api_version: Some(Step::api_version(&()).to_string()),
        kind: Some(Step::kind(&()).to_string()),
        name: step.metadata.name.clone(),
        namespace: step.metadata.namespace.clone(),
        uid: step.metadata.uid.clone(),
        ..Default::default()
    }
}
