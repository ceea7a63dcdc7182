//! Kubernetes controller.
//!
//! This controller observes the Pipelines, Steps, Pods & Services of its
//! namespace, and converges desired state (the CRs) with observed state (the
//! pods & services) through two level-triggered reconciliation loops. Watcher
//! events are reduced to reconcile tasks carrying only the object name; the
//! reconcilers always re-read fresh state from the API, so no intermediate
//! event is ever load-bearing.

mod killer;
mod pipeline;
mod scaling;
mod step;
#[cfg(test)]
mod step_test;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::prelude::*;
use k8s_openapi::api::core::v1::{Event as K8sEvent, ObjectReference, Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta, OwnerReference};
use kube::api::{Api, ListParams};
use kube::client::Client;
use kube::Resource;
use kube_runtime::watcher::{watcher, Error as WatcherError, Event};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};

use crate::config::Config;
use crate::k8s::killer::ContainerKiller;
use crate::k8s::scaling::PendingCache;
use dataflow_core::crd::{Pipeline, RequiredMetadata, Step};
use dataflow_core::{LABEL_PIPELINE_NAME, LABEL_STEP_NAME};

const APP_NAME: &str = "dataflow-operator";

/// The default timeout to use for API calls.
const API_TIMEOUT: Duration = Duration::from_secs(5);
/// The delay applied before a failed reconcile task is retried.
const RETRY_DELAY: Duration = Duration::from_secs(10);

type EventResult<T> = std::result::Result<Event<T>, WatcherError>;

/// A reconciliation task to be performed.
#[derive(Clone, Debug)]
pub enum ReconcileTask {
    Pipeline(Arc<String>),
    Step(Arc<String>),
}

/// Kubernetes controller for watching Dataflow CRs.
pub struct Controller {
    /// K8s client.
    client: Client,
    /// Runtime config.
    config: Arc<Config>,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// A channel of reconcile tasks.
    tasks_tx: mpsc::Sender<ReconcileTask>,
    /// A channel of reconcile tasks.
    tasks_rx: ReceiverStream<ReconcileTask>,

    /// All known pipeline objects of this namespace.
    pipelines: HashMap<Arc<String>, Pipeline>,
    /// All known step objects of this namespace.
    steps: HashMap<Arc<String>, Step>,

    /// Per-step pending samples used by the autoscaler.
    pending_cache: Arc<PendingCache>,
    /// The container killer used for terminator propagation & sidecar shutdown.
    killer: ContainerKiller,
}

impl Controller {
    /// Create a new instance.
    pub fn new(client: Client, config: Arc<Config>, shutdown_tx: broadcast::Sender<()>) -> Result<Self> {
        let (tasks_tx, tasks_rx) = mpsc::channel(1000);
        let pending_cache = Arc::new(PendingCache::new(client.clone(), config.clone()));
        let killer = ContainerKiller::new(client.clone(), config.clone());
        Ok(Self {
            client,
            config,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            tasks_tx,
            tasks_rx: ReceiverStream::new(tasks_rx),
            pipelines: Default::default(),
            steps: Default::default(),
            pending_cache,
            killer,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        // Build watcher streams.
        let params_spec = ListParams::default();
        let params_labels = self.list_params_cluster_selector_labels();
        let pipelines: Api<Pipeline> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let pipelines_watcher = watcher(pipelines, params_spec.clone());
        let steps: Api<Step> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let steps_watcher = watcher(steps, params_spec);
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let pods_watcher = watcher(pods, params_labels.clone());
        let services: Api<Service> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let services_watcher = watcher(services, params_labels);
        tokio::pin!(pipelines_watcher, steps_watcher, pods_watcher, services_watcher);

        tracing::info!("k8s controller initialized");
        loop {
            tokio::select! {
                Some(k8s_event_res) = pipelines_watcher.next() => self.handle_pipeline_event(k8s_event_res).await,
                Some(k8s_event_res) = steps_watcher.next() => self.handle_step_event(k8s_event_res).await,
                Some(k8s_event_res) = pods_watcher.next() => self.handle_pod_event(k8s_event_res).await,
                Some(k8s_event_res) = services_watcher.next() => self.handle_service_event(k8s_event_res).await,
                Some(task) = self.tasks_rx.next() => self.handle_reconcile_task(task).await,
                _ = self.shutdown_rx.next() => break,
            }
        }

        tracing::debug!("k8s controller shutting down");
        self.pending_cache.stop_all().await;
        tracing::debug!("k8s controller shutdown");
        Ok(())
    }

    /// Handle a reconcile task, retrying with a delay on error.
    #[tracing::instrument(level = "debug", skip(self, task))]
    async fn handle_reconcile_task(&mut self, task: ReconcileTask) {
        let res = match &task {
            ReconcileTask::Pipeline(name) => self.reconcile_pipeline(name.clone()).await,
            ReconcileTask::Step(name) => self.reconcile_step(name.clone()).await,
        };
        if let Err(err) = res {
            tracing::error!(error = ?err, ?task, "error processing reconcile task");
            self.spawn_task(task, true);
        }
    }

    /// Enqueue the given reconcile task, optionally after the standard retry delay.
    pub(super) fn spawn_task(&self, task: ReconcileTask, needs_delay: bool) {
        let delay = if needs_delay { RETRY_DELAY } else { Duration::from_secs(0) };
        self.spawn_task_after(task, delay);
    }

    /// Enqueue the given reconcile task after the given delay.
    pub(super) fn spawn_task_after(&self, task: ReconcileTask, delay: Duration) {
        let tx = self.tasks_tx.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let _res = tx.send(task).await;
        });
    }

    /// Create a list params object which selects only objects matching Dataflow labels.
    fn list_params_cluster_selector_labels(&self) -> ListParams {
        ListParams {
            label_selector: Some(dataflow_core::DATAFLOW_OPERATOR_LABEL_SELECTORS.into()),
            ..Default::default()
        }
    }

    /// Record a K8s event for the given object.
    #[tracing::instrument(level = "debug", skip(self, object_ref, reason, message))]
    pub(super) async fn record_event(&self, object_ref: ObjectReference, reason: &str, message: String) {
        let now = chrono::Utc::now();
        let event = K8sEvent {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}-", APP_NAME)),
                namespace: Some(self.config.namespace.clone()),
                ..Default::default()
            },
            involved_object: object_ref,
            reason: Some(reason.into()),
            message: Some(message),
            type_: Some("Normal".into()),
            reporting_component: Some(APP_NAME.into()),
            reporting_instance: Some(self.config.pod_name.clone()),
            event_time: Some(MicroTime(now)),
            action: Some("Reconcile".into()),
            ..Default::default()
        };
        let api: Api<K8sEvent> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let res = timeout(API_TIMEOUT, api.create(&Default::default(), &event))
            .await
            .context("timeout while creating event")
            .and_then(|res| res.context("error creating event"));
        if let Err(err) = res {
            tracing::error!(error = ?err, "error recording K8s event");
        }
    }
}

//////////////////////////////////////////////////////////////////////////////
// Watcher Events ////////////////////////////////////////////////////////////
impl Controller {
    /// Handle `Pipeline` watcher event.
    #[tracing::instrument(level = "debug", skip(self, res))]
    async fn handle_pipeline_event(&mut self, res: EventResult<Pipeline>) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "error from Pipeline k8s watcher");
                let _ = tokio::time::sleep(RETRY_DELAY).await;
                return;
            }
        };
        match event {
            Event::Applied(obj) => self.pipeline_applied(obj),
            Event::Deleted(obj) => self.pipeline_deleted(obj),
            Event::Restarted(objs) => {
                let old = self.pipelines.clone();
                for obj in objs {
                    self.pipeline_applied(obj);
                }
                for (name, obj) in old {
                    if !self.pipelines.contains_key(name.as_ref()) {
                        self.pipeline_deleted(obj);
                    }
                }
            }
        }
    }

    fn pipeline_applied(&mut self, pipeline: Pipeline) {
        let name_str = match pipeline.metadata.name.as_ref() {
            Some(name_str) => name_str,
            None => return, // Not actually possible as K8s requires name.
        };
        let name = match self.pipelines.get_key_value(name_str) {
            Some((key, _old)) => Arc::clone(key), // No additional alloc.
            None => Arc::new(name_str.clone()),
        };
        self.pipelines.insert(name.clone(), pipeline);
        self.spawn_task(ReconcileTask::Pipeline(name), false);
    }

    fn pipeline_deleted(&mut self, pipeline: Pipeline) {
        let name_str = match pipeline.metadata.name.as_ref() {
            Some(name_str) => name_str,
            None => return, // Not actually possible as K8s requires name.
        };
        let (name, _pipeline) = match self.pipelines.remove_entry(name_str) {
            Some((name, pipeline)) => (name, pipeline),
            None => (Arc::new(name_str.clone()), pipeline),
        };
        // Child steps are deleted by K8s garbage collection via owner references;
        // a reconcile pass is still queued to settle any remaining state.
        self.spawn_task(ReconcileTask::Pipeline(name), false);
    }

    /// Handle `Step` watcher event.
    #[tracing::instrument(level = "debug", skip(self, res))]
    async fn handle_step_event(&mut self, res: EventResult<Step>) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "error from Step k8s watcher");
                let _ = tokio::time::sleep(RETRY_DELAY).await;
                return;
            }
        };
        match event {
            Event::Applied(obj) => self.step_applied(obj),
            Event::Deleted(obj) => self.step_deleted(obj),
            Event::Restarted(objs) => {
                let old = self.steps.clone();
                for obj in objs {
                    self.step_applied(obj);
                }
                for (name, obj) in old {
                    if !self.steps.contains_key(name.as_ref()) {
                        self.step_deleted(obj);
                    }
                }
            }
        }
    }

    fn step_applied(&mut self, step: Step) {
        let name_str = match step.metadata.name.as_ref() {
            Some(name_str) => name_str,
            None => return, // Not actually possible as K8s requires name.
        };
        let name = match self.steps.get_key_value(name_str) {
            Some((key, _old)) => Arc::clone(key), // No additional alloc.
            None => Arc::new(name_str.clone()),
        };
        let parent = step.metadata.labels.as_ref().and_then(|labels| labels.get(LABEL_PIPELINE_NAME)).cloned();
        self.steps.insert(name.clone(), step);
        self.spawn_task(ReconcileTask::Step(name), false);
        if let Some(parent) = parent {
            self.spawn_task(ReconcileTask::Pipeline(Arc::new(parent)), false);
        }
    }

    fn step_deleted(&mut self, step: Step) {
        let name_str = match step.metadata.name.as_ref() {
            Some(name_str) => name_str,
            None => return, // Not actually possible as K8s requires name.
        };
        let (name, step) = match self.steps.remove_entry(name_str) {
            Some((name, step)) => (name, step),
            None => (Arc::new(name_str.clone()), step),
        };
        let parent = step.metadata.labels.as_ref().and_then(|labels| labels.get(LABEL_PIPELINE_NAME)).cloned();
        self.spawn_task(ReconcileTask::Step(name), false);
        if let Some(parent) = parent {
            self.spawn_task(ReconcileTask::Pipeline(Arc::new(parent)), false);
        }
    }

    /// Handle `Pod` watcher event.
    #[tracing::instrument(level = "debug", skip(self, res))]
    async fn handle_pod_event(&mut self, res: EventResult<Pod>) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "error from Pod k8s watcher");
                let _ = tokio::time::sleep(RETRY_DELAY).await;
                return;
            }
        };
        match event {
            Event::Applied(obj) | Event::Deleted(obj) => self.enqueue_step_of(obj.metadata.labels.as_ref()),
            Event::Restarted(objs) => {
                for obj in objs {
                    self.enqueue_step_of(obj.metadata.labels.as_ref());
                }
            }
        }
    }

    /// Handle `Service` watcher event.
    #[tracing::instrument(level = "debug", skip(self, res))]
    async fn handle_service_event(&mut self, res: EventResult<Service>) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "error from Service k8s watcher");
                let _ = tokio::time::sleep(RETRY_DELAY).await;
                return;
            }
        };
        match event {
            Event::Applied(obj) | Event::Deleted(obj) => self.enqueue_step_of(obj.metadata.labels.as_ref()),
            Event::Restarted(objs) => {
                for obj in objs {
                    self.enqueue_step_of(obj.metadata.labels.as_ref());
                }
            }
        }
    }

    /// Enqueue a reconcile of the Step owning an object with the given labels.
    fn enqueue_step_of(&self, labels: Option<&std::collections::BTreeMap<String, String>>) {
        let labels = match labels {
            Some(labels) => labels,
            None => return,
        };
        let (pipeline, step) = match (labels.get(LABEL_PIPELINE_NAME), labels.get(LABEL_STEP_NAME)) {
            (Some(pipeline), Some(step)) => (pipeline, step),
            _ => return,
        };
        self.spawn_task(ReconcileTask::Step(Arc::new(format!("{}-{}", pipeline, step))), false);
    }
}

/// Check if the given API error carries the given HTTP status code.
pub(super) fn is_api_code(err: &kube::Error, code: http::StatusCode) -> bool {
    matches!(err, kube::Error::Api(api_err) if api_err.code == code)
}

/// Set the canonical labels on an object controlled by Dataflow.
pub(super) fn set_canonical_labels(labels: &mut std::collections::BTreeMap<String, String>) {
    labels.insert("app".into(), "dataflow".into());
    labels.insert("dataflow.rs/controlled-by".into(), APP_NAME.into());
}

/// Build an owner reference pointing at the given pipeline.
pub(super) fn pipeline_owner_ref(pipeline: &Pipeline) -> OwnerReference {
    OwnerReference {
        api_version: Pipeline::api_version(&()).to_string(),
        kind: Pipeline::kind(&()).to_string(),
        name: pipeline.name().to_string(),
        uid: pipeline.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Build an owner reference pointing at the given step.
pub(super) fn step_owner_ref(step: &Step) -> OwnerReference {
    OwnerReference {
        api_version: Step::api_version(&()).to_string(),
        kind: Step::kind(&()).to_string(),
        name: step.name().to_string(),
        uid: step.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}
