use anyhow::Result;
use k8s_openapi::api::core::v1::{ContainerState, ContainerStateTerminated, ContainerStateWaiting, ContainerStatus, Pod, PodStatus};

use crate::config::Config;
use crate::k8s::step::{build_pod, build_service, infer_phase, main_container_terminated, pod_spec_hash};
use dataflow_core::crd::{Step, StepCRD, StepPhase, StepSpec};
use dataflow_core::{ANNOTATION_HASH, ANNOTATION_REPLICA, CTR_INIT, CTR_MAIN, CTR_SIDECAR, ENV_STEP, PORT_SIDECAR};

fn step_fixture(yaml: &str) -> Step {
    let spec: StepSpec = serde_yaml::from_str(yaml).expect("error parsing step spec fixture");
    let name = format!("pl-{}", spec.name);
    let mut step = StepCRD::new(&name, spec);
    step.metadata.namespace = Some("default".into());
    step.metadata.uid = Some("uid-0000".into());
    step
}

fn cat_step() -> Step {
    step_fixture(
        r#"
name: main
cat: {}
sources:
  - name: in
    http: {}
sinks:
  - name: out
    log: {}
"#,
    )
}

fn pod_with_container_state(name: &str, state: ContainerState, ready: bool) -> Pod {
    let mut pod = Pod::default();
    pod.metadata.name = Some("pl-main-0".into());
    pod.status = Some(PodStatus {
        phase: Some("Running".into()),
        container_statuses: Some(vec![ContainerStatus {
            name: name.into(),
            state: Some(state),
            ready,
            ..Default::default()
        }]),
        ..Default::default()
    });
    pod
}

#[test]
fn hash_is_stable_across_replica_changes() -> Result<()> {
    let mut a = cat_step();
    let mut b = cat_step();
    a.spec.replicas = 1;
    b.spec.replicas = 8;
    assert_eq!(pod_spec_hash("img", &a.spec)?, pod_spec_hash("img", &b.spec)?);
    Ok(())
}

#[test]
fn hash_changes_with_spec_or_image() -> Result<()> {
    let a = cat_step();
    let mut b = cat_step();
    b.spec.sinks.clear();
    assert_ne!(pod_spec_hash("img", &a.spec)?, pod_spec_hash("img", &b.spec)?);
    assert_ne!(pod_spec_hash("img-v1", &a.spec)?, pod_spec_hash("img-v2", &a.spec)?);
    Ok(())
}

#[test]
fn pod_carries_system_containers_and_annotations() -> Result<()> {
    let config = Config::new_test();
    let step = cat_step();
    let pod = build_pod(&config, &step, "pl", 0, "abc123")?;

    assert_eq!(pod.metadata.name.as_deref(), Some("pl-main-0"));
    let annotations = pod.metadata.annotations.as_ref().expect("expected pod annotations");
    assert_eq!(annotations.get(ANNOTATION_REPLICA).map(String::as_str), Some("0"));
    assert_eq!(annotations.get(ANNOTATION_HASH).map(String::as_str), Some("abc123"));

    let spec = pod.spec.as_ref().expect("expected pod spec");
    let init = &spec.init_containers.as_ref().expect("expected init containers")[0];
    assert_eq!(init.name, CTR_INIT);
    assert_eq!(init.args.as_deref(), Some(&["init".to_string()][..]));

    let names: Vec<_> = spec.containers.iter().map(|container| container.name.as_str()).collect();
    assert_eq!(names, vec![CTR_SIDECAR, CTR_MAIN], "unexpected containers: {:?}", names);

    let sidecar = &spec.containers[0];
    assert!(sidecar.readiness_probe.is_some(), "sidecar must carry a readiness probe");
    assert!(sidecar.lifecycle.as_ref().and_then(|l| l.pre_stop.as_ref()).is_some(), "sidecar must carry a pre-stop hook");
    let env = sidecar.env.as_ref().expect("expected sidecar env");
    assert!(env.iter().any(|var| var.name == ENV_STEP), "sidecar env must carry the step spec");

    // The built-in cat processor runs the runner image with its kind as the arg.
    let main = &spec.containers[1];
    assert_eq!(main.image.as_deref(), Some(config.runner_image.as_str()));
    assert_eq!(main.args.as_deref(), Some(&["cat".to_string()][..]));

    let security = spec.security_context.as_ref().expect("expected pod security context");
    assert_eq!(security.run_as_non_root, Some(true));
    assert_eq!(security.run_as_user, Some(9653));
    Ok(())
}

#[test]
fn lead_replica_gets_priority_class() -> Result<()> {
    let config = Config::new_test();
    let step = cat_step();
    let lead = build_pod(&config, &step, "pl", 0, "h")?;
    let follower = build_pod(&config, &step, "pl", 1, "h")?;
    assert_eq!(
        lead.spec.as_ref().and_then(|spec| spec.priority_class_name.as_deref()),
        Some("lead-replica")
    );
    assert_eq!(follower.spec.as_ref().and_then(|spec| spec.priority_class_name.as_deref()), None);
    Ok(())
}

#[test]
fn headless_service_exposes_sidecar_port() {
    let config = Config::new_test();
    let step = cat_step();
    let service = build_service(&config, &step, "pl", step.headless_service_name(), true);
    let spec = service.spec.as_ref().expect("expected service spec");
    assert_eq!(spec.cluster_ip.as_deref(), Some("None"));
    assert_eq!(spec.ports.as_ref().expect("expected ports")[0].port, i32::from(PORT_SIDECAR));
}

#[test]
fn source_service_fronts_https() {
    let config = Config::new_test();
    let step = cat_step();
    let service = build_service(&config, &step, "pl", "pl-main".to_string(), false);
    let spec = service.spec.as_ref().expect("expected service spec");
    assert_eq!(spec.cluster_ip, None);
    assert_eq!(spec.ports.as_ref().expect("expected ports")[0].port, 443);
}

#[test]
fn waiting_image_pull_is_failed() {
    let pod = pod_with_container_state(
        CTR_MAIN,
        ContainerState {
            waiting: Some(ContainerStateWaiting {
                reason: Some("ImagePullBackOff".into()),
                ..Default::default()
            }),
            ..Default::default()
        },
        false,
    );
    let phase = infer_phase(&pod);
    assert_eq!(phase.phase, StepPhase::Failed);
    assert_eq!(phase.reason, "ImagePullBackOff");
}

#[test]
fn crash_loop_is_failed() {
    let pod = pod_with_container_state(
        CTR_SIDECAR,
        ContainerState {
            waiting: Some(ContainerStateWaiting {
                reason: Some("CrashLoopBackOff".into()),
                ..Default::default()
            }),
            ..Default::default()
        },
        false,
    );
    assert_eq!(infer_phase(&pod).phase, StepPhase::Failed);
}

#[test]
fn main_exit_zero_is_succeeded() {
    let pod = pod_with_container_state(
        CTR_MAIN,
        ContainerState {
            terminated: Some(ContainerStateTerminated {
                exit_code: 0,
                ..Default::default()
            }),
            ..Default::default()
        },
        false,
    );
    assert_eq!(infer_phase(&pod).phase, StepPhase::Succeeded);
    assert!(main_container_terminated(&pod));
}

#[test]
fn main_exit_nonzero_is_failed() {
    let pod = pod_with_container_state(
        CTR_MAIN,
        ContainerState {
            terminated: Some(ContainerStateTerminated {
                exit_code: 1,
                ..Default::default()
            }),
            ..Default::default()
        },
        false,
    );
    let phase = infer_phase(&pod);
    assert_eq!(phase.phase, StepPhase::Failed);
    assert!(!main_container_terminated(&pod));
}

#[test]
fn running_and_ready_pod_is_running() {
    let pod = pod_with_container_state(CTR_MAIN, ContainerState::default(), true);
    assert_eq!(infer_phase(&pod).phase, StepPhase::Running);
}

#[test]
fn running_but_unready_pod_is_pending() {
    let pod = pod_with_container_state(CTR_MAIN, ContainerState::default(), false);
    assert_eq!(infer_phase(&pod).phase, StepPhase::Pending, "a running pod with an unready container is not yet Running");
}

#[test]
fn running_pod_with_one_unready_container_is_pending() {
    let mut pod = pod_with_container_state(CTR_MAIN, ContainerState::default(), true);
    if let Some(statuses) = pod.status.as_mut().and_then(|status| status.container_statuses.as_mut()) {
        statuses.push(ContainerStatus {
            name: CTR_SIDECAR.into(),
            ready: false,
            ..Default::default()
        });
    }
    assert_eq!(infer_phase(&pod).phase, StepPhase::Pending);
}

#[test]
fn pending_pod_is_pending() {
    let mut pod = Pod::default();
    pod.status = Some(PodStatus {
        phase: Some("Pending".into()),
        ..Default::default()
    });
    assert_eq!(infer_phase(&pod).phase, StepPhase::Pending);
}
