pub mod backoff;
pub mod connector;
pub mod crd;
pub mod error;
pub mod expr;
pub mod meta;

pub use error::{ShutdownError, ShutdownResult};

/// Comma-separated list of canonical label selectors which match the
/// Dataflow operator's labelling scheme.
pub const DATAFLOW_OPERATOR_LABEL_SELECTORS: &str = "app=dataflow,dataflow.rs/controlled-by=dataflow-operator";

/// The canonical label identifying the pipeline to which an object belongs.
pub const LABEL_PIPELINE_NAME: &str = "dataflow.rs/pipeline";
/// The canonical label identifying the step to which an object belongs.
pub const LABEL_STEP_NAME: &str = "dataflow.rs/step";

/// The annotation carrying a pod's replica index.
pub const ANNOTATION_REPLICA: &str = "dataflow.rs/replica";
/// The annotation carrying the hash of the pod's generating spec.
pub const ANNOTATION_HASH: &str = "dataflow.rs/hash";
/// The annotation prefix carrying the kill command of a container, suffixed by container name.
pub const ANNOTATION_KILL_CMD: &str = "dataflow.rs/kill-cmd.";

/// The pod container name of the sidecar process.
pub const CTR_SIDECAR: &str = "sidecar";
/// The pod container name of the user's main process.
pub const CTR_MAIN: &str = "main";
/// The pod container name of the init process.
pub const CTR_INIT: &str = "init";

/// The fixed port of the sidecar's HTTP interface.
pub const PORT_SIDECAR: u16 = 3570;
/// The fixed port of the main container's loopback HTTP interface.
pub const PORT_MAIN: u16 = 8080;

/// The shared volume carrying the FIFOs between the sidecar and the main container.
pub const PATH_VAR_RUN: &str = "/var/run/argo-dataflow";
/// The FIFO carrying messages from the sidecar into the main container.
pub const PATH_FIFO_IN: &str = "/var/run/argo-dataflow/in";
/// The FIFO carrying messages from the main container back to the sidecar.
pub const PATH_FIFO_OUT: &str = "/var/run/argo-dataflow/out";
/// The working dir into which git steps are checked out.
pub const PATH_WORKING_DIR: &str = "/var/run/argo-dataflow/wd";
/// The on-disk location used by the group processor for per-key groups.
pub const PATH_GROUPS: &str = "/var/run/argo-dataflow/groups";

// Environment variables seeded into the system containers.
pub const ENV_CLUSTER: &str = "CLUSTER";
pub const ENV_NAMESPACE: &str = "NAMESPACE";
pub const ENV_PIPELINE_NAME: &str = "PIPELINE_NAME";
pub const ENV_POD: &str = "POD";
pub const ENV_REPLICA: &str = "REPLICA";
pub const ENV_STEP: &str = "STEP";
pub const ENV_UPDATE_INTERVAL: &str = "UPDATE_INTERVAL";
