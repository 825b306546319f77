//! Control plane endpoint reconciliation
//!
//! Keeps the control plane elastic IP on a healthy control plane node and
//! mirrors `default/kubernetes` onto a LoadBalancer service that carries the
//! elastic IP.
//!
//! - [`probe`] - HTTPS health probe against `/healthz`
//! - [`reservation`] - elastic IP lookup by tag
//! - [`reassign`] - failover onto the first healthy control plane node
//! - [`manager`] - node reconciliation entry point
//! - [`mirror`] - service mirror entry point
//! - [`store`] - Service/Endpoints persistence, API-backed and in-memory

pub mod manager;
pub mod mirror;
pub mod probe;
pub mod reassign;
pub mod reservation;
pub mod state;
pub mod store;

#[cfg(test)]
pub(crate) mod fakes;

use crate::cloud::CloudError;
use thiserror::Error;

pub use manager::{ControlPlaneEndpointManager, ManagerConfig, NodeReconcileOutcome};
pub use mirror::ServiceReconcileOutcome;
pub use probe::{HealthProber, HttpsProber, ProbeOutcome, TransportErrorPolicy};
pub use store::{KubeObjectStore, MemoryObjectStore, ObjectStore};

/// Node role labels that mark a control plane node
pub const CONTROL_PLANE_LABELS: [&str; 2] = [
    "node-role.kubernetes.io/control-plane",
    "node-role.kubernetes.io/master",
];

/// Namespace of the API server service that gets mirrored
pub const UPSTREAM_SERVICE_NAMESPACE: &str = "default";

/// Name of the API server service that gets mirrored
pub const UPSTREAM_SERVICE_NAME: &str = "kubernetes";

/// Name of the mirrored LoadBalancer service and its endpoints
pub const EXTERNAL_SERVICE_NAME: &str = "cloud-provider-equinix-metal-kubernetes-external";

/// Namespace of the mirrored LoadBalancer service and its endpoints
pub const EXTERNAL_SERVICE_NAMESPACE: &str = "kube-system";

/// Keeps MetalLB from handing the mirrored service an address of its own
pub const METALLB_ANNOTATION: &str = "metallb.universe.tf/address-pool";
pub const METALLB_DISABLED_TAG: &str = "disabled-metallb-do-not-use-any-address-pool";

/// How complete the service list handed to the service reconciler is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// Full resync with every service in the cluster.
    ///
    /// `default/kubernetes` always exists, so not finding it is an error.
    Sync,

    /// Change notification carrying only the services that changed.
    ///
    /// The upstream service is usually absent; that is not an error.
    Incremental,
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("control plane load balancer elastic IP tag is empty, nothing to do")]
    EmptyTag,

    #[error("control plane apiserver port not provided or determined, cannot check, will try again on next loop")]
    ApiServerPortUnknown,

    #[error("control plane node apiserver port not yet determined, cannot reassign, will try again on next loop")]
    NodePortUnknown,

    #[error("failed to list elastic IP reservations: {0}")]
    ReservationLookup(#[source] CloudError),

    #[error("failed to look up node {node}: {source}")]
    NodeLookup {
        node: String,
        #[source]
        source: CloudError,
    },

    #[error("elastic IP {id} has more than one device assigned to it, which is not supported; fix it manually by unassigning devices")]
    MultipleAssignments { id: String },

    #[error("no healthy control plane node found to take elastic IP {address}, cluster is unhealthy")]
    NoHealthyCandidate { address: String },

    #[error("failed to remove assignment {assignment} of elastic IP {address}: {source}")]
    Unassign {
        address: String,
        assignment: String,
        #[source]
        source: CloudError,
    },

    #[error("failed to assign elastic IP {address} to instance {instance}: {source}")]
    Assign {
        address: String,
        instance: String,
        #[source]
        source: CloudError,
    },

    #[error("elastic IP {address} was unassigned but assigning it to instance {instance} failed; it stays unassigned until the next pass: {source}")]
    AssignAfterUnassign {
        address: String,
        instance: String,
        #[source]
        source: CloudError,
    },

    #[error("service {0} does not have any ports defined")]
    UpstreamServiceHasNoPorts(String),

    #[error("service {0} not found")]
    UpstreamServiceNotFound(String),

    #[error("endpoints {0} not found")]
    UpstreamEndpointsNotFound(String),

    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),
}

impl ReconcileError {
    /// Errors that clear up on their own on a later tick
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReconcileError::ApiServerPortUnknown
                | ReconcileError::NodePortUnknown
                | ReconcileError::ReservationLookup(_)
                | ReconcileError::NodeLookup { .. }
                | ReconcileError::Unassign { .. }
                | ReconcileError::Assign { .. }
                | ReconcileError::AssignAfterUnassign { .. }
                | ReconcileError::KubeError(_)
        )
    }
}
