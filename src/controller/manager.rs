//! Control plane endpoint manager
//!
//! Checks the elastic IP reserved for the control plane and, when the device
//! behind it stops answering, moves it to a healthy control plane node.
//!
//! On every node reconciliation:
//! 1. Look up the elastic IP by tag. No reservation means nothing to do.
//! 2. Health check `https://{eip}:{port}/healthz`.
//! 3. A 200 means the current device is fine and nothing changes.
//! 4. Otherwise probe the control plane nodes and move the elastic IP to the
//!    first one that answers 200.
//! 5. If no control plane node answers, the cluster is unhealthy and the
//!    current assignment is left as it is.

use super::probe::{health_check_url, HealthProber, TransportErrorPolicy};
use super::reassign::Failover;
use super::reservation::{ensure_single_assignment, resolve_reservation};
use super::state::{ExecutionGuard, PortState};
use super::store::ObjectStore;
use super::{ReconcileError, CONTROL_PLANE_LABELS};
use crate::cloud::{CloudInstances, IpReservation, ReservationService};
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Settings supplied by whoever builds the manager
#[derive(Debug, Clone, Default)]
pub struct ManagerConfig {
    /// Tag identifying the control plane elastic IP
    pub eip_tag: String,
    /// Project the reservation lives in
    pub project_id: String,
    /// Port the elastic IP serves on; 0 takes it from `default/kubernetes`
    pub api_server_port: i32,
    pub transport_error_policy: TransportErrorPolicy,
}

/// Result of a node reconciliation that did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeReconcileOutcome {
    /// Another node reconciliation was still running
    Skipped,
    /// No reservation carries the configured tag
    ReservationNotFound,
    /// The elastic IP answered 200
    Healthy,
    /// The elastic IP was unreachable and the policy says to wait
    Held,
    /// The elastic IP was moved to this node
    Reassigned { node: String },
}

impl NodeReconcileOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeReconcileOutcome::Skipped => "skipped",
            NodeReconcileOutcome::ReservationNotFound => "reservation_not_found",
            NodeReconcileOutcome::Healthy => "healthy",
            NodeReconcileOutcome::Held => "held",
            NodeReconcileOutcome::Reassigned { .. } => "reassigned",
        }
    }
}

/// Whether the node carries a control plane role label
pub fn is_control_plane(node: &Node) -> bool {
    let labels = node.labels();
    CONTROL_PLANE_LABELS
        .iter()
        .any(|label| labels.contains_key(*label))
}

pub struct ControlPlaneEndpointManager {
    pub(super) eip_tag: String,
    pub(super) project_id: String,
    pub(super) transport_error_policy: TransportErrorPolicy,
    pub(super) reservations: Arc<dyn ReservationService>,
    pub(super) instances: Arc<dyn CloudInstances>,
    pub(super) prober: Arc<dyn HealthProber>,
    pub(super) store: Arc<dyn ObjectStore>,
    pub(super) guard: ExecutionGuard,
    pub(super) ports: PortState,
}

impl ControlPlaneEndpointManager {
    pub fn new(
        config: ManagerConfig,
        reservations: Arc<dyn ReservationService>,
        instances: Arc<dyn CloudInstances>,
        prober: Arc<dyn HealthProber>,
        store: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            eip_tag: config.eip_tag,
            project_id: config.project_id,
            transport_error_policy: config.transport_error_policy,
            reservations,
            instances,
            prober,
            store,
            guard: ExecutionGuard::new(),
            ports: PortState::new(config.api_server_port),
        }
    }

    pub fn name(&self) -> &'static str {
        "controlPlaneEndpointManager"
    }

    /// Port the elastic IP serves on, once known
    pub fn api_server_port(&self) -> Option<i32> {
        self.ports.desired_port()
    }

    /// Port the API server listens on on the nodes, once known
    pub fn node_api_server_port(&self) -> Option<i32> {
        self.ports.node_port()
    }

    /// Reservation for the configured tag, rejecting multi-assignment
    pub(super) async fn control_plane_endpoint(
        &self,
    ) -> Result<Option<IpReservation>, ReconcileError> {
        let reservation =
            resolve_reservation(self.reservations.as_ref(), &self.project_id, &self.eip_tag)
                .await?;

        match reservation {
            Some(reservation) => {
                ensure_single_assignment(&reservation)?;
                Ok(Some(reservation))
            }
            None => {
                error!(
                    tag = %self.eip_tag,
                    "Elastic IP not found, verify one exists with the expected tag"
                );
                Ok(None)
            }
        }
    }

    /// Keep the elastic IP on a healthy control plane node
    ///
    /// Single-flight: a call made while another is running returns
    /// [`NodeReconcileOutcome::Skipped`] without touching anything.
    pub async fn reconcile_nodes(
        &self,
        nodes: &[Node],
    ) -> Result<NodeReconcileOutcome, ReconcileError> {
        debug!("New control plane endpoint reconciliation");

        let Some(_permit) = self.guard.try_enter() else {
            debug!("Node reconciliation already in process, not starting a new one");
            return Ok(NodeReconcileOutcome::Skipped);
        };

        let port = self
            .ports
            .desired_port()
            .ok_or(ReconcileError::ApiServerPortUnknown)?;

        let Some(reservation) = self.control_plane_endpoint().await? else {
            return Ok(NodeReconcileOutcome::ReservationNotFound);
        };

        let eip_url = health_check_url(&reservation.address, port);

        if reservation.assignments.is_empty() {
            // Left over from an unassign whose assign never happened
            warn!(
                address = %reservation.address,
                "Elastic IP is not assigned to any device, looking for a healthy control plane node"
            );
        } else {
            info!(url = %eip_url, "Health checking elastic IP");
            let outcome = self.prober.probe(&reservation.address, port).await;
            if outcome.is_healthy() {
                return Ok(NodeReconcileOutcome::Healthy);
            }
            if !self.transport_error_policy.triggers_failover(&outcome) {
                warn!(
                    url = %eip_url,
                    error = ?outcome.error,
                    "Elastic IP unreachable, holding current assignment"
                );
                return Ok(NodeReconcileOutcome::Held);
            }
            warn!(
                url = %eip_url,
                status = ?outcome.status,
                error = ?outcome.error,
                "Elastic IP health check failed, will try to reassign to a healthy node"
            );
        }

        let control_plane: Vec<&Node> = nodes
            .iter()
            .filter(|node| is_control_plane(node))
            .inspect(|node| debug!(node = %node.name_any(), "Adding control plane node"))
            .collect();

        let failover = Failover {
            reservations: self.reservations.as_ref(),
            instances: self.instances.as_ref(),
            prober: self.prober.as_ref(),
        };

        match failover
            .reassign(&control_plane, &reservation, &eip_url, self.ports.node_port())
            .await
        {
            Ok(node) => Ok(NodeReconcileOutcome::Reassigned { node }),
            Err(e) => {
                error!(error = %e, "Error reassigning control plane endpoint to a different device");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
#[path = "manager_test.rs"]
mod tests;
