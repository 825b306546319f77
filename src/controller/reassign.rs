//! Failover of the elastic IP onto a healthy control plane node
//!
//! Candidates are tried in the order given: nodes first, then each node's
//! addresses. The first address answering 200 on `/healthz` wins and the
//! elastic IP is moved to that node's instance. When nobody answers, the
//! current assignment is left alone.
//!
//! Moving the IP is two calls (unassign, then assign) and is not atomic. If
//! the assign fails after the unassign went through, the reservation is left
//! with no assignment; the next node reconciliation treats that as unhealthy
//! and runs a fresh candidate search.

use super::probe::{health_check_url, HealthProber};
use super::ReconcileError;
use crate::cloud::{AddressType, CloudInstances, IpReservation, ReservationService};
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use tracing::{debug, error, info};

/// Dependencies needed to move the elastic IP
pub struct Failover<'a> {
    pub reservations: &'a dyn ReservationService,
    pub instances: &'a dyn CloudInstances,
    pub prober: &'a dyn HealthProber,
}

/// What phase one of a move left behind
#[derive(Debug, PartialEq, Eq)]
enum Detached {
    /// The reservation had no assignment
    Nothing,
    /// The previous assignment was removed
    Released,
}

impl Failover<'_> {
    /// Move `reservation` to the first healthy candidate
    ///
    /// `eip_url` is the elastic IP's own health check URL; addresses that
    /// resolve to it are skipped. Returns the name of the node that now
    /// holds the IP.
    pub async fn reassign(
        &self,
        nodes: &[&Node],
        reservation: &IpReservation,
        eip_url: &str,
        node_port: Option<i32>,
    ) -> Result<String, ReconcileError> {
        debug!(reservation = %reservation.id, candidates = nodes.len(), "Reassigning control plane endpoint");

        let node_port = node_port.ok_or(ReconcileError::NodePortUnknown)?;
        if reservation.assignments.len() > 1 {
            return Err(ReconcileError::MultipleAssignments {
                id: reservation.id.clone(),
            });
        }

        let Some(node) = self.find_candidate(nodes, eip_url, node_port).await? else {
            error!(
                address = %reservation.address,
                "No healthy control plane node found for elastic IP"
            );
            return Err(ReconcileError::NoHealthyCandidate {
                address: reservation.address.clone(),
            });
        };

        self.move_address(reservation, &node).await?;
        Ok(node)
    }

    /// First node with an address answering 200, skipping hostnames and the
    /// elastic IP itself
    async fn find_candidate(
        &self,
        nodes: &[&Node],
        eip_url: &str,
        node_port: i32,
    ) -> Result<Option<String>, ReconcileError> {
        for node in nodes {
            let name = node.name_any();
            let addresses = self
                .instances
                .node_addresses(&name)
                .await
                .map_err(|source| ReconcileError::NodeLookup {
                    node: name.clone(),
                    source,
                })?;

            for address in addresses {
                if address.address_type == AddressType::Hostname {
                    debug!(node = %name, address = %address.address, "Skipping hostname address");
                    continue;
                }

                let url = health_check_url(&address.address, node_port);
                if url == eip_url {
                    debug!(node = %name, url = %url, "Skipping elastic IP address on node");
                    continue;
                }

                info!(node = %name, url = %url, "Health checking control plane node");
                let outcome = self.prober.probe(&address.address, node_port).await;
                if outcome.is_healthy() {
                    return Ok(Some(name));
                }

                match (&outcome.status, &outcome.error) {
                    (Some(status), _) => info!(
                        node = %name,
                        url = %url,
                        status = *status,
                        "Not assigning control plane endpoint to node"
                    ),
                    (None, error) => info!(
                        node = %name,
                        url = %url,
                        error = ?error,
                        "Health check failed for node"
                    ),
                }
            }
        }

        Ok(None)
    }

    /// Move the elastic IP onto `node`'s instance
    async fn move_address(
        &self,
        reservation: &IpReservation,
        node: &str,
    ) -> Result<(), ReconcileError> {
        let instance = self
            .instances
            .instance_id(node)
            .await
            .map_err(|source| ReconcileError::NodeLookup {
                node: node.to_string(),
                source,
            })?;

        let detached = self.detach(reservation).await?;
        self.attach(reservation, &instance, detached).await?;

        info!(
            node = %node,
            instance = %instance,
            address = %reservation.address,
            "Control plane endpoint assigned to new device"
        );
        Ok(())
    }

    /// Phase one: drop the current assignment, if there is one
    async fn detach(&self, reservation: &IpReservation) -> Result<Detached, ReconcileError> {
        let Some(current) = reservation.assignments.first() else {
            return Ok(Detached::Nothing);
        };

        self.reservations
            .unassign_address(&current.id)
            .await
            .map_err(|source| {
                error!(assignment = %current.id, error = %source, "Failed to unassign elastic IP");
                ReconcileError::Unassign {
                    address: reservation.address.clone(),
                    assignment: current.id.clone(),
                    source,
                }
            })?;

        Ok(Detached::Released)
    }

    /// Phase two: assign the elastic IP to `instance`
    async fn attach(
        &self,
        reservation: &IpReservation,
        instance: &str,
        detached: Detached,
    ) -> Result<(), ReconcileError> {
        match self
            .reservations
            .assign_address(instance, &reservation.address)
            .await
        {
            Ok(_) => Ok(()),
            Err(source) => {
                error!(instance = %instance, error = %source, "Failed to assign elastic IP");
                let address = reservation.address.clone();
                let instance = instance.to_string();
                Err(match detached {
                    Detached::Released => ReconcileError::AssignAfterUnassign {
                        address,
                        instance,
                        source,
                    },
                    Detached::Nothing => ReconcileError::Assign {
                        address,
                        instance,
                        source,
                    },
                })
            }
        }
    }
}

#[cfg(test)]
#[path = "reassign_test.rs"]
mod tests;
