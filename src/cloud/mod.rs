//! Cloud-side seams used by the control plane endpoint manager
//!
//! - [`ReservationService`] - floating IP reservations (list/assign/unassign)
//! - [`CloudInstances`] - node name to instance id and typed addresses
//!
//! Production implementations live in [`metal`] (Equinix Metal REST API) and
//! [`instances`] (addresses read from the Kubernetes `Node` object).

pub mod instances;
pub mod metal;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

pub use instances::NodeInstances;
pub use metal::MetalClient;

/// Errors returned by the cloud seams
#[derive(Debug, Error)]
pub enum CloudError {
    #[error("HTTP error talking to the cloud API: {0}")]
    Http(#[from] reqwest::Error),

    #[error("cloud API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("node {0} has no provider id")]
    MissingProviderId(String),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

/// A floating IP reservation with its current device assignments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpReservation {
    pub id: String,
    pub address: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub assignments: Vec<IpAssignment>,
}

impl IpReservation {
    /// True when every required tag is present on the reservation
    pub fn has_all_tags(&self, required: &[String]) -> bool {
        required.iter().all(|tag| self.tags.contains(tag))
    }
}

/// One assignment of a reservation to a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpAssignment {
    pub id: String,
}

/// Kind of a node address, mirroring `NodeAddress.type` in the core API
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressType {
    Hostname,
    InternalIp,
    ExternalIp,
    InternalDns,
    ExternalDns,
    Other(String),
}

impl From<&str> for AddressType {
    fn from(value: &str) -> Self {
        match value {
            "Hostname" => AddressType::Hostname,
            "InternalIP" => AddressType::InternalIp,
            "ExternalIP" => AddressType::ExternalIp,
            "InternalDNS" => AddressType::InternalDns,
            "ExternalDNS" => AddressType::ExternalDns,
            other => AddressType::Other(other.to_string()),
        }
    }
}

impl fmt::Display for AddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressType::Hostname => f.write_str("Hostname"),
            AddressType::InternalIp => f.write_str("InternalIP"),
            AddressType::ExternalIp => f.write_str("ExternalIP"),
            AddressType::InternalDns => f.write_str("InternalDNS"),
            AddressType::ExternalDns => f.write_str("ExternalDNS"),
            AddressType::Other(other) => f.write_str(other),
        }
    }
}

/// A typed node address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAddress {
    pub address_type: AddressType,
    pub address: String,
}

impl NodeAddress {
    pub fn new(address_type: AddressType, address: impl Into<String>) -> Self {
        Self {
            address_type,
            address: address.into(),
        }
    }
}

/// Floating IP reservation API
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReservationService: Send + Sync {
    /// List every reservation in the project, assignments included
    async fn list_reservations(&self, project_id: &str) -> Result<Vec<IpReservation>, CloudError>;

    /// Assign `address` to the instance, returning the new assignment
    async fn assign_address(
        &self,
        instance_id: &str,
        address: &str,
    ) -> Result<IpAssignment, CloudError>;

    /// Remove an existing assignment
    async fn unassign_address(&self, assignment_id: &str) -> Result<(), CloudError>;
}

/// Node name to cloud instance lookups
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CloudInstances: Send + Sync {
    /// Typed addresses of the node, in the order the provider reports them
    async fn node_addresses(&self, node_name: &str) -> Result<Vec<NodeAddress>, CloudError>;

    /// Cloud instance (device) id backing the node
    async fn instance_id(&self, node_name: &str) -> Result<String, CloudError>;
}
