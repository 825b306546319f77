//! Instance lookups served from the Kubernetes `Node` object
//!
//! The cloud node controller has already written the provider id and
//! addresses onto each node, so the node itself is the source of truth here.

use super::{AddressType, CloudError, CloudInstances, NodeAddress};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::Api;
use kube::Client;

/// Reads instance ids and addresses off `Node` objects
#[derive(Clone)]
pub struct NodeInstances {
    client: Client,
}

impl NodeInstances {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn get_node(&self, node_name: &str) -> Result<Node, CloudError> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.get(node_name).await?)
    }
}

/// Typed addresses from `status.addresses`, in reported order
pub fn addresses_of(node: &Node) -> Vec<NodeAddress> {
    node.status
        .as_ref()
        .and_then(|s| s.addresses.as_ref())
        .map(|addresses| {
            addresses
                .iter()
                .map(|a| NodeAddress::new(AddressType::from(a.type_.as_str()), a.address.clone()))
                .collect()
        })
        .unwrap_or_default()
}

/// Instance id from a provider id such as `equinixmetal://<id>`
///
/// Legacy `packet://<id>` ids and bare ids are accepted as well.
pub fn instance_id_from_provider_id(provider_id: &str) -> Option<String> {
    let id = match provider_id.split_once("://") {
        Some((_, rest)) => rest,
        None => provider_id,
    };
    let id = id.trim_matches('/');
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

#[async_trait]
impl CloudInstances for NodeInstances {
    async fn node_addresses(&self, node_name: &str) -> Result<Vec<NodeAddress>, CloudError> {
        let node = self.get_node(node_name).await?;
        Ok(addresses_of(&node))
    }

    async fn instance_id(&self, node_name: &str) -> Result<String, CloudError> {
        let node = self.get_node(node_name).await?;
        node.spec
            .as_ref()
            .and_then(|s| s.provider_id.as_deref())
            .and_then(instance_id_from_provider_id)
            .ok_or_else(|| CloudError::MissingProviderId(node_name.to_string()))
    }
}
