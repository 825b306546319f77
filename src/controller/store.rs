//! Service and Endpoints persistence used by the service mirror

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Endpoints, Service, ServiceStatus};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Namespaced reads and writes of Services and Endpoints
///
/// `replace_*` write back an object previously returned by `get_*`, so the
/// stored resource version guards against lost updates.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_endpoints(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Endpoints>, kube::Error>;

    async fn create_endpoints(
        &self,
        namespace: &str,
        endpoints: &Endpoints,
    ) -> Result<Endpoints, kube::Error>;

    async fn replace_endpoints(
        &self,
        namespace: &str,
        endpoints: &Endpoints,
    ) -> Result<Endpoints, kube::Error>;

    async fn get_service(&self, namespace: &str, name: &str)
        -> Result<Option<Service>, kube::Error>;

    async fn create_service(
        &self,
        namespace: &str,
        service: &Service,
    ) -> Result<Service, kube::Error>;

    async fn replace_service(
        &self,
        namespace: &str,
        service: &Service,
    ) -> Result<Service, kube::Error>;

    /// Overwrite the status subresource of a service
    async fn replace_service_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ServiceStatus,
    ) -> Result<Service, kube::Error>;
}

/// [`ObjectStore`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeObjectStore {
    client: Client,
}

impl KubeObjectStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn endpoints(&self, namespace: &str) -> Api<Endpoints> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn services(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ObjectStore for KubeObjectStore {
    async fn get_endpoints(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Endpoints>, kube::Error> {
        self.endpoints(namespace).get_opt(name).await
    }

    async fn create_endpoints(
        &self,
        namespace: &str,
        endpoints: &Endpoints,
    ) -> Result<Endpoints, kube::Error> {
        self.endpoints(namespace)
            .create(&PostParams::default(), endpoints)
            .await
    }

    async fn replace_endpoints(
        &self,
        namespace: &str,
        endpoints: &Endpoints,
    ) -> Result<Endpoints, kube::Error> {
        self.endpoints(namespace)
            .replace(&endpoints.name_any(), &PostParams::default(), endpoints)
            .await
    }

    async fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Service>, kube::Error> {
        self.services(namespace).get_opt(name).await
    }

    async fn create_service(
        &self,
        namespace: &str,
        service: &Service,
    ) -> Result<Service, kube::Error> {
        self.services(namespace)
            .create(&PostParams::default(), service)
            .await
    }

    async fn replace_service(
        &self,
        namespace: &str,
        service: &Service,
    ) -> Result<Service, kube::Error> {
        self.services(namespace)
            .replace(&service.name_any(), &PostParams::default(), service)
            .await
    }

    async fn replace_service_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ServiceStatus,
    ) -> Result<Service, kube::Error> {
        let patch = status_patch(status);
        self.services(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
    }
}

/// Merge patch body for a status write
///
/// Carries only the status; a merge patch replaces the ingress list wholesale.
pub(crate) fn status_patch(status: &ServiceStatus) -> serde_json::Value {
    json!({ "status": status })
}

type Key = (String, String);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// [`ObjectStore`] keeping Services and Endpoints in memory
///
/// Runs the service mirror without a cluster. Every write is appended to
/// [`writes`](Self::writes) as `"<verb> <kind> <ns>/<name>"`.
#[derive(Default)]
pub struct MemoryObjectStore {
    endpoints: Mutex<BTreeMap<Key, Endpoints>>,
    services: Mutex<BTreeMap<Key, Service>>,
    writes: Mutex<Vec<String>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object without recording a write
    pub fn insert_endpoints(&self, endpoints: Endpoints) {
        let key = (endpoints.namespace().unwrap_or_default(), endpoints.name_any());
        lock(&self.endpoints).insert(key, endpoints);
    }

    /// Seed an object without recording a write
    pub fn insert_service(&self, service: Service) {
        let key = (service.namespace().unwrap_or_default(), service.name_any());
        lock(&self.services).insert(key, service);
    }

    pub fn endpoints(&self, namespace: &str, name: &str) -> Option<Endpoints> {
        lock(&self.endpoints)
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn service(&self, namespace: &str, name: &str) -> Option<Service> {
        lock(&self.services)
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn writes(&self) -> Vec<String> {
        lock(&self.writes).clone()
    }

    fn record(&self, verb: &str, kind: &str, namespace: &str, name: &str) {
        lock(&self.writes).push(format!("{} {} {}/{}", verb, kind, namespace, name));
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get_endpoints(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Endpoints>, kube::Error> {
        Ok(self.endpoints(namespace, name))
    }

    async fn create_endpoints(
        &self,
        namespace: &str,
        endpoints: &Endpoints,
    ) -> Result<Endpoints, kube::Error> {
        let name = endpoints.name_any();
        self.record("create", "endpoints", namespace, &name);
        lock(&self.endpoints).insert((namespace.to_string(), name), endpoints.clone());
        Ok(endpoints.clone())
    }

    async fn replace_endpoints(
        &self,
        namespace: &str,
        endpoints: &Endpoints,
    ) -> Result<Endpoints, kube::Error> {
        let name = endpoints.name_any();
        self.record("replace", "endpoints", namespace, &name);
        lock(&self.endpoints).insert((namespace.to_string(), name), endpoints.clone());
        Ok(endpoints.clone())
    }

    async fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Service>, kube::Error> {
        Ok(self.service(namespace, name))
    }

    async fn create_service(
        &self,
        namespace: &str,
        service: &Service,
    ) -> Result<Service, kube::Error> {
        let name = service.name_any();
        self.record("create", "service", namespace, &name);
        lock(&self.services).insert((namespace.to_string(), name), service.clone());
        Ok(service.clone())
    }

    async fn replace_service(
        &self,
        namespace: &str,
        service: &Service,
    ) -> Result<Service, kube::Error> {
        let name = service.name_any();
        self.record("replace", "service", namespace, &name);
        // Status is a subresource; a spec write leaves it as stored
        let mut services = lock(&self.services);
        let key = (namespace.to_string(), name);
        let status = services.get(&key).and_then(|s| s.status.clone());
        let mut stored = service.clone();
        stored.status = status;
        services.insert(key, stored.clone());
        Ok(stored)
    }

    async fn replace_service_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ServiceStatus,
    ) -> Result<Service, kube::Error> {
        self.record("status", "service", namespace, name);
        let mut services = lock(&self.services);
        let service = services
            .entry((namespace.to_string(), name.to_string()))
            .or_default();
        service.status = Some(status.clone());
        Ok(service.clone())
    }
}

#[cfg(test)]
#[path = "store_test.rs"]
mod tests;
