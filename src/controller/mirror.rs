//! Mirror of `default/kubernetes` onto a LoadBalancer service
//!
//! Publishes the API server behind the elastic IP:
//! - Endpoints: a copy of the `default/kubernetes` endpoint subsets
//! - Service: `type: LoadBalancer`, `loadBalancerIP` set to the elastic IP,
//!   ports copied from `default/kubernetes` with the first port set to the
//!   serving port
//! - Status: a single load balancer ingress carrying the elastic IP
//!
//! Existing objects are updated in place. Only the fields listed above are
//! written; everything else on a stored object is kept.

use super::manager::ControlPlaneEndpointManager;
use super::{
    ReconcileError, UpdateMode, EXTERNAL_SERVICE_NAME, EXTERNAL_SERVICE_NAMESPACE,
    METALLB_ANNOTATION, METALLB_DISABLED_TAG, UPSTREAM_SERVICE_NAME, UPSTREAM_SERVICE_NAMESPACE,
};
use k8s_openapi::api::core::v1::{
    EndpointSubset, Endpoints, LoadBalancerIngress, LoadBalancerStatus, Service, ServicePort,
    ServiceSpec, ServiceStatus,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use std::collections::BTreeMap;
use tracing::{debug, error, info, warn};

/// Result of a service reconciliation that did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceReconcileOutcome {
    /// No reservation carries the configured tag
    ReservationNotFound,
    /// `default/kubernetes` was not among the services passed in
    UpstreamAbsent,
    /// Mirrored service, endpoints and status are in place
    Mirrored,
}

impl ServiceReconcileOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceReconcileOutcome::ReservationNotFound => "reservation_not_found",
            ServiceReconcileOutcome::UpstreamAbsent => "upstream_absent",
            ServiceReconcileOutcome::Mirrored => "mirrored",
        }
    }
}

fn upstream_id() -> String {
    format!("{}/{}", UPSTREAM_SERVICE_NAMESPACE, UPSTREAM_SERVICE_NAME)
}

fn is_upstream(service: &Service) -> bool {
    service.namespace().as_deref() == Some(UPSTREAM_SERVICE_NAMESPACE)
        && service.name_any() == UPSTREAM_SERVICE_NAME
}

/// Port the API server listens on on the nodes
///
/// An unset target port defaults to the service port, as Kubernetes does. A
/// named target port cannot be resolved from the service alone.
pub fn node_port_of(port: &ServicePort) -> Option<i32> {
    match &port.target_port {
        Some(IntOrString::Int(value)) if *value != 0 => Some(*value),
        Some(IntOrString::Int(_)) | None => Some(port.port),
        Some(IntOrString::String(_)) => None,
    }
}

/// Upstream ports with the first one serving on `serving_port`
pub fn mirrored_ports(upstream: &[ServicePort], serving_port: Option<i32>) -> Vec<ServicePort> {
    let mut ports = upstream.to_vec();
    if let (Some(first), Some(port)) = (ports.first_mut(), serving_port) {
        first.port = port;
    }
    ports
}

/// Fresh mirrored endpoints carrying `subsets`
pub fn build_mirrored_endpoints(subsets: Option<Vec<EndpointSubset>>) -> Endpoints {
    Endpoints {
        metadata: ObjectMeta {
            name: Some(EXTERNAL_SERVICE_NAME.to_string()),
            namespace: Some(EXTERNAL_SERVICE_NAMESPACE.to_string()),
            ..Default::default()
        },
        subsets,
    }
}

/// Fresh mirrored LoadBalancer service for `eip`
pub fn build_mirrored_service(eip: &str, ports: Vec<ServicePort>) -> Service {
    let annotations = BTreeMap::from([(
        METALLB_ANNOTATION.to_string(),
        METALLB_DISABLED_TAG.to_string(),
    )]);

    Service {
        metadata: ObjectMeta {
            name: Some(EXTERNAL_SERVICE_NAME.to_string()),
            namespace: Some(EXTERNAL_SERVICE_NAMESPACE.to_string()),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("LoadBalancer".to_string()),
            load_balancer_ip: Some(eip.to_string()),
            ports: Some(ports),
            ..Default::default()
        }),
        status: None,
    }
}

/// Status with a single ingress entry for `eip`
pub fn load_balancer_status(eip: &str) -> ServiceStatus {
    ServiceStatus {
        load_balancer: Some(LoadBalancerStatus {
            ingress: Some(vec![LoadBalancerIngress {
                ip: Some(eip.to_string()),
                ..Default::default()
            }]),
        }),
        ..Default::default()
    }
}

impl ControlPlaneEndpointManager {
    /// Mirror `default/kubernetes` onto the elastic IP service
    ///
    /// Also records the node-side API server port for the node reconciler,
    /// and adopts it as the serving port when none was configured.
    pub async fn reconcile_services(
        &self,
        services: &[Service],
        mode: UpdateMode,
    ) -> Result<ServiceReconcileOutcome, ReconcileError> {
        let Some(reservation) = self.control_plane_endpoint().await? else {
            return Ok(ServiceReconcileOutcome::ReservationNotFound);
        };
        let eip = reservation.address.as_str();

        let Some(upstream) = services.iter().find(|s| is_upstream(s)) else {
            return match mode {
                UpdateMode::Sync => {
                    error!(service = %upstream_id(), "Service not found during full sync");
                    Err(ReconcileError::UpstreamServiceNotFound(upstream_id()))
                }
                UpdateMode::Incremental => Ok(ServiceReconcileOutcome::UpstreamAbsent),
            };
        };

        let upstream_ports = upstream
            .spec
            .as_ref()
            .and_then(|s| s.ports.as_deref())
            .unwrap_or_default();
        let Some(first_port) = upstream_ports.first() else {
            error!(service = %upstream_id(), "Service does not have any ports defined");
            return Err(ReconcileError::UpstreamServiceHasNoPorts(upstream_id()));
        };

        let serving_port = match node_port_of(first_port) {
            Some(node_port) => Some(self.ports.observe_node_port(node_port)),
            None => {
                warn!(
                    service = %upstream_id(),
                    target_port = ?first_port.target_port,
                    "Named target port cannot be resolved, node API server port left unchanged"
                );
                self.ports.desired_port()
            }
        };

        self.mirror_endpoints().await?;
        self.mirror_service(eip, mirrored_ports(upstream_ports, serving_port))
            .await?;

        self.store
            .replace_service_status(
                EXTERNAL_SERVICE_NAMESPACE,
                EXTERNAL_SERVICE_NAME,
                &load_balancer_status(eip),
            )
            .await
            .inspect_err(|e| error!(error = %e, "Failed to update service status"))?;

        info!(
            service = %EXTERNAL_SERVICE_NAME,
            address = %eip,
            port = ?serving_port,
            "Control plane endpoint service mirrored"
        );
        Ok(ServiceReconcileOutcome::Mirrored)
    }

    /// Copy the upstream endpoint subsets onto the mirrored endpoints
    async fn mirror_endpoints(&self) -> Result<(), ReconcileError> {
        let upstream = self
            .store
            .get_endpoints(UPSTREAM_SERVICE_NAMESPACE, UPSTREAM_SERVICE_NAME)
            .await
            .inspect_err(|e| debug!(error = %e, "Failed to get upstream endpoints"))?
            .ok_or_else(|| ReconcileError::UpstreamEndpointsNotFound(upstream_id()))?;

        match self
            .store
            .get_endpoints(EXTERNAL_SERVICE_NAMESPACE, EXTERNAL_SERVICE_NAME)
            .await?
        {
            Some(mut existing) => {
                existing.subsets = upstream.subsets;
                self.store
                    .replace_endpoints(EXTERNAL_SERVICE_NAMESPACE, &existing)
                    .await
                    .inspect_err(|e| error!(error = %e, "Failed to update mirrored endpoints"))?;
            }
            None => {
                info!(
                    namespace = %EXTERNAL_SERVICE_NAMESPACE,
                    name = %EXTERNAL_SERVICE_NAME,
                    "Endpoints did not yet exist, creating"
                );
                self.store
                    .create_endpoints(
                        EXTERNAL_SERVICE_NAMESPACE,
                        &build_mirrored_endpoints(upstream.subsets),
                    )
                    .await
                    .inspect_err(|e| error!(error = %e, "Failed to create mirrored endpoints"))?;
            }
        }
        Ok(())
    }

    /// Create the mirrored service, or update its address and ports
    async fn mirror_service(
        &self,
        eip: &str,
        ports: Vec<ServicePort>,
    ) -> Result<(), ReconcileError> {
        match self
            .store
            .get_service(EXTERNAL_SERVICE_NAMESPACE, EXTERNAL_SERVICE_NAME)
            .await?
        {
            Some(mut existing) => {
                debug!(service = %EXTERNAL_SERVICE_NAME, "Service already exists, just updating");
                let spec = existing.spec.get_or_insert_with(ServiceSpec::default);
                spec.load_balancer_ip = Some(eip.to_string());
                spec.ports = Some(ports);
                self.store
                    .replace_service(EXTERNAL_SERVICE_NAMESPACE, &existing)
                    .await
                    .inspect_err(|e| error!(error = %e, "Failed to update service"))?;
            }
            None => {
                debug!(service = %EXTERNAL_SERVICE_NAME, "Service did not exist, creating");
                self.store
                    .create_service(
                        EXTERNAL_SERVICE_NAMESPACE,
                        &build_mirrored_service(eip, ports),
                    )
                    .await
                    .inspect_err(|e| error!(error = %e, "Failed to create service"))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "mirror_test.rs"]
mod tests;
