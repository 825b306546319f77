//! Fixtures shared by the controller tests

use super::manager::{ControlPlaneEndpointManager, ManagerConfig};
use super::probe::{HealthProber, TransportErrorPolicy};
pub use super::store::MemoryObjectStore;
use super::{UPSTREAM_SERVICE_NAME, UPSTREAM_SERVICE_NAMESPACE};
use crate::cloud::{IpAssignment, IpReservation, MockCloudInstances, MockReservationService};
use k8s_openapi::api::core::v1::{
    EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use std::sync::Arc;

pub const EIP: &str = "147.75.0.10";
pub const TAG: &str = "eip-apiserver";
pub const PROJECT: &str = "proj-1";

/// Reservation tagged [`TAG`] for [`EIP`] with the given assignment ids
pub fn tagged_reservation(assignments: &[&str]) -> IpReservation {
    IpReservation {
        id: "res-1".to_string(),
        address: EIP.to_string(),
        tags: vec!["cluster".to_string(), TAG.to_string()],
        assignments: assignments
            .iter()
            .map(|id| IpAssignment { id: id.to_string() })
            .collect(),
    }
}

/// Reservation service whose listing always returns `reservations`
pub fn listing(reservations: Vec<IpReservation>) -> MockReservationService {
    let mut mock = MockReservationService::new();
    mock.expect_list_reservations().returning(move |project| {
        assert_eq!(project, PROJECT);
        Ok(reservations.clone())
    });
    mock
}

pub fn manager_with(
    api_server_port: i32,
    transport_error_policy: TransportErrorPolicy,
    reservations: MockReservationService,
    instances: MockCloudInstances,
    prober: Arc<dyn HealthProber>,
    store: Arc<MemoryObjectStore>,
) -> ControlPlaneEndpointManager {
    ControlPlaneEndpointManager::new(
        ManagerConfig {
            eip_tag: TAG.to_string(),
            project_id: PROJECT.to_string(),
            api_server_port,
            transport_error_policy,
        },
        Arc::new(reservations),
        Arc::new(instances),
        prober,
        store,
    )
}

/// `default/kubernetes` with the given ports
pub fn upstream_service(ports: Vec<ServicePort>) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(UPSTREAM_SERVICE_NAME.to_string()),
            namespace: Some(UPSTREAM_SERVICE_NAMESPACE.to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            cluster_ip: Some("10.96.0.1".to_string()),
            ports: Some(ports),
            ..Default::default()
        }),
        status: None,
    }
}

pub fn https_port(port: i32, target_port: i32) -> ServicePort {
    ServicePort {
        name: Some("https".to_string()),
        protocol: Some("TCP".to_string()),
        port,
        target_port: Some(IntOrString::Int(target_port)),
        ..Default::default()
    }
}

/// `default/kubernetes` endpoints with one API server address per ip
pub fn upstream_endpoints(ips: &[&str]) -> Endpoints {
    Endpoints {
        metadata: ObjectMeta {
            name: Some(UPSTREAM_SERVICE_NAME.to_string()),
            namespace: Some(UPSTREAM_SERVICE_NAMESPACE.to_string()),
            ..Default::default()
        },
        subsets: Some(vec![EndpointSubset {
            addresses: Some(
                ips.iter()
                    .map(|ip| EndpointAddress {
                        ip: ip.to_string(),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ports: Some(vec![EndpointPort {
                name: Some("https".to_string()),
                port: 6443,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }]),
    }
}
