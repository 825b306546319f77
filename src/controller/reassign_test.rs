//! Tests for elastic IP failover

use super::*;
use crate::cloud::{
    CloudError, IpAssignment, MockCloudInstances, MockReservationService, NodeAddress,
};
use crate::controller::probe::{MockHealthProber, ProbeOutcome};
use kube::api::ObjectMeta;
use mockall::Sequence;
use std::sync::{Arc, Mutex};

const EIP: &str = "147.75.0.10";
const PORT: i32 = 6443;

fn node(name: &str) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn reservation(assignments: &[&str]) -> IpReservation {
    IpReservation {
        id: "res-1".to_string(),
        address: EIP.to_string(),
        tags: vec!["eip".to_string()],
        assignments: assignments
            .iter()
            .map(|id| IpAssignment { id: id.to_string() })
            .collect(),
    }
}

fn eip_url() -> String {
    health_check_url(EIP, PORT)
}

/// cp-0: hostname, the elastic IP itself, an internal address answering 500
/// cp-1: an external address that refuses, an internal address answering 200
fn two_node_addresses() -> MockCloudInstances {
    let mut instances = MockCloudInstances::new();
    instances.expect_node_addresses().returning(|name| match name {
        "cp-0" => Ok(vec![
            NodeAddress::new(AddressType::Hostname, "cp-0"),
            NodeAddress::new(AddressType::ExternalIp, EIP),
            NodeAddress::new(AddressType::InternalIp, "10.0.0.1"),
        ]),
        "cp-1" => Ok(vec![
            NodeAddress::new(AddressType::ExternalIp, "147.75.0.21"),
            NodeAddress::new(AddressType::InternalIp, "10.0.0.2"),
        ]),
        other => panic!("unexpected node lookup {}", other),
    });
    instances
}

/// Prober that records the probed addresses and answers from a fixed table
fn recording_prober(probed: Arc<Mutex<Vec<String>>>) -> MockHealthProber {
    let mut prober = MockHealthProber::new();
    prober.expect_probe().returning(move |address, port| {
        probed.lock().unwrap().push(address.to_string());
        let url = health_check_url(address, port);
        match address {
            "10.0.0.1" => ProbeOutcome::status(url, 500),
            "147.75.0.21" => ProbeOutcome::transport_error(url, "connection refused"),
            "10.0.0.2" => ProbeOutcome::status(url, 200),
            other => panic!("unexpected probe of {}", other),
        }
    });
    prober
}

#[tokio::test]
async fn test_unknown_node_port_fails_before_any_call() {
    let reservations = MockReservationService::new();
    let instances = MockCloudInstances::new();
    let prober = MockHealthProber::new();
    let failover = Failover {
        reservations: &reservations,
        instances: &instances,
        prober: &prober,
    };
    let cp0 = node("cp-0");

    let err = failover
        .reassign(&[&cp0], &reservation(&["asg-1"]), &eip_url(), None)
        .await
        .expect_err("node port is required");

    assert!(matches!(err, ReconcileError::NodePortUnknown));
}

#[tokio::test]
async fn test_first_healthy_address_in_order_wins() {
    // ARRANGE
    let probed = Arc::new(Mutex::new(Vec::new()));
    let prober = recording_prober(probed.clone());
    let mut instances = two_node_addresses();
    instances
        .expect_instance_id()
        .times(1)
        .returning(|name| {
            assert_eq!(name, "cp-1");
            Ok("device-1".to_string())
        });

    let mut seq = Sequence::new();
    let mut reservations = MockReservationService::new();
    reservations
        .expect_unassign_address()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|assignment| {
            assert_eq!(assignment, "asg-1");
            Ok(())
        });
    reservations
        .expect_assign_address()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|instance, address| {
            assert_eq!(instance, "device-1");
            assert_eq!(address, EIP);
            Ok(IpAssignment {
                id: "asg-2".to_string(),
            })
        });

    let failover = Failover {
        reservations: &reservations,
        instances: &instances,
        prober: &prober,
    };
    let (cp0, cp1) = (node("cp-0"), node("cp-1"));

    // ACT
    let winner = failover
        .reassign(&[&cp0, &cp1], &reservation(&["asg-1"]), &eip_url(), Some(PORT))
        .await
        .expect("reassignment succeeds");

    // ASSERT: hostname and the elastic IP itself were never probed
    assert_eq!(winner, "cp-1");
    assert_eq!(
        *probed.lock().unwrap(),
        vec![
            "10.0.0.1".to_string(),
            "147.75.0.21".to_string(),
            "10.0.0.2".to_string()
        ]
    );
}

#[tokio::test]
async fn test_stops_at_first_healthy_node() {
    let mut instances = MockCloudInstances::new();
    instances
        .expect_node_addresses()
        .times(1)
        .returning(|_| Ok(vec![NodeAddress::new(AddressType::InternalIp, "10.0.0.1")]));
    instances
        .expect_instance_id()
        .returning(|_| Ok("device-0".to_string()));

    let mut prober = MockHealthProber::new();
    prober
        .expect_probe()
        .times(1)
        .returning(|address, port| ProbeOutcome::status(health_check_url(address, port), 200));

    let mut reservations = MockReservationService::new();
    reservations.expect_unassign_address().times(1).returning(|_| Ok(()));
    reservations.expect_assign_address().times(1).returning(|_, _| {
        Ok(IpAssignment {
            id: "asg-2".to_string(),
        })
    });

    let failover = Failover {
        reservations: &reservations,
        instances: &instances,
        prober: &prober,
    };
    let (cp0, cp1) = (node("cp-0"), node("cp-1"));

    let winner = failover
        .reassign(&[&cp0, &cp1], &reservation(&["asg-1"]), &eip_url(), Some(PORT))
        .await
        .expect("reassignment succeeds");

    // cp-1 addresses are never looked up
    assert_eq!(winner, "cp-0");
}

#[tokio::test]
async fn test_no_healthy_candidate_leaves_assignment_alone() {
    let instances = two_node_addresses();
    let mut prober = MockHealthProber::new();
    prober
        .expect_probe()
        .times(3)
        .returning(|address, port| ProbeOutcome::status(health_check_url(address, port), 503));
    // No unassign/assign expectations: any mutation panics
    let reservations = MockReservationService::new();

    let failover = Failover {
        reservations: &reservations,
        instances: &instances,
        prober: &prober,
    };
    let (cp0, cp1) = (node("cp-0"), node("cp-1"));

    let err = failover
        .reassign(&[&cp0, &cp1], &reservation(&["asg-1"]), &eip_url(), Some(PORT))
        .await
        .expect_err("nobody is healthy");

    assert!(matches!(err, ReconcileError::NoHealthyCandidate { address } if address == EIP));
}

#[tokio::test]
async fn test_empty_candidate_list_is_exhaustion() {
    let reservations = MockReservationService::new();
    let instances = MockCloudInstances::new();
    let prober = MockHealthProber::new();
    let failover = Failover {
        reservations: &reservations,
        instances: &instances,
        prober: &prober,
    };

    let err = failover
        .reassign(&[], &reservation(&["asg-1"]), &eip_url(), Some(PORT))
        .await
        .expect_err("no candidates");

    assert!(matches!(err, ReconcileError::NoHealthyCandidate { .. }));
}

#[tokio::test]
async fn test_unassigned_reservation_is_only_assigned() {
    let probed = Arc::new(Mutex::new(Vec::new()));
    let prober = recording_prober(probed);
    let mut instances = two_node_addresses();
    instances
        .expect_instance_id()
        .returning(|_| Ok("device-1".to_string()));

    // No unassign expectation: the reservation has nothing to release
    let mut reservations = MockReservationService::new();
    reservations.expect_assign_address().times(1).returning(|_, _| {
        Ok(IpAssignment {
            id: "asg-2".to_string(),
        })
    });

    let failover = Failover {
        reservations: &reservations,
        instances: &instances,
        prober: &prober,
    };
    let (cp0, cp1) = (node("cp-0"), node("cp-1"));

    let winner = failover
        .reassign(&[&cp0, &cp1], &reservation(&[]), &eip_url(), Some(PORT))
        .await
        .expect("reassignment succeeds");

    assert_eq!(winner, "cp-1");
}

#[tokio::test]
async fn test_assign_failure_after_unassign_is_reported_as_such() {
    let probed = Arc::new(Mutex::new(Vec::new()));
    let prober = recording_prober(probed);
    let mut instances = two_node_addresses();
    instances
        .expect_instance_id()
        .returning(|_| Ok("device-1".to_string()));

    let mut reservations = MockReservationService::new();
    reservations.expect_unassign_address().times(1).returning(|_| Ok(()));
    reservations.expect_assign_address().times(1).returning(|_, _| {
        Err(CloudError::Api {
            status: 422,
            body: "device not active".to_string(),
        })
    });

    let failover = Failover {
        reservations: &reservations,
        instances: &instances,
        prober: &prober,
    };
    let (cp0, cp1) = (node("cp-0"), node("cp-1"));

    let err = failover
        .reassign(&[&cp0, &cp1], &reservation(&["asg-1"]), &eip_url(), Some(PORT))
        .await
        .expect_err("assign failed");

    assert!(matches!(
        err,
        ReconcileError::AssignAfterUnassign { ref instance, .. } if instance == "device-1"
    ));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_assign_failure_without_prior_assignment() {
    let probed = Arc::new(Mutex::new(Vec::new()));
    let prober = recording_prober(probed);
    let mut instances = two_node_addresses();
    instances
        .expect_instance_id()
        .returning(|_| Ok("device-1".to_string()));

    let mut reservations = MockReservationService::new();
    reservations.expect_assign_address().times(1).returning(|_, _| {
        Err(CloudError::Api {
            status: 500,
            body: "boom".to_string(),
        })
    });

    let failover = Failover {
        reservations: &reservations,
        instances: &instances,
        prober: &prober,
    };
    let (cp0, cp1) = (node("cp-0"), node("cp-1"));

    let err = failover
        .reassign(&[&cp0, &cp1], &reservation(&[]), &eip_url(), Some(PORT))
        .await
        .expect_err("assign failed");

    assert!(matches!(err, ReconcileError::Assign { .. }));
}

#[tokio::test]
async fn test_unassign_failure_aborts_before_assign() {
    let probed = Arc::new(Mutex::new(Vec::new()));
    let prober = recording_prober(probed);
    let mut instances = two_node_addresses();
    instances
        .expect_instance_id()
        .returning(|_| Ok("device-1".to_string()));

    // No assign expectation: assign must not run
    let mut reservations = MockReservationService::new();
    reservations.expect_unassign_address().times(1).returning(|_| {
        Err(CloudError::Api {
            status: 500,
            body: "boom".to_string(),
        })
    });

    let failover = Failover {
        reservations: &reservations,
        instances: &instances,
        prober: &prober,
    };
    let (cp0, cp1) = (node("cp-0"), node("cp-1"));

    let err = failover
        .reassign(&[&cp0, &cp1], &reservation(&["asg-1"]), &eip_url(), Some(PORT))
        .await
        .expect_err("unassign failed");

    assert!(matches!(err, ReconcileError::Unassign { ref assignment, .. } if assignment == "asg-1"));
}

#[tokio::test]
async fn test_address_lookup_failure_aborts() {
    let mut instances = MockCloudInstances::new();
    instances.expect_node_addresses().times(1).returning(|_| {
        Err(CloudError::MissingProviderId("cp-0".to_string()))
    });
    let prober = MockHealthProber::new();
    let reservations = MockReservationService::new();

    let failover = Failover {
        reservations: &reservations,
        instances: &instances,
        prober: &prober,
    };
    let (cp0, cp1) = (node("cp-0"), node("cp-1"));

    let err = failover
        .reassign(&[&cp0, &cp1], &reservation(&["asg-1"]), &eip_url(), Some(PORT))
        .await
        .expect_err("lookup failed");

    assert!(matches!(err, ReconcileError::NodeLookup { ref node, .. } if node == "cp-0"));
}

#[tokio::test]
async fn test_instance_lookup_failure_aborts_before_mutation() {
    let probed = Arc::new(Mutex::new(Vec::new()));
    let prober = recording_prober(probed);
    let mut instances = two_node_addresses();
    instances
        .expect_instance_id()
        .returning(|name| Err(CloudError::MissingProviderId(name.to_string())));
    let reservations = MockReservationService::new();

    let failover = Failover {
        reservations: &reservations,
        instances: &instances,
        prober: &prober,
    };
    let (cp0, cp1) = (node("cp-0"), node("cp-1"));

    let err = failover
        .reassign(&[&cp0, &cp1], &reservation(&["asg-1"]), &eip_url(), Some(PORT))
        .await
        .expect_err("instance lookup failed");

    assert!(matches!(err, ReconcileError::NodeLookup { ref node, .. } if node == "cp-1"));
}
