use eip_controller::cloud::{MetalClient, NodeInstances};
use eip_controller::controller::{
    HttpsProber, KubeObjectStore, NodeReconcileOutcome, ServiceReconcileOutcome,
    UPSTREAM_SERVICE_NAME, UPSTREAM_SERVICE_NAMESPACE,
};
use eip_controller::server::metrics::{NODES, SERVICES};
use eip_controller::server::{create_metrics, run_health_server, ControllerMetrics, ReadinessState};
use eip_controller::{ControlPlaneEndpointManager, ControllerConfig, ReconcileError, UpdateMode};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Node, Service};
use kube::api::ListParams;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn, Level};

/// Log level for a failed reconciliation
///
/// Retryable errors clear up on a later tick and are logged with `warn!`;
/// everything else needs an operator.
pub fn error_level(error: &ReconcileError) -> Level {
    if error.is_retryable() {
        Level::WARN
    } else {
        Level::ERROR
    }
}

fn log_error(reconciler: &str, error: &ReconcileError) {
    if error_level(error) == Level::WARN {
        warn!(reconciler = reconciler, error = %error, "Reconcile error (will retry)");
    } else {
        error!(reconciler = reconciler, error = %error, "Reconcile error");
    }
}

/// Whether the error came out of an elastic IP move
fn is_reassignment_error(error: &ReconcileError) -> bool {
    matches!(
        error,
        ReconcileError::Unassign { .. }
            | ReconcileError::Assign { .. }
            | ReconcileError::AssignAfterUnassign { .. }
    )
}

pub fn record_node_pass(
    metrics: &ControllerMetrics,
    result: &Result<NodeReconcileOutcome, ReconcileError>,
    elapsed: Duration,
) {
    match result {
        Ok(NodeReconcileOutcome::Skipped) => metrics.record_reconciliation_skipped(NODES),
        Ok(outcome) => {
            if matches!(outcome, NodeReconcileOutcome::Reassigned { .. }) {
                metrics.record_reassignment(true);
            }
            debug!(outcome = outcome.as_str(), "Node reconciliation completed");
            metrics.record_reconciliation_success(NODES, elapsed.as_secs_f64());
        }
        Err(e) => {
            if is_reassignment_error(e) {
                metrics.record_reassignment(false);
            }
            log_error(NODES, e);
            metrics.record_reconciliation_error(NODES, elapsed.as_secs_f64());
        }
    }
}

pub fn record_service_pass(
    metrics: &ControllerMetrics,
    result: &Result<ServiceReconcileOutcome, ReconcileError>,
    elapsed: Duration,
) {
    match result {
        Ok(outcome) => {
            debug!(outcome = outcome.as_str(), "Service reconciliation completed");
            metrics.record_reconciliation_success(SERVICES, elapsed.as_secs_f64());
        }
        Err(e) => {
            log_error(SERVICES, e);
            metrics.record_reconciliation_error(SERVICES, elapsed.as_secs_f64());
        }
    }
}

/// The service to reconcile for one item of the `default/kubernetes` watch
///
/// Watch errors are retried by the stream's backoff. The stream ending leaves
/// the controller blind to upstream changes, so it is fatal.
pub fn upstream_change(
    event: Option<Result<watcher::Event<Service>, watcher::Error>>,
) -> anyhow::Result<Option<Service>> {
    match event {
        Some(Ok(watcher::Event::Apply(service) | watcher::Event::InitApply(service))) => {
            Ok(Some(service))
        }
        Some(Ok(_)) => Ok(None),
        Some(Err(e)) => {
            warn!(error = %e, "Service watch error");
            Ok(None)
        }
        None => {
            error!("Service watch ended");
            anyhow::bail!("watch on {}/{} ended", UPSTREAM_SERVICE_NAMESPACE, UPSTREAM_SERVICE_NAME)
        }
    }
}

/// One full pass over every Service and Node
///
/// Services go first so the node pass sees the port they learn.
async fn full_sync(client: &Client, manager: &ControlPlaneEndpointManager, metrics: &ControllerMetrics) {
    let services: Api<Service> = Api::all(client.clone());
    match services.list(&ListParams::default()).await {
        Ok(list) => {
            let started = Instant::now();
            let result = manager.reconcile_services(&list.items, UpdateMode::Sync).await;
            record_service_pass(metrics, &result, started.elapsed());
        }
        Err(e) => warn!(error = %e, "Failed to list services, skipping service pass"),
    }

    let nodes: Api<Node> = Api::all(client.clone());
    match nodes.list(&ListParams::default()).await {
        Ok(list) => {
            let started = Instant::now();
            let result = manager.reconcile_nodes(&list.items).await;
            record_node_pass(metrics, &result, started.elapsed());
        }
        Err(e) => warn!(error = %e, "Failed to list nodes, skipping node pass"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting control plane elastic IP controller");

    let config = match ControllerConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return Err(e.into());
        }
    };
    info!(config = ?config, "Configuration loaded");
    if config.eip_tag.is_empty() {
        warn!("Elastic IP tag is empty, every reconciliation will fail until it is set");
    }

    let metrics = create_metrics()?;
    let readiness = ReadinessState::new();

    // Start health server in background
    let health_readiness = readiness.clone();
    let health_metrics = metrics.clone();
    let health_port = config.health_port;
    tokio::spawn(async move {
        if let Err(e) = run_health_server(health_port, health_readiness, health_metrics).await {
            warn!(error = %e, "Health server failed");
        }
    });

    let client = match Client::try_default().await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to create Kubernetes client");
            return Err(e.into());
        }
    };
    info!("Connected to Kubernetes cluster");

    let metal = MetalClient::with_timeout(&config.api_url, &config.api_token, config.api_timeout)?;
    let manager = ControlPlaneEndpointManager::new(
        config.manager_config(),
        Arc::new(metal),
        Arc::new(NodeInstances::new(client.clone())),
        Arc::new(HttpsProber::new()?),
        Arc::new(KubeObjectStore::new(client.clone())),
    );

    let upstream: Api<Service> = Api::namespaced(client.clone(), UPSTREAM_SERVICE_NAMESPACE);
    let mut upstream_events = watcher(
        upstream,
        watcher::Config::default().fields(&format!("metadata.name={}", UPSTREAM_SERVICE_NAME)),
    )
    .default_backoff()
    .boxed();

    // interval fires its first tick immediately, so the first full sync
    // runs right away
    let mut tick = tokio::time::interval(config.reconcile_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    readiness.set_ready();
    info!(
        manager = manager.name(),
        interval = ?config.reconcile_interval,
        "Controller ready, starting reconciliation loop"
    );

    // One task for every pass: reconcilers never overlap each other
    loop {
        tokio::select! {
            _ = tick.tick() => {
                full_sync(&client, &manager, &metrics).await;
            }
            event = upstream_events.next() => {
                if let Some(service) = upstream_change(event)? {
                    let started = Instant::now();
                    let result = manager
                        .reconcile_services(&[service], UpdateMode::Incremental)
                        .await;
                    record_service_pass(&metrics, &result, started.elapsed());
                }
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
