//! Health checks go straight to the node even when a proxy is configured
//!
//! reqwest reads proxy variables once per process, so this lives in its own
//! test binary where no other client is built first.

use eip_controller::controller::{HealthProber, HttpsProber};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

#[tokio::test]
async fn test_health_check_ignores_proxy_environment() {
    // ARRANGE: a listener standing in for a proxy, counting connections
    let proxy = TcpListener::bind("127.0.0.1:0").await.expect("bind proxy");
    let proxy_url = format!("http://{}", proxy.local_addr().expect("addr"));
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = connections.clone();
    let proxy_task = tokio::spawn(async move {
        while let Ok((_stream, _)) = proxy.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    for var in ["HTTPS_PROXY", "https_proxy", "ALL_PROXY", "all_proxy"] {
        std::env::set_var(var, &proxy_url);
    }
    let prober = HttpsProber::with_timeout(Duration::from_millis(300)).expect("prober");

    // ACT: an unroutable address, so a direct attempt simply times out
    let outcome = prober.probe("10.255.255.1", 6443).await;

    // ASSERT
    assert!(!outcome.is_healthy());
    assert!(outcome.is_transport_error());
    assert_eq!(
        connections.load(Ordering::SeqCst),
        0,
        "health check was sent through the proxy"
    );

    for var in ["HTTPS_PROXY", "https_proxy", "ALL_PROXY", "all_proxy"] {
        std::env::remove_var(var);
    }
    proxy_task.abort();
}
