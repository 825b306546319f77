//! Health probe for the Kubernetes API server
//!
//! A probe is a single `GET https://{address}:{port}/healthz`. Only a
//! completed request answering 200 counts as healthy; transport errors,
//! timeouts and other statuses are all unhealthy, but are reported apart so
//! they can be logged (and, for the elastic IP, handled) differently.

use async_trait::async_trait;
use std::net::Ipv6Addr;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

/// Timeout for a single health probe
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Build the health check URL for an address and port
///
/// IPv6 literals are bracketed.
pub fn health_check_url(address: &str, port: i32) -> String {
    if address.parse::<Ipv6Addr>().is_ok() {
        format!("https://[{}]:{}/healthz", address, port)
    } else {
        format!("https://{}:{}/healthz", address, port)
    }
}

/// Result of one probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub url: String,
    /// HTTP status, when the request completed
    pub status: Option<u16>,
    /// Transport error, when it did not
    pub error: Option<String>,
}

impl ProbeOutcome {
    pub fn status(url: impl Into<String>, status: u16) -> Self {
        Self {
            url: url.into(),
            status: Some(status),
            error: None,
        }
    }

    pub fn transport_error(url: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            status: None,
            error: Some(error.into()),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == Some(200)
    }

    pub fn is_transport_error(&self) -> bool {
        self.error.is_some()
    }
}

/// What a transport error on the elastic IP probe means
///
/// Candidate probes during failover always need a 200; this only decides
/// whether failing to reach the elastic IP at all is reason to move it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportErrorPolicy {
    /// Unreachable counts as unhealthy and starts failover
    #[default]
    Unhealthy,
    /// Unreachable is logged and left alone; only a non-200 answer moves the IP
    Hold,
}

impl TransportErrorPolicy {
    /// Whether this probe outcome should start failover
    pub fn triggers_failover(&self, outcome: &ProbeOutcome) -> bool {
        if outcome.is_healthy() {
            return false;
        }
        if outcome.is_transport_error() {
            return *self == TransportErrorPolicy::Unhealthy;
        }
        true
    }
}

impl FromStr for TransportErrorPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unhealthy" => Ok(TransportErrorPolicy::Unhealthy),
            "hold" => Ok(TransportErrorPolicy::Hold),
            other => Err(format!("expected \"unhealthy\" or \"hold\", got {:?}", other)),
        }
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait HealthProber: Send + Sync {
    /// Probe `https://{address}:{port}/healthz`
    async fn probe(&self, address: &str, port: i32) -> ProbeOutcome;
}

/// `reqwest` prober that accepts any certificate
///
/// The API server certificate is usually signed by the cluster CA, which the
/// controller does not necessarily trust. Proxy settings from the environment
/// are ignored: the check must reach the node directly.
#[derive(Clone)]
pub struct HttpsProber {
    client: reqwest::Client,
}

impl HttpsProber {
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::with_timeout(HEALTH_CHECK_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .no_proxy()
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HealthProber for HttpsProber {
    async fn probe(&self, address: &str, port: i32) -> ProbeOutcome {
        let url = health_check_url(address, port);

        match self.client.get(&url).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                // Release the connection; the body is never read
                drop(response);
                if status != 200 {
                    info!(url = %url, status = status, "Health check returned non-OK status");
                }
                ProbeOutcome::status(url, status)
            }
            Err(e) => {
                warn!(url = %url, error = %e, "HTTP client error during health check");
                ProbeOutcome::transport_error(url, e.to_string())
            }
        }
    }
}

#[cfg(test)]
#[path = "probe_test.rs"]
mod tests;
