//! Equinix Metal REST client for floating IP reservations

use super::{CloudError, IpAssignment, IpReservation, ReservationService};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

/// Default Metal API endpoint
pub const DEFAULT_API_URL: &str = "https://api.equinix.com/metal/v1";

/// Per-request timeout for Metal API calls, unless configured
pub const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(30);

const AUTH_HEADER: &str = "X-Auth-Token";

#[derive(Debug, Deserialize)]
struct ReservationList {
    #[serde(default)]
    ip_addresses: Vec<IpReservation>,
}

/// Reservation service backed by the Metal REST API
#[derive(Clone)]
pub struct MetalClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl MetalClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self, CloudError> {
        Self::with_timeout(base_url, token, DEFAULT_API_TIMEOUT)
    }

    /// Client whose requests fail with [`CloudError::Http`] after `timeout`
    pub fn with_timeout(
        base_url: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, CloudError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

/// Turn a non-2xx response into [`CloudError::Api`]
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, CloudError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(CloudError::Api {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl ReservationService for MetalClient {
    async fn list_reservations(&self, project_id: &str) -> Result<Vec<IpReservation>, CloudError> {
        let url = self.url(&format!("projects/{}/ips", project_id));
        debug!(url = %url, "Listing IP reservations");

        let response = self
            .http
            .get(&url)
            .header(AUTH_HEADER, &self.token)
            .query(&[("include", "assignments")])
            .send()
            .await?;
        let list: ReservationList = check_status(response).await?.json().await?;

        Ok(list.ip_addresses)
    }

    async fn assign_address(
        &self,
        instance_id: &str,
        address: &str,
    ) -> Result<IpAssignment, CloudError> {
        let url = self.url(&format!("devices/{}/ips", instance_id));
        debug!(url = %url, address = %address, "Assigning IP address");

        let response = self
            .http
            .post(&url)
            .header(AUTH_HEADER, &self.token)
            .json(&json!({ "address": address }))
            .send()
            .await?;

        Ok(check_status(response).await?.json().await?)
    }

    async fn unassign_address(&self, assignment_id: &str) -> Result<(), CloudError> {
        let url = self.url(&format!("ips/{}", assignment_id));
        debug!(url = %url, "Removing IP assignment");

        let response = self
            .http
            .delete(&url)
            .header(AUTH_HEADER, &self.token)
            .send()
            .await?;
        check_status(response).await?;

        Ok(())
    }
}

#[cfg(test)]
#[path = "metal_test.rs"]
mod tests;
