//! Controller configuration from environment variables
//!
//! | Variable | Default |
//! |---|---|
//! | `METAL_API_TOKEN` | required |
//! | `METAL_PROJECT_ID` | required |
//! | `METAL_EIP_TAG` | empty, which disables reconciliation with an error per pass |
//! | `METAL_API_URL` | `https://api.equinix.com/metal/v1` |
//! | `METAL_API_TIMEOUT_SECONDS` | `30`, per Metal API request |
//! | `METAL_API_SERVER_PORT` | `0`, take the port from `default/kubernetes` |
//! | `EIP_TRANSPORT_ERROR_POLICY` | `unhealthy` |
//! | `EIP_RECONCILE_INTERVAL_SECONDS` | `30` |
//! | `EIP_HEALTH_PORT` | `8080` |

use crate::cloud::metal::{DEFAULT_API_TIMEOUT, DEFAULT_API_URL};
use crate::controller::{ManagerConfig, TransportErrorPolicy};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub const API_TOKEN_VAR: &str = "METAL_API_TOKEN";
pub const PROJECT_ID_VAR: &str = "METAL_PROJECT_ID";
pub const EIP_TAG_VAR: &str = "METAL_EIP_TAG";
pub const API_URL_VAR: &str = "METAL_API_URL";
pub const API_TIMEOUT_VAR: &str = "METAL_API_TIMEOUT_SECONDS";
pub const API_SERVER_PORT_VAR: &str = "METAL_API_SERVER_PORT";
pub const TRANSPORT_ERROR_POLICY_VAR: &str = "EIP_TRANSPORT_ERROR_POLICY";
pub const RECONCILE_INTERVAL_VAR: &str = "EIP_RECONCILE_INTERVAL_SECONDS";
pub const HEALTH_PORT_VAR: &str = "EIP_HEALTH_PORT";

const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_HEALTH_PORT: u16 = 8080;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("environment variable {0} is required")]
    Missing(&'static str),

    #[error("environment variable {var} has invalid value {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Clone)]
pub struct ControllerConfig {
    pub api_token: String,
    pub project_id: String,
    pub eip_tag: String,
    pub api_url: String,
    pub api_timeout: Duration,
    /// Port the elastic IP serves on; 0 takes it from `default/kubernetes`
    pub api_server_port: i32,
    pub transport_error_policy: TransportErrorPolicy,
    pub reconcile_interval: Duration,
    pub health_port: u16,
}

// Keeps the token out of logs
impl fmt::Debug for ControllerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerConfig")
            .field("api_token", &"<redacted>")
            .field("project_id", &self.project_id)
            .field("eip_tag", &self.eip_tag)
            .field("api_url", &self.api_url)
            .field("api_timeout", &self.api_timeout)
            .field("api_server_port", &self.api_server_port)
            .field("transport_error_policy", &self.transport_error_policy)
            .field("reconcile_interval", &self.reconcile_interval)
            .field("health_port", &self.health_port)
            .finish()
    }
}

impl ControllerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from any variable source
    ///
    /// Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let api_token = get(API_TOKEN_VAR).ok_or(ConfigError::Missing(API_TOKEN_VAR))?;
        let project_id = get(PROJECT_ID_VAR).ok_or(ConfigError::Missing(PROJECT_ID_VAR))?;
        let eip_tag = get(EIP_TAG_VAR).unwrap_or_default();
        let api_url = get(API_URL_VAR).unwrap_or_else(|| DEFAULT_API_URL.to_string());

        let api_timeout = match get(API_TIMEOUT_VAR) {
            Some(value) => parse_seconds(API_TIMEOUT_VAR, &value)?,
            None => DEFAULT_API_TIMEOUT,
        };

        let api_server_port = match get(API_SERVER_PORT_VAR) {
            Some(value) => parse_port(API_SERVER_PORT_VAR, &value, true)?,
            None => 0,
        };

        let transport_error_policy = match get(TRANSPORT_ERROR_POLICY_VAR) {
            Some(value) => {
                value
                    .parse::<TransportErrorPolicy>()
                    .map_err(|reason| ConfigError::Invalid {
                        var: TRANSPORT_ERROR_POLICY_VAR,
                        value: value.clone(),
                        reason,
                    })?
            }
            None => TransportErrorPolicy::default(),
        };

        let reconcile_interval = match get(RECONCILE_INTERVAL_VAR) {
            Some(value) => parse_seconds(RECONCILE_INTERVAL_VAR, &value)?,
            None => DEFAULT_RECONCILE_INTERVAL,
        };

        let health_port = match get(HEALTH_PORT_VAR) {
            Some(value) => parse_port(HEALTH_PORT_VAR, &value, false)? as u16,
            None => DEFAULT_HEALTH_PORT,
        };

        Ok(Self {
            api_token,
            project_id,
            eip_tag,
            api_url,
            api_timeout,
            api_server_port,
            transport_error_policy,
            reconcile_interval,
            health_port,
        })
    }

    /// Settings for the control plane endpoint manager
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            eip_tag: self.eip_tag.clone(),
            project_id: self.project_id.clone(),
            api_server_port: self.api_server_port,
            transport_error_policy: self.transport_error_policy,
        }
    }
}

/// Whole number of seconds, at least 1
fn parse_seconds(var: &'static str, value: &str) -> Result<Duration, ConfigError> {
    let invalid = |reason: String| ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason,
    };
    match value.trim().parse::<u64>() {
        Ok(0) => Err(invalid("must be at least 1 second".to_string())),
        Ok(secs) => Ok(Duration::from_secs(secs)),
        Err(e) => Err(invalid(e.to_string())),
    }
}

/// TCP port in 1..=65535, or 0 when `allow_zero`
fn parse_port(var: &'static str, value: &str, allow_zero: bool) -> Result<i32, ConfigError> {
    let invalid = |reason: String| ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason,
    };
    let port: i32 = value.trim().parse().map_err(|e| invalid(format!("{}", e)))?;
    let min = if allow_zero { 0 } else { 1 };
    if !(min..=65535).contains(&port) {
        return Err(invalid(format!("must be between {} and 65535", min)));
    }
    Ok(port)
}
