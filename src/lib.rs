pub mod cloud;
pub mod config;
pub mod controller;
pub mod server;

// Re-export for main.rs
pub use crate::config::{ConfigError, ControllerConfig};
pub use crate::controller::{ControlPlaneEndpointManager, ReconcileError, UpdateMode};
