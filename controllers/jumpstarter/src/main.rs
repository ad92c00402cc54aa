//! Jumpstarter Controller
//!
//! Hardware-access control plane for physical test fixtures:
//! - Lease scheduler binding clients to exporters with fairness, duration
//!   caps and spot preemption
//! - Controller RPC service: exporter registration, liveness and listen
//!   streams, client dial and lease CRUD
//! - Router: brokered stream splice pairing two authenticated endpoints
//! - OIDC discovery endpoints for the rotating signing key

mod config;
mod controller;
mod error;
mod policy;
mod reconciler;
mod service;
mod watcher;

#[cfg(test)]
mod test_utils;

use controller::Controller;
use tracing::info;

use crate::config::{Config, Environment};
use crate::error::ControllerError;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt::init();

    info!("starting jumpstarter controller");

    let env = Environment::from_env()?;
    let config = Config::load(&env.config_path)?;

    info!(namespace = %env.namespace, endpoint = %env.endpoint, "configuration loaded");
    info!(
        routers = config.router.len(),
        offline_timeout_seconds = config.exporter_options.offline_timeout_seconds,
        "scheduling options"
    );

    let controller = Controller::new(env, config).await?;
    controller.run().await
}
