//! Main controller implementation.
//!
//! Wires the store, token service, reconcilers and RPC services together
//! and runs them as long-lived tasks: resource watchers, the time sweep,
//! the controller RPC listener, the router listener and the OIDC discovery
//! endpoints.

use std::sync::Arc;

use auth::{OidcSigner, TokenService};
use store::{KubeStore, Store, StoreError};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{Config, Environment};
use crate::error::ControllerError;
use crate::reconciler::Reconciler;
use crate::service::auth::ServiceAuth;
use crate::service::client_v1::ClientService;
use crate::service::connection::{self, ConnectionLimits};
use crate::service::controller::ControllerService;
use crate::service::listen::ListenMap;
use crate::service::oidc;
use crate::service::router::{self, RouterService};
use crate::watcher::Watcher;

type TaskHandle = JoinHandle<Result<(), ControllerError>>;

/// Long-running controller tasks.
pub struct Controller {
    lease_watcher: TaskHandle,
    exporter_watcher: TaskHandle,
    client_watcher: TaskHandle,
    sweeper: TaskHandle,
    controller_service: TaskHandle,
    router_service: TaskHandle,
    oidc_service: Option<TaskHandle>,
}

impl Controller {
    pub async fn new(env: Environment, config: Config) -> Result<Self, ControllerError> {
        info!("initializing jumpstarter controller");

        let kube_client = kube::Client::try_default()
            .await
            .map_err(|e| ControllerError::Store(StoreError::Kube(e)))?;
        let store: Arc<dyn Store> = Arc::new(KubeStore::new(kube_client.clone()));

        let tokens = Arc::new(TokenService::new(
            env.controller_key.as_bytes().to_vec(),
            env.router_key.as_bytes().to_vec(),
            config.authentication.internal.prefix.clone(),
        ));
        let authorizer = Arc::new(config.build_authorizer()?);

        let oidc_signer = match &env.oidc_key_path {
            Some(path) => {
                let pem = std::fs::read_to_string(path).map_err(|e| {
                    ControllerError::InvalidConfig(format!("unable to read {path}: {e}"))
                })?;
                let issuer = format!("https://{}", env.endpoint);
                Some(Arc::new(
                    OidcSigner::from_rsa_pem(issuer, &pem)
                        .map_err(|e| ControllerError::InvalidConfig(e.to_string()))?,
                ))
            }
            None => None,
        };

        let listen_map = Arc::new(ListenMap::new());
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            tokens.clone(),
            listen_map.clone(),
            env.endpoint.clone(),
            config.exporter_options.offline_timeout(),
        ));

        let controller_service = Arc::new(ControllerService::new(
            store.clone(),
            ServiceAuth::new(
                store.clone(),
                tokens.clone(),
                authorizer.clone(),
                oidc_signer.clone(),
                env.namespace.clone(),
            ),
            tokens.clone(),
            config.router.clone(),
            listen_map.clone(),
        ));
        let client_service = Arc::new(ClientService::new(
            store.clone(),
            ServiceAuth::new(
                store.clone(),
                tokens.clone(),
                authorizer,
                oidc_signer.clone(),
                env.namespace.clone(),
            ),
        ));
        let router_service = Arc::new(RouterService::new(tokens));

        let watcher = Arc::new(Watcher::new(
            reconciler,
            kube_client,
            env.namespace.clone(),
        ));

        let lease_watcher = {
            let watcher = watcher.clone();
            tokio::spawn(async move { watcher.watch_leases().await })
        };
        let exporter_watcher = {
            let watcher = watcher.clone();
            tokio::spawn(async move { watcher.watch_exporters().await })
        };
        let client_watcher = {
            let watcher = watcher.clone();
            tokio::spawn(async move { watcher.watch_clients().await })
        };
        let sweeper = {
            let watcher = watcher.clone();
            tokio::spawn(async move { watcher.sweep().await })
        };

        let limits = ConnectionLimits::from(&config.grpc.keepalive);
        let controller_listener = TcpListener::bind(&env.listen_addr).await?;
        info!(addr = %env.listen_addr, "starting controller service");
        let controller_service = tokio::spawn(async move {
            connection::serve_controller(
                controller_listener,
                controller_service,
                client_service,
                limits,
            )
            .await
        });

        let router_listener = TcpListener::bind(&env.router_listen_addr).await?;
        info!(addr = %env.router_listen_addr, "starting router service");
        let router_task = {
            let router_service = router_service.clone();
            tokio::spawn(async move { router::serve_router(router_listener, router_service).await })
        };
        // Expired pending halves are dropped in the background
        tokio::spawn(router_service.run_gc(CancellationToken::new()));

        let oidc_service = oidc_signer.map(|signer| {
            let addr = env.oidc_listen_addr.clone();
            tokio::spawn(async move { oidc::serve(&addr, signer).await })
        });

        Ok(Self {
            lease_watcher,
            exporter_watcher,
            client_watcher,
            sweeper,
            controller_service,
            router_service: router_task,
            oidc_service,
        })
    }

    /// Runs the controller until any task exits.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("jumpstarter controller running");

        // These tasks run forever; any completion is a failure worth
        // surfacing
        tokio::select! {
            result = &mut self.lease_watcher => {
                flatten("lease watcher", result)?;
            }
            result = &mut self.exporter_watcher => {
                flatten("exporter watcher", result)?;
            }
            result = &mut self.client_watcher => {
                flatten("client watcher", result)?;
            }
            result = &mut self.sweeper => {
                flatten("sweeper", result)?;
            }
            result = &mut self.controller_service => {
                flatten("controller service", result)?;
            }
            result = &mut self.router_service => {
                flatten("router service", result)?;
            }
            result = async {
                match self.oidc_service.as_mut() {
                    Some(handle) => handle.await,
                    None => std::future::pending().await,
                }
            } => {
                flatten("oidc service", result)?;
            }
        }

        Ok(())
    }
}

fn flatten(
    task: &str,
    result: Result<Result<(), ControllerError>, tokio::task::JoinError>,
) -> Result<(), ControllerError> {
    result
        .map_err(|e| ControllerError::Watch(format!("{task} panicked: {e}")))?
        .map_err(|e| ControllerError::Watch(format!("{task} error: {e}")))
}
