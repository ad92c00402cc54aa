//! Client reconciler
//!
//! Materializes the credential secret and advertises the controller
//! endpoint on the client status.

use crds::LocalObjectReference;
use store::OwnerInfo;
use tracing::{debug, info};

use super::Reconciler;
use crate::error::ControllerError;

impl Reconciler {
    pub async fn reconcile_client(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), ControllerError> {
        let client = match self.store.get_client(namespace, name).await {
            Ok(client) => client,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        let mut status = client.status.clone().unwrap_or_default();

        if status.credential.is_none() {
            let secret_name = format!("{name}-client");
            let uid = client.metadata.uid.clone().unwrap_or_default();
            let token = self
                .tokens
                .sign_object_token("Client", namespace, name, &uid)?;
            self.store
                .ensure_secret(
                    namespace,
                    &secret_name,
                    &token,
                    &OwnerInfo {
                        api_version: format!("{}/{}", crds::GROUP, crds::VERSION),
                        kind: "Client".to_string(),
                        name: name.to_string(),
                        uid,
                    },
                )
                .await?;
            info!(client = name, secret = secret_name, "created client credential");
            status.credential = Some(LocalObjectReference::new(secret_name));
        }

        if status.endpoint != self.endpoint {
            status.endpoint = self.endpoint.clone();
        }

        if client.status.as_ref() == Some(&status) {
            return Ok(());
        }

        let mut updated = client;
        updated.status = Some(status);
        match self.store.update_client_status(&updated).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_conflict() => {
                debug!(client = name, "status update lost a race, requeueing");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}
