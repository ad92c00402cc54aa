//! Bearer resolution for RPC handlers
//!
//! Every RPC first resolves the bearer to a principal, then to a specific
//! Client or Exporter object, then asks the configured authorizer whether
//! the principal *is* that object. Internal tokens carry the object
//! reference in their claims; OIDC tokens are matched by username.

use std::sync::Arc;

use auth::{AuthError, AuthorizeRequest, ObjectAuthorizer, OidcSigner, Principal, TokenService};
use crds::{Client, Exporter};
use jsonwebtoken::{decode, Algorithm, Validation};
use store::Store;
use tracing::debug;

use super::RpcError;

/// Failures while resolving or authorizing a caller; all collapse to
/// `Unauthenticated` or `PermissionDenied` on the wire.
#[derive(Debug)]
pub enum AuthFailure {
    Unauthenticated(String),
    PermissionDenied(String),
}

impl AuthFailure {
    pub fn into_rpc(self) -> RpcError {
        match self {
            Self::Unauthenticated(msg) => RpcError::unauthenticated(msg),
            Self::PermissionDenied(msg) => RpcError::permission_denied(msg),
        }
    }
}

impl From<AuthError> for AuthFailure {
    fn from(err: AuthError) -> Self {
        Self::Unauthenticated(err.to_string())
    }
}

/// Audience expected on OIDC-issued tokens.
const OIDC_AUDIENCE: &str = "jumpstarter";

/// Resolves bearers to stored objects for the RPC services.
pub struct ServiceAuth {
    store: Arc<dyn Store>,
    tokens: Arc<TokenService>,
    authorizer: Arc<ObjectAuthorizer>,
    oidc: Option<Arc<OidcSigner>>,
    namespace: String,
}

impl ServiceAuth {
    pub fn new(
        store: Arc<dyn Store>,
        tokens: Arc<TokenService>,
        authorizer: Arc<ObjectAuthorizer>,
        oidc: Option<Arc<OidcSigner>>,
        namespace: String,
    ) -> Self {
        Self {
            store,
            tokens,
            authorizer,
            oidc,
            namespace,
        }
    }

    /// Resolve the bearer: internal controller tokens first, then tokens
    /// signed by our own OIDC key.
    fn resolve(&self, bearer: &str) -> Result<Principal, AuthFailure> {
        if bearer.is_empty() {
            return Err(AuthFailure::Unauthenticated("missing bearer token".to_string()));
        }

        match self.tokens.verify_object_token(bearer) {
            Ok(principal) => return Ok(principal),
            Err(err) => debug!("not an internal token: {err}"),
        }

        if let Some(signer) = &self.oidc {
            let mut validation = Validation::new(Algorithm::RS256);
            validation.set_issuer(&[signer.issuer()]);
            validation.set_audience(&[OIDC_AUDIENCE]);

            let key = signer
                .decoding_key()
                .map_err(|e| AuthFailure::Unauthenticated(e.to_string()))?;
            let data = decode::<auth::oidc::OidcClaims>(bearer, &key, &validation)
                .map_err(|e| AuthFailure::Unauthenticated(e.to_string()))?;

            return Ok(Principal {
                user: auth::UserInfo::new(data.claims.sub.clone(), data.claims.sub),
                object: None,
            });
        }

        Err(AuthFailure::Unauthenticated("invalid bearer token".to_string()))
    }

    /// Resolve the bearer to an existing Client object.
    pub async fn authenticate_client(&self, bearer: &str) -> Result<Client, AuthFailure> {
        let principal = self.resolve(bearer)?;

        let client = match &principal.object {
            Some(object) => {
                if object.kind != "Client" {
                    return Err(AuthFailure::PermissionDenied(
                        "token is not bound to a client".to_string(),
                    ));
                }
                let client = self
                    .store
                    .get_client(&object.namespace, &object.name)
                    .await
                    .map_err(|e| AuthFailure::Unauthenticated(e.to_string()))?;
                // A recreated object with the same name must not satisfy an
                // old token
                if client.metadata.uid.as_deref() != Some(object.uid.as_str()) {
                    return Err(AuthFailure::Unauthenticated(
                        "client uid does not match token".to_string(),
                    ));
                }
                client
            }
            None => self.find_client_by_username(&principal.user.username).await?,
        };

        let request = AuthorizeRequest {
            self_object: serde_json::to_value(&client)
                .map_err(|e| AuthFailure::Unauthenticated(e.to_string()))?,
            computed_subject: client.internal_subject(self.tokens.prefix()),
            user: &principal.user,
            kind: "Client",
            prefix: self.tokens.prefix(),
        };
        match self.authorizer.authorize(&request) {
            Ok(true) => Ok(client),
            Ok(false) => Err(AuthFailure::PermissionDenied("permission denied".to_string())),
            Err(err) => Err(err.into()),
        }
    }

    /// Resolve the bearer to an existing Exporter object.
    pub async fn authenticate_exporter(&self, bearer: &str) -> Result<Exporter, AuthFailure> {
        let principal = self.resolve(bearer)?;

        let exporter = match &principal.object {
            Some(object) => {
                if object.kind != "Exporter" {
                    return Err(AuthFailure::PermissionDenied(
                        "token is not bound to an exporter".to_string(),
                    ));
                }
                let exporter = self
                    .store
                    .get_exporter(&object.namespace, &object.name)
                    .await
                    .map_err(|e| AuthFailure::Unauthenticated(e.to_string()))?;
                if exporter.metadata.uid.as_deref() != Some(object.uid.as_str()) {
                    return Err(AuthFailure::Unauthenticated(
                        "exporter uid does not match token".to_string(),
                    ));
                }
                exporter
            }
            None => {
                self.find_exporter_by_username(&principal.user.username)
                    .await?
            }
        };

        let request = AuthorizeRequest {
            self_object: serde_json::to_value(&exporter)
                .map_err(|e| AuthFailure::Unauthenticated(e.to_string()))?,
            computed_subject: exporter.internal_subject(self.tokens.prefix()),
            user: &principal.user,
            kind: "Exporter",
            prefix: self.tokens.prefix(),
        };
        match self.authorizer.authorize(&request) {
            Ok(true) => Ok(exporter),
            Ok(false) => Err(AuthFailure::PermissionDenied("permission denied".to_string())),
            Err(err) => Err(err.into()),
        }
    }

    async fn find_client_by_username(&self, username: &str) -> Result<Client, AuthFailure> {
        let clients = self
            .store
            .list_clients(&self.namespace)
            .await
            .map_err(|e| AuthFailure::Unauthenticated(e.to_string()))?;
        clients
            .into_iter()
            .find(|c| c.internal_subject(self.tokens.prefix()) == username)
            .ok_or_else(|| {
                AuthFailure::PermissionDenied(format!("no client matches username {username:?}"))
            })
    }

    async fn find_exporter_by_username(&self, username: &str) -> Result<Exporter, AuthFailure> {
        let exporters = self
            .store
            .list_exporters(&self.namespace, &crds::LabelSelector::default())
            .await
            .map_err(|e| AuthFailure::Unauthenticated(e.to_string()))?;
        exporters
            .into_iter()
            .find(|e| e.internal_subject(self.tokens.prefix()) == username)
            .ok_or_else(|| {
                AuthFailure::PermissionDenied(format!("no exporter matches username {username:?}"))
            })
    }
}
