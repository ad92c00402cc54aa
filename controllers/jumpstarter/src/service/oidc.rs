//! OIDC discovery endpoints
//!
//! Serves the discovery and JWKS documents for the rotating RS256 signing
//! key. TLS is terminated by the fronting edge.

use std::sync::Arc;

use auth::OidcSigner;
use axum::extract::State;
use axum::routing::get;
use axum::Json;
use tracing::info;

use crate::error::ControllerError;

pub fn router(signer: Arc<OidcSigner>) -> axum::Router {
    axum::Router::new()
        .route("/.well-known/openid-configuration", get(discovery))
        .route("/.well-known/jwks", get(jwks))
        .with_state(signer)
}

async fn discovery(State(signer): State<Arc<OidcSigner>>) -> Json<serde_json::Value> {
    Json(signer.discovery_document())
}

async fn jwks(State(signer): State<Arc<OidcSigner>>) -> Json<serde_json::Value> {
    Json(signer.jwks_document())
}

pub async fn serve(addr: &str, signer: Arc<OidcSigner>) -> Result<(), ControllerError> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "starting oidc discovery service");
    axum::serve(listener, router(signer))
        .await
        .map_err(ControllerError::Io)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Exercises the handlers directly; endpoint routing is axum's concern
    #[tokio::test]
    async fn test_documents_are_served() {
        let pem = test_key();
        let signer = Arc::new(OidcSigner::from_rsa_pem("https://jumpstarter.dev", &pem).unwrap());

        let Json(discovery) = discovery(State(signer.clone())).await;
        assert_eq!(discovery["issuer"], "https://jumpstarter.dev");

        let Json(jwks) = jwks(State(signer)).await;
        assert_eq!(jwks["keys"][0]["kty"], "RSA");
    }

    fn test_key() -> String {
        use rsa::pkcs8::{EncodePrivateKey, LineEnding};
        let mut rng = rand::thread_rng();
        let key = rsa::RsaPrivateKey::new(&mut rng, 2048).expect("keygen");
        key.to_pkcs8_pem(LineEnding::LF).expect("pem").to_string()
    }
}
