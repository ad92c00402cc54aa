//! HMAC token minting and verification
//!
//! Controller-audience tokens live as long as the object they are bound to;
//! router tickets expire after thirty minutes and carry the stream ID as
//! subject. Signing algorithms are restricted to the HS family on both
//! paths.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AuthError;
use crate::principal::{ObjectRef, Principal, UserInfo};

/// Issuer and audience of controller tokens.
pub const CONTROLLER_ISSUER: &str = "https://jumpstarter.dev/controller";
/// Issuer of router tickets.
pub const STREAM_ISSUER: &str = "https://jumpstarter.dev/stream";
/// Audience of router tickets.
pub const ROUTER_AUDIENCE: &str = "https://jumpstarter.dev/router";
/// Router tickets expire after thirty minutes.
pub const ROUTER_TICKET_LIFETIME_SECONDS: i64 = 30 * 60;

/// Claims of a controller-audience token bound to a stored object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectClaims {
    pub iss: String,
    pub sub: String,
    pub aud: Vec<String>,
    pub nbf: i64,
    pub iat: i64,
    pub jti: String,
    #[serde(rename = "kubernetes.io/kind")]
    pub kind: String,
    #[serde(rename = "kubernetes.io/namespace")]
    pub namespace: String,
    #[serde(rename = "kubernetes.io/name")]
    pub name: String,
    #[serde(rename = "kubernetes.io/uid")]
    pub uid: String,
}

/// Claims of a router ticket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketClaims {
    pub iss: String,
    pub sub: String,
    pub aud: Vec<String>,
    pub exp: i64,
    pub nbf: i64,
    pub iat: i64,
    pub jti: String,
}

/// Mints and verifies controller tokens and router tickets.
#[derive(Clone)]
pub struct TokenService {
    controller_key: Vec<u8>,
    router_key: Vec<u8>,
    prefix: String,
}

impl TokenService {
    pub fn new(
        controller_key: impl Into<Vec<u8>>,
        router_key: impl Into<Vec<u8>>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            controller_key: controller_key.into(),
            router_key: router_key.into(),
            prefix: prefix.into(),
        }
    }

    /// The username prefix internal principals carry.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Sign a controller-audience token bound to the given object. Valid for
    /// the lifetime of the object; the UID claim pins the exact incarnation.
    pub fn sign_object_token(
        &self,
        kind: &str,
        namespace: &str,
        name: &str,
        uid: &str,
    ) -> Result<String, AuthError> {
        let now = Utc::now();
        let claims = ObjectClaims {
            iss: CONTROLLER_ISSUER.to_string(),
            sub: uid.to_string(),
            aud: vec![CONTROLLER_ISSUER.to_string()],
            nbf: now.timestamp(),
            iat: now.timestamp(),
            jti: Uuid::new_v4().to_string(),
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            uid: uid.to_string(),
        };

        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(&self.controller_key),
        )
        .map_err(|e| AuthError::Signing(e.to_string()))
    }

    /// Verify a controller-audience token and derive the principal. The
    /// caller must still confirm the referenced object exists with the same
    /// UID before trusting the binding.
    pub fn verify_object_token(&self, token: &str) -> Result<Principal, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.algorithms = vec![Algorithm::HS256, Algorithm::HS384, Algorithm::HS512];
        validation.set_issuer(&[CONTROLLER_ISSUER]);
        validation.set_audience(&[CONTROLLER_ISSUER]);
        validation.set_required_spec_claims(&["iss", "aud", "sub"]);
        validation.validate_exp = false;
        validation.validate_nbf = true;

        let data = decode::<ObjectClaims>(
            token,
            &DecodingKey::from_secret(&self.controller_key),
            &validation,
        )
        .map_err(|e| AuthError::InvalidToken(e.to_string()))?;

        let claims = data.claims;
        let username = format!(
            "{}{}:{}:{}:{}",
            self.prefix,
            claims.kind.to_lowercase(),
            claims.namespace,
            claims.name,
            claims.uid
        );

        Ok(Principal {
            user: UserInfo::new(username, claims.uid.clone()),
            object: Some(ObjectRef {
                kind: claims.kind,
                namespace: claims.namespace,
                name: claims.name,
                uid: claims.uid,
            }),
        })
    }

    /// Sign a router ticket whose subject is the stream ID.
    pub fn sign_router_ticket(
        &self,
        stream_id: &Uuid,
        now: DateTime<Utc>,
    ) -> Result<String, AuthError> {
        let claims = TicketClaims {
            iss: STREAM_ISSUER.to_string(),
            sub: stream_id.to_string(),
            aud: vec![ROUTER_AUDIENCE.to_string()],
            exp: (now + Duration::seconds(ROUTER_TICKET_LIFETIME_SECONDS)).timestamp(),
            nbf: now.timestamp(),
            iat: now.timestamp(),
            jti: Uuid::new_v4().to_string(),
        };

        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(&self.router_key),
        )
        .map_err(|e| AuthError::Signing(e.to_string()))
    }

    /// Verify a router ticket and return the stream ID it names.
    pub fn verify_router_ticket(&self, token: &str) -> Result<String, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.algorithms = vec![Algorithm::HS256, Algorithm::HS384, Algorithm::HS512];
        validation.set_issuer(&[STREAM_ISSUER]);
        validation.set_audience(&[ROUTER_AUDIENCE]);
        validation.set_required_spec_claims(&["iss", "aud", "sub", "exp"]);
        validation.validate_nbf = true;

        let data = decode::<TicketClaims>(
            token,
            &DecodingKey::from_secret(&self.router_key),
            &validation,
        )
        .map_err(|e| AuthError::InvalidToken(e.to_string()))?;

        Ok(data.claims.sub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> TokenService {
        TokenService::new(b"controller-secret".to_vec(), b"router-secret".to_vec(), "jumpstarter:")
    }

    #[test]
    fn test_object_token_roundtrip() {
        let service = service();
        let token = service
            .sign_object_token("Client", "default", "test-client", "uid-1")
            .unwrap();

        let principal = service.verify_object_token(&token).unwrap();
        assert_eq!(
            principal.user.username,
            "jumpstarter:client:default:test-client:uid-1"
        );
        let object = principal.object.unwrap();
        assert_eq!(object.kind, "Client");
        assert_eq!(object.uid, "uid-1");
    }

    #[test]
    fn test_object_token_rejects_wrong_key() {
        let token = service()
            .sign_object_token("Exporter", "default", "e1", "uid-2")
            .unwrap();

        let other = TokenService::new(b"different".to_vec(), b"router-secret".to_vec(), "jumpstarter:");
        assert!(other.verify_object_token(&token).is_err());
    }

    #[test]
    fn test_router_ticket_roundtrip() {
        let service = service();
        let stream_id = Uuid::new_v4();
        let ticket = service.sign_router_ticket(&stream_id, Utc::now()).unwrap();

        let subject = service.verify_router_ticket(&ticket).unwrap();
        assert_eq!(subject, stream_id.to_string());
    }

    #[test]
    fn test_router_ticket_expires() {
        let service = service();
        let stream_id = Uuid::new_v4();
        // Issued far enough in the past that exp (and the default leeway)
        // are behind us
        let issued = Utc::now() - Duration::seconds(ROUTER_TICKET_LIFETIME_SECONDS + 120);
        let ticket = service.sign_router_ticket(&stream_id, issued).unwrap();

        assert!(service.verify_router_ticket(&ticket).is_err());
    }

    #[test]
    fn test_audiences_are_not_interchangeable() {
        let service = service();
        let object_token = service
            .sign_object_token("Client", "default", "c1", "uid-3")
            .unwrap();
        let ticket = service
            .sign_router_ticket(&Uuid::new_v4(), Utc::now())
            .unwrap();

        assert!(service.verify_router_ticket(&object_token).is_err());
        assert!(service.verify_object_token(&ticket).is_err());
    }
}
