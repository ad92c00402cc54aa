//! OIDC signing and JWKS publication
//!
//! Signs RS256 tokens for external authenticators. The signing key is loaded
//! once at startup; rotating it requires a restart, at which point the JWKS
//! document advertises the new key.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{Duration, Utc};
use jsonwebtoken::{encode, Algorithm, DecodingKey, EncodingKey, Header};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::error::AuthError;

/// Claims of an OIDC-audience token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OidcClaims {
    pub iss: String,
    pub sub: String,
    pub aud: Vec<String>,
    pub exp: i64,
    pub iat: i64,
}

/// RS256 signer with a stable key id derived from the public modulus.
#[derive(Clone)]
pub struct OidcSigner {
    issuer: String,
    encoding_key: EncodingKey,
    kid: String,
    modulus: String,
    exponent: String,
}

impl OidcSigner {
    /// Load an RSA private key in PKCS#8 or PKCS#1 PEM form.
    pub fn from_rsa_pem(issuer: impl Into<String>, pem: &str) -> Result<Self, AuthError> {
        let private = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|e| AuthError::Key(e.to_string()))?;

        let encoding_key =
            EncodingKey::from_rsa_pem(pem.as_bytes()).map_err(|e| AuthError::Key(e.to_string()))?;

        let public = private.to_public_key();
        let n = public.n().to_bytes_be();
        let e = public.e().to_bytes_be();

        let kid = URL_SAFE_NO_PAD.encode(Sha256::digest(&n));

        Ok(Self {
            issuer: issuer.into(),
            encoding_key,
            kid,
            modulus: URL_SAFE_NO_PAD.encode(n),
            exponent: URL_SAFE_NO_PAD.encode(e),
        })
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Sign an RS256 token for the given subject and audience.
    pub fn sign(
        &self,
        subject: &str,
        audience: &str,
        lifetime_seconds: i64,
    ) -> Result<String, AuthError> {
        let now = Utc::now();
        let claims = OidcClaims {
            iss: self.issuer.clone(),
            sub: subject.to_string(),
            aud: vec![audience.to_string()],
            exp: (now + Duration::seconds(lifetime_seconds)).timestamp(),
            iat: now.timestamp(),
        };

        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.kid.clone());

        encode(&header, &claims, &self.encoding_key).map_err(|e| AuthError::Signing(e.to_string()))
    }

    /// Decoding key matching the published JWKS entry.
    pub fn decoding_key(&self) -> Result<DecodingKey, AuthError> {
        DecodingKey::from_rsa_components(&self.modulus, &self.exponent)
            .map_err(|e| AuthError::Key(e.to_string()))
    }

    /// Document served at `/.well-known/jwks`.
    pub fn jwks_document(&self) -> serde_json::Value {
        json!({
            "keys": [{
                "kty": "RSA",
                "alg": "RS256",
                "use": "sig",
                "kid": self.kid,
                "n": self.modulus,
                "e": self.exponent,
            }]
        })
    }

    /// Document served at `/.well-known/openid-configuration`.
    pub fn discovery_document(&self) -> serde_json::Value {
        json!({
            "issuer": self.issuer,
            "jwks_uri": format!("{}/.well-known/jwks", self.issuer.trim_end_matches('/')),
            "response_types_supported": ["id_token"],
            "subject_types_supported": ["public"],
            "id_token_signing_alg_values_supported": ["RS256"],
        })
    }
}
