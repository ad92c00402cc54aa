//! Jumpstarter token service and authorization
//!
//! Groups token minting/verification, OIDC signing with JWKS publication,
//! principal resolution and the Basic/CEL object authorizers.
//!
//! Three token audiences exist:
//! - *controller*: long-lived HS256 tokens bound to a Client or Exporter UID
//! - *router*: 30-minute HS256 tickets whose subject is a stream ID
//! - *OIDC*: RS256 tokens for external authenticators, key published at
//!   `/.well-known/jwks`

pub mod authorizer;
pub mod error;
pub mod oidc;
pub mod principal;
pub mod token;

pub use authorizer::{AuthorizeRequest, CelAuthorizer, ObjectAuthorizer};
pub use error::AuthError;
pub use oidc::OidcSigner;
pub use principal::{ObjectRef, Principal, UserInfo};
pub use token::{ObjectClaims, TokenService, ROUTER_TICKET_LIFETIME_SECONDS};
