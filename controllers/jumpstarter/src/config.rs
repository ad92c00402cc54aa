//! Controller configuration
//!
//! One YAML document plus a handful of environment inputs. Everything is
//! read once at startup; key rotation requires a restart.

use std::collections::BTreeMap;
use std::env;
use std::path::Path;

use auth::{CelAuthorizer, ObjectAuthorizer};
use serde::Deserialize;

use crate::error::ControllerError;

fn default_prefix() -> String {
    "jumpstarter:".to_string()
}

fn default_min_time_seconds() -> u64 {
    1
}

fn default_permit_without_stream() -> bool {
    true
}

fn default_offline_timeout_seconds() -> u64 {
    180
}

/// Top-level configuration document.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub authentication: Authentication,

    #[serde(default)]
    pub authorization: Authorization,

    #[serde(default)]
    pub grpc: Grpc,

    #[serde(default)]
    pub exporter_options: ExporterOptions,

    /// Named routers clients may be directed to
    #[serde(default)]
    pub router: BTreeMap<String, RouterEntry>,

    #[serde(default)]
    pub provisioning: Provisioning,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Authentication {
    #[serde(default)]
    pub internal: Internal,

    /// External JWT authenticators accepted in addition to internal tokens
    #[serde(default)]
    pub jwt: Vec<JwtAuthenticator>,
}

impl Default for Authentication {
    fn default() -> Self {
        Self {
            internal: Internal::default(),
            jwt: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Internal {
    /// Prefix prepended to internally issued usernames
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

impl Default for Internal {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JwtAuthenticator {
    pub issuer: String,
    pub audience: String,
}

/// Authorization mode selection.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Authorization {
    #[serde(rename = "type", default)]
    pub type_: AuthorizationType,

    #[serde(default)]
    pub cel: Option<CelConfiguration>,
}

impl Default for Authorization {
    fn default() -> Self {
        Self {
            type_: AuthorizationType::Basic,
            cel: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
pub enum AuthorizationType {
    #[default]
    Basic,
    #[serde(rename = "CEL")]
    Cel,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CelConfiguration {
    pub expression: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Grpc {
    #[serde(default)]
    pub keepalive: Keepalive,
}

/// Connection keepalive parameters. `minTimeSeconds` and
/// `permitWithoutStream` are accepted for compatibility with edge-enforced
/// policies; the framed listener enforces the idle and age limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Keepalive {
    #[serde(default = "default_min_time_seconds")]
    pub min_time_seconds: u64,

    #[serde(default = "default_permit_without_stream")]
    pub permit_without_stream: bool,

    #[serde(default)]
    pub timeout_seconds: Option<u64>,

    #[serde(default)]
    pub max_connection_idle_seconds: Option<u64>,

    #[serde(default)]
    pub max_connection_age_seconds: Option<u64>,

    #[serde(default)]
    pub max_connection_age_grace_seconds: Option<u64>,

    #[serde(default)]
    pub time_seconds: Option<u64>,
}

impl Default for Keepalive {
    fn default() -> Self {
        Self {
            min_time_seconds: default_min_time_seconds(),
            permit_without_stream: default_permit_without_stream(),
            timeout_seconds: None,
            max_connection_idle_seconds: None,
            max_connection_age_seconds: None,
            max_connection_age_grace_seconds: None,
            time_seconds: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExporterOptions {
    /// How long to wait without a heartbeat before marking an exporter
    /// offline
    #[serde(default = "default_offline_timeout_seconds")]
    pub offline_timeout_seconds: u64,
}

impl Default for ExporterOptions {
    fn default() -> Self {
        Self {
            offline_timeout_seconds: default_offline_timeout_seconds(),
        }
    }
}

impl ExporterOptions {
    pub fn offline_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.offline_timeout_seconds as i64)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterEntry {
    pub endpoint: String,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Provisioning {
    #[serde(default)]
    pub enabled: bool,
}

impl Config {
    /// Parse the configuration document.
    pub fn from_yaml(raw: &str) -> Result<Self, ControllerError> {
        serde_yaml::from_str(raw).map_err(|e| ControllerError::InvalidConfig(e.to_string()))
    }

    /// Load the configuration document from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ControllerError> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ControllerError::InvalidConfig(format!(
                "unable to read {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_yaml(&raw)
    }

    /// Build the configured authorizer; CEL expressions compile here, once.
    pub fn build_authorizer(&self) -> Result<ObjectAuthorizer, ControllerError> {
        match self.authorization.type_ {
            AuthorizationType::Basic => Ok(ObjectAuthorizer::Basic),
            AuthorizationType::Cel => {
                let cel = self.authorization.cel.as_ref().ok_or_else(|| {
                    ControllerError::InvalidConfig(
                        "CEL authorizer configuration missing".to_string(),
                    )
                })?;
                Ok(ObjectAuthorizer::Cel(
                    CelAuthorizer::new(&cel.expression)
                        .map_err(|e| ControllerError::InvalidConfig(e.to_string()))?,
                ))
            }
        }
    }
}

/// Process-wide environment inputs.
#[derive(Debug, Clone)]
pub struct Environment {
    /// HMAC key for controller-audience tokens
    pub controller_key: String,
    /// HMAC key for router tickets
    pub router_key: String,
    /// Controller endpoint advertised to clients and exporters
    pub endpoint: String,
    /// Namespace this controller manages
    pub namespace: String,
    /// Path to the configuration document
    pub config_path: String,
    /// Optional path to the RS256 OIDC signing key (PEM)
    pub oidc_key_path: Option<String>,
    /// Controller RPC listen address
    pub listen_addr: String,
    /// Router listen address
    pub router_listen_addr: String,
    /// OIDC discovery listen address
    pub oidc_listen_addr: String,
}

impl Environment {
    /// Read the environment; missing keys are configuration errors.
    pub fn from_env() -> Result<Self, ControllerError> {
        let require = |key: &str| {
            env::var(key)
                .map_err(|_| ControllerError::InvalidConfig(format!("{key} must be set")))
        };

        Ok(Self {
            controller_key: require("CONTROLLER_KEY")?,
            router_key: require("ROUTER_KEY")?,
            endpoint: env::var("GRPC_ENDPOINT")
                .unwrap_or_else(|_| "jumpstarter.local:8082".to_string()),
            namespace: env::var("NAMESPACE").unwrap_or_else(|_| "default".to_string()),
            config_path: env::var("JUMPSTARTER_CONFIG")
                .unwrap_or_else(|_| "/etc/jumpstarter/config.yaml".to_string()),
            oidc_key_path: env::var("OIDC_SIGNING_KEY").ok(),
            listen_addr: env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8082".to_string()),
            router_listen_addr: env::var("ROUTER_LISTEN_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:8083".to_string()),
            oidc_listen_addr: env::var("OIDC_LISTEN_ADDR")
                .unwrap_or_else(|_| "127.0.0.1:8085".to_string()),
        })
    }
}
