//! Cloud provider credentials referenced by the Infrastructure secret
//!
//! Two secret layouts are understood:
//! - `serviceaccount.json`: a service account key file
//! - `credentialsConfig` + `token` + `projectID`: workload identity, where the
//!   token is exchanged for an access token through Google STS

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use crate::crd::Infrastructure;
use crate::error::{Error, Result};

pub const SERVICE_ACCOUNT_JSON_KEY: &str = "serviceaccount.json";
pub const CREDENTIALS_CONFIG_KEY: &str = "credentialsConfig";
pub const TOKEN_KEY: &str = "token";
pub const PROJECT_ID_KEY: &str = "projectID";

/// Parsed service account key file
#[derive(Clone, Deserialize, Serialize)]
pub struct ServiceAccountKey {
    #[serde(rename = "type")]
    pub type_: String,
    pub project_id: String,
    #[serde(default)]
    pub private_key_id: String,
    pub private_key: String,
    pub client_email: String,
    #[serde(default)]
    pub token_uri: Option<String>,
}

impl std::fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("project_id", &self.project_id)
            .field("client_email", &self.client_email)
            .finish_non_exhaustive()
    }
}

/// `external_account` configuration used for workload identity
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ExternalAccountConfig {
    #[serde(rename = "type", default)]
    pub type_: String,
    pub audience: String,
    #[serde(default = "default_subject_token_type")]
    pub subject_token_type: String,
    #[serde(default = "default_sts_url")]
    pub token_url: String,
    #[serde(default)]
    pub service_account_impersonation_url: Option<String>,
}

fn default_subject_token_type() -> String {
    "urn:ietf:params:oauth:token-type:jwt".to_string()
}

fn default_sts_url() -> String {
    "https://sts.googleapis.com/v1/token".to_string()
}

#[derive(Clone)]
pub struct WorkloadIdentity {
    pub project_id: String,
    pub config: ExternalAccountConfig,
    /// Raw `credentialsConfig` as stored in the secret
    pub raw_config: String,
    pub token: String,
}

impl std::fmt::Debug for WorkloadIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkloadIdentity")
            .field("project_id", &self.project_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug)]
pub enum Credentials {
    ServiceAccount {
        key: ServiceAccountKey,
        /// Key file exactly as stored, handed to terraform unchanged
        raw: String,
    },
    WorkloadIdentity(WorkloadIdentity),
}

impl Credentials {
    pub fn project_id(&self) -> &str {
        match self {
            Credentials::ServiceAccount { key, .. } => &key.project_id,
            Credentials::WorkloadIdentity(wi) => &wi.project_id,
        }
    }

    /// Whether the workload identity token has to be mounted into terraformer pods
    pub fn requires_token_mount(&self) -> bool {
        matches!(self, Credentials::WorkloadIdentity(_))
    }

    /// Digest of the secret material, equal for equal credentials
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        match self {
            Credentials::ServiceAccount { raw, .. } => {
                hasher.update(b"serviceaccount\0");
                hasher.update(raw.as_bytes());
            }
            Credentials::WorkloadIdentity(wi) => {
                hasher.update(b"workloadidentity\0");
                hasher.update(wi.raw_config.as_bytes());
                hasher.update(b"\0");
                hasher.update(wi.token.as_bytes());
            }
        }
        hex::encode(hasher.finalize())
    }
}

/// Extract credentials from the data of a secret
pub fn resolve_credentials(secret: &Secret) -> Result<Credentials> {
    let name = secret.metadata.name.clone().unwrap_or_default();
    let data = secret_data(secret);

    if let Some(raw) = data.get(SERVICE_ACCOUNT_JSON_KEY) {
        let key: ServiceAccountKey = serde_json::from_str(raw).map_err(|e| {
            Error::ConfigError(format!(
                "could not decode {SERVICE_ACCOUNT_JSON_KEY} of secret {name}: {e}"
            ))
        })?;
        if key.type_ != "service_account" {
            return Err(Error::ConfigError(format!(
                "{SERVICE_ACCOUNT_JSON_KEY} of secret {name} has type {:?}, expected \"service_account\"",
                key.type_
            )));
        }
        if key.project_id.is_empty() || key.client_email.is_empty() {
            return Err(Error::ConfigError(format!(
                "{SERVICE_ACCOUNT_JSON_KEY} of secret {name} is missing project_id or client_email"
            )));
        }
        return Ok(Credentials::ServiceAccount {
            key,
            raw: raw.clone(),
        });
    }

    if let Some(raw_config) = data.get(CREDENTIALS_CONFIG_KEY) {
        let config: ExternalAccountConfig = serde_json::from_str(raw_config).map_err(|e| {
            Error::ConfigError(format!(
                "could not decode {CREDENTIALS_CONFIG_KEY} of secret {name}: {e}"
            ))
        })?;
        let token = data.get(TOKEN_KEY).cloned().ok_or_else(|| {
            Error::ConfigError(format!("secret {name} is missing the {TOKEN_KEY} key"))
        })?;
        let project_id = data
            .get(PROJECT_ID_KEY)
            .filter(|p| !p.is_empty())
            .cloned()
            .ok_or_else(|| {
                Error::ConfigError(format!("secret {name} is missing the {PROJECT_ID_KEY} key"))
            })?;
        return Ok(Credentials::WorkloadIdentity(WorkloadIdentity {
            project_id,
            config,
            raw_config: raw_config.clone(),
            token,
        }));
    }

    Err(Error::ConfigError(format!(
        "secret {name} contains neither {SERVICE_ACCOUNT_JSON_KEY} nor {CREDENTIALS_CONFIG_KEY}"
    )))
}

fn secret_data(secret: &Secret) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    if let Some(data) = &secret.data {
        for (k, v) in data {
            out.insert(k.clone(), String::from_utf8_lossy(&v.0).into_owned());
        }
    }
    if let Some(string_data) = &secret.string_data {
        for (k, v) in string_data {
            out.insert(k.clone(), v.clone());
        }
    }
    out
}

/// Looks up the credentials referenced by an Infrastructure
#[async_trait]
pub trait CredentialsProvider: Send + Sync {
    async fn credentials(&self, infra: &Infrastructure) -> Result<Credentials>;
}

pub struct KubeCredentialsProvider {
    client: Client,
}

impl KubeCredentialsProvider {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CredentialsProvider for KubeCredentialsProvider {
    #[instrument(skip(self, infra), fields(secret = %infra.spec.secret_ref.name))]
    async fn credentials(&self, infra: &Infrastructure) -> Result<Credentials> {
        let namespace = infra.secret_namespace();
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        let secret = api.get_opt(&infra.spec.secret_ref.name).await?.ok_or_else(|| {
            Error::ConfigError(format!(
                "secret {}/{} does not exist",
                namespace, infra.spec.secret_ref.name
            ))
        })?;
        debug!("Resolved credentials secret {}/{}", namespace, infra.spec.secret_ref.name);
        resolve_credentials(&secret)
    }
}
