//! Google Cloud access for the infrastructure controller
//!
//! Credentials are resolved from the Infrastructure secret, turned into a
//! [`auth::TokenSource`], and handed to the REST clients behind the
//! [`ComputeClient`] and [`IamClient`] capabilities.

pub mod auth;
pub mod compute;
pub mod credentials;
pub mod iam;
pub mod rest;

#[cfg(test)]
pub(crate) mod fake;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub use compute::ComputeClient;
pub use credentials::{resolve_credentials, Credentials, CredentialsProvider, KubeCredentialsProvider};
pub use iam::IamClient;

use auth::TokenSource;

use crate::error::Result;

/// Builds cloud clients bound to the project of a set of credentials
pub trait CloudClientFactory: Send + Sync {
    fn compute(&self, credentials: &Credentials) -> Result<Arc<dyn ComputeClient>>;
    fn iam(&self, credentials: &Credentials) -> Result<Arc<dyn IamClient>>;
}

/// Token sources kept per credential fingerprint before the cache is reset
const MAX_TOKEN_SOURCES: usize = 256;

pub struct RestClientFactory {
    http: reqwest::Client,
    compute_base_url: String,
    iam_base_url: String,
    /// One token source per set of credentials, shared by all its clients
    token_sources: Mutex<HashMap<String, Arc<dyn TokenSource>>>,
}

impl RestClientFactory {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("gcp-infra-extension/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            compute_base_url: rest::COMPUTE_BASE_URL.to_string(),
            iam_base_url: rest::IAM_BASE_URL.to_string(),
            token_sources: Mutex::new(HashMap::new()),
        })
    }

    fn tokens(&self, credentials: &Credentials) -> Arc<dyn TokenSource> {
        let mut sources = self
            .token_sources
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let fingerprint = credentials.fingerprint();
        if let Some(source) = sources.get(&fingerprint) {
            return source.clone();
        }
        // Rotated workload identity tokens leave stale entries behind
        if sources.len() >= MAX_TOKEN_SOURCES {
            sources.clear();
        }
        let source = auth::token_source(self.http.clone(), credentials);
        sources.insert(fingerprint, source.clone());
        source
    }
}

impl CloudClientFactory for RestClientFactory {
    fn compute(&self, credentials: &Credentials) -> Result<Arc<dyn ComputeClient>> {
        Ok(Arc::new(
            rest::RestComputeClient::new(
                self.http.clone(),
                self.tokens(credentials),
                credentials.project_id(),
            )
            .with_base_url(&self.compute_base_url),
        ))
    }

    fn iam(&self, credentials: &Credentials) -> Result<Arc<dyn IamClient>> {
        Ok(Arc::new(
            rest::RestIamClient::new(
                self.http.clone(),
                self.tokens(credentials),
                credentials.project_id(),
            )
            .with_base_url(&self.iam_base_url),
        ))
    }
}
