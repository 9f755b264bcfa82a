//! OAuth2 access tokens for the Google APIs
//!
//! Tokens are cached and refreshed 60 seconds before they expire.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::credentials::{Credentials, ServiceAccountKey, WorkloadIdentity};
use crate::error::{Error, Result};

pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);
const JWT_LIFETIME_SECS: i64 = 3600;

#[async_trait]
pub trait TokenSource: Send + Sync {
    /// A valid bearer token
    async fn token(&self) -> Result<String>;
}

#[derive(Clone)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

#[derive(Default)]
struct TokenCache {
    inner: Mutex<Option<CachedToken>>,
}

impl TokenCache {
    async fn get_or_refresh<F, Fut>(&self, refresh: F) -> Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<(String, Duration)>>,
    {
        let mut guard = self.inner.lock().await;
        if let Some(cached) = guard.as_ref() {
            if Instant::now() + EXPIRY_MARGIN < cached.expires_at {
                return Ok(cached.value.clone());
            }
        }
        let (value, lifetime) = refresh().await?;
        *guard = Some(CachedToken {
            value: value.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(value)
    }
}

#[derive(Debug, Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

/// JWT bearer grant signed with a service account key
pub struct ServiceAccountTokenSource {
    http: reqwest::Client,
    key: ServiceAccountKey,
    cache: TokenCache,
}

impl ServiceAccountTokenSource {
    pub fn new(http: reqwest::Client, key: ServiceAccountKey) -> Self {
        Self {
            http,
            key,
            cache: TokenCache::default(),
        }
    }

    fn assertion(&self, token_uri: &str) -> Result<String> {
        let now = chrono::Utc::now().timestamp();
        let claims = JwtClaims {
            iss: &self.key.client_email,
            scope: CLOUD_PLATFORM_SCOPE,
            aud: token_uri,
            iat: now,
            exp: now + JWT_LIFETIME_SECS,
        };
        let mut header = Header::new(Algorithm::RS256);
        if !self.key.private_key_id.is_empty() {
            header.kid = Some(self.key.private_key_id.clone());
        }
        let key = EncodingKey::from_rsa_pem(self.key.private_key.as_bytes())
            .map_err(|e| Error::ConfigError(format!("invalid service account private key: {e}")))?;
        encode(&header, &claims, &key)
            .map_err(|e| Error::ConfigError(format!("could not sign token request: {e}")))
    }

    async fn fetch(&self) -> Result<(String, Duration)> {
        let token_uri = self.key.token_uri.as_deref().unwrap_or(DEFAULT_TOKEN_URI);
        let assertion = self.assertion(token_uri)?;
        let response = self
            .http
            .post(token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await?;
        let body: OAuthTokenResponse = decode_response(response).await?;
        debug!("Obtained access token for {}", self.key.client_email);
        Ok((body.access_token, Duration::from_secs(body.expires_in)))
    }
}

#[async_trait]
impl TokenSource for ServiceAccountTokenSource {
    async fn token(&self) -> Result<String> {
        self.cache.get_or_refresh(|| self.fetch()).await
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StsExchangeRequest<'a> {
    grant_type: &'a str,
    audience: &'a str,
    scope: &'a str,
    requested_token_type: &'a str,
    subject_token: &'a str,
    subject_token_type: &'a str,
}

#[derive(Debug, Serialize)]
struct ImpersonationRequest<'a> {
    scope: [&'a str; 1],
    lifetime: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImpersonationResponse {
    access_token: String,
    expire_time: String,
}

/// Workload identity: STS token exchange, optionally followed by impersonation
pub struct WorkloadIdentityTokenSource {
    http: reqwest::Client,
    identity: WorkloadIdentity,
    cache: TokenCache,
}

impl WorkloadIdentityTokenSource {
    pub fn new(http: reqwest::Client, identity: WorkloadIdentity) -> Self {
        Self {
            http,
            identity,
            cache: TokenCache::default(),
        }
    }

    async fn fetch(&self) -> Result<(String, Duration)> {
        let config = &self.identity.config;
        let response = self
            .http
            .post(&config.token_url)
            .json(&StsExchangeRequest {
                grant_type: "urn:ietf:params:oauth:grant-type:token-exchange",
                audience: &config.audience,
                scope: CLOUD_PLATFORM_SCOPE,
                requested_token_type: "urn:ietf:params:oauth:token-type:access_token",
                subject_token: &self.identity.token,
                subject_token_type: &config.subject_token_type,
            })
            .send()
            .await?;
        let federated: OAuthTokenResponse = decode_response(response).await?;

        let Some(url) = config.service_account_impersonation_url.as_deref() else {
            return Ok((
                federated.access_token,
                Duration::from_secs(federated.expires_in),
            ));
        };

        let response = self
            .http
            .post(url)
            .bearer_auth(&federated.access_token)
            .json(&ImpersonationRequest {
                scope: [CLOUD_PLATFORM_SCOPE],
                lifetime: "3600s",
            })
            .send()
            .await?;
        let impersonated: ImpersonationResponse = decode_response(response).await?;
        let lifetime = chrono::DateTime::parse_from_rfc3339(&impersonated.expire_time)
            .ok()
            .and_then(|t| (t.with_timezone(&chrono::Utc) - chrono::Utc::now()).to_std().ok())
            .unwrap_or(Duration::from_secs(300));
        Ok((impersonated.access_token, lifetime))
    }
}

#[async_trait]
impl TokenSource for WorkloadIdentityTokenSource {
    async fn token(&self) -> Result<String> {
        self.cache.get_or_refresh(|| self.fetch()).await
    }
}

/// Token source matching the kind of `credentials`
pub fn token_source(http: reqwest::Client, credentials: &Credentials) -> Arc<dyn TokenSource> {
    match credentials {
        Credentials::ServiceAccount { key, .. } => {
            Arc::new(ServiceAccountTokenSource::new(http, key.clone()))
        }
        Credentials::WorkloadIdentity(wi) => {
            Arc::new(WorkloadIdentityTokenSource::new(http, wi.clone()))
        }
    }
}

pub(crate) async fn decode_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(Error::GcpApi {
            status: status.as_u16(),
            message,
        });
    }
    Ok(response.json::<T>().await?)
}
