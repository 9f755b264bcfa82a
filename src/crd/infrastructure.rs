//! Infrastructure Custom Resource Definition
//!
//! Mirrors the `extensions.gardener.cloud/v1alpha1` Infrastructure resource.
//! Only the fields this controller reads or writes are modelled; the spec is
//! owned by gardenlet and treated as read-only input.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{preserve_unknown_fields, LastError, LastOperation};

/// Infrastructure type handled by this controller
pub const INFRASTRUCTURE_TYPE_GCP: &str = "gcp";

/// Annotation gardenlet sets to request a specific operation
pub const OPERATION_ANNOTATION: &str = "gardener.cloud/operation";
pub const OPERATION_RECONCILE: &str = "reconcile";
pub const OPERATION_RESTORE: &str = "restore";
pub const OPERATION_MIGRATE: &str = "migrate";

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "extensions.gardener.cloud",
    version = "v1alpha1",
    kind = "Infrastructure",
    namespaced,
    status = "InfrastructureResourceStatus",
    shortname = "infra",
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Region","type":"string","jsonPath":".spec.region"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.lastOperation.state"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct InfrastructureSpec {
    #[serde(rename = "type")]
    pub type_: String,

    pub region: String,

    pub secret_ref: SecretReference,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub provider_config: Option<serde_json::Value>,
}

/// Reference to the cloud provider secret
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct SecretReference {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
}

/// Status written back by the actuator
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InfrastructureResourceStatus {
    /// Provider specific output, an encoded `InfrastructureStatus`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub provider_status: Option<serde_json::Value>,

    /// Opaque state, either a terraform raw state or a flow `InfrastructureState`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub state: Option<serde_json::Value>,

    #[serde(
        default,
        rename = "egressCIDRs",
        skip_serializing_if = "Option::is_none"
    )]
    pub egress_cidrs: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_operation: Option<LastOperation>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastError>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Infrastructure {
    /// Annotations of the resource, empty when none are set
    pub fn annotations_or_empty(&self) -> BTreeMap<String, String> {
        self.metadata.annotations.clone().unwrap_or_default()
    }

    /// Operation requested through the `gardener.cloud/operation` annotation
    pub fn operation_annotation(&self) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(OPERATION_ANNOTATION))
            .map(String::as_str)
    }

    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Persisted opaque state, if any
    pub fn state(&self) -> Option<&serde_json::Value> {
        self.status.as_ref().and_then(|s| s.state.as_ref())
    }

    /// Namespace of the shoot on the seed, which is also the Cluster name
    pub fn technical_id(&self) -> String {
        self.metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string())
    }

    /// Namespace of the referenced secret, defaulting to the resource namespace
    pub fn secret_namespace(&self) -> String {
        self.spec
            .secret_ref
            .namespace
            .clone()
            .unwrap_or_else(|| self.technical_id())
    }

    /// Whether the last operation finished successfully
    pub fn last_operation_succeeded(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.last_operation.as_ref())
            .map(LastOperation::succeeded)
            .unwrap_or(false)
    }
}
