//! Shared types used by the Infrastructure and Cluster CRDs
//!
//! - [`LastOperation`] / [`LastError`] follow the Gardener extension status conventions
//! - [`preserve_unknown_fields`] marks opaque `RawExtension`-style fields in the schema

use chrono::Utc;
use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;

/// Schema for opaque JSON fields that Kubernetes must not prune
pub fn preserve_unknown_fields(_gen: &mut SchemaGenerator) -> Schema {
    let mut schema = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    Schema::Object(schema)
}

/// Type of the operation recorded in `status.lastOperation`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum LastOperationType {
    Create,
    Reconcile,
    Delete,
    Migrate,
    Restore,
}

impl std::fmt::Display for LastOperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LastOperationType::Create => write!(f, "Create"),
            LastOperationType::Reconcile => write!(f, "Reconcile"),
            LastOperationType::Delete => write!(f, "Delete"),
            LastOperationType::Migrate => write!(f, "Migrate"),
            LastOperationType::Restore => write!(f, "Restore"),
        }
    }
}

/// State of the operation recorded in `status.lastOperation`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum LastOperationState {
    Processing,
    Succeeded,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LastOperation {
    #[serde(rename = "type")]
    pub type_: LastOperationType,
    pub state: LastOperationState,
    pub description: String,
    pub progress: i32,
    pub last_update_time: String,
}

impl LastOperation {
    pub fn new(type_: LastOperationType, state: LastOperationState, description: &str) -> Self {
        let progress = match state {
            LastOperationState::Succeeded => 100,
            _ => 1,
        };
        Self {
            type_,
            state,
            description: description.to_string(),
            progress,
            last_update_time: Utc::now().to_rfc3339(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.state == LastOperationState::Succeeded
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LastError {
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(with = "Vec<String>")]
    pub codes: Vec<ErrorCode>,
    pub last_update_time: String,
}

impl LastError {
    pub fn new(description: &str, codes: &[ErrorCode]) -> Self {
        Self {
            description: description.to_string(),
            codes: codes.to_vec(),
            last_update_time: Utc::now().to_rfc3339(),
        }
    }
}
