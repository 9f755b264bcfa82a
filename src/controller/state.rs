//! Persisted infrastructure state
//!
//! `status.state` holds one of two encodings:
//! - a terraform raw state envelope `{"data": "<tfstate>", "encoding": "none"|"base64"}`
//! - a flow [`InfrastructureState`] identified by its `apiVersion`/`kind` header
//!
//! Detection only looks at the header. Migration goes from terraform to flow,
//! never back.

use std::collections::BTreeMap;

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::crd::provider::{InfrastructureState, KIND_INFRASTRUCTURE_STATE, PROVIDER_API_VERSION};
use crate::error::{Error, Result};

/// Set once any cloud resource may have been created
pub const MARKER_CREATED_RESOURCES_EXIST: &str = "created-resources-exist";
/// Set once a managed service account was created
pub const MARKER_CREATED_SERVICE_ACCOUNT: &str = "created-service-account";

const MARKER_TRUE: &str = "true";
const SERVICE_ACCOUNT_RESOURCE_TYPE: &str = "google_service_account";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypeHeader {
    #[serde(default)]
    api_version: Option<String>,
    #[serde(default)]
    kind: Option<String>,
}

/// Whether `raw` is a flow state.
///
/// No state and empty state are not flow state. Only a non-object header is
/// rejected as malformed.
pub fn has_flow_state(raw: Option<&serde_json::Value>) -> Result<bool> {
    let Some(raw) = raw else {
        return Ok(false);
    };
    if raw.is_null() {
        return Ok(false);
    }
    let header: TypeHeader = serde_json::from_value(raw.clone())
        .map_err(|e| Error::ConfigError(format!("could not decode infrastructure state: {e}")))?;
    Ok(is_flow_header(&header))
}

fn is_flow_header(header: &TypeHeader) -> bool {
    header.api_version.as_deref() == Some(PROVIDER_API_VERSION)
        && header.kind.as_deref() == Some(KIND_INFRASTRUCTURE_STATE)
}

/// Flow bookkeeping with its string markers.
///
/// Unknown markers are kept when decoding and written back on encode.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlowState {
    data: BTreeMap<String, String>,
}

impl FlowState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(raw: &serde_json::Value) -> Result<Self> {
        if !has_flow_state(Some(raw))? {
            return Err(Error::ConfigError(
                "infrastructure state is not a flow state".to_string(),
            ));
        }
        let state: InfrastructureState = serde_json::from_value(raw.clone())
            .map_err(|e| Error::ConfigError(format!("could not decode flow state: {e}")))?;
        Ok(Self { data: state.data })
    }

    pub fn encode(&self) -> Result<serde_json::Value> {
        let state = InfrastructureState {
            data: self.data.clone(),
            ..Default::default()
        };
        Ok(serde_json::to_value(state)?)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.data.insert(key.to_string(), value.to_string());
    }

    pub fn remove(&mut self, key: &str) {
        self.data.remove(key);
    }

    pub fn data(&self) -> &BTreeMap<String, String> {
        &self.data
    }

    pub fn is_set(&self, marker: &str) -> bool {
        self.get(marker) == Some(MARKER_TRUE)
    }

    pub fn mark(&mut self, marker: &str) {
        self.set(marker, MARKER_TRUE);
    }

    pub fn created_resources_exist(&self) -> bool {
        self.is_set(MARKER_CREATED_RESOURCES_EXIST)
    }

    pub fn created_service_account(&self) -> bool {
        self.is_set(MARKER_CREATED_SERVICE_ACCOUNT)
    }
}

/// Terraformer raw state envelope
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct TerraformRawState {
    #[serde(default)]
    pub data: String,
    #[serde(default = "encoding_none")]
    pub encoding: String,
}

fn encoding_none() -> String {
    "none".to_string()
}

impl TerraformRawState {
    pub fn from_tfstate(tfstate: &str) -> Self {
        Self {
            data: tfstate.to_string(),
            encoding: encoding_none(),
        }
    }

    pub fn decode(raw: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(raw.clone())
            .map_err(|e| Error::ConfigError(format!("could not decode terraform state: {e}")))
    }

    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// The tfstate document as text
    pub fn tfstate(&self) -> Result<String> {
        match self.encoding.as_str() {
            "" | "none" => Ok(self.data.clone()),
            "base64" => {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(self.data.trim())
                    .map_err(|e| Error::ConfigError(format!("invalid base64 terraform state: {e}")))?;
                String::from_utf8(bytes)
                    .map_err(|e| Error::ConfigError(format!("terraform state is not utf-8: {e}")))
            }
            other => Err(Error::ConfigError(format!(
                "unknown terraform state encoding {other:?}"
            ))),
        }
    }

    fn document(&self) -> Result<Option<serde_json::Value>> {
        let text = self.tfstate()?;
        if text.trim().is_empty() {
            return Ok(None);
        }
        let doc = serde_json::from_str(&text)
            .map_err(|e| Error::ConfigError(format!("could not decode tfstate: {e}")))?;
        Ok(Some(doc))
    }

    /// No data, or a tfstate that tracks no resources
    pub fn is_empty(&self) -> Result<bool> {
        Ok(match self.document()? {
            None => true,
            Some(doc) => resource_types(&doc).is_empty(),
        })
    }

    pub fn tracks_resource_type(&self, resource_type: &str) -> Result<bool> {
        Ok(match self.document()? {
            None => false,
            Some(doc) => resource_types(&doc).iter().any(|t| t == resource_type),
        })
    }

    /// Values of the named outputs; missing outputs are an error
    pub fn outputs(&self, keys: &[&str]) -> Result<BTreeMap<String, String>> {
        let doc = self.document()?.unwrap_or(serde_json::Value::Null);
        let mut values = BTreeMap::new();
        let mut missing = Vec::new();
        for key in keys {
            match output_value(&doc, key) {
                Some(v) => {
                    values.insert(key.to_string(), v);
                }
                None => missing.push(*key),
            }
        }
        if !missing.is_empty() {
            return Err(Error::TerraformerError(format!(
                "terraform outputs not found: {}",
                missing.join(", ")
            )));
        }
        Ok(values)
    }
}

/// Resource types tracked by a v4 (`resources[]`) or v3 (`modules[].resources`) tfstate
fn resource_types(doc: &serde_json::Value) -> Vec<String> {
    let mut types = Vec::new();
    if let Some(resources) = doc.get("resources").and_then(|r| r.as_array()) {
        types.extend(
            resources
                .iter()
                .filter_map(|r| r.get("type").and_then(|t| t.as_str()))
                .map(str::to_string),
        );
    }
    if let Some(modules) = doc.get("modules").and_then(|m| m.as_array()) {
        for module in modules {
            if let Some(resources) = module.get("resources").and_then(|r| r.as_object()) {
                for resource in resources.values() {
                    if let Some(t) = resource.get("type").and_then(|t| t.as_str()) {
                        types.push(t.to_string());
                    }
                }
            }
        }
    }
    types
}

fn output_value(doc: &serde_json::Value, key: &str) -> Option<String> {
    let from_v4 = doc.get("outputs").and_then(|o| o.get(key));
    let from_v3 = doc
        .get("modules")
        .and_then(|m| m.as_array())
        .and_then(|m| m.first())
        .and_then(|m| m.get("outputs"))
        .and_then(|o| o.get(key));
    let value = from_v4.or(from_v3)?.get("value")?;
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Array(items) => Some(
            items
                .iter()
                .filter_map(|i| i.as_str())
                .collect::<Vec<_>>()
                .join(","),
        ),
        serde_json::Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Build the flow state for a resource that was so far managed by terraform.
///
/// An empty terraform state yields an empty flow state. Any other state is
/// assumed to have created resources; the service account marker is set when
/// the tfstate tracks one.
pub fn migrate_from_terraform(raw: &TerraformRawState) -> Result<FlowState> {
    let mut state = FlowState::new();
    if raw.is_empty()? {
        return Ok(state);
    }
    state.mark(MARKER_CREATED_RESOURCES_EXIST);
    if raw.tracks_resource_type(SERVICE_ACCOUNT_RESOURCE_TYPE)? {
        state.mark(MARKER_CREATED_SERVICE_ACCOUNT);
    }
    Ok(state)
}
