//! Cluster Custom Resource Definition
//!
//! Gardener publishes one cluster-scoped `Cluster` per shoot, named after the
//! shoot's technical namespace on the seed. The embedded shoot and seed
//! manifests are opaque; only the handful of fields this controller needs are
//! decoded into [`ShootCluster`].

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::preserve_unknown_fields;
use crate::error::{Error, Result};

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "extensions.gardener.cloud",
    version = "v1alpha1",
    kind = "Cluster",
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    #[serde(default)]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub seed: serde_json::Value,

    #[serde(default)]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub shoot: serde_json::Value,
}

/// Minimal object metadata of an embedded manifest
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct EmbeddedMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Shoot {
    #[serde(default)]
    pub metadata: EmbeddedMeta,
    #[serde(default)]
    pub spec: ShootSpec,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ShootSpec {
    #[serde(default)]
    pub networking: Option<Networking>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Networking {
    #[serde(default)]
    pub pods: Option<String>,
    #[serde(default)]
    pub nodes: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Seed {
    #[serde(default)]
    pub metadata: EmbeddedMeta,
}

/// Decoded view of a [`Cluster`] used by the actuator
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShootCluster {
    /// Name of the Cluster object, the shoot's technical namespace
    pub name: String,
    pub shoot: Shoot,
    pub seed: Seed,
}

impl ShootCluster {
    pub fn pods_cidr(&self) -> Option<&str> {
        self.networking().and_then(|n| n.pods.as_deref())
    }

    pub fn nodes_cidr(&self) -> Option<&str> {
        self.networking().and_then(|n| n.nodes.as_deref())
    }

    fn networking(&self) -> Option<&Networking> {
        self.shoot.spec.networking.as_ref()
    }
}

impl Cluster {
    /// Decode the embedded shoot and seed manifests
    pub fn decode(&self) -> Result<ShootCluster> {
        let shoot = decode_embedded::<Shoot>(&self.spec.shoot, "shoot")?;
        let seed = decode_embedded::<Seed>(&self.spec.seed, "seed")?;
        Ok(ShootCluster {
            name: kube::ResourceExt::name_any(self),
            shoot,
            seed,
        })
    }
}

fn decode_embedded<T>(raw: &serde_json::Value, what: &str) -> Result<T>
where
    T: Default + serde::de::DeserializeOwned,
{
    if raw.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(raw.clone())
        .map_err(|e| Error::ConfigError(format!("could not decode {what} of cluster: {e}")))
}
