//! Provider specific API types of `gcp.provider.extensions.gardener.cloud/v1alpha1`
//!
//! These travel inside the opaque `providerConfig`, `providerStatus` and
//! `state` fields of the Infrastructure resource.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::infrastructure::Infrastructure;
use crate::error::{Error, Result};

pub const PROVIDER_API_VERSION: &str = "gcp.provider.extensions.gardener.cloud/v1alpha1";
pub const KIND_INFRASTRUCTURE_CONFIG: &str = "InfrastructureConfig";
pub const KIND_INFRASTRUCTURE_STATUS: &str = "InfrastructureStatus";
pub const KIND_INFRASTRUCTURE_STATE: &str = "InfrastructureState";

pub const DEFAULT_MIN_PORTS_PER_VM: i32 = 2048;
pub const DEFAULT_MAX_PORTS_PER_VM: i32 = 65536;
pub const DEFAULT_ICMP_IDLE_TIMEOUT_SEC: i32 = 30;
pub const DEFAULT_TCP_ESTABLISHED_IDLE_TIMEOUT_SEC: i32 = 1200;
pub const DEFAULT_TCP_TRANSITORY_IDLE_TIMEOUT_SEC: i32 = 30;
pub const DEFAULT_UDP_IDLE_TIMEOUT_SEC: i32 = 30;

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InfrastructureConfig {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    pub networks: NetworkConfig,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    /// Existing VPC to use. Absent means a VPC and cloud router are created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpc: Option<Vpc>,

    #[serde(default, rename = "cloudNAT", skip_serializing_if = "Option::is_none")]
    pub cloud_nat: Option<CloudNat>,

    /// Deprecated single-worker CIDR, superseded by `workers`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_logs: Option<FlowLogs>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Vpc {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_router: Option<CloudRouter>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct CloudRouter {
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudNat {
    #[serde(default, rename = "minPortsPerVM", skip_serializing_if = "Option::is_none")]
    pub min_ports_per_vm: Option<i32>,
    #[serde(default, rename = "maxPortsPerVM", skip_serializing_if = "Option::is_none")]
    pub max_ports_per_vm: Option<i32>,
    #[serde(default)]
    pub enable_dynamic_port_allocation: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_endpoint_independent_mapping: Option<bool>,
    #[serde(default, rename = "natIPNames", skip_serializing_if = "Vec::is_empty")]
    pub nat_ip_names: Vec<NatIpName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icmp_idle_timeout_sec: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_established_idle_timeout_sec: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_transitory_idle_timeout_sec: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udp_idle_timeout_sec: Option<i32>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct NatIpName {
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowLogs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregation_interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_sampling: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
}

impl InfrastructureConfig {
    /// Decode the provider config of `infra`.
    ///
    /// Fails when no provider config is set or it is not an
    /// `InfrastructureConfig` of this provider.
    pub fn from_infrastructure(infra: &Infrastructure) -> Result<Self> {
        let raw = infra.spec.provider_config.as_ref().ok_or_else(|| {
            Error::ConfigError("provider config is not set on the infrastructure resource".into())
        })?;
        let config: InfrastructureConfig = serde_json::from_value(raw.clone())
            .map_err(|e| Error::ConfigError(format!("could not decode provider config: {e}")))?;
        if config.api_version != PROVIDER_API_VERSION || config.kind != KIND_INFRASTRUCTURE_CONFIG
        {
            return Err(Error::ConfigError(format!(
                "unexpected provider config type {}/{}",
                config.api_version, config.kind
            )));
        }
        Ok(config)
    }

    /// Worker CIDR, honouring the deprecated `worker` field
    pub fn workers_cidr(&self) -> Option<&str> {
        self.networks
            .workers
            .as_deref()
            .or(self.networks.worker.as_deref())
    }

    pub fn nat_ip_names(&self) -> Vec<&str> {
        self.networks
            .cloud_nat
            .as_ref()
            .map(|nat| nat.nat_ip_names.iter().map(|n| n.name.as_str()).collect())
            .unwrap_or_default()
    }

    /// Whether a cloud router is created alongside the shoot's network
    pub fn creates_cloud_router(&self) -> bool {
        self.networks.vpc.is_none()
    }

    /// Whether the shoot gets a cloud NAT: not when an existing VPC without router is used
    pub fn has_cloud_nat(&self) -> bool {
        match &self.networks.vpc {
            None => true,
            Some(vpc) => vpc.cloud_router.is_some(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InfrastructureStatus {
    pub api_version: String,
    pub kind: String,
    pub networks: NetworkStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_account_email: String,
}

impl Default for InfrastructureStatus {
    fn default() -> Self {
        Self {
            api_version: PROVIDER_API_VERSION.to_string(),
            kind: KIND_INFRASTRUCTURE_STATUS.to_string(),
            networks: NetworkStatus::default(),
            service_account_email: String::new(),
        }
    }
}

impl InfrastructureStatus {
    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn subnet(&self, purpose: SubnetPurpose) -> Option<&Subnet> {
        self.networks.subnets.iter().find(|s| s.purpose == purpose)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    pub vpc: Vpc,
    #[serde(default)]
    pub subnets: Vec<Subnet>,
    #[serde(default, rename = "natIPs", skip_serializing_if = "Vec::is_empty")]
    pub nat_ips: Vec<NatIp>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Subnet {
    pub name: String,
    pub purpose: SubnetPurpose,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubnetPurpose {
    Nodes,
    Internal,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct NatIp {
    pub ip: String,
}

/// Flow bookkeeping persisted in `status.state`
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InfrastructureState {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl Default for InfrastructureState {
    fn default() -> Self {
        Self {
            api_version: PROVIDER_API_VERSION.to_string(),
            kind: KIND_INFRASTRUCTURE_STATE.to_string(),
            data: BTreeMap::new(),
        }
    }
}
