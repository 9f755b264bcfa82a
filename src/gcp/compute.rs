//! Compute Engine resources and the capability the controller needs from them
//!
//! The structs double as REST payloads, so field names follow the
//! `compute/v1` JSON representation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Firewall {
    pub name: String,
    #[serde(default)]
    pub network: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_ranges: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed: Vec<FirewallAllowed>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct FirewallAllowed {
    #[serde(rename = "IPProtocol")]
    pub ip_protocol: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub name: String,
    #[serde(default)]
    pub network: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dest_range: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Address {
    pub name: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub address_type: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub self_link: String,
    /// Self links of the resources using the address
    #[serde(default)]
    pub users: Vec<String>,
}

impl Address {
    pub fn is_external(&self) -> bool {
        self.address_type.as_deref().unwrap_or("EXTERNAL") == "EXTERNAL"
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Network {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub self_link: String,
    #[serde(default)]
    pub auto_create_subnetworks: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Subnetwork {
    pub name: String,
    pub network: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub region: String,
    pub ip_cidr_range: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub self_link: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_config: Option<SubnetworkLogConfig>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubnetworkLogConfig {
    pub enable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregation_interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_sampling: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Router {
    pub name: String,
    #[serde(default)]
    pub network: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub region: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub self_link: String,
    #[serde(default)]
    pub nats: Vec<RouterNat>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterNat {
    pub name: String,
    pub nat_ip_allocate_option: String,
    pub source_subnetwork_ip_ranges_to_nat: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nat_ips: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subnetworks: Vec<RouterNatSubnetwork>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_ports_per_vm: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_ports_per_vm: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_dynamic_port_allocation: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_endpoint_independent_mapping: Option<bool>,
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
#[serde(rename_all = "camelCase")]
pub struct RouterNatSubnetwork {
    pub name: String,
    pub source_ip_ranges_to_nat: Vec<String>,
}

/// Compute Engine operations used by both reconcile engines.
///
/// Getters return `None` for absent resources and deletes of absent
/// resources succeed.
#[async_trait]
pub trait ComputeClient: Send + Sync {
    async fn list_firewall_rules(&self, filter: Option<&str>) -> Result<Vec<Firewall>>;
    async fn get_firewall_rule(&self, name: &str) -> Result<Option<Firewall>>;
    async fn insert_firewall_rule(&self, firewall: &Firewall) -> Result<()>;
    async fn patch_firewall_rule(&self, firewall: &Firewall) -> Result<()>;
    async fn delete_firewall_rule(&self, name: &str) -> Result<()>;

    async fn list_routes(&self, filter: Option<&str>) -> Result<Vec<Route>>;
    async fn delete_route(&self, name: &str) -> Result<()>;

    /// External addresses of `region`, restricted to `names` unless empty
    async fn get_external_addresses(&self, region: &str, names: &[&str]) -> Result<Vec<Address>>;

    async fn get_network(&self, name: &str) -> Result<Option<Network>>;
    async fn insert_network(&self, network: &Network) -> Result<()>;
    async fn delete_network(&self, name: &str) -> Result<()>;

    async fn get_subnetwork(&self, region: &str, name: &str) -> Result<Option<Subnetwork>>;
    async fn insert_subnetwork(&self, region: &str, subnetwork: &Subnetwork) -> Result<()>;
    async fn patch_subnetwork(&self, region: &str, subnetwork: &Subnetwork) -> Result<()>;
    async fn delete_subnetwork(&self, region: &str, name: &str) -> Result<()>;

    async fn get_router(&self, region: &str, name: &str) -> Result<Option<Router>>;
    async fn insert_router(&self, region: &str, router: &Router) -> Result<()>;
    async fn patch_router(&self, region: &str, router: &Router) -> Result<()>;
    async fn delete_router(&self, region: &str, name: &str) -> Result<()>;
}

/// Self link style reference to a global network
pub fn network_link(project: &str, name: &str) -> String {
    format!("projects/{project}/global/networks/{name}")
}

pub fn subnetwork_link(project: &str, region: &str, name: &str) -> String {
    format!("projects/{project}/regions/{region}/subnetworks/{name}")
}

/// Last path segment of a self link
pub fn short_name(link: &str) -> &str {
    link.rsplit('/').next().unwrap_or(link)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_name() {
        assert_eq!(
            short_name("https://www.googleapis.com/compute/v1/projects/p/global/networks/vpc-a"),
            "vpc-a"
        );
        assert_eq!(short_name("vpc-a"), "vpc-a");
    }

    #[test]
    fn test_firewall_payload_shape() {
        let fw = Firewall {
            name: "shoot--dev--a-allow-health-checks".to_string(),
            network: network_link("p", "vpc"),
            allowed: vec![FirewallAllowed {
                ip_protocol: "tcp".to_string(),
                ports: vec!["30000-32767".to_string()],
            }],
            ..Default::default()
        };
        let json = serde_json::to_value(&fw).unwrap();
        assert_eq!(json["allowed"][0]["IPProtocol"], "tcp");
        assert_eq!(json["network"], "projects/p/global/networks/vpc");
        assert!(json.get("targetTags").is_none());
    }
}
