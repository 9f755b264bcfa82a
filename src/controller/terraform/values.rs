//! Terraform template values and rendering

use serde::Serialize;
use tera::{Context, Tera};

use super::executor::{TerraformFiles, WORKLOAD_IDENTITY_MOUNT_PATH};
use crate::crd::provider::{
    InfrastructureConfig, DEFAULT_ICMP_IDLE_TIMEOUT_SEC, DEFAULT_MAX_PORTS_PER_VM,
    DEFAULT_MIN_PORTS_PER_VM, DEFAULT_TCP_ESTABLISHED_IDLE_TIMEOUT_SEC,
    DEFAULT_TCP_TRANSITORY_IDLE_TIMEOUT_SEC, DEFAULT_UDP_IDLE_TIMEOUT_SEC,
};
use crate::crd::{Infrastructure, ShootCluster};
use crate::error::{Error, Result};
use crate::gcp::credentials::{Credentials, CREDENTIALS_CONFIG_KEY};

pub const TF_OUTPUT_VPC_NAME: &str = "vpc_name";
pub const TF_OUTPUT_SUBNET_NODES: &str = "subnet_nodes";
pub const TF_OUTPUT_SUBNET_INTERNAL: &str = "subnet_internal";
pub const TF_OUTPUT_SERVICE_ACCOUNT_EMAIL: &str = "service_account_email";
pub const TF_OUTPUT_CLOUD_ROUTER: &str = "cloud_router";
pub const TF_OUTPUT_CLOUD_NAT: &str = "cloud_nat";
pub const TF_OUTPUT_NAT_IPS: &str = "nat_ips";

/// Source ranges of Google Cloud load balancer health checks
pub const HEALTH_CHECK_RANGES: [&str; 4] = [
    "35.191.0.0/16",
    "209.85.204.0/22",
    "209.85.152.0/22",
    "130.211.0.0/22",
];

const MAIN_TF_TEMPLATE: &str = include_str!("../../../templates/main.tf");
const VARIABLES_TF_TEMPLATE: &str = include_str!("../../../templates/variables.tf");
const TFVARS_TEMPLATE: &str = include_str!("../../../templates/terraform.tfvars");

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GoogleValues {
    pub project: String,
    pub region: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CreateValues {
    pub vpc: bool,
    pub cloud_router: bool,
    pub service_account: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VpcValues {
    /// Terraform expression evaluating to the VPC name
    pub reference: String,
    /// Terraform expression evaluating to the cloud router name
    pub router_reference: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CloudNatValues {
    pub nat_ip_names: Vec<String>,
    pub min_ports_per_vm: i32,
    pub max_ports_per_vm: i32,
    pub enable_dynamic_port_allocation: bool,
    pub enable_endpoint_independent_mapping: bool,
    pub icmp_idle_timeout_sec: i32,
    pub tcp_established_idle_timeout_sec: i32,
    pub tcp_transitory_idle_timeout_sec: i32,
    pub udp_idle_timeout_sec: i32,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FlowLogValues {
    pub aggregation_interval: Option<String>,
    pub flow_sampling: Option<f32>,
    pub metadata: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NetworkValues {
    pub workers: String,
    pub internal: Option<String>,
    /// Source ranges allowed by the internal access firewall rule
    pub internal_ranges: Vec<String>,
    pub cloud_nat: Option<CloudNatValues>,
    pub flow_logs: Option<FlowLogValues>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CredentialValues {
    pub workload_identity: bool,
    pub file: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TerraformValues {
    pub google: GoogleValues,
    pub create: CreateValues,
    pub vpc: VpcValues,
    pub cluster_name: String,
    pub networks: NetworkValues,
    pub credentials: CredentialValues,
    pub health_check_ranges: Vec<String>,
    #[serde(skip)]
    pub output_keys: Vec<&'static str>,
}

impl TerraformValues {
    pub fn compute(
        infra: &Infrastructure,
        config: &InfrastructureConfig,
        cluster: &ShootCluster,
        credentials: &Credentials,
        create_service_account: bool,
    ) -> Result<Self> {
        let cluster_name = infra.technical_id();
        let networks = &config.networks;

        let (create_vpc, vpc_reference) = match &networks.vpc {
            Some(vpc) => (false, quoted(&vpc.name)),
            None => (true, "google_compute_network.network.name".to_string()),
        };
        let create_router = config.creates_cloud_router();
        let router_reference = if create_router {
            Some("google_compute_router.router.name".to_string())
        } else {
            networks
                .vpc
                .as_ref()
                .and_then(|v| v.cloud_router.as_ref())
                .map(|r| quoted(&r.name))
        };

        let workers = config
            .workers_cidr()
            .or_else(|| cluster.nodes_cidr())
            .ok_or_else(|| {
                Error::ConfigError("no workers CIDR configured for the shoot network".into())
            })?
            .to_string();

        let mut internal_ranges = vec![workers.clone()];
        internal_ranges.extend(cluster.pods_cidr().map(str::to_string));
        internal_ranges.extend(networks.internal.clone());

        let cloud_nat = if config.has_cloud_nat() {
            let nat = networks.cloud_nat.clone().unwrap_or_default();
            Some(CloudNatValues {
                nat_ip_names: nat.nat_ip_names.iter().map(|n| n.name.clone()).collect(),
                min_ports_per_vm: nat.min_ports_per_vm.unwrap_or(DEFAULT_MIN_PORTS_PER_VM),
                max_ports_per_vm: nat.max_ports_per_vm.unwrap_or(DEFAULT_MAX_PORTS_PER_VM),
                enable_dynamic_port_allocation: nat.enable_dynamic_port_allocation,
                enable_endpoint_independent_mapping: nat
                    .enable_endpoint_independent_mapping
                    .unwrap_or(false),
                icmp_idle_timeout_sec: nat
                    .icmp_idle_timeout_sec
                    .unwrap_or(DEFAULT_ICMP_IDLE_TIMEOUT_SEC),
                tcp_established_idle_timeout_sec: nat
                    .tcp_established_idle_timeout_sec
                    .unwrap_or(DEFAULT_TCP_ESTABLISHED_IDLE_TIMEOUT_SEC),
                tcp_transitory_idle_timeout_sec: nat
                    .tcp_transitory_idle_timeout_sec
                    .unwrap_or(DEFAULT_TCP_TRANSITORY_IDLE_TIMEOUT_SEC),
                udp_idle_timeout_sec: nat
                    .udp_idle_timeout_sec
                    .unwrap_or(DEFAULT_UDP_IDLE_TIMEOUT_SEC),
            })
        } else {
            None
        };

        let flow_logs = networks.flow_logs.as_ref().map(|f| FlowLogValues {
            aggregation_interval: f.aggregation_interval.clone(),
            flow_sampling: f.flow_sampling,
            metadata: f.metadata.clone(),
        });

        let mut output_keys = vec![TF_OUTPUT_VPC_NAME, TF_OUTPUT_SUBNET_NODES];
        if create_service_account {
            output_keys.push(TF_OUTPUT_SERVICE_ACCOUNT_EMAIL);
        }
        if cloud_nat.is_some() {
            output_keys.push(TF_OUTPUT_CLOUD_ROUTER);
            output_keys.push(TF_OUTPUT_CLOUD_NAT);
        }
        // Manual NAT IPs are only rendered together with a managed NAT
        if cloud_nat
            .as_ref()
            .map(|n| !n.nat_ip_names.is_empty())
            .unwrap_or(false)
        {
            output_keys.push(TF_OUTPUT_NAT_IPS);
        }
        if networks.internal.is_some() {
            output_keys.push(TF_OUTPUT_SUBNET_INTERNAL);
        }

        Ok(Self {
            google: GoogleValues {
                project: credentials.project_id().to_string(),
                region: infra.spec.region.clone(),
            },
            create: CreateValues {
                vpc: create_vpc,
                cloud_router: create_router,
                service_account: create_service_account,
            },
            vpc: VpcValues {
                reference: vpc_reference,
                router_reference,
            },
            cluster_name,
            networks: NetworkValues {
                workers,
                internal: networks.internal.clone(),
                internal_ranges,
                cloud_nat,
                flow_logs,
            },
            credentials: CredentialValues {
                workload_identity: credentials.requires_token_mount(),
                file: format!("{WORKLOAD_IDENTITY_MOUNT_PATH}/{CREDENTIALS_CONFIG_KEY}"),
            },
            health_check_ranges: HEALTH_CHECK_RANGES.iter().map(|r| r.to_string()).collect(),
            output_keys,
        })
    }

    pub fn render(&self) -> Result<TerraformFiles> {
        let context = Context::from_serialize(self)?;
        let mut tera = Tera::default();
        Ok(TerraformFiles {
            main: tera.render_str(MAIN_TF_TEMPLATE, &context)?,
            variables: tera.render_str(VARIABLES_TF_TEMPLATE, &context)?,
            tfvars: tera.render_str(TFVARS_TEMPLATE, &context)?,
        })
    }
}

fn quoted(value: &str) -> String {
    format!("\"{value}\"")
}
