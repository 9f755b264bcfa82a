//! Native reconciliation against the Compute Engine and IAM APIs
//!
//! Every step reads the current resource and only writes on drift, so a
//! repeated reconcile of an unchanged shoot performs no mutating call.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use super::{FlowOpts, Orchestrator};
use crate::controller::cloud::{cleanup_kubernetes_firewalls, cleanup_kubernetes_routes, vpc_name};
use crate::controller::state::{
    FlowState, MARKER_CREATED_RESOURCES_EXIST, MARKER_CREATED_SERVICE_ACCOUNT,
};
use crate::controller::terraform::HEALTH_CHECK_RANGES;
use crate::crd::provider::{
    CloudRouter, InfrastructureConfig, InfrastructureStatus, NatIp, Subnet, SubnetPurpose,
    DEFAULT_ICMP_IDLE_TIMEOUT_SEC, DEFAULT_MAX_PORTS_PER_VM, DEFAULT_MIN_PORTS_PER_VM,
    DEFAULT_TCP_ESTABLISHED_IDLE_TIMEOUT_SEC, DEFAULT_TCP_TRANSITORY_IDLE_TIMEOUT_SEC,
    DEFAULT_UDP_IDLE_TIMEOUT_SEC,
};
use crate::crd::Infrastructure;
use crate::error::{Error, Result};
use crate::gcp::compute::{
    network_link, short_name, subnetwork_link, Firewall, FirewallAllowed, Network, Router,
    RouterNat, RouterNatSubnetwork, Subnetwork, SubnetworkLogConfig,
};
use crate::gcp::iam::service_account_email;
use crate::gcp::{ComputeClient, IamClient};

const DIRECTION_INGRESS: &str = "INGRESS";
const NAT_AUTO_ONLY: &str = "AUTO_ONLY";
const NAT_MANUAL_ONLY: &str = "MANUAL_ONLY";
const NAT_LIST_OF_SUBNETWORKS: &str = "LIST_OF_SUBNETWORKS";
const NAT_ALL_IP_RANGES: &str = "ALL_IP_RANGES";
const NODE_PORT_RANGE: &str = "30000-32767";
const ALL_PORTS: &str = "1-65535";

// Values the API reports for unspecified flow log settings
const DEFAULT_FLOW_LOG_AGGREGATION_INTERVAL: &str = "INTERVAL_5_SEC";
const DEFAULT_FLOW_LOG_SAMPLING: f32 = 0.5;
const DEFAULT_FLOW_LOG_METADATA: &str = "INCLUDE_ALL_METADATA";

/// Names of the cloud resources managed for one shoot
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceNames {
    pub namespace: String,
    pub vpc: String,
    pub nodes_subnet: String,
    pub internal_subnet: String,
    pub router: String,
    pub nat: String,
    pub internal_firewall: String,
    pub health_check_firewall: String,
}

impl ResourceNames {
    pub fn new(infra: &Infrastructure, config: &InfrastructureConfig) -> Self {
        let ns = infra.technical_id();
        let router = config
            .networks
            .vpc
            .as_ref()
            .and_then(|v| v.cloud_router.as_ref())
            .map(|r| r.name.clone())
            .unwrap_or_else(|| format!("{ns}-cloud-router"));
        Self {
            vpc: vpc_name(infra, config),
            nodes_subnet: format!("{ns}-nodes"),
            internal_subnet: format!("{ns}-internal"),
            router,
            nat: format!("{ns}-cloud-nat"),
            internal_firewall: format!("{ns}-allow-internal-access"),
            health_check_firewall: format!("{ns}-allow-health-checks"),
            namespace: ns,
        }
    }
}

pub struct GcpFlow {
    compute: Arc<dyn ComputeClient>,
    iam: Arc<dyn IamClient>,
}

impl GcpFlow {
    pub fn new(compute: Arc<dyn ComputeClient>, iam: Arc<dyn IamClient>) -> Self {
        Self { compute, iam }
    }

    async fn persist(opts: &FlowOpts<'_>, state: &FlowState) -> Result<()> {
        match opts.persister {
            Some(persister) => persister.persist_state(state).await,
            None => Ok(()),
        }
    }

    async fn ensure_service_account(
        &self,
        opts: &FlowOpts<'_>,
        names: &ResourceNames,
        state: &mut FlowState,
    ) -> Result<String> {
        let email = service_account_email(&names.namespace, opts.credentials.project_id());
        if self.iam.get_service_account(&email).await?.is_none() {
            info!("Creating service account {}", email);
            self.iam
                .create_service_account(&names.namespace, &names.namespace)
                .await?;
        }
        if !state.created_service_account() {
            state.mark(MARKER_CREATED_SERVICE_ACCOUNT);
            Self::persist(opts, state).await?;
        }
        Ok(email)
    }

    async fn ensure_network(
        &self,
        config: &InfrastructureConfig,
        names: &ResourceNames,
    ) -> Result<()> {
        if self.compute.get_network(&names.vpc).await?.is_some() {
            return Ok(());
        }
        if config.networks.vpc.is_some() {
            return Err(Error::ConfigError(format!(
                "configured VPC {} does not exist",
                names.vpc
            )));
        }
        info!("Creating VPC {}", names.vpc);
        self.compute
            .insert_network(&Network {
                name: names.vpc.clone(),
                auto_create_subnetworks: false,
                ..Default::default()
            })
            .await
    }

    async fn ensure_subnetwork(&self, region: &str, desired: Subnetwork) -> Result<()> {
        let Some(current) = self.compute.get_subnetwork(region, &desired.name).await? else {
            info!("Creating subnetwork {}", desired.name);
            return self.compute.insert_subnetwork(region, &desired).await;
        };
        if current.ip_cidr_range != desired.ip_cidr_range {
            return Err(Error::ValidationError(format!(
                "subnetwork {} has CIDR {}, changing it to {} is not supported",
                desired.name, current.ip_cidr_range, desired.ip_cidr_range
            )));
        }
        if !log_config_matches(current.log_config.as_ref(), desired.log_config.as_ref()) {
            info!("Updating flow logs of subnetwork {}", desired.name);
            return self.compute.patch_subnetwork(region, &desired).await;
        }
        debug!("Subnetwork {} is up to date", desired.name);
        Ok(())
    }

    async fn ensure_router(
        &self,
        config: &InfrastructureConfig,
        names: &ResourceNames,
        region: &str,
        network: &str,
    ) -> Result<()> {
        if self.compute.get_router(region, &names.router).await?.is_some() {
            return Ok(());
        }
        if !config.creates_cloud_router() {
            return Err(Error::ConfigError(format!(
                "configured cloud router {} does not exist in region {region}",
                names.router
            )));
        }
        info!("Creating cloud router {}", names.router);
        self.compute
            .insert_router(
                region,
                &Router {
                    name: names.router.clone(),
                    network: network.to_string(),
                    region: region.to_string(),
                    ..Default::default()
                },
            )
            .await
    }

    /// Ensure the cloud NAT on the router, returning the manual NAT IPs
    async fn ensure_nat(
        &self,
        config: &InfrastructureConfig,
        names: &ResourceNames,
        region: &str,
        project: &str,
    ) -> Result<Vec<NatIp>> {
        let ip_names = config.nat_ip_names();
        let mut nat_ip_links = Vec::new();
        let mut nat_ips = Vec::new();
        if !ip_names.is_empty() {
            let addresses = self
                .compute
                .get_external_addresses(region, &ip_names)
                .await?;
            for name in &ip_names {
                let address = addresses.iter().find(|a| a.name == *name).ok_or_else(|| {
                    Error::ConfigError(format!(
                        "NAT IP address {name} does not exist in region {region}"
                    ))
                })?;
                nat_ip_links.push(address.self_link.clone());
                nat_ips.push(NatIp {
                    ip: address.address.clone(),
                });
            }
        }

        let desired = desired_nat(config, names, region, project, nat_ip_links);
        let mut router = self
            .compute
            .get_router(region, &names.router)
            .await?
            .ok_or_else(|| {
                Error::ConfigError(format!("cloud router {} does not exist", names.router))
            })?;
        match router.nats.iter().position(|n| n.name == desired.name) {
            Some(i) if nat_matches(&router.nats[i], &desired) => {
                debug!("Cloud NAT {} is up to date", desired.name);
                return Ok(nat_ips);
            }
            Some(i) => {
                info!("Updating cloud NAT {}", desired.name);
                router.nats[i] = desired;
            }
            None => {
                info!("Creating cloud NAT {}", desired.name);
                router.nats.push(desired);
            }
        }
        self.compute.patch_router(region, &router).await?;
        Ok(nat_ips)
    }

    async fn ensure_firewall(&self, desired: Firewall) -> Result<()> {
        match self.compute.get_firewall_rule(&desired.name).await? {
            None => {
                info!("Creating firewall rule {}", desired.name);
                self.compute.insert_firewall_rule(&desired).await
            }
            Some(current) if firewall_matches(&current, &desired) => Ok(()),
            Some(_) => {
                info!("Updating firewall rule {}", desired.name);
                self.compute.patch_firewall_rule(&desired).await
            }
        }
    }

    async fn remove_nat(&self, region: &str, names: &ResourceNames) -> Result<()> {
        let Some(mut router) = self.compute.get_router(region, &names.router).await? else {
            return Ok(());
        };
        let before = router.nats.len();
        router.nats.retain(|n| n.name != names.nat);
        if router.nats.len() != before {
            info!("Removing cloud NAT {} from router {}", names.nat, names.router);
            self.compute.patch_router(region, &router).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Orchestrator for GcpFlow {
    #[instrument(skip_all, fields(namespace = opts.infra.technical_id()))]
    async fn reconcile(
        &self,
        opts: &FlowOpts<'_>,
        state: &mut FlowState,
    ) -> Result<InfrastructureStatus> {
        let config = opts.config;
        let names = ResourceNames::new(opts.infra, config);
        let region = opts.infra.spec.region.as_str();
        let project = opts.credentials.project_id();
        let network = network_link(project, &names.vpc);

        if !state.created_resources_exist() {
            state.mark(MARKER_CREATED_RESOURCES_EXIST);
            Self::persist(opts, state).await?;
        }

        let mut status = InfrastructureStatus::default();
        if opts.create_service_account {
            status.service_account_email =
                self.ensure_service_account(opts, &names, state).await?;
        }

        self.ensure_network(config, &names).await?;
        status.networks.vpc.name = names.vpc.clone();

        let workers = config
            .workers_cidr()
            .or_else(|| opts.cluster.nodes_cidr())
            .ok_or_else(|| {
                Error::ConfigError("no workers CIDR configured for the shoot network".into())
            })?
            .to_string();
        self.ensure_subnetwork(
            region,
            Subnetwork {
                name: names.nodes_subnet.clone(),
                network: network.clone(),
                region: region.to_string(),
                ip_cidr_range: workers.clone(),
                self_link: String::new(),
                log_config: Some(flow_log_config(config)),
            },
        )
        .await?;
        status.networks.subnets.push(Subnet {
            name: names.nodes_subnet.clone(),
            purpose: SubnetPurpose::Nodes,
        });

        match &config.networks.internal {
            Some(cidr) => {
                self.ensure_subnetwork(
                    region,
                    Subnetwork {
                        name: names.internal_subnet.clone(),
                        network: network.clone(),
                        region: region.to_string(),
                        ip_cidr_range: cidr.clone(),
                        self_link: String::new(),
                        log_config: None,
                    },
                )
                .await?;
                status.networks.subnets.push(Subnet {
                    name: names.internal_subnet.clone(),
                    purpose: SubnetPurpose::Internal,
                });
            }
            None => {
                if self
                    .compute
                    .get_subnetwork(region, &names.internal_subnet)
                    .await?
                    .is_some()
                {
                    info!("Deleting unconfigured subnetwork {}", names.internal_subnet);
                    self.compute
                        .delete_subnetwork(region, &names.internal_subnet)
                        .await?;
                }
            }
        }

        if config.has_cloud_nat() {
            self.ensure_router(config, &names, region, &network).await?;
            status.networks.nat_ips = self.ensure_nat(config, &names, region, project).await?;
            status.networks.vpc.cloud_router = Some(CloudRouter {
                name: names.router.clone(),
            });
        }

        let mut internal_ranges = vec![workers];
        internal_ranges.extend(opts.cluster.pods_cidr().map(str::to_string));
        internal_ranges.extend(config.networks.internal.clone());
        for firewall in managed_firewalls(&names, &network, internal_ranges) {
            self.ensure_firewall(firewall).await?;
        }

        Ok(status)
    }

    #[instrument(skip_all, fields(namespace = opts.infra.technical_id()))]
    async fn delete(&self, opts: &FlowOpts<'_>, state: &mut FlowState) -> Result<()> {
        if !state.created_resources_exist() {
            info!("No cloud resources were created, skipping delete");
            return Ok(());
        }
        let config = opts.config;
        let names = ResourceNames::new(opts.infra, config);
        let region = opts.infra.spec.region.as_str();

        cleanup_kubernetes_firewalls(self.compute.as_ref(), &names.vpc, &names.namespace).await?;
        cleanup_kubernetes_routes(self.compute.as_ref(), &names.vpc, &names.namespace).await?;

        for firewall in [&names.internal_firewall, &names.health_check_firewall] {
            self.compute.delete_firewall_rule(firewall).await?;
        }

        if config.has_cloud_nat() {
            self.remove_nat(region, &names).await?;
        }
        if config.creates_cloud_router() {
            self.compute.delete_router(region, &names.router).await?;
        }

        self.compute
            .delete_subnetwork(region, &names.internal_subnet)
            .await?;
        self.compute
            .delete_subnetwork(region, &names.nodes_subnet)
            .await?;

        if config.networks.vpc.is_none() {
            self.compute.delete_network(&names.vpc).await?;
        }

        if state.created_service_account() {
            let email = service_account_email(&names.namespace, opts.credentials.project_id());
            self.iam.delete_service_account(&email).await?;
            state.remove(MARKER_CREATED_SERVICE_ACCOUNT);
            Self::persist(opts, state).await?;
        }

        state.remove(MARKER_CREATED_RESOURCES_EXIST);
        Ok(())
    }
}

fn flow_log_config(config: &InfrastructureConfig) -> SubnetworkLogConfig {
    match &config.networks.flow_logs {
        Some(logs) => SubnetworkLogConfig {
            enable: true,
            aggregation_interval: Some(
                logs.aggregation_interval
                    .clone()
                    .unwrap_or_else(|| DEFAULT_FLOW_LOG_AGGREGATION_INTERVAL.to_string()),
            ),
            flow_sampling: Some(logs.flow_sampling.unwrap_or(DEFAULT_FLOW_LOG_SAMPLING)),
            metadata: Some(
                logs.metadata
                    .clone()
                    .unwrap_or_else(|| DEFAULT_FLOW_LOG_METADATA.to_string()),
            ),
        },
        None => SubnetworkLogConfig {
            enable: false,
            ..Default::default()
        },
    }
}

/// No log config and a disabled one are the same
fn log_config_matches(
    current: Option<&SubnetworkLogConfig>,
    desired: Option<&SubnetworkLogConfig>,
) -> bool {
    let enabled = |c: Option<&SubnetworkLogConfig>| c.map(|c| c.enable).unwrap_or(false);
    match (enabled(current), enabled(desired)) {
        (false, false) => true,
        (true, true) => current == desired,
        _ => false,
    }
}

fn desired_nat(
    config: &InfrastructureConfig,
    names: &ResourceNames,
    region: &str,
    project: &str,
    nat_ip_links: Vec<String>,
) -> RouterNat {
    let nat = config.networks.cloud_nat.clone().unwrap_or_default();
    let dynamic = nat.enable_dynamic_port_allocation;
    RouterNat {
        name: names.nat.clone(),
        nat_ip_allocate_option: if nat_ip_links.is_empty() {
            NAT_AUTO_ONLY.to_string()
        } else {
            NAT_MANUAL_ONLY.to_string()
        },
        source_subnetwork_ip_ranges_to_nat: NAT_LIST_OF_SUBNETWORKS.to_string(),
        nat_ips: nat_ip_links,
        subnetworks: vec![RouterNatSubnetwork {
            name: subnetwork_link(project, region, &names.nodes_subnet),
            source_ip_ranges_to_nat: vec![NAT_ALL_IP_RANGES.to_string()],
        }],
        min_ports_per_vm: Some(nat.min_ports_per_vm.unwrap_or(DEFAULT_MIN_PORTS_PER_VM)),
        max_ports_per_vm: dynamic
            .then(|| nat.max_ports_per_vm.unwrap_or(DEFAULT_MAX_PORTS_PER_VM)),
        enable_dynamic_port_allocation: Some(dynamic),
        enable_endpoint_independent_mapping: Some(
            nat.enable_endpoint_independent_mapping.unwrap_or(false),
        ),
        icmp_idle_timeout_sec: Some(
            nat.icmp_idle_timeout_sec
                .unwrap_or(DEFAULT_ICMP_IDLE_TIMEOUT_SEC),
        ),
        tcp_established_idle_timeout_sec: Some(
            nat.tcp_established_idle_timeout_sec
                .unwrap_or(DEFAULT_TCP_ESTABLISHED_IDLE_TIMEOUT_SEC),
        ),
        tcp_transitory_idle_timeout_sec: Some(
            nat.tcp_transitory_idle_timeout_sec
                .unwrap_or(DEFAULT_TCP_TRANSITORY_IDLE_TIMEOUT_SEC),
        ),
        udp_idle_timeout_sec: Some(
            nat.udp_idle_timeout_sec
                .unwrap_or(DEFAULT_UDP_IDLE_TIMEOUT_SEC),
        ),
    }
}

/// Compares NATs ignoring whether references are full URLs or short links
fn nat_matches(current: &RouterNat, desired: &RouterNat) -> bool {
    let normalize = |nat: &RouterNat| {
        let mut nat = nat.clone();
        for subnetwork in &mut nat.subnetworks {
            subnetwork.name = short_name(&subnetwork.name).to_string();
        }
        nat.nat_ips = nat.nat_ips.iter().map(|l| short_name(l).to_string()).collect();
        nat
    };
    normalize(current) == normalize(desired)
}

fn firewall_matches(current: &Firewall, desired: &Firewall) -> bool {
    let mut current_ranges = current.source_ranges.clone();
    let mut desired_ranges = desired.source_ranges.clone();
    current_ranges.sort();
    desired_ranges.sort();
    current_ranges == desired_ranges && current.allowed == desired.allowed
}

fn allow(protocol: &str, ports: &[&str]) -> FirewallAllowed {
    FirewallAllowed {
        ip_protocol: protocol.to_string(),
        ports: ports.iter().map(|p| p.to_string()).collect(),
    }
}

fn managed_firewalls(
    names: &ResourceNames,
    network: &str,
    internal_ranges: Vec<String>,
) -> [Firewall; 2] {
    [
        Firewall {
            name: names.internal_firewall.clone(),
            network: network.to_string(),
            direction: Some(DIRECTION_INGRESS.to_string()),
            source_ranges: internal_ranges,
            allowed: vec![
                allow("icmp", &[]),
                allow("ipip", &[]),
                allow("tcp", &[ALL_PORTS]),
                allow("udp", &[ALL_PORTS]),
            ],
            ..Default::default()
        },
        Firewall {
            name: names.health_check_firewall.clone(),
            network: network.to_string(),
            direction: Some(DIRECTION_INGRESS.to_string()),
            source_ranges: HEALTH_CHECK_RANGES.iter().map(|r| r.to_string()).collect(),
            allowed: vec![allow("tcp", &[NODE_PORT_RANGE]), allow("udp", &[NODE_PORT_RANGE])],
            ..Default::default()
        },
    ]
}
