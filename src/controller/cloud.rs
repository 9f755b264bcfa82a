//! Cloud side helpers shared by the terraform and flow engines
//!
//! The Kubernetes cloud provider creates firewall rules (`k8s-*`, tagged with
//! the shoot namespace) and routes (`<namespace>-*`) in the shoot's VPC. They
//! are not tracked by either engine and must be removed before the VPC can go.

use tracing::{debug, info, instrument};

use crate::crd::provider::{InfrastructureConfig, InfrastructureStatus};
use crate::crd::Infrastructure;
use crate::error::Result;
use crate::gcp::compute::{Firewall, Route};
use crate::gcp::ComputeClient;

const KUBERNETES_FIREWALL_PREFIX: &str = "k8s";

/// Name of the shoot VPC: the configured one, else the one created for the shoot
pub fn vpc_name(infra: &Infrastructure, config: &InfrastructureConfig) -> String {
    config
        .networks
        .vpc
        .as_ref()
        .map(|v| v.name.clone())
        .unwrap_or_else(|| infra.technical_id())
}

/// Server side list filter for resources of `vpc`
pub fn network_filter(vpc: &str) -> String {
    format!("network eq \".*/{vpc}$\"")
}

fn in_network(network: &str, vpc: &str) -> bool {
    network.ends_with(&format!("/{vpc}"))
}

pub fn is_kubernetes_firewall(firewall: &Firewall, vpc: &str, namespace: &str) -> bool {
    in_network(&firewall.network, vpc)
        && firewall.name.starts_with(KUBERNETES_FIREWALL_PREFIX)
        && firewall.target_tags.iter().any(|t| t == namespace)
}

pub fn is_kubernetes_route(route: &Route, vpc: &str, namespace: &str) -> bool {
    in_network(&route.network, vpc) && route.name.starts_with(namespace)
}

#[instrument(skip(compute))]
pub async fn cleanup_kubernetes_firewalls(
    compute: &dyn ComputeClient,
    vpc: &str,
    namespace: &str,
) -> Result<()> {
    let rules = compute
        .list_firewall_rules(Some(&network_filter(vpc)))
        .await?;
    for rule in rules
        .iter()
        .filter(|r| is_kubernetes_firewall(r, vpc, namespace))
    {
        info!("Deleting kubernetes firewall rule {}", rule.name);
        compute.delete_firewall_rule(&rule.name).await?;
    }
    Ok(())
}

#[instrument(skip(compute))]
pub async fn cleanup_kubernetes_routes(
    compute: &dyn ComputeClient,
    vpc: &str,
    namespace: &str,
) -> Result<()> {
    let routes = compute.list_routes(Some(&network_filter(vpc))).await?;
    for route in routes
        .iter()
        .filter(|r| is_kubernetes_route(r, vpc, namespace))
    {
        info!("Deleting kubernetes route {}", route.name);
        compute.delete_route(&route.name).await?;
    }
    Ok(())
}

/// Egress CIDRs of the shoot: the NAT IPs as `/32`.
///
/// Without manual NAT IPs the addresses auto allocated for the cloud router
/// are looked up.
pub async fn egress_cidrs(
    compute: &dyn ComputeClient,
    region: &str,
    status: &InfrastructureStatus,
) -> Result<Vec<String>> {
    let mut ips: Vec<String> = status
        .networks
        .nat_ips
        .iter()
        .map(|n| n.ip.clone())
        .collect();

    if ips.is_empty() {
        if let Some(router) = &status.networks.vpc.cloud_router {
            let suffix = format!("/routers/{}", router.name);
            ips = compute
                .get_external_addresses(region, &[])
                .await?
                .into_iter()
                .filter(|a| a.users.iter().any(|u| u.ends_with(&suffix)))
                .map(|a| a.address)
                .collect();
        }
    }

    ips.sort();
    ips.dedup();
    debug!(count = ips.len(), "Computed egress CIDRs");
    Ok(ips.into_iter().map(|ip| format!("{ip}/32")).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::provider::{CloudRouter, NatIp};
    use crate::gcp::compute::Address;
    use crate::gcp::fake::FakeCloud;

    const NS: &str = "shoot--dev--alpha";

    fn firewall(name: &str, network: &str, tags: &[&str]) -> Firewall {
        Firewall {
            name: name.to_string(),
            network: network.to_string(),
            target_tags: tags.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_kubernetes_firewall_filter() {
        let net = "https://www.googleapis.com/compute/v1/projects/p/global/networks/vpc";
        assert!(is_kubernetes_firewall(&firewall("k8s-fw-a", net, &[NS]), "vpc", NS));
        assert!(!is_kubernetes_firewall(&firewall("k8s-fw-a", net, &["other"]), "vpc", NS));
        assert!(!is_kubernetes_firewall(&firewall("managed", net, &[NS]), "vpc", NS));
        assert!(!is_kubernetes_firewall(
            &firewall("k8s-fw-a", "projects/p/global/networks/vpc-2", &[NS]),
            "vpc",
            NS
        ));
    }

    #[test]
    fn test_kubernetes_route_filter() {
        let route = |name: &str, network: &str| Route {
            name: name.to_string(),
            network: network.to_string(),
            ..Default::default()
        };
        assert!(is_kubernetes_route(&route(&format!("{NS}-abc"), "p/networks/vpc"), "vpc", NS));
        assert!(!is_kubernetes_route(&route("default-route-1", "p/networks/vpc"), "vpc", NS));
        assert!(!is_kubernetes_route(&route(&format!("{NS}-abc"), "p/networks/other"), "vpc", NS));
    }

    #[tokio::test]
    async fn test_cleanup_only_touches_matching_resources() {
        let cloud = FakeCloud::new("p");
        {
            let mut state = cloud.lock();
            let net = "projects/p/global/networks/vpc";
            for fw in [
                firewall("k8s-fw-a", net, &[NS]),
                firewall("k8s-fw-b", net, &["shoot--other--x"]),
                firewall(&format!("{NS}-allow-health-checks"), net, &[]),
            ] {
                state.firewalls.insert(fw.name.clone(), fw);
            }
            for name in [format!("{NS}-route-1"), "other-route".to_string()] {
                state.routes.insert(
                    name.clone(),
                    Route {
                        name,
                        network: net.to_string(),
                        ..Default::default()
                    },
                );
            }
        }

        cleanup_kubernetes_firewalls(&cloud, "vpc", NS).await.unwrap();
        cleanup_kubernetes_routes(&cloud, "vpc", NS).await.unwrap();

        let state = cloud.lock();
        assert!(!state.firewalls.contains_key("k8s-fw-a"));
        assert!(state.firewalls.contains_key("k8s-fw-b"));
        assert!(state.firewalls.contains_key(&format!("{NS}-allow-health-checks")));
        assert_eq!(state.routes.keys().collect::<Vec<_>>(), vec!["other-route"]);
    }

    #[tokio::test]
    async fn test_egress_from_manual_nat_ips() {
        let cloud = FakeCloud::new("p");
        let mut status = InfrastructureStatus::default();
        status.networks.nat_ips = vec![
            NatIp { ip: "34.0.0.2".into() },
            NatIp { ip: "34.0.0.1".into() },
        ];
        let cidrs = egress_cidrs(&cloud, "europe-west1", &status).await.unwrap();
        assert_eq!(cidrs, vec!["34.0.0.1/32", "34.0.0.2/32"]);
        assert!(cloud.calls().is_empty());
    }

    #[tokio::test]
    async fn test_egress_from_auto_allocated_addresses() {
        let cloud = FakeCloud::new("p");
        cloud.lock().addresses = vec![
            Address {
                name: "nat-auto-1".into(),
                address: "35.1.1.1".into(),
                users: vec![format!("projects/p/regions/europe-west1/routers/{NS}-cloud-router")],
                ..Default::default()
            },
            Address {
                name: "lb".into(),
                address: "35.9.9.9".into(),
                users: vec!["projects/p/regions/europe-west1/forwardingRules/lb".into()],
                ..Default::default()
            },
        ];
        let mut status = InfrastructureStatus::default();
        status.networks.vpc.cloud_router = Some(CloudRouter {
            name: format!("{NS}-cloud-router"),
        });
        let cidrs = egress_cidrs(&cloud, "europe-west1", &status).await.unwrap();
        assert_eq!(cidrs, vec!["35.1.1.1/32"]);
    }
}
