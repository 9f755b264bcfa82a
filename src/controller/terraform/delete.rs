//! Terraform delete graph
//!
//! ```text
//! cleanup kubernetes firewall rules ─┐
//!                                    ├─> terraform destroy
//! cleanup kubernetes routes ─────────┘
//! ```
//!
//! Both cleanups run concurrently, are retried every 10s for at most 5m and
//! are skipped when no terraform configuration exists. Destroy only runs once
//! both succeeded.

use std::time::Duration;

use tracing::{info, instrument};

use super::executor::Terraformer;
use crate::controller::cloud::{cleanup_kubernetes_firewalls, cleanup_kubernetes_routes};
use crate::controller::retry::{retry_until_timeout, CLEANUP_RETRY_INTERVAL, CLEANUP_RETRY_TIMEOUT};
use crate::error::Result;
use crate::gcp::ComputeClient;

pub struct DeleteGraph<'a> {
    pub terraformer: &'a dyn Terraformer,
    pub compute: &'a dyn ComputeClient,
    pub vpc: &'a str,
    pub namespace: &'a str,
    pub retry_interval: Duration,
    pub retry_timeout: Duration,
}

impl<'a> DeleteGraph<'a> {
    pub fn new(
        terraformer: &'a dyn Terraformer,
        compute: &'a dyn ComputeClient,
        vpc: &'a str,
        namespace: &'a str,
    ) -> Self {
        Self {
            terraformer,
            compute,
            vpc,
            namespace,
            retry_interval: CLEANUP_RETRY_INTERVAL,
            retry_timeout: CLEANUP_RETRY_TIMEOUT,
        }
    }

    #[instrument(skip(self), fields(vpc = self.vpc, namespace = self.namespace))]
    pub async fn run(&self) -> Result<()> {
        let config_exists = self.terraformer.config_exists().await?;

        let firewalls = async {
            if !config_exists {
                return Ok(());
            }
            retry_until_timeout(
                "cleanup kubernetes firewall rules",
                self.retry_interval,
                self.retry_timeout,
                || cleanup_kubernetes_firewalls(self.compute, self.vpc, self.namespace),
            )
            .await
        };
        let routes = async {
            if !config_exists {
                return Ok(());
            }
            retry_until_timeout(
                "cleanup kubernetes routes",
                self.retry_interval,
                self.retry_timeout,
                || cleanup_kubernetes_routes(self.compute, self.vpc, self.namespace),
            )
            .await
        };

        let (firewalls, routes) = tokio::join!(firewalls, routes);
        firewalls?;
        routes?;

        info!("Destroying terraform managed infrastructure");
        self.terraformer.destroy().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::FakeTerraformer;
    use crate::error::Error;
    use crate::gcp::compute::{Firewall, Route};
    use crate::gcp::fake::FakeCloud;

    const NS: &str = "shoot--dev--alpha";

    fn seeded_cloud() -> FakeCloud {
        let cloud = FakeCloud::new("p");
        {
            let mut state = cloud.lock();
            state.firewalls.insert(
                "k8s-fw-lb".into(),
                Firewall {
                    name: "k8s-fw-lb".into(),
                    network: format!("projects/p/global/networks/{NS}"),
                    target_tags: vec![NS.into()],
                    ..Default::default()
                },
            );
            state.routes.insert(
                format!("{NS}-r1"),
                Route {
                    name: format!("{NS}-r1"),
                    network: format!("projects/p/global/networks/{NS}"),
                    ..Default::default()
                },
            );
        }
        cloud
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanups_precede_destroy() {
        let cloud = seeded_cloud();
        let tf = FakeTerraformer::with_resources(&["google_compute_network"]);

        DeleteGraph::new(&tf, &cloud, NS, NS).run().await.unwrap();

        let state = cloud.lock();
        assert!(state.firewalls.is_empty());
        assert!(state.routes.is_empty());
        assert_eq!(tf.commands(), vec!["destroy"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_cleanup_failure_is_retried() {
        let cloud = seeded_cloud();
        cloud.fail("list_routes", 2);
        let tf = FakeTerraformer::with_resources(&["google_compute_network"]);

        DeleteGraph::new(&tf, &cloud, NS, NS).run().await.unwrap();

        let list_calls = cloud
            .calls()
            .iter()
            .filter(|c| c.starts_with("list_routes"))
            .count();
        assert_eq!(list_calls, 3);
        assert_eq!(tf.commands(), vec!["destroy"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_cleanup_failure_skips_destroy() {
        let cloud = seeded_cloud();
        cloud.fail("list_firewall_rules", usize::MAX);
        let tf = FakeTerraformer::with_resources(&["google_compute_network"]);

        let err = DeleteGraph::new(&tf, &cloud, NS, NS).run().await.unwrap_err();

        assert!(matches!(err, Error::Timeout(_)));
        assert!(tf.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_config_skips_cleanups() {
        let cloud = seeded_cloud();
        let tf = FakeTerraformer::with_resources(&["google_compute_network"]);
        tf.set_config_exists(false);

        DeleteGraph::new(&tf, &cloud, NS, NS).run().await.unwrap();

        assert!(cloud.calls().is_empty());
        assert_eq!(tf.commands(), vec!["destroy"]);
    }
}
