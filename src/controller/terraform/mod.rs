//! Terraform engine
//!
//! Renders the shoot's infrastructure as terraform configuration and lets the
//! terraformer apply or destroy it. Provider status is read back from the
//! terraform outputs.

mod delete;
mod executor;
mod outputs;
mod values;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument};

pub use delete::DeleteGraph;
pub use executor::{
    KubeTerraformerFactory, TerraformFiles, Terraformer, TerraformerFactory, TERRAFORMER_FINALIZER,
};
pub use outputs::status_from_outputs;
pub use values::{TerraformValues, HEALTH_CHECK_RANGES};

use super::cloud::{egress_cidrs, vpc_name};
use super::engine::{Dependencies, InfrastructureReconciler};
use super::state::TerraformRawState;
use super::status::StatusUpdate;
use crate::crd::provider::InfrastructureConfig;
use crate::crd::{Infrastructure, ShootCluster};
use crate::error::Result;
use crate::gcp::Credentials;

const SERVICE_ACCOUNT_RESOURCE_TYPE: &str = "google_service_account";

/// Remove every trace of the terraformer: pods, configuration and finalizers
#[instrument(skip(terraformer))]
pub async fn cleanup_terraformer_resources(terraformer: &dyn Terraformer) -> Result<()> {
    terraformer.ensure_cleaned_up().await?;
    terraformer.cleanup_configuration().await?;
    terraformer.remove_finalizers().await
}

pub struct TerraformReconciler {
    deps: Dependencies,
}

impl TerraformReconciler {
    pub fn new(deps: Dependencies) -> Self {
        Self { deps }
    }

    /// Whether terraform manages a service account for the shoot.
    ///
    /// With creation disabled, an account terraform already tracks is kept.
    fn should_create_service_account(&self, state: &TerraformRawState) -> Result<bool> {
        if !self.deps.gates.disable_gardener_service_account_creation {
            return Ok(true);
        }
        state.tracks_resource_type(SERVICE_ACCOUNT_RESOURCE_TYPE)
    }

    fn render(
        &self,
        infra: &Infrastructure,
        cluster: &ShootCluster,
        credentials: &Credentials,
        current_state: &TerraformRawState,
    ) -> Result<(TerraformValues, TerraformFiles)> {
        let config = InfrastructureConfig::from_infrastructure(infra)?;
        let create_service_account = self.should_create_service_account(current_state)?;
        let values =
            TerraformValues::compute(infra, &config, cluster, credentials, create_service_account)?;
        let files = values.render()?;
        Ok((values, files))
    }

    #[instrument(skip_all, fields(namespace = infra.technical_id(), restore = initial_state.is_some()))]
    async fn apply(
        &self,
        infra: &mut Infrastructure,
        cluster: &ShootCluster,
        initial_state: Option<TerraformRawState>,
    ) -> Result<()> {
        let credentials = self.deps.credentials.credentials(infra).await?;
        let terraformer = self.deps.terraformers.terraformer(infra, &credentials)?;

        let current_state = match &initial_state {
            Some(state) => state.clone(),
            None => terraformer.get_raw_state().await?,
        };
        let (values, files) = self.render(infra, cluster, &credentials, &current_state)?;

        terraformer
            .initialize_with(&files, initial_state.as_ref())
            .await?;
        info!("Applying terraform configuration");
        terraformer.apply().await?;

        let outputs = terraformer.get_state_outputs(&values.output_keys).await?;
        let status = status_from_outputs(&outputs)?;
        let compute = self.deps.clouds.compute(&credentials)?;
        let egress = egress_cidrs(compute.as_ref(), &infra.spec.region, &status).await?;
        let raw_state = terraformer.get_raw_state().await?;

        self.deps
            .status
            .persist(
                infra,
                StatusUpdate::outputs(status.to_value()?, raw_state.to_value()?, egress),
            )
            .await
    }
}

#[async_trait]
impl InfrastructureReconciler for TerraformReconciler {
    async fn reconcile(&self, infra: &mut Infrastructure, cluster: &ShootCluster) -> Result<()> {
        self.apply(infra, cluster, None).await
    }

    async fn restore(&self, infra: &mut Infrastructure, cluster: &ShootCluster) -> Result<()> {
        let initial_state = match infra.state() {
            Some(raw) if !raw.is_null() => Some(TerraformRawState::decode(raw)?),
            _ => None,
        };
        self.apply(infra, cluster, initial_state).await
    }

    #[instrument(skip_all, fields(namespace = infra.technical_id()))]
    async fn delete(&self, infra: &mut Infrastructure, _cluster: &ShootCluster) -> Result<()> {
        let credentials = self.deps.credentials.credentials(infra).await?;
        let terraformer: Arc<dyn Terraformer> =
            self.deps.terraformers.terraformer(infra, &credentials)?;

        if terraformer.is_state_empty().await? {
            info!("Terraform state is empty, cleaning up terraformer configuration");
            return cleanup_terraformer_resources(terraformer.as_ref()).await;
        }

        let config = InfrastructureConfig::from_infrastructure(infra)?;
        let compute = self.deps.clouds.compute(&credentials)?;
        let vpc = vpc_name(infra, &config);
        let namespace = infra.technical_id();
        DeleteGraph::new(terraformer.as_ref(), compute.as_ref(), &vpc, &namespace)
            .run()
            .await
    }
}
