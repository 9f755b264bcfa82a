//! Flow engine
//!
//! Reconciles the shoot's infrastructure with direct cloud API calls and keeps
//! its bookkeeping in the flow [`FlowState`] persisted on the resource.
//! Resources that were so far handled by terraform are migrated on first use.

mod gcp;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{error, info, instrument};

pub use gcp::{GcpFlow, ResourceNames};

use super::cloud::egress_cidrs;
use super::engine::{Dependencies, InfrastructureReconciler};
use super::state::{has_flow_state, migrate_from_terraform, FlowState, TerraformRawState};
use super::status::{StatusUpdate, StatusWriter};
use super::terraform::{cleanup_terraformer_resources, Terraformer};
use crate::crd::provider::{InfrastructureConfig, InfrastructureStatus};
use crate::crd::{Infrastructure, ShootCluster};
use crate::error::Result;
use crate::gcp::Credentials;

/// Inputs of one orchestrator run
pub struct FlowOpts<'a> {
    pub infra: &'a Infrastructure,
    pub cluster: &'a ShootCluster,
    pub config: &'a InfrastructureConfig,
    pub credentials: &'a Credentials,
    pub create_service_account: bool,
    /// Receives intermediate state so progress survives a failed run
    pub persister: Option<&'a dyn StatePersister>,
}

#[async_trait]
pub trait StatePersister: Send + Sync {
    async fn persist_state(&self, state: &FlowState) -> Result<()>;
}

#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn reconcile(
        &self,
        opts: &FlowOpts<'_>,
        state: &mut FlowState,
    ) -> Result<InfrastructureStatus>;

    /// Remove everything the state says was created, clearing its markers
    async fn delete(&self, opts: &FlowOpts<'_>, state: &mut FlowState) -> Result<()>;
}

/// Writes flow state of one Infrastructure through a [`StatusWriter`]
pub struct InfrastructureStatePersister {
    writer: Arc<dyn StatusWriter>,
    infra: Mutex<Infrastructure>,
}

impl InfrastructureStatePersister {
    pub fn new(writer: Arc<dyn StatusWriter>, infra: Infrastructure) -> Self {
        Self {
            writer,
            infra: Mutex::new(infra),
        }
    }

    /// The resource with every persisted state applied
    pub fn into_inner(self) -> Infrastructure {
        self.infra.into_inner()
    }
}

#[async_trait]
impl StatePersister for InfrastructureStatePersister {
    async fn persist_state(&self, state: &FlowState) -> Result<()> {
        let mut infra = self.infra.lock().await;
        self.writer
            .persist(&mut infra, StatusUpdate::state(state.encode()?))
            .await
    }
}

pub struct FlowReconciler {
    deps: Dependencies,
}

impl FlowReconciler {
    pub fn new(deps: Dependencies) -> Self {
        Self { deps }
    }

    fn orchestrator(&self, credentials: &Credentials) -> Result<Arc<dyn Orchestrator>> {
        Ok(Arc::new(GcpFlow::new(
            self.deps.clouds.compute(credentials)?,
            self.deps.clouds.iam(credentials)?,
        )))
    }

    fn should_create_service_account(&self, state: &FlowState) -> bool {
        !self.deps.gates.disable_gardener_service_account_creation
            || state.created_service_account()
    }

    /// The persisted flow state, migrating from terraform when there is none.
    ///
    /// Terraformer objects are swept on every run while any of them remains,
    /// so a cleanup that failed right after migration is retried.
    async fn ensure_flow_state(
        &self,
        infra: &mut Infrastructure,
        credentials: &Credentials,
    ) -> Result<FlowState> {
        let terraformer = self.deps.terraformers.terraformer(infra, credentials)?;
        let state = if has_flow_state(infra.state())? {
            FlowState::decode(infra.state().unwrap_or(&serde_json::Value::Null))?
        } else {
            self.migrate(infra, terraformer.as_ref()).await?
        };
        if terraformer.leftovers_exist().await? {
            info!("Removing terraformer resources");
            cleanup_terraformer_resources(terraformer.as_ref()).await?;
        }
        Ok(state)
    }

    /// Derive and persist flow state from what terraform tracked
    async fn migrate(
        &self,
        infra: &mut Infrastructure,
        terraformer: &dyn Terraformer,
    ) -> Result<FlowState> {
        info!("Migrating infrastructure state from terraform");
        let mut raw = terraformer.get_raw_state().await?;
        if raw.is_empty()? {
            if let Some(persisted) = infra.state().filter(|s| !s.is_null()) {
                raw = TerraformRawState::decode(persisted)?;
            }
        }
        let state = migrate_from_terraform(&raw)?;
        self.deps
            .status
            .persist(infra, StatusUpdate::state(state.encode()?))
            .await?;
        Ok(state)
    }

    /// Best effort: keeps partial progress of a failed run
    async fn persist_after_failure(&self, infra: &mut Infrastructure, state: &FlowState) {
        let update = match state.encode() {
            Ok(encoded) => StatusUpdate::state(encoded),
            Err(e) => {
                error!(error = %e, "Failed to encode flow state");
                return;
            }
        };
        if let Err(e) = self.deps.status.persist(infra, update).await {
            error!(error = %e, "Failed to persist flow state after error");
        }
    }

    async fn run(
        &self,
        infra: &mut Infrastructure,
        cluster: &ShootCluster,
        delete: bool,
    ) -> Result<()> {
        let config = InfrastructureConfig::from_infrastructure(infra)?;
        let credentials = self.deps.credentials.credentials(infra).await?;
        let mut state = self.ensure_flow_state(infra, &credentials).await?;
        let orchestrator = self.orchestrator(&credentials)?;

        let snapshot = infra.clone();
        let persister = InfrastructureStatePersister::new(self.deps.status.clone(), infra.clone());
        let result = {
            let opts = FlowOpts {
                infra: &snapshot,
                cluster,
                config: &config,
                credentials: &credentials,
                create_service_account: self.should_create_service_account(&state),
                persister: Some(&persister),
            };
            if delete {
                orchestrator.delete(&opts, &mut state).await.map(|_| None)
            } else {
                orchestrator.reconcile(&opts, &mut state).await.map(Some)
            }
        };
        *infra = persister.into_inner();

        match result {
            Ok(Some(status)) => {
                let compute = self.deps.clouds.compute(&credentials)?;
                let egress = egress_cidrs(compute.as_ref(), &infra.spec.region, &status).await?;
                self.deps
                    .status
                    .persist(
                        infra,
                        StatusUpdate::outputs(status.to_value()?, state.encode()?, egress),
                    )
                    .await
            }
            Ok(None) => {
                self.deps
                    .status
                    .persist(infra, StatusUpdate::state(serde_json::Value::Null))
                    .await
            }
            Err(err) => {
                self.persist_after_failure(infra, &state).await;
                Err(err)
            }
        }
    }
}

#[async_trait]
impl InfrastructureReconciler for FlowReconciler {
    #[instrument(skip_all, fields(namespace = infra.technical_id()))]
    async fn reconcile(&self, infra: &mut Infrastructure, cluster: &ShootCluster) -> Result<()> {
        self.run(infra, cluster, false).await
    }

    #[instrument(skip_all, fields(namespace = infra.technical_id()))]
    async fn delete(&self, infra: &mut Infrastructure, cluster: &ShootCluster) -> Result<()> {
        self.run(infra, cluster, true).await
    }

    async fn restore(&self, infra: &mut Infrastructure, cluster: &ShootCluster) -> Result<()> {
        self.run(infra, cluster, false).await
    }
}
