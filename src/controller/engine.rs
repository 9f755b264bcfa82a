//! The contract both reconcile engines implement

use std::sync::Arc;

use async_trait::async_trait;

use super::flow::FlowReconciler;
use super::status::StatusWriter;
use super::strategy::{Engine, FeatureGates};
use super::terraform::{TerraformReconciler, TerraformerFactory};
use crate::crd::{Infrastructure, ShootCluster};
use crate::error::Result;
use crate::gcp::{CloudClientFactory, CredentialsProvider};

/// Drives an Infrastructure to its desired state with one engine.
///
/// Implementations persist provider status, state and egress CIDRs through
/// the [`StatusWriter`]; `infra.status` reflects every write on return.
#[async_trait]
pub trait InfrastructureReconciler: Send + Sync {
    async fn reconcile(&self, infra: &mut Infrastructure, cluster: &ShootCluster) -> Result<()>;
    async fn delete(&self, infra: &mut Infrastructure, cluster: &ShootCluster) -> Result<()>;
    /// Reconcile from the state persisted on the resource
    async fn restore(&self, infra: &mut Infrastructure, cluster: &ShootCluster) -> Result<()>;
}

/// Collaborators shared by both engines
#[derive(Clone)]
pub struct Dependencies {
    pub credentials: Arc<dyn CredentialsProvider>,
    pub terraformers: Arc<dyn TerraformerFactory>,
    pub clouds: Arc<dyn CloudClientFactory>,
    pub status: Arc<dyn StatusWriter>,
    pub gates: FeatureGates,
}

pub trait ReconcilerFactory: Send + Sync {
    fn reconciler(&self, engine: Engine) -> Arc<dyn InfrastructureReconciler>;
}

/// Builds the production reconcilers from a set of [`Dependencies`]
pub struct DefaultReconcilerFactory {
    deps: Dependencies,
}

impl DefaultReconcilerFactory {
    pub fn new(deps: Dependencies) -> Self {
        Self { deps }
    }
}

impl ReconcilerFactory for DefaultReconcilerFactory {
    fn reconciler(&self, engine: Engine) -> Arc<dyn InfrastructureReconciler> {
        match engine {
            Engine::Terraform => Arc::new(TerraformReconciler::new(self.deps.clone())),
            Engine::Flow => Arc::new(FlowReconciler::new(self.deps.clone())),
        }
    }
}
