//! Infrastructure actuator
//!
//! Entry point for the four extension operations. Each one selects an engine,
//! delegates to its reconciler and classifies the resulting error.

use std::sync::Arc;

use kube::ResourceExt;
use tracing::{info, instrument, warn};

use super::engine::{DefaultReconcilerFactory, Dependencies, ReconcilerFactory};
use super::strategy::{Engine, Operation, StrategySelector};
use super::terraform::cleanup_terraformer_resources;
use crate::crd::{Infrastructure, ShootCluster};
use crate::error::{classify, Result};

pub struct Actuator {
    selector: StrategySelector,
    reconcilers: Arc<dyn ReconcilerFactory>,
    deps: Dependencies,
}

impl Actuator {
    pub fn new(deps: Dependencies) -> Self {
        let reconcilers = Arc::new(DefaultReconcilerFactory::new(deps.clone()));
        Self::with_reconcilers(deps, reconcilers)
    }

    pub fn with_reconcilers(deps: Dependencies, reconcilers: Arc<dyn ReconcilerFactory>) -> Self {
        Self {
            selector: StrategySelector::new(),
            reconcilers,
            deps,
        }
    }

    fn select(
        &self,
        operation: Operation,
        infra: &Infrastructure,
        cluster: &ShootCluster,
    ) -> Result<Engine> {
        let engine = self.selector.select(operation, infra, cluster)?;
        info!(%operation, %engine, "Selected reconcile engine");
        #[cfg(feature = "metrics")]
        super::metrics::inc_engine_selection(&operation.to_string(), &engine.to_string());
        Ok(engine)
    }

    #[instrument(skip_all, fields(name = %infra.name_any(), namespace = infra.technical_id()))]
    pub async fn reconcile(&self, infra: &mut Infrastructure, cluster: &ShootCluster) -> Result<()> {
        let run = async {
            let engine = self.select(Operation::Reconcile, infra, cluster)?;
            self.reconcilers
                .reconciler(engine)
                .reconcile(infra, cluster)
                .await
        };
        run.await.map_err(classify)
    }

    #[instrument(skip_all, fields(name = %infra.name_any(), namespace = infra.technical_id()))]
    pub async fn delete(&self, infra: &mut Infrastructure, cluster: &ShootCluster) -> Result<()> {
        let run = async {
            let engine = self.select(Operation::Delete, infra, cluster)?;
            self.reconcilers
                .reconciler(engine)
                .delete(infra, cluster)
                .await?;
            // Sweep terraformer leftovers whichever engine owned the resources
            if let Err(e) = self.cleanup_terraformer(infra).await {
                warn!(%engine, error = %e, "Failed to clean up terraformer resources after delete");
            }
            Ok(())
        };
        run.await.map_err(classify)
    }

    #[instrument(skip_all, fields(name = %infra.name_any(), namespace = infra.technical_id()))]
    pub async fn restore(&self, infra: &mut Infrastructure, cluster: &ShootCluster) -> Result<()> {
        let run = async {
            let engine = self.select(Operation::Restore, infra, cluster)?;
            self.reconcilers
                .reconciler(engine)
                .restore(infra, cluster)
                .await
        };
        run.await.map_err(classify)
    }

    /// Move the resource onto flow state and drop the terraformer
    /// configuration so the shoot can be handed over to another seed.
    #[instrument(skip_all, fields(name = %infra.name_any(), namespace = infra.technical_id()))]
    pub async fn migrate(&self, infra: &mut Infrastructure, cluster: &ShootCluster) -> Result<()> {
        let run = async {
            let engine = self.select(Operation::Migrate, infra, cluster)?;
            self.reconcilers
                .reconciler(engine)
                .reconcile(infra, cluster)
                .await?;
            self.cleanup_terraformer(infra).await
        };
        run.await.map_err(classify)
    }

    async fn cleanup_terraformer(&self, infra: &Infrastructure) -> Result<()> {
        let credentials = self.deps.credentials.credentials(infra).await?;
        let terraformer = self.deps.terraformers.terraformer(infra, &credentials)?;
        cleanup_terraformer_resources(terraformer.as_ref()).await
    }
}
