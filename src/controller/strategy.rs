//! Reconcile engine selection
//!
//! Decides per operation whether an Infrastructure is handled by the
//! terraform engine or the native flow engine. Selection is a pure function of
//! the persisted state and the use-flow annotations.

use std::collections::BTreeMap;
use std::fmt;

use tracing::debug;

use super::state::has_flow_state;
use crate::crd::{Infrastructure, ShootCluster};
use crate::error::Result;

/// Provider scoped use-flow annotation, also used as seed label
pub const ANNOTATION_USE_FLOW: &str = "gcp.provider.extensions.gardener.cloud/use-flow";
/// Provider independent use-flow annotation
pub const GLOBAL_ANNOTATION_USE_FLOW: &str = "provider.extensions.gardener.cloud/use-flow";
pub const SEED_LABEL_USE_FLOW: &str = ANNOTATION_USE_FLOW;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Engine {
    Terraform,
    Flow,
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Engine::Terraform => write!(f, "terraform"),
            Engine::Flow => write!(f, "flow"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Reconcile,
    Delete,
    Restore,
    Migrate,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Reconcile => write!(f, "reconcile"),
            Operation::Delete => write!(f, "delete"),
            Operation::Restore => write!(f, "restore"),
            Operation::Migrate => write!(f, "migrate"),
        }
    }
}

/// Feature gates of the controller
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FeatureGates {
    /// Do not create a service account for new shoots
    pub disable_gardener_service_account_creation: bool,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct StrategySelector;

impl StrategySelector {
    pub fn new() -> Self {
        Self
    }

    pub fn select(
        &self,
        operation: Operation,
        infra: &Infrastructure,
        cluster: &ShootCluster,
    ) -> Result<Engine> {
        let flow_state = has_flow_state(infra.state())?;
        let use_flow = match operation {
            Operation::Migrate => true,
            Operation::Delete | Operation::Restore => flow_state,
            Operation::Reconcile => flow_state || use_flow_requested(infra, cluster),
        };
        let engine = if use_flow {
            Engine::Flow
        } else {
            Engine::Terraform
        };
        debug!(%operation, %engine, flow_state, "Selected reconcile engine");
        Ok(engine)
    }
}

/// The first object carrying a use-flow key decides: Infrastructure, then
/// shoot, then seed.
fn use_flow_requested(infra: &Infrastructure, cluster: &ShootCluster) -> bool {
    let infra_annotations = infra.annotations_or_empty();
    flag(&infra_annotations)
        .or_else(|| flag(&cluster.shoot.metadata.annotations))
        .or_else(|| {
            cluster
                .seed
                .metadata
                .labels
                .get(SEED_LABEL_USE_FLOW)
                .map(|v| is_true(v))
        })
        .unwrap_or(false)
}

fn flag(annotations: &BTreeMap<String, String>) -> Option<bool> {
    annotations
        .get(ANNOTATION_USE_FLOW)
        .or_else(|| annotations.get(GLOBAL_ANNOTATION_USE_FLOW))
        .map(|v| is_true(v))
}

fn is_true(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("true")
}
