//! Controller module for Infrastructure reconciliation
//!
//! Contains the controller loop, the actuator with its engine selection, and
//! the terraform and flow engines.

mod actuator;
pub mod cloud;
mod conditions;
mod engine;
mod finalizers;
pub mod flow;
#[cfg(feature = "metrics")]
pub mod metrics;
mod patch;
mod reconciler;
#[cfg(test)]
mod reconciler_test;
mod retry;
pub mod state;
pub mod status;
pub mod strategy;
pub mod terraform;
#[cfg(test)]
pub(crate) mod testing;

pub use actuator::Actuator;
pub use engine::{DefaultReconcilerFactory, Dependencies, InfrastructureReconciler, ReconcilerFactory};
pub use finalizers::INFRASTRUCTURE_FINALIZER;
pub use reconciler::{next_step, run_controller, ControllerState, Step};
pub use status::{KubeStatusWriter, StatusUpdate, StatusWriter};
pub use strategy::{Engine, FeatureGates, Operation, StrategySelector};
pub use terraform::KubeTerraformerFactory;
