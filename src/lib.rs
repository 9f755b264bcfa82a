//! GCP infrastructure controller for Gardener shoots
//!
//! Reconciles `Infrastructure` resources of type `gcp` either through the
//! terraformer or through native calls to the Compute and IAM APIs, and
//! migrates shoots from the former to the latter.

pub mod controller;
pub mod crd;
pub mod error;
pub mod gcp;
#[cfg(feature = "metrics")]
pub mod server;
pub mod telemetry;

pub use crate::error::{Error, Result};
