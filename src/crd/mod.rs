//! Custom Resource Definitions read and written by the GCP infrastructure controller
//!
//! Only the fields this controller touches are modelled. Gardener owns the
//! full schemas.

mod cluster;
mod infrastructure;
pub mod provider;
pub mod types;


pub use cluster::{Cluster, ClusterSpec, EmbeddedMeta, Networking, Seed, Shoot, ShootCluster, ShootSpec};
pub use infrastructure::{
    Infrastructure, InfrastructureResourceStatus, InfrastructureSpec, SecretReference,
    INFRASTRUCTURE_TYPE_GCP, OPERATION_ANNOTATION, OPERATION_MIGRATE, OPERATION_RECONCILE,
    OPERATION_RESTORE,
};
pub use provider::{InfrastructureConfig, InfrastructureStatus};
pub use types::*;
