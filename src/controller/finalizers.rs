//! Finalizer handling for Infrastructure cleanup
//!
//! The finalizer keeps the Infrastructure around until the actuator has
//! removed every cloud resource of the shoot. It is dropped without cleanup
//! when the resource is migrated away from this seed.

use kube::{
    api::{Api, Patch, PatchParams},
    Client, ResourceExt,
};
use serde_json::json;
use tracing::info;

use super::status::FIELD_MANAGER;
use crate::crd::Infrastructure;
use crate::error::Result;

pub const INFRASTRUCTURE_FINALIZER: &str = "extensions.gardener.cloud/infrastructure";

/// Finalizers of `infra` with `name` added, or `None` when already present
fn with_finalizer(infra: &Infrastructure, name: &str) -> Option<Vec<String>> {
    let finalizers = infra.finalizers();
    if finalizers.iter().any(|f| f == name) {
        return None;
    }
    let mut next = finalizers.to_vec();
    next.push(name.to_string());
    Some(next)
}

/// Finalizers of `infra` without `name`, or `None` when it is absent
fn without_finalizer(infra: &Infrastructure, name: &str) -> Option<Vec<String>> {
    let finalizers = infra.finalizers();
    if !finalizers.iter().any(|f| f == name) {
        return None;
    }
    Some(finalizers.iter().filter(|f| *f != name).cloned().collect())
}

async fn patch_finalizers(client: &Client, infra: &Infrastructure, finalizers: Vec<String>) -> Result<()> {
    let namespace = infra.technical_id();
    let api: Api<Infrastructure> = Api::namespaced(client.clone(), &namespace);
    let patch = json!({
        "metadata": {
            "finalizers": finalizers
        }
    });
    api.patch(
        &infra.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

pub async fn add_finalizer(client: &Client, infra: &Infrastructure) -> Result<()> {
    if let Some(finalizers) = with_finalizer(infra, INFRASTRUCTURE_FINALIZER) {
        patch_finalizers(client, infra, finalizers).await?;
        info!("Added finalizer to Infrastructure: {}", infra.name_any());
    }
    Ok(())
}

/// Remove the finalizer so Kubernetes can complete the deletion
pub async fn remove_finalizer(client: &Client, infra: &Infrastructure) -> Result<()> {
    if let Some(finalizers) = without_finalizer(infra, INFRASTRUCTURE_FINALIZER) {
        patch_finalizers(client, infra, finalizers).await?;
        info!("Removed finalizer from Infrastructure: {}", infra.name_any());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::test_infrastructure;

    #[test]
    fn test_finalizer_name() {
        assert_eq!(INFRASTRUCTURE_FINALIZER, "extensions.gardener.cloud/infrastructure");
    }

    #[test]
    fn test_add_keeps_foreign_finalizers() {
        let mut infra = test_infrastructure();
        infra.metadata.finalizers = Some(vec!["other/finalizer".to_string()]);

        let next = with_finalizer(&infra, INFRASTRUCTURE_FINALIZER).unwrap();

        assert_eq!(next, vec!["other/finalizer", INFRASTRUCTURE_FINALIZER]);
        infra.metadata.finalizers = Some(next);
        assert!(with_finalizer(&infra, INFRASTRUCTURE_FINALIZER).is_none());
    }

    #[test]
    fn test_remove_only_own_finalizer() {
        let mut infra = test_infrastructure();
        assert!(without_finalizer(&infra, INFRASTRUCTURE_FINALIZER).is_none());

        infra.metadata.finalizers = Some(vec![
            INFRASTRUCTURE_FINALIZER.to_string(),
            "other/finalizer".to_string(),
        ]);

        assert_eq!(
            without_finalizer(&infra, INFRASTRUCTURE_FINALIZER).unwrap(),
            vec!["other/finalizer"]
        );
    }
}
