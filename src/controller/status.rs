//! Status persistence for Infrastructure resources
//!
//! Every write is a single merge patch on the status subresource, computed
//! against the status currently known for the resource. Unchanged status
//! produces no request at all.

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{debug, instrument};

use super::patch::merge_patch;
use crate::crd::{Infrastructure, InfrastructureResourceStatus, LastError, LastOperation};
use crate::error::{Error, Result};

pub const FIELD_MANAGER: &str = "gcp-infrastructure-controller";

/// Changes to apply to `status`; `None` leaves a field untouched
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StatusUpdate {
    /// Replaces the whole provider status
    pub provider_status: Option<serde_json::Value>,
    /// Replaces the state. `Some(Value::Null)` clears it.
    pub state: Option<serde_json::Value>,
    pub egress_cidrs: Option<Vec<String>>,
    pub last_operation: Option<LastOperation>,
    /// `Some(None)` clears the last error
    pub last_error: Option<Option<LastError>>,
    pub observed_generation: Option<i64>,
}

impl StatusUpdate {
    pub fn state(state: serde_json::Value) -> Self {
        Self {
            state: Some(state),
            ..Default::default()
        }
    }

    pub fn outputs(
        provider_status: serde_json::Value,
        state: serde_json::Value,
        egress_cidrs: Vec<String>,
    ) -> Self {
        Self {
            provider_status: Some(provider_status),
            state: Some(state),
            egress_cidrs: Some(egress_cidrs),
            ..Default::default()
        }
    }

    /// The status resulting from applying this update to `current`
    pub fn apply_to(&self, current: &InfrastructureResourceStatus) -> InfrastructureResourceStatus {
        let mut next = current.clone();
        if let Some(provider_status) = &self.provider_status {
            next.provider_status = non_null(provider_status);
        }
        if let Some(state) = &self.state {
            next.state = non_null(state);
        }
        if let Some(egress) = &self.egress_cidrs {
            next.egress_cidrs = if egress.is_empty() {
                None
            } else {
                Some(egress.clone())
            };
        }
        if let Some(op) = &self.last_operation {
            next.last_operation = Some(op.clone());
        }
        if let Some(err) = &self.last_error {
            next.last_error = err.clone();
        }
        if let Some(generation) = self.observed_generation {
            next.observed_generation = Some(generation);
        }
        next
    }
}

fn non_null(value: &serde_json::Value) -> Option<serde_json::Value> {
    if value.is_null() {
        None
    } else {
        Some(value.clone())
    }
}

/// Merge patch body for moving `infra` to the status produced by `update`.
///
/// Returns the new status and the patch, or no patch when nothing changes.
pub fn status_patch(
    infra: &Infrastructure,
    update: &StatusUpdate,
) -> Result<(InfrastructureResourceStatus, Option<serde_json::Value>)> {
    let current = infra.status.clone().unwrap_or_default();
    let desired = update.apply_to(&current);
    let patch = merge_patch(
        &serde_json::to_value(&current)?,
        &serde_json::to_value(&desired)?,
    );
    Ok((desired, patch.map(|status| json!({ "status": status }))))
}

#[async_trait]
pub trait StatusWriter: Send + Sync {
    /// Persist `update` and refresh `infra.status` with the written status
    async fn persist(&self, infra: &mut Infrastructure, update: StatusUpdate) -> Result<()>;
}

pub struct KubeStatusWriter {
    client: Client,
}

impl KubeStatusWriter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StatusWriter for KubeStatusWriter {
    #[instrument(skip(self, infra, update), fields(name = %infra.name_any(), namespace = infra.namespace()))]
    async fn persist(&self, infra: &mut Infrastructure, update: StatusUpdate) -> Result<()> {
        let (desired, patch) = status_patch(infra, &update)?;
        let Some(patch) = patch else {
            debug!("Status unchanged, skipping patch");
            return Ok(());
        };
        let namespace = infra
            .namespace()
            .ok_or_else(|| Error::ValidationError("infrastructure has no namespace".into()))?;
        let api: Api<Infrastructure> = Api::namespaced(self.client.clone(), &namespace);
        api.patch_status(
            &infra.name_any(),
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        infra.status = Some(desired);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::test_infrastructure;

    #[test]
    fn test_provider_status_is_replaced_not_merged() {
        let mut infra = test_infrastructure();
        infra.status = Some(InfrastructureResourceStatus {
            provider_status: Some(json!({
                "networks": {"vpc": {"name": "a"}, "natIPs": [{"ip": "1.1.1.1"}]}
            })),
            egress_cidrs: Some(vec!["1.1.1.1/32".into()]),
            ..Default::default()
        });

        let update = StatusUpdate::outputs(
            json!({"networks": {"vpc": {"name": "a"}}}),
            json!({"data": "", "encoding": "none"}),
            vec![],
        );
        let (desired, patch) = status_patch(&infra, &update).unwrap();

        assert_eq!(
            desired.provider_status,
            Some(json!({"networks": {"vpc": {"name": "a"}}}))
        );
        assert_eq!(desired.egress_cidrs, None);
        let patch = patch.unwrap();
        assert_eq!(patch["status"]["providerStatus"]["networks"]["natIPs"], json!(null));
        assert_eq!(patch["status"]["egressCIDRs"], json!(null));
        assert_eq!(patch["status"]["state"]["encoding"], "none");
    }

    #[test]
    fn test_unchanged_status_yields_no_patch() {
        let mut infra = test_infrastructure();
        let state = json!({"data": "{}", "encoding": "none"});
        infra.status = Some(InfrastructureResourceStatus {
            state: Some(state.clone()),
            ..Default::default()
        });
        let (_, patch) = status_patch(&infra, &StatusUpdate::state(state)).unwrap();
        assert!(patch.is_none());
    }

    #[test]
    fn test_null_state_clears() {
        let mut infra = test_infrastructure();
        infra.status = Some(InfrastructureResourceStatus {
            state: Some(json!({"kind": "InfrastructureState"})),
            ..Default::default()
        });
        let (desired, patch) =
            status_patch(&infra, &StatusUpdate::state(serde_json::Value::Null)).unwrap();
        assert!(desired.state.is_none());
        assert_eq!(patch.unwrap(), json!({"status": {"state": null}}));
    }
}
