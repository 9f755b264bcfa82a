//! Main reconciler for Infrastructure resources
//!
//! Implements the controller pattern using kube-rs runtime. Every change of a
//! `gcp` Infrastructure is mapped to one actuator operation, bracketed by
//! `lastOperation` updates.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use k8s_openapi::api::core::v1::Event;
use kube::{
    api::{Api, Patch, PatchParams, PostParams},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        watcher::Config,
    },
    Resource, ResourceExt,
};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use super::actuator::Actuator;
use super::conditions::{failed, operation_type, processing, succeeded};
use super::finalizers::{add_finalizer, remove_finalizer};
use super::status::{StatusWriter, FIELD_MANAGER};
use super::strategy::Operation;
use crate::crd::{
    Cluster, Infrastructure, ShootCluster, INFRASTRUCTURE_TYPE_GCP, OPERATION_ANNOTATION, OPERATION_MIGRATE,
    OPERATION_RECONCILE, OPERATION_RESTORE,
};
use crate::error::{Error, Result};

const CONTROLLER_NAME: &str = "infrastructure";

/// Requeue delay while another replica holds the lease
const NOT_LEADER_REQUEUE: Duration = Duration::from_secs(5);

/// Shared state for the controller
pub struct ControllerState {
    pub client: Client,
    pub actuator: Actuator,
    pub status: Arc<dyn StatusWriter>,
    pub is_leader: Arc<AtomicBool>,
    pub sync_period: Duration,
}

/// What a reconcile of the current object has to do
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    Run(Operation),
    /// Up to date, nothing requested
    Skip,
}

/// Map the observed object to the operation gardenlet asked for
pub fn next_step(infra: &Infrastructure) -> Step {
    let annotation = infra.operation_annotation();
    if annotation == Some(OPERATION_MIGRATE) {
        return Step::Run(Operation::Migrate);
    }
    if infra.is_being_deleted() {
        return Step::Run(Operation::Delete);
    }
    if annotation == Some(OPERATION_RESTORE) {
        return Step::Run(Operation::Restore);
    }
    let observed = infra.status.as_ref().and_then(|s| s.observed_generation);
    let generation_changed = infra.metadata.generation != observed;
    if generation_changed
        || annotation == Some(OPERATION_RECONCILE)
        || !infra.last_operation_succeeded()
    {
        return Step::Run(Operation::Reconcile);
    }
    Step::Skip
}

/// Main entry point to start the controller
pub async fn run_controller(state: Arc<ControllerState>) -> Result<()> {
    let client = state.client.clone();
    let infrastructures: Api<Infrastructure> = Api::all(client.clone());

    info!("Starting Infrastructure controller");

    // Verify CRD exists
    match infrastructures.list(&Default::default()).await {
        Ok(_) => info!("Infrastructure CRD is available"),
        Err(e) => {
            error!(
                "Infrastructure CRD not found. Please install the CRD first: {:?}",
                e
            );
            return Err(Error::ConfigError(
                "Infrastructure CRD not installed".to_string(),
            ));
        }
    }

    Controller::new(infrastructures, Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok(obj) => debug!("Reconciled: {:?}", obj),
                Err(e) => error!("Reconcile error: {:?}", e),
            }
        })
        .await;

    Ok(())
}

/// Helper to emit a Kubernetes Event
async fn emit_event(
    client: &Client,
    infra: &Infrastructure,
    event_type: &str,
    reason: &str,
    message: &str,
) -> Result<()> {
    let namespace = infra.technical_id();
    let events: Api<Event> = Api::namespaced(client.clone(), &namespace);

    let time = chrono::Utc::now();
    let event = Event {
        metadata: kube::api::ObjectMeta {
            generate_name: Some(format!("{}-event-", infra.name_any())),
            ..Default::default()
        },
        type_: Some(event_type.to_string()),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        involved_object: infra.object_ref(&()),
        first_timestamp: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(time)),
        last_timestamp: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(time)),
        count: Some(1),
        ..Default::default()
    };

    events
        .create(&PostParams::default(), &event)
        .await
        .map_err(Error::KubeError)?;
    Ok(())
}

async fn remove_operation_annotation(client: &Client, infra: &Infrastructure) -> Result<()> {
    if infra.operation_annotation().is_none() {
        return Ok(());
    }
    let api: Api<Infrastructure> = Api::namespaced(client.clone(), &infra.technical_id());
    let patch = json!({
        "metadata": {
            "annotations": { OPERATION_ANNOTATION: null }
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

/// Decode the owning cluster.
///
/// A deletion proceeds without it, otherwise the Infrastructure would keep its
/// finalizer forever once the Cluster is gone.
pub fn shoot_cluster(
    cluster: Option<Cluster>,
    name: &str,
    operation: Operation,
) -> Result<ShootCluster> {
    match cluster {
        Some(cluster) => cluster.decode(),
        None if operation == Operation::Delete => {
            warn!(cluster = name, "Cluster not found, deleting without it");
            Ok(ShootCluster {
                name: name.to_string(),
                ..Default::default()
            })
        }
        None => Err(Error::ConfigError(format!("cluster {name} not found"))),
    }
}

/// The main reconciliation function
#[instrument(skip(ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile(obj: Arc<Infrastructure>, ctx: Arc<ControllerState>) -> Result<Action> {
    if obj.spec.type_ != INFRASTRUCTURE_TYPE_GCP {
        debug!(type_ = %obj.spec.type_, "Ignoring infrastructure of foreign type");
        return Ok(Action::await_change());
    }
    if !ctx.is_leader.load(Ordering::Relaxed) {
        debug!("Not the leader, skipping reconcile");
        return Ok(Action::requeue(NOT_LEADER_REQUEUE));
    }

    let operation = match next_step(&obj) {
        Step::Run(operation) => operation,
        Step::Skip => return Ok(Action::requeue(ctx.sync_period)),
    };
    info!(%operation, "Processing Infrastructure");

    let client = ctx.client.clone();
    if !matches!(operation, Operation::Delete | Operation::Migrate) {
        add_finalizer(&client, &obj).await?;
    }

    let clusters: Api<Cluster> = Api::all(client.clone());
    let cluster = shoot_cluster(
        clusters.get_opt(&obj.technical_id()).await?,
        &obj.technical_id(),
        operation,
    )?;

    let mut infra = (*obj).clone();
    let type_ = operation_type(&infra, operation);
    ctx.status.persist(&mut infra, processing(type_)).await?;

    let started = Instant::now();
    let result = match operation {
        Operation::Reconcile => ctx.actuator.reconcile(&mut infra, &cluster).await,
        Operation::Delete => ctx.actuator.delete(&mut infra, &cluster).await,
        Operation::Restore => ctx.actuator.restore(&mut infra, &cluster).await,
        Operation::Migrate => ctx.actuator.migrate(&mut infra, &cluster).await,
    };
    #[cfg(feature = "metrics")]
    super::metrics::observe_reconcile_duration_seconds(
        CONTROLLER_NAME,
        &operation.to_string(),
        started.elapsed().as_secs_f64(),
    );
    #[cfg(not(feature = "metrics"))]
    let _ = started;

    let generation = infra.metadata.generation;
    if let Err(err) = result {
        if let Err(e) = ctx
            .status
            .persist(&mut infra, failed(type_, &err, generation))
            .await
        {
            warn!(error = %e, "Failed to record last error");
        }
        let message = err.to_string();
        if let Err(e) = emit_event(&client, &infra, "Warning", "OperationFailed", &message).await {
            warn!(error = %e, "Failed to emit event");
        }
        #[cfg(feature = "metrics")]
        {
            super::metrics::inc_reconcile_error(CONTROLLER_NAME, err.kind());
            super::metrics::inc_operation(&operation.to_string(), "Error");
        }
        return Err(err);
    }

    ctx.status
        .persist(&mut infra, succeeded(type_, generation))
        .await?;
    #[cfg(feature = "metrics")]
    super::metrics::inc_operation(&operation.to_string(), "Succeeded");

    match operation {
        Operation::Delete => {
            remove_finalizer(&client, &infra).await?;
            info!("Infrastructure deleted");
            Ok(Action::await_change())
        }
        Operation::Migrate => {
            remove_finalizer(&client, &infra).await?;
            remove_operation_annotation(&client, &infra).await?;
            info!("Infrastructure migrated");
            Ok(Action::await_change())
        }
        Operation::Reconcile | Operation::Restore => {
            remove_operation_annotation(&client, &infra).await?;
            Ok(Action::requeue(ctx.sync_period))
        }
    }
}

/// Error policy determines how to handle reconciliation errors
fn error_policy(infra: Arc<Infrastructure>, error: &Error, _ctx: Arc<ControllerState>) -> Action {
    error!("Reconciliation error for {}: {:?}", infra.name_any(), error);
    Action::requeue(retry_delay(error))
}

/// Shorter retry for retriable errors
pub fn retry_delay(error: &Error) -> Duration {
    if error.is_retriable() {
        Duration::from_secs(15)
    } else {
        Duration::from_secs(60)
    }
}
