//! Tests for the reconciler module
//!
//! These tests verify how the controller maps observed Infrastructure objects
//! to actuator operations and how errors are requeued.

#[cfg(test)]
mod tests {
    use super::super::reconciler::*;
    use super::super::strategy::Operation;
    use crate::controller::testing::test_infrastructure;
    use crate::crd::{
        Infrastructure, InfrastructureResourceStatus, LastOperation, LastOperationState,
        LastOperationType, OPERATION_ANNOTATION,
    };
    use crate::error::{classify, Error};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use std::time::Duration;

    fn reconciled(generation: i64) -> Infrastructure {
        let mut infra = test_infrastructure();
        infra.metadata.generation = Some(generation);
        infra.status = Some(InfrastructureResourceStatus {
            observed_generation: Some(generation),
            last_operation: Some(LastOperation::new(
                LastOperationType::Reconcile,
                LastOperationState::Succeeded,
                "done",
            )),
            ..Default::default()
        });
        infra
    }

    fn annotated(mut infra: Infrastructure, operation: &str) -> Infrastructure {
        infra
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(OPERATION_ANNOTATION.to_string(), operation.to_string());
        infra
    }

    fn deleting(mut infra: Infrastructure) -> Infrastructure {
        infra.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        infra
    }

    #[test]
    fn test_new_object_is_reconciled() {
        assert_eq!(
            next_step(&test_infrastructure()),
            Step::Run(Operation::Reconcile)
        );
    }

    #[test]
    fn test_up_to_date_object_is_skipped() {
        assert_eq!(next_step(&reconciled(2)), Step::Skip);
    }

    #[test]
    fn test_generation_change_triggers_reconcile() {
        let mut infra = reconciled(2);
        infra.metadata.generation = Some(3);
        assert_eq!(next_step(&infra), Step::Run(Operation::Reconcile));
    }

    #[test]
    fn test_failed_last_operation_triggers_reconcile() {
        let mut infra = reconciled(2);
        if let Some(status) = infra.status.as_mut() {
            status.last_operation = Some(LastOperation::new(
                LastOperationType::Reconcile,
                LastOperationState::Error,
                "boom",
            ));
        }
        assert_eq!(next_step(&infra), Step::Run(Operation::Reconcile));
    }

    #[test]
    fn test_reconcile_annotation_triggers_reconcile() {
        let infra = annotated(reconciled(2), "reconcile");
        assert_eq!(next_step(&infra), Step::Run(Operation::Reconcile));
    }

    #[test]
    fn test_restore_annotation() {
        let infra = annotated(reconciled(2), "restore");
        assert_eq!(next_step(&infra), Step::Run(Operation::Restore));
    }

    #[test]
    fn test_deletion_wins_over_restore() {
        let infra = deleting(annotated(reconciled(2), "restore"));
        assert_eq!(next_step(&infra), Step::Run(Operation::Delete));
    }

    #[test]
    fn test_migrate_wins_over_deletion() {
        let infra = deleting(annotated(reconciled(2), "migrate"));
        assert_eq!(next_step(&infra), Step::Run(Operation::Migrate));
    }

    #[test]
    fn test_retry_delay_retriable_error() {
        let err = Error::Timeout("cleanup".into());
        assert_eq!(retry_delay(&err), Duration::from_secs(15));
    }

    #[test]
    fn test_retry_delay_non_retriable_error() {
        let err = Error::ValidationError("subnet CIDR changed".into());
        assert_eq!(retry_delay(&err), Duration::from_secs(60));
    }

    #[test]
    fn test_retry_delay_user_error() {
        let err = classify(Error::GcpApi {
            status: 503,
            message: "Quota 'ROUTERS' exceeded".into(),
        });
        assert_eq!(retry_delay(&err), Duration::from_secs(60));
    }

    #[test]
    fn test_missing_cluster_does_not_block_deletion() {
        let cluster = shoot_cluster(None, "shoot--dev--alpha", Operation::Delete).unwrap();
        assert_eq!(cluster.name, "shoot--dev--alpha");
        assert!(cluster.nodes_cidr().is_none());
    }

    #[test]
    fn test_missing_cluster_fails_reconcile() {
        let err = shoot_cluster(None, "shoot--dev--alpha", Operation::Reconcile).unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }
}
