//! `lastOperation` / `lastError` helpers following the Gardener extension conventions

use super::status::StatusUpdate;
use super::strategy::Operation;
use crate::crd::{Infrastructure, LastError, LastOperation, LastOperationState, LastOperationType};
use crate::error::Error;

/// Type recorded for `operation`; a first reconcile is reported as `Create`
pub fn operation_type(infra: &Infrastructure, operation: Operation) -> LastOperationType {
    match operation {
        Operation::Reconcile => {
            let previous = infra.status.as_ref().and_then(|s| s.last_operation.as_ref());
            match previous {
                None => LastOperationType::Create,
                Some(op) if op.type_ == LastOperationType::Create && !op.succeeded() => {
                    LastOperationType::Create
                }
                Some(_) => LastOperationType::Reconcile,
            }
        }
        Operation::Delete => LastOperationType::Delete,
        Operation::Restore => LastOperationType::Restore,
        Operation::Migrate => LastOperationType::Migrate,
    }
}

fn describe(type_: LastOperationType) -> &'static str {
    match type_ {
        LastOperationType::Create | LastOperationType::Reconcile => "reconcile",
        LastOperationType::Delete => "deletion",
        LastOperationType::Migrate => "migration",
        LastOperationType::Restore => "restoration",
    }
}

pub fn processing(type_: LastOperationType) -> StatusUpdate {
    StatusUpdate {
        last_operation: Some(LastOperation::new(
            type_,
            LastOperationState::Processing,
            &format!("Processing infrastructure {}", describe(type_)),
        )),
        ..Default::default()
    }
}

/// Marks the operation done and clears `lastError`
pub fn succeeded(type_: LastOperationType, generation: Option<i64>) -> StatusUpdate {
    StatusUpdate {
        last_operation: Some(LastOperation::new(
            type_,
            LastOperationState::Succeeded,
            &format!("Infrastructure {} succeeded", describe(type_)),
        )),
        last_error: Some(None),
        observed_generation: generation,
        ..Default::default()
    }
}

/// Records `err` with the codes attached during classification
pub fn failed(type_: LastOperationType, err: &Error, generation: Option<i64>) -> StatusUpdate {
    let description = format!("Error during infrastructure {}: {err}", describe(type_));
    StatusUpdate {
        last_operation: Some(LastOperation::new(
            type_,
            LastOperationState::Error,
            &description,
        )),
        last_error: Some(Some(LastError::new(&description, err.codes()))),
        observed_generation: generation,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::test_infrastructure;
    use crate::crd::InfrastructureResourceStatus;
    use crate::error::{classify, ErrorCode};

    fn with_last_operation(type_: LastOperationType, state: LastOperationState) -> Infrastructure {
        let mut infra = test_infrastructure();
        infra.status = Some(InfrastructureResourceStatus {
            last_operation: Some(LastOperation::new(type_, state, "")),
            ..Default::default()
        });
        infra
    }

    #[test]
    fn test_first_reconcile_is_create() {
        let infra = test_infrastructure();
        assert_eq!(
            operation_type(&infra, Operation::Reconcile),
            LastOperationType::Create
        );

        let failed_create = with_last_operation(LastOperationType::Create, LastOperationState::Error);
        assert_eq!(
            operation_type(&failed_create, Operation::Reconcile),
            LastOperationType::Create
        );

        let created = with_last_operation(LastOperationType::Create, LastOperationState::Succeeded);
        assert_eq!(
            operation_type(&created, Operation::Reconcile),
            LastOperationType::Reconcile
        );
        assert_eq!(
            operation_type(&created, Operation::Migrate),
            LastOperationType::Migrate
        );
    }

    #[test]
    fn test_succeeded_clears_last_error() {
        let update = succeeded(LastOperationType::Reconcile, Some(3));

        let op = update.last_operation.unwrap();
        assert_eq!(op.state, LastOperationState::Succeeded);
        assert_eq!(op.progress, 100);
        assert_eq!(update.last_error, Some(None));
        assert_eq!(update.observed_generation, Some(3));
    }

    #[test]
    fn test_failed_carries_error_codes() {
        let err = classify(Error::GcpApi {
            status: 403,
            message: "Required 'compute.networks.create' permission: PERMISSION_DENIED".into(),
        });

        let update = failed(LastOperationType::Delete, &err, None);

        let last_error = update.last_error.flatten().unwrap();
        assert!(last_error.codes.contains(&ErrorCode::InfraUnauthorized));
        assert!(last_error.description.contains("deletion"));
        assert_eq!(
            update.last_operation.unwrap().state,
            LastOperationState::Error
        );
    }
}
