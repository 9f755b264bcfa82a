//! IAM service accounts

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAccount {
    #[serde(default)]
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub display_name: String,
}

#[async_trait]
pub trait IamClient: Send + Sync {
    async fn get_service_account(&self, email: &str) -> Result<Option<ServiceAccount>>;
    async fn create_service_account(&self, account_id: &str, display_name: &str)
        -> Result<ServiceAccount>;
    /// Deleting an absent account succeeds
    async fn delete_service_account(&self, email: &str) -> Result<()>;
}

/// Email of the account `account_id` in `project`
pub fn service_account_email(account_id: &str, project: &str) -> String {
    format!("{account_id}@{project}.iam.gserviceaccount.com")
}
