//! Terraformer: runs terraform inside pods on the seed
//!
//! The configuration lives in three objects next to the Infrastructure:
//! - ConfigMap `<name>.infra.tf-config` with `main.tf` and `variables.tf`
//! - Secret `<name>.infra.tf-vars` with `terraform.tfvars`
//! - ConfigMap `<name>.infra.tf-state` with `terraform.tfstate`
//!
//! Each carries the `gardener.cloud/terraformer` finalizer so the state
//! cannot vanish while cloud resources still exist.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ConfigMap, Container, EnvVar, EnvVarSource, Pod, PodSpec, Secret, SecretKeySelector,
    SecretVolumeSource, Volume, VolumeMount,
};
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams};
use kube::{Client, ResourceExt};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use crate::controller::state::TerraformRawState;
use crate::controller::status::FIELD_MANAGER;
use crate::crd::Infrastructure;
use crate::error::{Error, Result};
use crate::gcp::credentials::{Credentials, SERVICE_ACCOUNT_JSON_KEY};

pub const TERRAFORMER_FINALIZER: &str = "gardener.cloud/terraformer";
pub const TERRAFORMER_PURPOSE: &str = "infra";
const LABEL_TERRAFORMER_NAME: &str = "terraformer.gardener.cloud/name";
const ANNOTATION_CONFIG_CHECKSUM: &str = "checksum/configuration";

pub const MAIN_TF_KEY: &str = "main.tf";
pub const VARIABLES_TF_KEY: &str = "variables.tf";
pub const TFVARS_KEY: &str = "terraform.tfvars";
pub const TFSTATE_KEY: &str = "terraform.tfstate";

/// Directory workload identity credentials are mounted to in terraformer pods
pub const WORKLOAD_IDENTITY_MOUNT_PATH: &str = "/var/run/secrets/gardener.cloud/workload-identity";

const POD_POLL_INTERVAL: Duration = Duration::from_secs(5);
const POD_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Rendered terraform configuration
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TerraformFiles {
    pub main: String,
    pub variables: String,
    pub tfvars: String,
}

impl TerraformFiles {
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.main.as_bytes());
        hasher.update(self.variables.as_bytes());
        hasher.update(self.tfvars.as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[async_trait]
pub trait Terraformer: Send + Sync {
    /// Store the configuration. `initial_state` replaces the stored state when given.
    async fn initialize_with(
        &self,
        files: &TerraformFiles,
        initial_state: Option<&TerraformRawState>,
    ) -> Result<()>;

    async fn apply(&self) -> Result<()>;

    async fn destroy(&self) -> Result<()>;

    async fn get_raw_state(&self) -> Result<TerraformRawState>;

    async fn get_state_outputs(&self, keys: &[&str]) -> Result<BTreeMap<String, String>> {
        self.get_raw_state().await?.outputs(keys)
    }

    async fn is_state_empty(&self) -> Result<bool> {
        self.get_raw_state().await?.is_empty()
    }

    async fn config_exists(&self) -> Result<bool>;

    /// Whether any configuration, variables or state object is still around,
    /// including ones held back by the terraformer finalizer
    async fn leftovers_exist(&self) -> Result<bool>;

    /// Delete the configuration, variables and state objects
    async fn cleanup_configuration(&self) -> Result<()>;

    /// Drop the terraformer finalizer from the configuration objects
    async fn remove_finalizers(&self) -> Result<()>;

    /// Delete leftover terraformer pods and wait until they are gone
    async fn ensure_cleaned_up(&self) -> Result<()>;
}

pub trait TerraformerFactory: Send + Sync {
    fn terraformer(
        &self,
        infra: &Infrastructure,
        credentials: &Credentials,
    ) -> Result<Arc<dyn Terraformer>>;
}

pub struct KubeTerraformerFactory {
    client: Client,
    image: String,
}

impl KubeTerraformerFactory {
    pub fn new(client: Client, image: &str) -> Self {
        Self {
            client,
            image: image.to_string(),
        }
    }
}

impl TerraformerFactory for KubeTerraformerFactory {
    fn terraformer(
        &self,
        infra: &Infrastructure,
        credentials: &Credentials,
    ) -> Result<Arc<dyn Terraformer>> {
        let namespace = infra
            .namespace()
            .ok_or_else(|| Error::ValidationError("infrastructure has no namespace".into()))?;
        Ok(Arc::new(KubeTerraformer {
            client: self.client.clone(),
            layout: TerraformerLayout {
                namespace,
                name: infra.name_any(),
                image: self.image.clone(),
                secret_name: infra.spec.secret_ref.name.clone(),
                token_mount: credentials.requires_token_mount(),
            },
            poll_interval: POD_POLL_INTERVAL,
            timeout: POD_TIMEOUT,
        }))
    }
}

/// Object names and pod template of one Infrastructure's terraformer
#[derive(Clone, Debug)]
struct TerraformerLayout {
    namespace: String,
    name: String,
    image: String,
    /// Cloud provider secret, referenced by the pods
    secret_name: String,
    token_mount: bool,
}

impl TerraformerLayout {
    fn prefix(&self) -> String {
        format!("{}.{}", self.name, TERRAFORMER_PURPOSE)
    }

    fn config_name(&self) -> String {
        format!("{}.tf-config", self.prefix())
    }

    fn variables_name(&self) -> String {
        format!("{}.tf-vars", self.prefix())
    }

    fn state_name(&self) -> String {
        format!("{}.tf-state", self.prefix())
    }

    fn meta(&self, name: String, checksum: Option<&str>) -> ObjectMeta {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_TERRAFORMER_NAME.to_string(), self.prefix());
        ObjectMeta {
            name: Some(name),
            namespace: Some(self.namespace.clone()),
            labels: Some(labels),
            annotations: checksum.map(|c| {
                BTreeMap::from([(ANNOTATION_CONFIG_CHECKSUM.to_string(), c.to_string())])
            }),
            finalizers: Some(vec![TERRAFORMER_FINALIZER.to_string()]),
            ..Default::default()
        }
    }

    /// Pod running terraform `command`, named with a random `suffix`
    fn pod(&self, command: &str, suffix: &str) -> Pod {
        let mut meta = self.meta(format!("{}.tf-{command}-{suffix}", self.prefix()), None);
        meta.finalizers = None;

        let mut env = vec![EnvVar {
            name: "TF_STATE_CONFIGMAP".to_string(),
            value: Some(self.state_name()),
            ..Default::default()
        }];
        let mut volumes = Vec::new();
        let mut mounts = Vec::new();
        if self.token_mount {
            volumes.push(Volume {
                name: "workload-identity".to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(self.secret_name.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            });
            mounts.push(VolumeMount {
                name: "workload-identity".to_string(),
                mount_path: WORKLOAD_IDENTITY_MOUNT_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            });
        } else {
            env.push(EnvVar {
                name: "TF_VAR_SERVICEACCOUNT".to_string(),
                value_from: Some(EnvVarSource {
                    secret_key_ref: Some(SecretKeySelector {
                        name: Some(self.secret_name.clone()),
                        key: SERVICE_ACCOUNT_JSON_KEY.to_string(),
                        optional: Some(false),
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }

        Pod {
            metadata: meta,
            spec: Some(PodSpec {
                restart_policy: Some("Never".to_string()),
                service_account_name: Some("terraformer".to_string()),
                termination_grace_period_seconds: Some(3600),
                containers: vec![Container {
                    name: "terraform".to_string(),
                    image: Some(self.image.clone()),
                    command: Some(vec![
                        "/terraformer".to_string(),
                        command.to_string(),
                        format!("--configuration-configmap-name={}", self.config_name()),
                        format!("--state-configmap-name={}", self.state_name()),
                        format!("--variables-secret-name={}", self.variables_name()),
                    ]),
                    env: Some(env),
                    volume_mounts: (!mounts.is_empty()).then_some(mounts),
                    termination_message_policy: Some("FallbackToLogsOnError".to_string()),
                    ..Default::default()
                }],
                volumes: (!volumes.is_empty()).then_some(volumes),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

pub struct KubeTerraformer {
    client: Client,
    layout: TerraformerLayout,
    poll_interval: Duration,
    timeout: Duration,
}

impl KubeTerraformer {
    fn config_maps(&self) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), &self.layout.namespace)
    }

    fn secrets(&self) -> Api<Secret> {
        Api::namespaced(self.client.clone(), &self.layout.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.layout.namespace)
    }

    /// Presence of the configuration, variables and state objects
    async fn existing_objects(&self) -> Result<[bool; 3]> {
        Ok([
            self.config_maps().get_opt(&self.layout.config_name()).await?.is_some(),
            self.secrets().get_opt(&self.layout.variables_name()).await?.is_some(),
            self.config_maps().get_opt(&self.layout.state_name()).await?.is_some(),
        ])
    }

    async fn apply_config_map(&self, cm: ConfigMap) -> Result<()> {
        let name = cm.name_any();
        self.config_maps()
            .patch(
                &name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&cm),
            )
            .await?;
        Ok(())
    }

    fn pod_for(&self, command: &str) -> Pod {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(5)
            .map(char::from)
            .collect::<String>()
            .to_lowercase();
        self.layout.pod(command, &suffix)
    }

    #[instrument(skip(self), fields(name = %self.layout.name, namespace = %self.layout.namespace))]
    async fn run(&self, command: &str) -> Result<()> {
        let pod = self.pod_for(command);
        let pod_name = pod.name_any();
        let pods = self.pods();
        pods.create(&Default::default(), &pod).await?;
        info!("Started terraformer pod {}", pod_name);

        let deadline = tokio::time::Instant::now() + self.timeout;
        let outcome = loop {
            if tokio::time::Instant::now() >= deadline {
                break Err(Error::Timeout(format!(
                    "terraformer pod {pod_name} did not finish within {:?}",
                    self.timeout
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
            let Some(current) = pods.get_opt(&pod_name).await? else {
                break Err(Error::TerraformerError(format!(
                    "terraformer pod {pod_name} disappeared"
                )));
            };
            let phase = current
                .status
                .as_ref()
                .and_then(|s| s.phase.clone())
                .unwrap_or_default();
            match phase.as_str() {
                "Succeeded" => break Ok(()),
                "Failed" => {
                    break Err(Error::TerraformerError(format!(
                        "terraform {command} failed: {}",
                        termination_message(&current)
                    )))
                }
                _ => debug!("Terraformer pod {} is {}", pod_name, phase),
            }
        };

        if let Err(e) = delete_ignore_missing(&pods, &pod_name).await {
            warn!("Failed to delete terraformer pod {}: {}", pod_name, e);
        }
        outcome
    }

    async fn remove_finalizer_from<K>(&self, api: &Api<K>, name: &str) -> Result<()>
    where
        K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
    {
        let Some(obj) = api.get_opt(name).await? else {
            return Ok(());
        };
        let finalizers: Vec<String> = obj
            .meta()
            .finalizers
            .clone()
            .unwrap_or_default()
            .into_iter()
            .filter(|f| f != TERRAFORMER_FINALIZER)
            .collect();
        let patch = json!({ "metadata": { "finalizers": finalizers } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

fn termination_message(pod: &Pod) -> String {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|cs| cs.first())
        .and_then(|c| c.state.as_ref())
        .and_then(|s| s.terminated.as_ref())
        .and_then(|t| t.message.clone().or_else(|| t.reason.clone()))
        .unwrap_or_else(|| "no termination message".to_string())
}

async fn delete_ignore_missing<K>(api: &Api<K>, name: &str) -> Result<()>
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match api.delete(name, &DeleteParams::background()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(Error::KubeError(e)),
    }
}

#[async_trait]
impl Terraformer for KubeTerraformer {
    #[instrument(skip(self, files, initial_state), fields(name = %self.layout.name, namespace = %self.layout.namespace))]
    async fn initialize_with(
        &self,
        files: &TerraformFiles,
        initial_state: Option<&TerraformRawState>,
    ) -> Result<()> {
        let checksum = files.checksum();
        self.apply_config_map(ConfigMap {
            metadata: self.layout.meta(self.layout.config_name(), Some(&checksum)),
            data: Some(BTreeMap::from([
                (MAIN_TF_KEY.to_string(), files.main.clone()),
                (VARIABLES_TF_KEY.to_string(), files.variables.clone()),
            ])),
            ..Default::default()
        })
        .await?;

        let vars = Secret {
            metadata: self.layout.meta(self.layout.variables_name(), Some(&checksum)),
            string_data: Some(BTreeMap::from([(
                TFVARS_KEY.to_string(),
                files.tfvars.clone(),
            )])),
            ..Default::default()
        };
        self.secrets()
            .patch(
                &self.layout.variables_name(),
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&vars),
            )
            .await?;

        let existing = self.config_maps().get_opt(&self.layout.state_name()).await?;
        match (initial_state, existing) {
            (Some(state), _) => {
                self.apply_config_map(ConfigMap {
                    metadata: self.layout.meta(self.layout.state_name(), None),
                    data: Some(BTreeMap::from([(TFSTATE_KEY.to_string(), state.tfstate()?)])),
                    ..Default::default()
                })
                .await?;
            }
            (None, None) => {
                self.apply_config_map(ConfigMap {
                    metadata: self.layout.meta(self.layout.state_name(), None),
                    data: Some(BTreeMap::from([(TFSTATE_KEY.to_string(), String::new())])),
                    ..Default::default()
                })
                .await?;
            }
            (None, Some(_)) => {}
        }
        debug!("Terraform configuration initialized");
        Ok(())
    }

    async fn apply(&self) -> Result<()> {
        self.run("apply").await
    }

    async fn destroy(&self) -> Result<()> {
        self.run("destroy").await
    }

    async fn get_raw_state(&self) -> Result<TerraformRawState> {
        let state = self
            .config_maps()
            .get_opt(&self.layout.state_name())
            .await?
            .and_then(|cm| cm.data)
            .and_then(|mut data| data.remove(TFSTATE_KEY))
            .unwrap_or_default();
        Ok(TerraformRawState::from_tfstate(&state))
    }

    async fn config_exists(&self) -> Result<bool> {
        Ok(self.existing_objects().await?.iter().all(|found| *found))
    }

    async fn leftovers_exist(&self) -> Result<bool> {
        Ok(self.existing_objects().await?.iter().any(|found| *found))
    }

    #[instrument(skip(self), fields(name = %self.layout.name, namespace = %self.layout.namespace))]
    async fn cleanup_configuration(&self) -> Result<()> {
        delete_ignore_missing(&self.config_maps(), &self.layout.config_name()).await?;
        delete_ignore_missing(&self.secrets(), &self.layout.variables_name()).await?;
        delete_ignore_missing(&self.config_maps(), &self.layout.state_name()).await?;
        Ok(())
    }

    async fn remove_finalizers(&self) -> Result<()> {
        self.remove_finalizer_from(&self.config_maps(), &self.layout.config_name())
            .await?;
        self.remove_finalizer_from(&self.secrets(), &self.layout.variables_name())
            .await?;
        self.remove_finalizer_from(&self.config_maps(), &self.layout.state_name())
            .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(name = %self.layout.name, namespace = %self.layout.namespace))]
    async fn ensure_cleaned_up(&self) -> Result<()> {
        let pods = self.pods();
        let selector = ListParams::default().labels(&format!("{LABEL_TERRAFORMER_NAME}={}", self.layout.prefix()));
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            let remaining = pods.list(&selector).await?;
            if remaining.items.is_empty() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "{} terraformer pods still exist",
                    remaining.items.len()
                )));
            }
            for pod in &remaining.items {
                delete_ignore_missing(&pods, &pod.name_any()).await?;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
