//! In-memory cloud used by unit tests

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::compute::{Address, ComputeClient, Firewall, Network, Route, Router, Subnetwork};
use super::iam::{service_account_email, IamClient, ServiceAccount};
use super::{CloudClientFactory, Credentials};
use crate::error::{Error, Result};

#[derive(Default)]
pub struct CloudState {
    pub firewalls: BTreeMap<String, Firewall>,
    pub routes: BTreeMap<String, Route>,
    pub addresses: Vec<Address>,
    pub networks: BTreeMap<String, Network>,
    pub subnetworks: BTreeMap<String, Subnetwork>,
    pub routers: BTreeMap<String, Router>,
    pub service_accounts: BTreeMap<String, ServiceAccount>,
    /// Every call in order, e.g. `delete_route:k8s-route-a`
    pub calls: Vec<String>,
    /// Remaining injected failures per operation name
    pub failures: HashMap<String, usize>,
}

/// Shared fake project backing both [`ComputeClient`] and [`IamClient`]
#[derive(Clone, Default)]
pub struct FakeCloud {
    pub state: Arc<Mutex<CloudState>>,
    pub project: String,
}

impl FakeCloud {
    pub fn new(project: &str) -> Self {
        Self {
            state: Arc::default(),
            project: project.to_string(),
        }
    }

    /// Make the next `times` calls of `op` fail
    pub fn fail(&self, op: &str, times: usize) {
        self.lock().failures.insert(op.to_string(), times);
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn lock(&self) -> std::sync::MutexGuard<'_, CloudState> {
        self.state.lock().unwrap()
    }

    fn record(&self, op: &str, arg: &str) -> Result<std::sync::MutexGuard<'_, CloudState>> {
        let mut state = self.lock();
        state.calls.push(format!("{op}:{arg}"));
        if let Some(remaining) = state.failures.get_mut(op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::GcpApi {
                    status: 503,
                    message: format!("injected failure for {op}"),
                });
            }
        }
        Ok(state)
    }
}

fn key(region: &str, name: &str) -> String {
    format!("{region}/{name}")
}

#[async_trait]
impl ComputeClient for FakeCloud {
    async fn list_firewall_rules(&self, filter: Option<&str>) -> Result<Vec<Firewall>> {
        let state = self.record("list_firewall_rules", filter.unwrap_or(""))?;
        Ok(state.firewalls.values().cloned().collect())
    }

    async fn get_firewall_rule(&self, name: &str) -> Result<Option<Firewall>> {
        let state = self.record("get_firewall_rule", name)?;
        Ok(state.firewalls.get(name).cloned())
    }

    async fn insert_firewall_rule(&self, firewall: &Firewall) -> Result<()> {
        let mut state = self.record("insert_firewall_rule", &firewall.name)?;
        state.firewalls.insert(firewall.name.clone(), firewall.clone());
        Ok(())
    }

    async fn patch_firewall_rule(&self, firewall: &Firewall) -> Result<()> {
        let mut state = self.record("patch_firewall_rule", &firewall.name)?;
        state.firewalls.insert(firewall.name.clone(), firewall.clone());
        Ok(())
    }

    async fn delete_firewall_rule(&self, name: &str) -> Result<()> {
        let mut state = self.record("delete_firewall_rule", name)?;
        state.firewalls.remove(name);
        Ok(())
    }

    async fn list_routes(&self, filter: Option<&str>) -> Result<Vec<Route>> {
        let state = self.record("list_routes", filter.unwrap_or(""))?;
        Ok(state.routes.values().cloned().collect())
    }

    async fn delete_route(&self, name: &str) -> Result<()> {
        let mut state = self.record("delete_route", name)?;
        state.routes.remove(name);
        Ok(())
    }

    async fn get_external_addresses(&self, region: &str, names: &[&str]) -> Result<Vec<Address>> {
        let state = self.record("get_external_addresses", region)?;
        Ok(state
            .addresses
            .iter()
            .filter(|a| a.is_external())
            .filter(|a| names.is_empty() || names.contains(&a.name.as_str()))
            .cloned()
            .collect())
    }

    async fn get_network(&self, name: &str) -> Result<Option<Network>> {
        let state = self.record("get_network", name)?;
        Ok(state.networks.get(name).cloned())
    }

    async fn insert_network(&self, network: &Network) -> Result<()> {
        let mut state = self.record("insert_network", &network.name)?;
        let mut network = network.clone();
        network.self_link = format!("projects/{}/global/networks/{}", self.project, network.name);
        state.networks.insert(network.name.clone(), network);
        Ok(())
    }

    async fn delete_network(&self, name: &str) -> Result<()> {
        let mut state = self.record("delete_network", name)?;
        state.networks.remove(name);
        Ok(())
    }

    async fn get_subnetwork(&self, region: &str, name: &str) -> Result<Option<Subnetwork>> {
        let state = self.record("get_subnetwork", name)?;
        Ok(state.subnetworks.get(&key(region, name)).cloned())
    }

    async fn insert_subnetwork(&self, region: &str, subnetwork: &Subnetwork) -> Result<()> {
        let mut state = self.record("insert_subnetwork", &subnetwork.name)?;
        let mut subnetwork = subnetwork.clone();
        subnetwork.self_link = format!(
            "projects/{}/regions/{region}/subnetworks/{}",
            self.project, subnetwork.name
        );
        state
            .subnetworks
            .insert(key(region, &subnetwork.name), subnetwork);
        Ok(())
    }

    async fn patch_subnetwork(&self, region: &str, subnetwork: &Subnetwork) -> Result<()> {
        let mut state = self.record("patch_subnetwork", &subnetwork.name)?;
        state
            .subnetworks
            .insert(key(region, &subnetwork.name), subnetwork.clone());
        Ok(())
    }

    async fn delete_subnetwork(&self, region: &str, name: &str) -> Result<()> {
        let mut state = self.record("delete_subnetwork", name)?;
        state.subnetworks.remove(&key(region, name));
        Ok(())
    }

    async fn get_router(&self, region: &str, name: &str) -> Result<Option<Router>> {
        let state = self.record("get_router", name)?;
        Ok(state.routers.get(&key(region, name)).cloned())
    }

    async fn insert_router(&self, region: &str, router: &Router) -> Result<()> {
        let mut state = self.record("insert_router", &router.name)?;
        let mut router = router.clone();
        router.self_link = format!(
            "projects/{}/regions/{region}/routers/{}",
            self.project, router.name
        );
        state.routers.insert(key(region, &router.name), router);
        Ok(())
    }

    async fn patch_router(&self, region: &str, router: &Router) -> Result<()> {
        let mut state = self.record("patch_router", &router.name)?;
        state.routers.insert(key(region, &router.name), router.clone());
        Ok(())
    }

    async fn delete_router(&self, region: &str, name: &str) -> Result<()> {
        let mut state = self.record("delete_router", name)?;
        state.routers.remove(&key(region, name));
        Ok(())
    }
}

#[async_trait]
impl IamClient for FakeCloud {
    async fn get_service_account(&self, email: &str) -> Result<Option<ServiceAccount>> {
        let state = self.record("get_service_account", email)?;
        Ok(state.service_accounts.get(email).cloned())
    }

    async fn create_service_account(
        &self,
        account_id: &str,
        display_name: &str,
    ) -> Result<ServiceAccount> {
        let mut state = self.record("create_service_account", account_id)?;
        let email = service_account_email(account_id, &self.project);
        let sa = ServiceAccount {
            name: format!("projects/{}/serviceAccounts/{email}", self.project),
            email: email.clone(),
            display_name: display_name.to_string(),
        };
        state.service_accounts.insert(email, sa.clone());
        Ok(sa)
    }

    async fn delete_service_account(&self, email: &str) -> Result<()> {
        let mut state = self.record("delete_service_account", email)?;
        state.service_accounts.remove(email);
        Ok(())
    }
}

impl CloudClientFactory for FakeCloud {
    fn compute(&self, _credentials: &Credentials) -> Result<Arc<dyn ComputeClient>> {
        Ok(Arc::new(self.clone()))
    }

    fn iam(&self, _credentials: &Credentials) -> Result<Arc<dyn IamClient>> {
        Ok(Arc::new(self.clone()))
    }
}
