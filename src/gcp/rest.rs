//! REST implementations of [`ComputeClient`] and [`IamClient`]
//!
//! Mutating compute calls return an Operation which is polled until it
//! reaches `DONE`. HTTP 404 on reads and deletes means "absent".

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::auth::{decode_response, TokenSource};
use super::compute::{Address, ComputeClient, Firewall, Network, Route, Router, Subnetwork};
use super::iam::{IamClient, ServiceAccount};
use crate::error::{Error, Result};

pub const COMPUTE_BASE_URL: &str = "https://compute.googleapis.com/compute/v1";
pub const IAM_BASE_URL: &str = "https://iam.googleapis.com/v1";

const OPERATION_POLL_INTERVAL: Duration = Duration::from_secs(2);
const OPERATION_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Operation {
    #[serde(default)]
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    self_link: String,
    #[serde(default)]
    http_error_status_code: Option<u16>,
    #[serde(default)]
    error: Option<OperationError>,
}

#[derive(Debug, Deserialize)]
struct OperationError {
    #[serde(default)]
    errors: Vec<OperationErrorItem>,
}

#[derive(Debug, Deserialize)]
struct OperationErrorItem {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

impl Operation {
    fn failure(&self) -> Option<Error> {
        let error = self.error.as_ref()?;
        let message = error
            .errors
            .iter()
            .map(|e| format!("{}: {}", e.code, e.message))
            .collect::<Vec<_>>()
            .join("; ");
        Some(Error::GcpApi {
            status: self.http_error_status_code.unwrap_or(400),
            message: format!("operation {} failed: {message}", self.name),
        })
    }
}

#[derive(Clone)]
struct Transport {
    http: reqwest::Client,
    tokens: Arc<dyn TokenSource>,
}

impl Transport {
    async fn request(&self, method: Method, url: &str) -> Result<reqwest::RequestBuilder> {
        let token = self.tokens.token().await?;
        Ok(self.http.request(method, url).bearer_auth(token))
    }

    async fn get_opt<T: DeserializeOwned>(&self, url: &str) -> Result<Option<T>> {
        let response = self.request(Method::GET, url).await?.send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        decode_response(response).await.map(Some)
    }
}

pub struct RestComputeClient {
    transport: Transport,
    project: String,
    base_url: String,
    poll_interval: Duration,
}

impl RestComputeClient {
    pub fn new(http: reqwest::Client, tokens: Arc<dyn TokenSource>, project: &str) -> Self {
        Self {
            transport: Transport { http, tokens },
            project: project.to_string(),
            base_url: COMPUTE_BASE_URL.to_string(),
            poll_interval: OPERATION_POLL_INTERVAL,
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/projects/{}/{}", self.base_url, self.project, path)
    }

    async fn list<T: DeserializeOwned>(&self, path: &str, filter: Option<&str>) -> Result<Vec<T>> {
        let url = self.url(path);
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut query: Vec<(&str, &str)> = Vec::new();
            if let Some(filter) = filter {
                query.push(("filter", filter));
            }
            if let Some(token) = page_token.as_deref() {
                query.push(("pageToken", token));
            }
            let response = self
                .transport
                .request(Method::GET, &url)
                .await?
                .query(&query)
                .send()
                .await?;
            let page: ListResponse<T> = decode_response(response).await?;
            items.extend(page.items);
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        Ok(items)
    }

    async fn mutate<B: Serialize + Sync>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<()> {
        let mut request = self.transport.request(method, &self.url(path)).await?;
        if let Some(body) = body {
            request = request.json(body);
        }
        let operation: Operation = decode_response(request.send().await?).await?;
        self.wait(operation).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let response = self
            .transport
            .request(Method::DELETE, &self.url(path))
            .await?
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!("{} already absent", path);
            return Ok(());
        }
        let operation: Operation = decode_response(response).await?;
        self.wait(operation).await
    }

    async fn wait(&self, mut operation: Operation) -> Result<()> {
        let deadline = tokio::time::Instant::now() + OPERATION_TIMEOUT;
        while operation.status != "DONE" {
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "operation {} did not finish within {:?}",
                    operation.name, OPERATION_TIMEOUT
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
            let response = self
                .transport
                .request(Method::GET, &operation.self_link)
                .await?
                .send()
                .await?;
            operation = decode_response(response).await?;
        }
        match operation.failure() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ComputeClient for RestComputeClient {
    #[instrument(skip(self))]
    async fn list_firewall_rules(&self, filter: Option<&str>) -> Result<Vec<Firewall>> {
        self.list("global/firewalls", filter).await
    }

    async fn get_firewall_rule(&self, name: &str) -> Result<Option<Firewall>> {
        self.transport
            .get_opt(&self.url(&format!("global/firewalls/{name}")))
            .await
    }

    async fn insert_firewall_rule(&self, firewall: &Firewall) -> Result<()> {
        self.mutate(Method::POST, "global/firewalls", Some(firewall))
            .await
    }

    async fn patch_firewall_rule(&self, firewall: &Firewall) -> Result<()> {
        self.mutate(
            Method::PATCH,
            &format!("global/firewalls/{}", firewall.name),
            Some(firewall),
        )
        .await
    }

    #[instrument(skip(self))]
    async fn delete_firewall_rule(&self, name: &str) -> Result<()> {
        self.delete(&format!("global/firewalls/{name}")).await
    }

    #[instrument(skip(self))]
    async fn list_routes(&self, filter: Option<&str>) -> Result<Vec<Route>> {
        self.list("global/routes", filter).await
    }

    #[instrument(skip(self))]
    async fn delete_route(&self, name: &str) -> Result<()> {
        self.delete(&format!("global/routes/{name}")).await
    }

    async fn get_external_addresses(&self, region: &str, names: &[&str]) -> Result<Vec<Address>> {
        let addresses: Vec<Address> = self
            .list(&format!("regions/{region}/addresses"), None)
            .await?;
        Ok(addresses
            .into_iter()
            .filter(Address::is_external)
            .filter(|a| names.is_empty() || names.contains(&a.name.as_str()))
            .collect())
    }

    async fn get_network(&self, name: &str) -> Result<Option<Network>> {
        self.transport
            .get_opt(&self.url(&format!("global/networks/{name}")))
            .await
    }

    async fn insert_network(&self, network: &Network) -> Result<()> {
        self.mutate(Method::POST, "global/networks", Some(network))
            .await
    }

    async fn delete_network(&self, name: &str) -> Result<()> {
        self.delete(&format!("global/networks/{name}")).await
    }

    async fn get_subnetwork(&self, region: &str, name: &str) -> Result<Option<Subnetwork>> {
        self.transport
            .get_opt(&self.url(&format!("regions/{region}/subnetworks/{name}")))
            .await
    }

    async fn insert_subnetwork(&self, region: &str, subnetwork: &Subnetwork) -> Result<()> {
        self.mutate(
            Method::POST,
            &format!("regions/{region}/subnetworks"),
            Some(subnetwork),
        )
        .await
    }

    async fn patch_subnetwork(&self, region: &str, subnetwork: &Subnetwork) -> Result<()> {
        self.mutate(
            Method::PATCH,
            &format!("regions/{region}/subnetworks/{}", subnetwork.name),
            Some(subnetwork),
        )
        .await
    }

    async fn delete_subnetwork(&self, region: &str, name: &str) -> Result<()> {
        self.delete(&format!("regions/{region}/subnetworks/{name}"))
            .await
    }

    async fn get_router(&self, region: &str, name: &str) -> Result<Option<Router>> {
        self.transport
            .get_opt(&self.url(&format!("regions/{region}/routers/{name}")))
            .await
    }

    async fn insert_router(&self, region: &str, router: &Router) -> Result<()> {
        self.mutate(
            Method::POST,
            &format!("regions/{region}/routers"),
            Some(router),
        )
        .await
    }

    async fn patch_router(&self, region: &str, router: &Router) -> Result<()> {
        self.mutate(
            Method::PATCH,
            &format!("regions/{region}/routers/{}", router.name),
            Some(router),
        )
        .await
    }

    async fn delete_router(&self, region: &str, name: &str) -> Result<()> {
        self.delete(&format!("regions/{region}/routers/{name}"))
            .await
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateServiceAccountRequest<'a> {
    account_id: &'a str,
    service_account: CreateServiceAccountBody<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateServiceAccountBody<'a> {
    display_name: &'a str,
}

pub struct RestIamClient {
    transport: Transport,
    project: String,
    base_url: String,
}

impl RestIamClient {
    pub fn new(http: reqwest::Client, tokens: Arc<dyn TokenSource>, project: &str) -> Self {
        Self {
            transport: Transport { http, tokens },
            project: project.to_string(),
            base_url: IAM_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn url(&self, suffix: &str) -> String {
        format!(
            "{}/projects/{}/serviceAccounts{}",
            self.base_url, self.project, suffix
        )
    }
}

#[async_trait]
impl IamClient for RestIamClient {
    async fn get_service_account(&self, email: &str) -> Result<Option<ServiceAccount>> {
        self.transport.get_opt(&self.url(&format!("/{email}"))).await
    }

    #[instrument(skip(self))]
    async fn create_service_account(
        &self,
        account_id: &str,
        display_name: &str,
    ) -> Result<ServiceAccount> {
        let response = self
            .transport
            .request(Method::POST, &self.url(""))
            .await?
            .json(&CreateServiceAccountRequest {
                account_id,
                service_account: CreateServiceAccountBody { display_name },
            })
            .send()
            .await?;
        decode_response(response).await
    }

    #[instrument(skip(self))]
    async fn delete_service_account(&self, email: &str) -> Result<()> {
        let response = self
            .transport
            .request(Method::DELETE, &self.url(&format!("/{email}")))
            .await?
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        let _: serde_json::Value = decode_response(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct StaticToken;

    #[async_trait]
    impl TokenSource for StaticToken {
        async fn token(&self) -> Result<String> {
            Ok("test-token".to_string())
        }
    }

    fn compute(server: &MockServer) -> RestComputeClient {
        RestComputeClient::new(reqwest::Client::new(), Arc::new(StaticToken), "my-project")
            .with_base_url(&server.uri())
            .with_poll_interval(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_list_firewalls_follows_pages() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/projects/my-project/global/firewalls"))
            .and(query_param("pageToken", "next"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [{"name": "k8s-fw-b", "network": "projects/my-project/global/networks/vpc"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/projects/my-project/global/firewalls"))
            .and(header("authorization", "Bearer test-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [{"name": "k8s-fw-a", "network": "projects/my-project/global/networks/vpc"}],
                "nextPageToken": "next"
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        let rules = compute(&server).list_firewall_rules(None).await.unwrap();
        let names: Vec<_> = rules.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["k8s-fw-a", "k8s-fw-b"]);
    }

    #[tokio::test]
    async fn test_get_missing_network_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/projects/my-project/global/networks/absent"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        assert!(compute(&server).get_network("absent").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_missing_route_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/projects/my-project/global/routes/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        compute(&server).delete_route("gone").await.unwrap();
    }

    #[tokio::test]
    async fn test_pending_operation_is_polled() {
        let server = MockServer::start().await;
        let op_link = format!("{}/projects/my-project/global/operations/op-1", server.uri());
        Mock::given(method("POST"))
            .and(path("/projects/my-project/global/networks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "op-1", "status": "RUNNING", "selfLink": op_link
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/projects/my-project/global/operations/op-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "op-1", "status": "DONE", "selfLink": op_link
            })))
            .expect(1)
            .mount(&server)
            .await;

        compute(&server)
            .insert_network(&Network {
                name: "vpc".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_failed_operation_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/projects/my-project/global/networks/vpc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "op-2",
                "status": "DONE",
                "httpErrorStatusCode": 400,
                "error": {"errors": [{"code": "RESOURCE_IN_USE_BY_ANOTHER_RESOURCE", "message": "The network resource is already being used by 'subnet'"}]}
            })))
            .mount(&server)
            .await;

        let err = compute(&server).delete_network("vpc").await.unwrap_err();
        assert!(err.to_string().contains("already being used"));
    }

    #[tokio::test]
    async fn test_external_addresses_are_filtered_by_name() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/projects/my-project/regions/europe-west1/addresses"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [
                    {"name": "ip-a", "address": "34.1.1.1", "addressType": "EXTERNAL"},
                    {"name": "ip-b", "address": "34.1.1.2"},
                    {"name": "int", "address": "10.0.0.5", "addressType": "INTERNAL"}
                ]
            })))
            .mount(&server)
            .await;

        let client = compute(&server);
        let all = client.get_external_addresses("europe-west1", &[]).await.unwrap();
        assert_eq!(all.len(), 2);
        let named = client
            .get_external_addresses("europe-west1", &["ip-b"])
            .await
            .unwrap();
        assert_eq!(named[0].address, "34.1.1.2");
    }

    #[tokio::test]
    async fn test_iam_create_and_missing_get() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/projects/my-project/serviceAccounts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "projects/my-project/serviceAccounts/shoot--dev--a@my-project.iam.gserviceaccount.com",
                "email": "shoot--dev--a@my-project.iam.gserviceaccount.com",
                "displayName": "shoot--dev--a"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/projects/my-project/serviceAccounts/none@my-project.iam.gserviceaccount.com"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let iam = RestIamClient::new(reqwest::Client::new(), Arc::new(StaticToken), "my-project")
            .with_base_url(&server.uri());
        let sa = iam
            .create_service_account("shoot--dev--a", "shoot--dev--a")
            .await
            .unwrap();
        assert_eq!(sa.email, "shoot--dev--a@my-project.iam.gserviceaccount.com");
        assert!(iam
            .get_service_account("none@my-project.iam.gserviceaccount.com")
            .await
            .unwrap()
            .is_none());
    }
}
