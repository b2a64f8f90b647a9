use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::DeleteOptions;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::Path;
use stowage_core::{Binding, ClusterView, Event, Node, Object, Pod, Result, StowageError};
use tracing::debug;

const ALREADY_ASSIGNED: &str = "is already assigned to node";
const BEING_DELETED: &str = "is being deleted";

/// HTTP client for the Kubernetes API server
pub struct ApiClient {
    base_url: String,
    client: Client,
    token: Option<String>,
}

/// The part of a Kubernetes list response the scheduler reads
#[derive(Debug, Deserialize)]
struct ItemList<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: Client::new(),
            token: None,
        }
    }

    /// Authenticate every request with a bearer token
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Authenticate with the token stored in `path`, e.g. a service account token
    pub fn with_token_file(self, path: &Path) -> Result<Self> {
        let token = std::fs::read_to_string(path).map_err(|e| {
            StowageError::internal_error(format!(
                "Failed to read token file {}: {}",
                path.display(),
                e
            ))
        })?;
        let token = token.trim();
        if token.is_empty() {
            return Err(StowageError::internal_error(format!(
                "Token file {} is empty",
                path.display()
            )));
        }
        Ok(self.with_token(token))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn pod_url(&self, namespace: &str, name: &str) -> String {
        format!(
            "{}/api/v1/namespaces/{}/pods/{}",
            self.base_url, namespace, name
        )
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let request = match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        request
            .send()
            .await
            .map_err(|e| StowageError::internal_error(format!("HTTP request failed: {}", e)))
    }

    async fn parse<T: DeserializeOwned>(resp: Response, what: &str) -> Result<T> {
        resp.json::<T>().await.map_err(|e| {
            StowageError::serialization_error(
                format!("Failed to parse {}: {}", what, e),
                Some(Box::new(e)),
            )
        })
    }

    /// Turn a non-success response into an error, mapping the bind and delete races
    async fn check(resp: Response, namespace: &str, name: &str) -> Result<Response> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Err(map_failure(status, &body, namespace, name))
    }
}

/// Map a failed API response to the error the scheduler reacts to
fn map_failure(status: StatusCode, body: &str, namespace: &str, name: &str) -> StowageError {
    if body.contains(ALREADY_ASSIGNED) {
        return StowageError::pod_already_bound(name, assigned_node(body));
    }
    if body.contains(BEING_DELETED) {
        return StowageError::pod_terminating(name);
    }
    if status == StatusCode::NOT_FOUND {
        return StowageError::pod_not_found(namespace, name);
    }
    StowageError::api_error(status.as_u16(), body.to_string())
}

/// Node named in an "already assigned" message, e.g. `... assigned to node "n1"`
fn assigned_node(body: &str) -> String {
    body.split_once(ALREADY_ASSIGNED)
        .map(|(_, rest)| rest.trim_start().trim_start_matches("\\\"").trim_start_matches('"'))
        .and_then(|rest| rest.split(['"', '\\']).next())
        .unwrap_or("")
        .to_string()
}

#[async_trait]
impl ClusterView for ApiClient {
    /// GET /api/v1/nodes
    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let url = format!("{}/api/v1/nodes", self.base_url);
        debug!("GET {}", url);

        let resp = self.send(self.client.get(&url)).await?;
        let resp = Self::check(resp, "", "nodes").await?;
        let list: ItemList<Node> = Self::parse(resp, "node list").await?;
        Ok(list.items)
    }

    /// GET /api/v1/pods
    async fn list_pods(&self) -> Result<Vec<Pod>> {
        let url = format!("{}/api/v1/pods", self.base_url);
        debug!("GET {}", url);

        let resp = self.send(self.client.get(&url)).await?;
        let resp = Self::check(resp, "", "pods").await?;
        let list: ItemList<Pod> = Self::parse(resp, "pod list").await?;
        Ok(list.items)
    }

    /// GET /api/v1/namespaces/{namespace}/pods/{name}
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        let url = self.pod_url(namespace, name);
        debug!("GET {}", url);

        let resp = self.send(self.client.get(&url)).await?;
        let resp = Self::check(resp, namespace, name).await?;
        Self::parse(resp, "pod").await
    }

    /// POST /api/v1/namespaces/{namespace}/pods/{name}/binding
    async fn bind(&self, namespace: &str, binding: &Binding) -> Result<()> {
        let name = binding.metadata.name.as_deref().unwrap_or("");
        let url = format!("{}/binding", self.pod_url(namespace, name));
        debug!("POST {}", url);

        let resp = self.send(self.client.post(&url).json(binding)).await?;
        Self::check(resp, namespace, name).await?;
        Ok(())
    }

    /// DELETE /api/v1/namespaces/{namespace}/pods/{name}
    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: i64,
    ) -> Result<()> {
        let url = format!(
            "{}?gracePeriodSeconds={}",
            self.pod_url(namespace, name),
            grace_period_seconds
        );
        debug!("DELETE {}", url);

        let options = DeleteOptions {
            grace_period_seconds: Some(grace_period_seconds),
            propagation_policy: Some("Foreground".to_string()),
            ..Default::default()
        };
        let resp = self.send(self.client.delete(&url).json(&options)).await?;
        Self::check(resp, namespace, name).await?;
        Ok(())
    }

    /// PUT /api/v1/namespaces/{namespace}/pods/{name}/status
    async fn update_pod_status(&self, pod: &Pod) -> Result<Pod> {
        let url = format!("{}/status", self.pod_url(pod.namespace(), pod.name()));
        debug!("PUT {}", url);

        let resp = self.send(self.client.put(&url).json(pod)).await?;
        let resp = Self::check(resp, pod.namespace(), pod.name()).await?;
        Self::parse(resp, "pod").await
    }

    /// POST /api/v1/namespaces/{namespace}/events
    async fn create_event(&self, namespace: &str, event: &Event) -> Result<()> {
        let url = format!("{}/api/v1/namespaces/{}/events", self.base_url, namespace);
        debug!("POST {}", url);

        let resp = self.send(self.client.post(&url).json(event)).await?;
        Self::check(resp, namespace, event.metadata.name.as_deref().unwrap_or("")).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ObjectReference;
    use std::io::Write;
    use stowage_core::ObjectMeta;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn make_binding(name: &str, node: &str) -> Binding {
        Binding {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            target: ObjectReference {
                kind: Some("Node".to_string()),
                name: Some(node.to_string()),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_map_failure() {
        let body = r#"{"kind":"Status","message":"Operation cannot be fulfilled on pods/binding \"ws-1\": pod ws-1 is already assigned to node \"node-2\"","code":409}"#;
        let err = map_failure(StatusCode::CONFLICT, body, "default", "ws-1");
        assert!(err.is_already_bound());
        assert_eq!(err.to_string(), "Pod ws-1 is already assigned to node node-2");

        let err = map_failure(
            StatusCode::CONFLICT,
            "pod ws-1 is being deleted, cannot be assigned to a host",
            "default",
            "ws-1",
        );
        assert!(err.is_terminating());

        let err = map_failure(StatusCode::NOT_FOUND, "{}", "default", "ws-1");
        assert!(err.is_not_found());

        let err = map_failure(StatusCode::FORBIDDEN, "forbidden", "default", "ws-1");
        assert!(matches!(err, StowageError::ApiError { status: 403, .. }));
    }

    #[test]
    fn test_assigned_node() {
        assert_eq!(assigned_node(r#"pod a is already assigned to node "n1""#), "n1");
        assert_eq!(assigned_node(r#"pod a is already assigned to node \"n1\""#), "n1");
        assert_eq!(assigned_node("something else"), "");
    }

    #[test]
    fn test_token_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "secret-token").unwrap();

        let client = ApiClient::new("http://localhost:8080/")
            .with_token_file(file.path())
            .unwrap();
        assert_eq!(client.token.as_deref(), Some("secret-token"));
        assert_eq!(client.base_url(), "http://localhost:8080");

        let empty = tempfile::NamedTempFile::new().unwrap();
        assert!(ApiClient::new("http://localhost").with_token_file(empty.path()).is_err());
    }

    #[tokio::test]
    async fn test_list_pods() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/pods"))
            .and(header("authorization", "Bearer t0ken"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "kind": "PodList",
                "apiVersion": "v1",
                "metadata": {"resourceVersion": "12"},
                "items": [
                    {"metadata": {"name": "ws-1", "namespace": "default"}},
                    {"metadata": {"name": "ws-2", "namespace": "default"}}
                ]
            })))
            .mount(&server)
            .await;

        let client = ApiClient::new(&server.uri()).with_token("t0ken");
        let pods = client.list_pods().await.unwrap();
        let names: Vec<&str> = pods.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["ws-1", "ws-2"]);
    }

    #[tokio::test]
    async fn test_bind_races() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/namespaces/default/pods/ws-1/binding"))
            .respond_with(ResponseTemplate::new(201).set_body_string("{}"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/namespaces/default/pods/ws-2/binding"))
            .respond_with(
                ResponseTemplate::new(409)
                    .set_body_string(r#"pod ws-2 is already assigned to node "node-1""#),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/namespaces/default/pods/ws-3/binding"))
            .respond_with(ResponseTemplate::new(409).set_body_string("pod ws-3 is being deleted"))
            .mount(&server)
            .await;

        let client = ApiClient::new(&server.uri());
        client.bind("default", &make_binding("ws-1", "node-1")).await.unwrap();

        let err = client
            .bind("default", &make_binding("ws-2", "node-2"))
            .await
            .unwrap_err();
        assert!(err.is_already_bound());

        let err = client
            .bind("default", &make_binding("ws-3", "node-2"))
            .await
            .unwrap_err();
        assert!(err.is_terminating());
    }

    #[tokio::test]
    async fn test_delete_pod_uses_foreground_propagation() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/v1/namespaces/default/pods/ghost-1"))
            .and(query_param("gracePeriodSeconds", "10"))
            .and(body_partial_json(serde_json::json!({
                "gracePeriodSeconds": 10,
                "propagationPolicy": "Foreground"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .expect(1)
            .mount(&server)
            .await;

        let client = ApiClient::new(&server.uri());
        client.delete_pod("default", "ghost-1", 10).await.unwrap();

        let err = client.delete_pod("default", "ghost-2", 10).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
