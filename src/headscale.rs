//! HTTP client for the Headscale coordinator
//!
//! Thin typed wrapper over the Headscale REST API (`/api/v1/...`) with
//! bearer-token auth. All calls are synchronous ureq requests bounded by the
//! configured timeout; async callers go through `spawn_blocking`.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::CoordinatorConfig;
use crate::error::RemoteError;

/// A node registered with the coordinator
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub ip_addresses: Vec<String>,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub last_seen: Option<String>,
}

/// A subnet route advertised by some node
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub node: Option<Node>,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub advertised: bool,
    #[serde(default)]
    pub enabled: bool,
}

impl Route {
    /// Id of the advertising node, empty when the coordinator omitted it
    pub fn node_id(&self) -> &str {
        self.node.as_ref().map(|n| n.id.as_str()).unwrap_or("")
    }
}

/// API key metadata (the secret is only returned at creation)
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKey {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub expiration: Option<String>,
}

/// A pre-auth key issued by the coordinator
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreAuthKey {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub reusable: bool,
    #[serde(default)]
    pub ephemeral: bool,
    #[serde(default)]
    pub expiration: Option<String>,
}

/// A coordinator user (namespace for nodes and keys)
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// Request body for `create_pre_auth_key`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePreAuthKeyRequest {
    pub user: String,
    pub reusable: bool,
    pub ephemeral: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub acl_tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodesResponse {
    #[serde(default)]
    nodes: Vec<Node>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeResponse {
    node: Node,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoutesResponse {
    #[serde(default)]
    routes: Vec<Route>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiKeysResponse {
    #[serde(default)]
    api_keys: Vec<ApiKey>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateApiKeyResponse {
    api_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PreAuthKeysResponse {
    #[serde(default)]
    pre_auth_keys: Vec<PreAuthKey>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PreAuthKeyResponse {
    pre_auth_key: PreAuthKey,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsersResponse {
    #[serde(default)]
    users: Vec<User>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserResponse {
    user: User,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PolicyResponse {
    #[serde(default)]
    policy: String,
}

/// Client for the Headscale coordinator API
pub struct HeadscaleClient {
    base_url: String,
    auth_key: String,
    agent: ureq::Agent,
}

impl HeadscaleClient {
    /// Create a new client from coordinator settings
    pub fn new(config: &CoordinatorConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs.max(1));
        let agent = ureq::AgentBuilder::new()
            .timeout(timeout)
            .build();

        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            auth_key: config.auth_key.clone(),
            agent,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/{}", self.base_url, path)
    }

    fn request(&self, method: &str, path: &str) -> ureq::Request {
        self.agent
            .request(method, &self.url(path))
            .set("Authorization", &format!("Bearer {}", self.auth_key))
            .set("Accept", "application/json")
    }

    fn map_err(err: ureq::Error) -> RemoteError {
        match err {
            ureq::Error::Status(status, response) => {
                let body = response.into_string().unwrap_or_default();
                RemoteError::Status { status, body }
            }
            ureq::Error::Transport(t) => RemoteError::Transport(t.to_string()),
        }
    }

    fn decode<T: serde::de::DeserializeOwned>(response: ureq::Response) -> Result<T, RemoteError> {
        response
            .into_json::<T>()
            .map_err(|e| RemoteError::Decode(e.to_string()))
    }

    fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, RemoteError> {
        let response = self.request("GET", path).call().map_err(Self::map_err)?;
        Self::decode(response)
    }

    fn post<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T, RemoteError> {
        let req = self.request("POST", path);
        let response = match body {
            Some(body) => req.send_json(body),
            None => req.call(),
        }
        .map_err(Self::map_err)?;
        Self::decode(response)
    }

    fn delete(&self, path: &str) -> Result<(), RemoteError> {
        self.request("DELETE", path).call().map_err(Self::map_err)?;
        Ok(())
    }

    // --- API keys ---

    pub fn list_api_keys(&self) -> Result<Vec<ApiKey>, RemoteError> {
        Ok(self.get::<ApiKeysResponse>("apikey")?.api_keys)
    }

    pub fn create_api_key(
        &self,
        expiration: Option<DateTime<Utc>>,
    ) -> Result<String, RemoteError> {
        let body = serde_json::json!({ "expiration": expiration });
        Ok(self.post::<CreateApiKeyResponse>("apikey", Some(body))?.api_key)
    }

    pub fn expire_api_key(&self, prefix: &str) -> Result<(), RemoteError> {
        let body = serde_json::json!({ "prefix": prefix });
        let _: serde_json::Value = self.post("apikey/expire", Some(body))?;
        Ok(())
    }

    pub fn delete_api_key(&self, prefix: &str) -> Result<(), RemoteError> {
        self.delete(&format!("apikey/{}", prefix))
    }

    /// Cheap reachability + credential probe
    pub fn check_api_key_health(&self) -> Result<(), RemoteError> {
        self.list_api_keys().map(|_| ())
    }

    // --- Nodes ---

    pub fn list_nodes(&self, user: Option<&str>) -> Result<Vec<Node>, RemoteError> {
        let path = match user {
            Some(user) => format!("node?user={}", user),
            None => "node".to_string(),
        };
        Ok(self.get::<NodesResponse>(&path)?.nodes)
    }

    pub fn get_node(&self, id: &str) -> Result<Node, RemoteError> {
        Ok(self.get::<NodeResponse>(&format!("node/{}", id))?.node)
    }

    pub fn delete_node(&self, id: &str) -> Result<(), RemoteError> {
        self.delete(&format!("node/{}", id))
    }

    pub fn expire_node(&self, id: &str) -> Result<Node, RemoteError> {
        Ok(self
            .post::<NodeResponse>(&format!("node/{}/expire", id), None)?
            .node)
    }

    pub fn rename_node(&self, id: &str, new_name: &str) -> Result<Node, RemoteError> {
        Ok(self
            .post::<NodeResponse>(&format!("node/{}/rename/{}", id, new_name), None)?
            .node)
    }

    pub fn register_node(&self, user: &str, key: &str) -> Result<Node, RemoteError> {
        Ok(self
            .post::<NodeResponse>(&format!("node/register?user={}&key={}", user, key), None)?
            .node)
    }

    pub fn get_node_routes(&self, id: &str) -> Result<Vec<Route>, RemoteError> {
        Ok(self
            .get::<RoutesResponse>(&format!("node/{}/routes", id))?
            .routes)
    }

    pub fn set_node_tags(&self, id: &str, tags: &[String]) -> Result<Node, RemoteError> {
        let body = serde_json::json!({ "tags": tags });
        Ok(self
            .post::<NodeResponse>(&format!("node/{}/tags", id), Some(body))?
            .node)
    }

    pub fn move_node(&self, id: &str, user: &str) -> Result<Node, RemoteError> {
        Ok(self
            .post::<NodeResponse>(&format!("node/{}/user?user={}", id, user), None)?
            .node)
    }

    /// Find a node by its mesh hostname
    pub fn find_node_by_name(&self, name: &str) -> Result<Option<Node>, RemoteError> {
        let nodes = self.list_nodes(None)?;
        Ok(nodes.into_iter().find(|n| n.name == name))
    }

    // --- Pre-auth keys ---

    pub fn list_pre_auth_keys(&self, user: &str) -> Result<Vec<PreAuthKey>, RemoteError> {
        Ok(self
            .get::<PreAuthKeysResponse>(&format!("preauthkey?user={}", user))?
            .pre_auth_keys)
    }

    pub fn create_pre_auth_key(
        &self,
        request: &CreatePreAuthKeyRequest,
    ) -> Result<PreAuthKey, RemoteError> {
        let body = serde_json::to_value(request)
            .map_err(|e| RemoteError::Decode(e.to_string()))?;
        Ok(self
            .post::<PreAuthKeyResponse>("preauthkey", Some(body))?
            .pre_auth_key)
    }

    pub fn expire_pre_auth_key(&self, user: &str, key: &str) -> Result<(), RemoteError> {
        let body = serde_json::json!({ "user": user, "key": key });
        let _: serde_json::Value = self.post("preauthkey/expire", Some(body))?;
        Ok(())
    }

    // --- Users ---

    pub fn list_users(&self) -> Result<Vec<User>, RemoteError> {
        Ok(self.get::<UsersResponse>("user")?.users)
    }

    pub fn create_user(&self, name: &str) -> Result<User, RemoteError> {
        let body = serde_json::json!({ "name": name });
        Ok(self.post::<UserResponse>("user", Some(body))?.user)
    }

    pub fn delete_user(&self, name: &str) -> Result<(), RemoteError> {
        self.delete(&format!("user/{}", name))
    }

    pub fn rename_user(&self, old_name: &str, new_name: &str) -> Result<User, RemoteError> {
        Ok(self
            .post::<UserResponse>(&format!("user/{}/rename/{}", old_name, new_name), None)?
            .user)
    }

    // --- Routes ---

    pub fn get_routes(&self) -> Result<Vec<Route>, RemoteError> {
        Ok(self.get::<RoutesResponse>("routes")?.routes)
    }

    pub fn delete_route(&self, id: &str) -> Result<(), RemoteError> {
        self.delete(&format!("routes/{}", id))
    }

    pub fn enable_route(&self, id: &str) -> Result<(), RemoteError> {
        let _: serde_json::Value = self.post(&format!("routes/{}/enable", id), None)?;
        Ok(())
    }

    pub fn disable_route(&self, id: &str) -> Result<(), RemoteError> {
        let _: serde_json::Value = self.post(&format!("routes/{}/disable", id), None)?;
        Ok(())
    }

    // --- Policy ---

    pub fn get_policy(&self) -> Result<String, RemoteError> {
        Ok(self.get::<PolicyResponse>("policy")?.policy)
    }

    pub fn set_policy(&self, policy: &str) -> Result<(), RemoteError> {
        let body = serde_json::json!({ "policy": policy });
        let req = self
            .agent
            .request("PUT", &self.url("policy"))
            .set("Authorization", &format!("Bearer {}", self.auth_key));
        req.send_json(body).map_err(Self::map_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client(server: &mockito::ServerGuard) -> HeadscaleClient {
        HeadscaleClient::new(&CoordinatorConfig {
            url: server.url(),
            auth_key: "hskey-test".to_string(),
            timeout_secs: 2,
            retries: 3,
        })
        .unwrap()
    }

    #[test]
    fn test_get_routes() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("GET", "/api/v1/routes")
            .match_header("authorization", "Bearer hskey-test")
            .with_status(200)
            .with_body(
                r#"{"routes":[
                    {"id":"1","prefix":"10.244.3.0/24","advertised":true,"enabled":false,
                     "node":{"id":"7","name":"worker-01","ipAddresses":["100.64.0.7"],"online":true}},
                    {"id":"2","prefix":"10.244.4.0/24","advertised":true,"enabled":true}
                ]}"#,
            )
            .create();

        let client = test_client(&server);
        let routes = client.get_routes().unwrap();
        mock.assert();

        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].prefix, "10.244.3.0/24");
        assert_eq!(routes[0].node_id(), "7");
        assert!(!routes[0].enabled);
        assert_eq!(routes[1].node_id(), "");
    }

    #[test]
    fn test_enable_route() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/api/v1/routes/42/enable")
            .with_status(200)
            .with_body("{}")
            .create();

        let client = test_client(&server);
        client.enable_route("42").unwrap();
        mock.assert();
    }

    #[test]
    fn test_non_2xx_surfaces_remote_error() {
        let mut server = mockito::Server::new();
        server
            .mock("GET", "/api/v1/routes")
            .with_status(500)
            .with_body("internal error")
            .create();

        let client = test_client(&server);
        let err = client.get_routes().unwrap_err();
        match err {
            RemoteError::Status { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "internal error");
            }
            other => panic!("expected status error, got {:?}", other),
        }
    }

    #[test]
    fn test_connection_refused_is_transport() {
        let client = HeadscaleClient::new(&CoordinatorConfig {
            url: "http://127.0.0.1:1".to_string(),
            auth_key: "hskey-test".to_string(),
            timeout_secs: 1,
            retries: 0,
        })
        .unwrap();

        match client.get_routes().unwrap_err() {
            RemoteError::Transport(_) => {}
            other => panic!("expected transport error, got {:?}", other),
        }
    }

    #[test]
    fn test_create_pre_auth_key() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/api/v1/preauthkey")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "user": "default",
                "reusable": false,
                "ephemeral": false,
                "aclTags": ["tag:node:worker-01"]
            })))
            .with_status(200)
            .with_body(r#"{"preAuthKey":{"id":"9","key":"hskey-auth-abc","expiration":"2026-08-02T00:00:00Z"}}"#)
            .create();

        let client = test_client(&server);
        let key = client
            .create_pre_auth_key(&CreatePreAuthKeyRequest {
                user: "default".to_string(),
                reusable: false,
                ephemeral: false,
                acl_tags: vec!["tag:node:worker-01".to_string()],
                expiration: Some(Utc::now() + chrono::Duration::hours(24)),
            })
            .unwrap();
        mock.assert();

        assert_eq!(key.key, "hskey-auth-abc");
        assert!(key.expiration.is_some());
    }

    #[test]
    fn test_list_nodes_with_user_filter() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("GET", "/api/v1/node?user=default")
            .with_status(200)
            .with_body(r#"{"nodes":[{"id":"1","name":"worker-01"}]}"#)
            .create();

        let client = test_client(&server);
        let nodes = client.list_nodes(Some("default")).unwrap();
        mock.assert();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].name, "worker-01");
    }

    #[test]
    fn test_find_node_by_name() {
        let mut server = mockito::Server::new();
        server
            .mock("GET", "/api/v1/node")
            .with_status(200)
            .with_body(r#"{"nodes":[{"id":"1","name":"a"},{"id":"2","name":"b"}]}"#)
            .create();

        let client = test_client(&server);
        let node = client.find_node_by_name("b").unwrap();
        assert_eq!(node.unwrap().id, "2");
        // Listing is fresh per call, so a miss is just None
        let missing = client.find_node_by_name("c").unwrap();
        assert!(missing.is_none());
    }
}
