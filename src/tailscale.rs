//! Client for the local tailscaled LocalAPI
//!
//! HTTP/1.1 over the daemon's unix socket. Each call opens a fresh
//! connection; responses are small JSON bodies. The advertised-routes
//! setter replaces the full set, so callers merge before calling.

use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixStream;

use crate::error::RemoteError;

/// Authority used in request URIs; tailscaled ignores it.
const SOCKET_AUTHORITY: &str = "local-tailscaled.sock";

/// Daemon status subset the agent consumes
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Status {
    #[serde(rename = "BackendState", default)]
    pub backend_state: String,

    #[serde(rename = "Self", default)]
    pub self_node: SelfStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SelfStatus {
    #[serde(rename = "TailscaleIPs", default)]
    pub tailscale_ips: Vec<String>,

    #[serde(rename = "PublicKey", default)]
    pub public_key: String,

    #[serde(rename = "HostName", default)]
    pub host_name: String,
}

impl Status {
    pub fn is_running(&self) -> bool {
        self.backend_state == "Running"
    }

    pub fn needs_login(&self) -> bool {
        self.backend_state == "NeedsLogin"
    }

    /// First IPv4 mesh address, if the daemon has one
    pub fn mesh_ip(&self) -> Option<IpAddr> {
        self.self_node
            .tailscale_ips
            .iter()
            .filter_map(|s| s.parse::<IpAddr>().ok())
            .find(|ip| ip.is_ipv4())
    }

    pub fn has_ips(&self) -> bool {
        !self.self_node.tailscale_ips.is_empty()
    }
}

/// Daemon preferences subset the agent consumes
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Prefs {
    #[serde(rename = "AdvertiseRoutes", default)]
    pub advertise_routes: Vec<String>,

    #[serde(rename = "RouteAll", default)]
    pub route_all: bool,

    #[serde(rename = "CorpDNS", default)]
    pub corp_dns: bool,

    #[serde(rename = "ControlURL", default)]
    pub control_url: String,

    #[serde(rename = "Hostname", default)]
    pub hostname: String,

    #[serde(rename = "WantRunning", default)]
    pub want_running: bool,
}

/// Options for bringing the daemon up
#[derive(Debug, Clone)]
pub struct UpOptions {
    /// Pre-auth key; "auto" relies on existing login state
    pub auth_key: String,
    pub hostname: String,
    pub control_url: String,
    pub accept_routes: bool,
    pub shields_up: bool,
    pub accept_dns: bool,
}

#[derive(Debug, Serialize)]
struct UpdatePrefs<'a> {
    #[serde(rename = "WantRunning")]
    want_running: bool,
    #[serde(rename = "Hostname")]
    hostname: &'a str,
    #[serde(rename = "ControlURL")]
    control_url: &'a str,
    #[serde(rename = "RouteAll")]
    route_all: bool,
    #[serde(rename = "ShieldsUp")]
    shields_up: bool,
    #[serde(rename = "CorpDNS")]
    corp_dns: bool,
}

/// Client for the tailscaled unix socket
#[derive(Clone)]
pub struct TailscaleClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl TailscaleClient {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            timeout: Duration::from_secs(15),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Whether the daemon socket exists on disk
    pub fn socket_exists(&self) -> bool {
        self.socket_path.exists()
    }

    async fn roundtrip(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Bytes, RemoteError> {
        let fut = async {
            let stream = UnixStream::connect(&self.socket_path)
                .await
                .map_err(|e| RemoteError::Transport(e.to_string()))?;
            let io = TokioIo::new(stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|e| RemoteError::Transport(e.to_string()))?;
            tokio::spawn(async move {
                let _ = conn.await;
            });

            let builder = Request::builder()
                .method(method)
                .uri(path)
                .header(http::header::HOST, SOCKET_AUTHORITY);

            let request = match body {
                Some(body) => {
                    let bytes = serde_json::to_vec(&body)
                        .map_err(|e| RemoteError::Decode(e.to_string()))?;
                    builder
                        .header(http::header::CONTENT_TYPE, "application/json")
                        .body(Full::new(Bytes::from(bytes)))
                }
                None => builder.body(Full::new(Bytes::new())),
            }
            .map_err(|e| RemoteError::Transport(e.to_string()))?;

            let response = sender
                .send_request(request)
                .await
                .map_err(|e| RemoteError::Transport(e.to_string()))?;

            let status = response.status();
            let bytes = response
                .into_body()
                .collect()
                .await
                .map_err(|e| RemoteError::Transport(e.to_string()))?
                .to_bytes();

            if !status.is_success() {
                return Err(RemoteError::Status {
                    status: status.as_u16(),
                    body: String::from_utf8_lossy(&bytes).to_string(),
                });
            }
            Ok(bytes)
        };

        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| RemoteError::Transport("localapi request timed out".to_string()))?
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, RemoteError> {
        let bytes = self.roundtrip(Method::GET, path, None).await?;
        serde_json::from_slice(&bytes).map_err(|e| RemoteError::Decode(e.to_string()))
    }

    /// Current backend state, self IPs and public key
    pub async fn get_status(&self) -> Result<Status, RemoteError> {
        self.get_json("/localapi/v0/status").await
    }

    /// Current daemon preferences
    pub async fn get_prefs(&self) -> Result<Prefs, RemoteError> {
        self.get_json("/localapi/v0/prefs").await
    }

    /// Bring the daemon up (login if needed, apply preferences).
    pub async fn up_with_options(&self, options: &UpOptions) -> Result<(), RemoteError> {
        let prefs = UpdatePrefs {
            want_running: true,
            hostname: &options.hostname,
            control_url: &options.control_url,
            route_all: options.accept_routes,
            shields_up: options.shields_up,
            corp_dns: options.accept_dns,
        };
        let mut body = serde_json::json!({ "UpdatePrefs": prefs });
        if options.auth_key != "auto" && !options.auth_key.is_empty() {
            body["AuthKey"] = serde_json::Value::String(options.auth_key.clone());
        }

        self.roundtrip(Method::POST, "/localapi/v0/start", Some(body))
            .await?;
        Ok(())
    }

    /// Enable accepting subnet routes from peers
    pub async fn accept_routes(&self) -> Result<(), RemoteError> {
        let body = serde_json::json!({
            "RouteAllSet": true,
            "RouteAll": true,
        });
        self.roundtrip(Method::PATCH, "/localapi/v0/prefs", Some(body))
            .await?;
        Ok(())
    }

    /// Replace the full advertised-routes set. Callers are responsible for
    /// merging with the existing set first.
    pub async fn advertise_routes(&self, routes: &[String]) -> Result<(), RemoteError> {
        let body = serde_json::json!({
            "AdvertiseRoutesSet": true,
            "AdvertiseRoutes": routes,
        });
        self.roundtrip(Method::PATCH, "/localapi/v0/prefs", Some(body))
            .await?;
        Ok(())
    }

    /// Mesh IPv4 address of this node
    pub async fn get_ip(&self) -> Result<IpAddr> {
        let status = self.get_status().await?;
        status
            .mesh_ip()
            .context("daemon has no mesh IPv4 address yet")
    }

    /// Physical address of this machine, determined by the kernel's route
    /// selection toward an external address. No packet is sent.
    pub fn get_local_ip() -> Result<IpAddr> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0")
            .context("failed to bind probe socket")?;
        socket
            .connect("8.8.8.8:80")
            .context("failed to select local address")?;
        Ok(socket.local_addr().context("no local address")?.ip())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::body::Incoming;
    use hyper::service::service_fn;
    use hyper::Response;
    use std::sync::{Arc, Mutex};
    use tokio::net::UnixListener;

    /// Minimal LocalAPI double: records requests, returns canned bodies.
    struct FakeDaemon;

    impl FakeDaemon {
        async fn serve(socket_path: PathBuf) -> Arc<Mutex<Vec<(String, String, String)>>> {
            let listener = UnixListener::bind(&socket_path).unwrap();
            let requests: Arc<Mutex<Vec<(String, String, String)>>> =
                Arc::new(Mutex::new(Vec::new()));
            let recorded = requests.clone();

            tokio::spawn(async move {
                loop {
                    let (stream, _) = match listener.accept().await {
                        Ok(pair) => pair,
                        Err(_) => return,
                    };
                    let recorded = recorded.clone();
                    tokio::spawn(async move {
                        let service = service_fn(move |req: Request<Incoming>| {
                            let recorded = recorded.clone();
                            async move {
                                let method = req.method().to_string();
                                let path = req.uri().path().to_string();
                                let body = req.into_body().collect().await.unwrap().to_bytes();
                                let body = String::from_utf8_lossy(&body).to_string();

                                let reply = match path.as_str() {
                                    "/localapi/v0/status" => {
                                        r#"{"BackendState":"Running",
                                            "Self":{"TailscaleIPs":["100.64.0.7","fd7a::7"],
                                                    "PublicKey":"nodekey:abc","HostName":"worker-01"}}"#
                                    }
                                    "/localapi/v0/prefs" if method == "GET" => {
                                        r#"{"AdvertiseRoutes":["10.244.3.0/24"],"RouteAll":true,
                                            "CorpDNS":false,"ControlURL":"https://hs.example.com",
                                            "Hostname":"worker-01","WantRunning":true}"#
                                    }
                                    _ => "{}",
                                };
                                recorded.lock().unwrap().push((method, path, body));
                                Ok::<_, std::convert::Infallible>(Response::new(Full::new(
                                    Bytes::from(reply),
                                )))
                            }
                        });
                        let _ = hyper::server::conn::http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await;
                    });
                }
            });

            requests
        }
    }

    #[tokio::test]
    async fn test_get_status() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("tailscaled.sock");
        let _requests = FakeDaemon::serve(socket.clone()).await;

        let client = TailscaleClient::new(&socket);
        let status = client.get_status().await.unwrap();

        assert!(status.is_running());
        assert_eq!(status.self_node.public_key, "nodekey:abc");
        assert_eq!(status.mesh_ip().unwrap().to_string(), "100.64.0.7");
    }

    #[tokio::test]
    async fn test_get_prefs() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("tailscaled.sock");
        let _requests = FakeDaemon::serve(socket.clone()).await;

        let client = TailscaleClient::new(&socket);
        let prefs = client.get_prefs().await.unwrap();

        assert_eq!(prefs.advertise_routes, vec!["10.244.3.0/24"]);
        assert!(prefs.route_all);
        assert!(!prefs.corp_dns);
    }

    #[tokio::test]
    async fn test_advertise_routes_sends_full_set() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("tailscaled.sock");
        let requests = FakeDaemon::serve(socket.clone()).await;

        let client = TailscaleClient::new(&socket);
        client
            .advertise_routes(&["10.244.3.0/24".to_string(), "10.244.7.0/24".to_string()])
            .await
            .unwrap();

        let recorded = requests.lock().unwrap();
        let (method, path, body) = recorded.last().unwrap();
        assert_eq!(method, "PATCH");
        assert_eq!(path, "/localapi/v0/prefs");
        assert!(body.contains("AdvertiseRoutesSet"));
        assert!(body.contains("10.244.7.0/24"));
        assert!(body.contains("10.244.3.0/24"));
    }

    #[tokio::test]
    async fn test_up_with_auto_key_omits_auth_key() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("tailscaled.sock");
        let requests = FakeDaemon::serve(socket.clone()).await;

        let client = TailscaleClient::new(&socket);
        client
            .up_with_options(&UpOptions {
                auth_key: "auto".to_string(),
                hostname: "worker-01".to_string(),
                control_url: "https://hs.example.com".to_string(),
                accept_routes: true,
                shields_up: false,
                accept_dns: false,
            })
            .await
            .unwrap();

        let recorded = requests.lock().unwrap();
        let (method, path, body) = recorded.last().unwrap();
        assert_eq!(method, "POST");
        assert_eq!(path, "/localapi/v0/start");
        assert!(!body.contains("AuthKey"));
        assert!(body.contains("worker-01"));
    }

    #[tokio::test]
    async fn test_up_with_real_key_sends_auth_key() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("tailscaled.sock");
        let requests = FakeDaemon::serve(socket.clone()).await;

        let client = TailscaleClient::new(&socket);
        client
            .up_with_options(&UpOptions {
                auth_key: "hskey-auth-abc".to_string(),
                hostname: "worker-01".to_string(),
                control_url: "https://hs.example.com".to_string(),
                accept_routes: true,
                shields_up: false,
                accept_dns: false,
            })
            .await
            .unwrap();

        let recorded = requests.lock().unwrap();
        let (_, _, body) = recorded.last().unwrap();
        assert!(body.contains("hskey-auth-abc"));
    }

    #[tokio::test]
    async fn test_missing_socket_is_transport_error() {
        let client = TailscaleClient::new("/nonexistent/tailscaled.sock")
            .with_timeout(Duration::from_secs(1));
        match client.get_status().await.unwrap_err() {
            RemoteError::Transport(_) => {}
            other => panic!("expected transport error, got {:?}", other),
        }
    }
}
