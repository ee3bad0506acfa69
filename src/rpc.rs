//! RPC server for the CNI binary
//!
//! HTTP/1.1 over a unix socket, one endpoint: POST /cni. The one-shot CNI
//! executable calls it during Pod setup/teardown; per-type callbacks are
//! injected so the daemon can wire route validation in without the server
//! knowing about coordinators.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::service::Service;

/// Request types the server recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestType {
    Allocate,
    Release,
    Status,
    PodReady,
}

impl RequestType {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "allocate" => Some(RequestType::Allocate),
            "release" => Some(RequestType::Release),
            "status" => Some(RequestType::Status),
            "pod_ready" => Some(RequestType::PodReady),
            _ => None,
        }
    }
}

/// Request body sent by the CNI binary
#[derive(Debug, Clone, Deserialize)]
pub struct CniRequest {
    #[serde(rename = "type")]
    pub request_type: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub pod_name: String,
    #[serde(default)]
    pub container_id: String,
    #[serde(default)]
    pub pod_ip: Option<String>,
    #[serde(default)]
    pub local_pool: Option<String>,
}

/// Response body returned for every recognized request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CniResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl CniResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
            data: None,
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            data: None,
        }
    }
}

/// Validates that a Pod CIDR is advertised and enabled before handing it to
/// a Pod. Implemented by the Pod-CIDR monitor.
#[async_trait]
pub trait RouteValidator: Send + Sync {
    async fn validate_route(&self, cidr: &str) -> Result<()>;
}

type CallbackFn = Arc<
    dyn Fn(CniRequest) -> futures::future::BoxFuture<'static, CniResponse> + Send + Sync,
>;

/// Per-type callbacks; unset entries use the defaults.
#[derive(Default, Clone)]
pub struct Callbacks {
    pub allocate: Option<CallbackFn>,
    pub release: Option<CallbackFn>,
    pub status: Option<CallbackFn>,
    pub pod_ready: Option<CallbackFn>,
}

struct Inner {
    callbacks: Callbacks,
    validator: Option<Arc<dyn RouteValidator>>,
}

impl Inner {
    async fn dispatch(&self, request: CniRequest) -> CniResponse {
        let Some(request_type) = RequestType::parse(&request.request_type) else {
            return CniResponse::fail(format!(
                "unknown request type: {}",
                request.request_type
            ));
        };

        let custom = match request_type {
            RequestType::Allocate => &self.callbacks.allocate,
            RequestType::Release => &self.callbacks.release,
            RequestType::Status => &self.callbacks.status,
            RequestType::PodReady => &self.callbacks.pod_ready,
        };
        if let Some(callback) = custom {
            return callback(request).await;
        }

        match request_type {
            RequestType::Allocate => self.default_allocate(&request).await,
            RequestType::PodReady => self.default_pod_ready(&request).await,
            RequestType::Release | RequestType::Status => CniResponse::ok(),
        }
    }

    /// Allocation fails hard when the pool's route is not healthy.
    async fn default_allocate(&self, request: &CniRequest) -> CniResponse {
        if let (Some(validator), Some(pool)) = (&self.validator, &request.local_pool) {
            if let Err(e) = validator.validate_route(pool).await {
                return CniResponse::fail(format!(
                    "route validation failed for {}: {:#}",
                    pool, e
                ));
            }
        }
        CniResponse::ok()
    }

    /// Pod readiness must not depend on cloud propagation: log and succeed.
    async fn default_pod_ready(&self, request: &CniRequest) -> CniResponse {
        if let (Some(validator), Some(pool)) = (&self.validator, &request.local_pool) {
            if let Err(e) = validator.validate_route(pool).await {
                warn!(
                    "Route validation failed for {} during pod_ready of {}/{}: {:#}",
                    pool, request.namespace, request.pod_name, e
                );
            }
        }
        CniResponse::ok()
    }
}

/// Strip stray URL schemes and force an absolute socket path.
pub fn normalize_socket_path(raw: &str) -> Result<PathBuf> {
    let mut path = raw.trim();
    for scheme in ["unix://", "http://", "https://"] {
        if let Some(stripped) = path.strip_prefix(scheme) {
            path = stripped;
        }
    }
    if path.is_empty() {
        anyhow::bail!("socket path is empty");
    }
    let path = Path::new(path);
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()
            .context("cannot resolve relative socket path")?
            .join(path))
    }
}

/// The embedded RPC server, driven as a service.
pub struct RpcServer {
    socket_path: PathBuf,
    inner: Arc<Inner>,
    running: AtomicBool,
    cancel: Mutex<Option<CancellationToken>>,
}

impl RpcServer {
    pub fn new(
        socket_path: &str,
        callbacks: Callbacks,
        validator: Option<Arc<dyn RouteValidator>>,
    ) -> Result<Self> {
        Ok(Self {
            socket_path: normalize_socket_path(socket_path)?,
            inner: Arc::new(Inner {
                callbacks,
                validator,
            }),
            running: AtomicBool::new(false),
            cancel: Mutex::new(None),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    async fn handle(
        inner: Arc<Inner>,
        request: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
        if request.uri().path() != "/cni" {
            return Ok(plain_response(StatusCode::NOT_FOUND, "not found"));
        }
        if request.method() != Method::POST {
            return Ok(plain_response(
                StatusCode::METHOD_NOT_ALLOWED,
                "only POST is supported",
            ));
        }

        let body = match request.into_body().collect().await {
            Ok(body) => body.to_bytes(),
            Err(e) => {
                return Ok(plain_response(
                    StatusCode::BAD_REQUEST,
                    &format!("failed to read body: {}", e),
                ))
            }
        };

        let cni_request: CniRequest = match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(e) => {
                return Ok(plain_response(
                    StatusCode::BAD_REQUEST,
                    &format!("invalid JSON body: {}", e),
                ))
            }
        };

        debug!(
            "CNI request type={} pod={}/{}",
            cni_request.request_type, cni_request.namespace, cni_request.pod_name
        );
        let response = inner.dispatch(cni_request).await;
        let json = serde_json::to_vec(&response).unwrap_or_else(|_| b"{}".to_vec());

        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(json)))
            .unwrap_or_else(|_| Response::new(Full::new(Bytes::new()))))
    }

    async fn accept_loop(
        listener: UnixListener,
        inner: Arc<Inner>,
        cancel: CancellationToken,
    ) {
        loop {
            let (stream, _) = tokio::select! {
                _ = cancel.cancelled() => return,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("RPC accept failed: {}", e);
                        continue;
                    }
                },
            };

            let inner = inner.clone();
            tokio::spawn(async move {
                let service =
                    service_fn(move |request| Self::handle(inner.clone(), request));
                if let Err(e) = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    debug!("RPC connection ended with error: {}", e);
                }
            });
        }
    }
}

fn plain_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(message.to_string())))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

#[async_trait]
impl Service for RpcServer {
    fn name(&self) -> &str {
        "rpc-server"
    }

    async fn start(&self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(parent) = self.socket_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        // A stale socket from a previous run would make bind fail
        if self.socket_path.exists() {
            tokio::fs::remove_file(&self.socket_path)
                .await
                .with_context(|| {
                    format!("failed to remove stale socket {}", self.socket_path.display())
                })?;
        }

        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("failed to bind {}", self.socket_path.display()))?;
        info!("RPC server listening on {}", self.socket_path.display());

        let cancel = CancellationToken::new();
        tokio::spawn(Self::accept_loop(
            listener,
            self.inner.clone(),
            cancel.clone(),
        ));
        *self.cancel.lock().await = Some(cancel);
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(cancel) = self.cancel.lock().await.take() {
            cancel.cancel();
        }
        let _ = tokio::fs::remove_file(&self.socket_path).await;
        info!("RPC server stopped");
        Ok(())
    }

    // The socket path and callbacks are fixed for the process lifetime, so
    // there is nothing to pick up on reload.
    async fn reload(&self) -> Result<()> {
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixStream;

    struct AlwaysFailValidator;

    #[async_trait]
    impl RouteValidator for AlwaysFailValidator {
        async fn validate_route(&self, cidr: &str) -> Result<()> {
            anyhow::bail!("route {} not propagated", cidr)
        }
    }

    async fn roundtrip(
        socket: &Path,
        method: Method,
        path: &str,
        body: &str,
    ) -> (StatusCode, String) {
        let stream = UnixStream::connect(socket).await.unwrap();
        let (mut sender, conn) =
            hyper::client::conn::http1::handshake(TokioIo::new(stream))
                .await
                .unwrap();
        tokio::spawn(conn);

        let request = Request::builder()
            .method(method)
            .uri(path)
            .header(http::header::HOST, "localhost")
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap();
        let response = sender.send_request(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8_lossy(&bytes).to_string())
    }

    async fn start_server(
        dir: &tempfile::TempDir,
        validator: Option<Arc<dyn RouteValidator>>,
    ) -> RpcServer {
        let socket = dir.path().join("headcni.sock");
        let server =
            RpcServer::new(socket.to_str().unwrap(), Callbacks::default(), validator).unwrap();
        server.start().await.unwrap();
        server
    }

    #[test]
    fn test_normalize_socket_path() {
        assert_eq!(
            normalize_socket_path("unix:///var/run/headcni/headcni.sock").unwrap(),
            PathBuf::from("/var/run/headcni/headcni.sock")
        );
        assert_eq!(
            normalize_socket_path("http:///var/run/x.sock").unwrap(),
            PathBuf::from("/var/run/x.sock")
        );
        let relative = normalize_socket_path("x.sock").unwrap();
        assert!(relative.is_absolute());
        assert!(normalize_socket_path("unix://").is_err());
    }

    #[tokio::test]
    async fn test_all_request_types_return_200_with_typed_body() {
        let dir = tempfile::tempdir().unwrap();
        let server = start_server(&dir, None).await;

        for request_type in ["allocate", "release", "status", "pod_ready", "bogus"] {
            let body = serde_json::json!({
                "type": request_type,
                "namespace": "default",
                "pod_name": "p1",
                "container_id": "c1"
            });
            let (status, body) = roundtrip(
                server.socket_path(),
                Method::POST,
                "/cni",
                &body.to_string(),
            )
            .await;
            assert_eq!(status, StatusCode::OK, "type {}", request_type);
            let response: CniResponse = serde_json::from_str(&body).unwrap();
            if request_type == "bogus" {
                assert!(!response.success);
                assert_eq!(
                    response.error.as_deref(),
                    Some("unknown request type: bogus")
                );
            } else {
                assert!(response.success, "type {}", request_type);
            }
        }
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_non_post_is_405() {
        let dir = tempfile::tempdir().unwrap();
        let server = start_server(&dir, None).await;

        let (status, _) = roundtrip(server.socket_path(), Method::GET, "/cni", "").await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_json_is_400() {
        let dir = tempfile::tempdir().unwrap();
        let server = start_server(&dir, None).await;

        let (status, _) =
            roundtrip(server.socket_path(), Method::POST, "/cni", "not json {{{").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_allocate_fails_when_validation_fails() {
        let dir = tempfile::tempdir().unwrap();
        let server = start_server(&dir, Some(Arc::new(AlwaysFailValidator))).await;

        let body = serde_json::json!({
            "type": "allocate",
            "namespace": "default",
            "pod_name": "p1",
            "container_id": "c1",
            "local_pool": "10.244.3.0/24"
        });
        let (status, body) = roundtrip(
            server.socket_path(),
            Method::POST,
            "/cni",
            &body.to_string(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let response: CniResponse = serde_json::from_str(&body).unwrap();
        assert!(!response.success);
        assert!(response.error.unwrap().contains("10.244.3.0/24"));
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_pod_ready_succeeds_despite_validation_failure() {
        let dir = tempfile::tempdir().unwrap();
        let server = start_server(&dir, Some(Arc::new(AlwaysFailValidator))).await;

        let body = serde_json::json!({
            "type": "pod_ready",
            "namespace": "default",
            "pod_name": "p1",
            "container_id": "c1",
            "local_pool": "10.244.3.0/24"
        });
        let (_, body) = roundtrip(
            server.socket_path(),
            Method::POST,
            "/cni",
            &body.to_string(),
        )
        .await;
        let response: CniResponse = serde_json::from_str(&body).unwrap();
        assert!(response.success);
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_custom_callback_overrides_default() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("headcni.sock");
        let status_callback: CallbackFn = Arc::new(|_request| {
            Box::pin(async {
                CniResponse {
                    success: true,
                    error: None,
                    data: Some(serde_json::json!({"pods": 3})),
                }
            })
        });
        let callbacks = Callbacks {
            status: Some(status_callback),
            ..Default::default()
        };
        let server = RpcServer::new(socket.to_str().unwrap(), callbacks, None).unwrap();
        server.start().await.unwrap();

        let body = serde_json::json!({"type": "status"});
        let (_, body) =
            roundtrip(server.socket_path(), Method::POST, "/cni", &body.to_string()).await;
        let response: CniResponse = serde_json::from_str(&body).unwrap();
        assert_eq!(response.data.unwrap()["pods"], 3);
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_removes_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("headcni.sock");
        std::fs::write(&socket, "stale").unwrap();

        let server =
            RpcServer::new(socket.to_str().unwrap(), Callbacks::default(), None).unwrap();
        server.start().await.unwrap();
        assert!(server.is_running());
        server.stop().await.unwrap();
        assert!(!socket.exists());
    }
}
