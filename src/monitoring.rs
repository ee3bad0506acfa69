//! Health endpoint
//!
//! Serves the health registry snapshot as JSON on a TCP port when
//! monitoring is enabled. Unhealthy snapshots answer 503 so the endpoint
//! can back a liveness probe directly.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::health::{HealthRegistry, OverallHealth};
use crate::service::Service;

const SERVICE_NAME: &str = "monitoring";

pub struct MonitoringServer {
    /// Desired port and path; reload updates these before restarting
    settings: std::sync::Mutex<(u16, String)>,
    /// Settings the running listener was started with
    active: std::sync::Mutex<Option<(u16, String)>>,
    registry: HealthRegistry,
    running: AtomicBool,
    cancel: AsyncMutex<Option<CancellationToken>>,
    bound_addr: std::sync::Mutex<Option<SocketAddr>>,
}

impl MonitoringServer {
    pub fn new(port: u16, path: String, registry: HealthRegistry) -> Self {
        Self {
            settings: std::sync::Mutex::new((port, path)),
            active: std::sync::Mutex::new(None),
            registry,
            running: AtomicBool::new(false),
            cancel: AsyncMutex::new(None),
            bound_addr: std::sync::Mutex::new(None),
        }
    }

    /// Replace port/path; takes effect on the next (re)start.
    pub fn update_settings(&self, port: u16, path: String) {
        *self.settings.lock().unwrap_or_else(|e| e.into_inner()) = (port, path);
    }

    fn settings(&self) -> (u16, String) {
        self.settings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Address actually bound (useful when constructed with port 0)
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        *self.bound_addr.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn respond(registry: &HealthRegistry, path: &str, request: &Request<Incoming>) -> Response<Full<Bytes>> {
        if request.method() != Method::GET {
            return status_response(StatusCode::METHOD_NOT_ALLOWED, "only GET is supported");
        }
        if request.uri().path() != path {
            return status_response(StatusCode::NOT_FOUND, "not found");
        }

        let snapshot = registry.get_health_status();
        let status = match snapshot.overall {
            OverallHealth::Healthy => StatusCode::OK,
            OverallHealth::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        };
        let body = serde_json::to_vec(&snapshot).unwrap_or_else(|_| b"{}".to_vec());
        Response::builder()
            .status(status)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))
            .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
    }
}

fn status_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(message.to_string())))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

#[async_trait]
impl Service for MonitoringServer {
    fn name(&self) -> &str {
        SERVICE_NAME
    }

    async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let (port, path) = self.settings();

        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e)
                    .with_context(|| format!("failed to bind health endpoint on {}", addr));
            }
        };
        let bound = listener.local_addr().context("no local addr")?;
        *self.bound_addr.lock().unwrap_or_else(|e| e.into_inner()) = Some(bound);
        *self.active.lock().unwrap_or_else(|e| e.into_inner()) = Some((port, path.clone()));
        info!("Health endpoint listening on {}{}", bound, path);

        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let registry = self.registry.clone();
        let path = Arc::new(path);
        tokio::spawn(async move {
            loop {
                let (stream, _) = tokio::select! {
                    _ = loop_cancel.cancelled() => return,
                    accepted = listener.accept() => match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("Health endpoint accept failed: {}", e);
                            continue;
                        }
                    },
                };
                let registry = registry.clone();
                let path = path.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |request| {
                        let registry = registry.clone();
                        let path = path.clone();
                        async move {
                            Ok::<_, std::convert::Infallible>(MonitoringServer::respond(
                                &registry, &path, &request,
                            ))
                        }
                    });
                    if let Err(e) = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        debug!("Health connection ended with error: {}", e);
                    }
                });
            }
        });
        *self.cancel.lock().await = Some(cancel);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(cancel) = self.cancel.lock().await.take() {
            cancel.cancel();
        }
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        let unchanged = {
            let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            active.as_ref() == Some(&self.settings())
        };
        if unchanged && self.is_running() {
            return Ok(());
        }
        self.stop().await?;
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        self.start().await
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn fetch(addr: SocketAddr, path: &str) -> (StatusCode, String) {
        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (mut sender, conn) =
            hyper::client::conn::http1::handshake(TokioIo::new(stream))
                .await
                .unwrap();
        tokio::spawn(conn);
        let request = Request::builder()
            .method(Method::GET)
            .uri(path)
            .header(http::header::HOST, addr.to_string())
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = sender.send_request(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8_lossy(&body).to_string())
    }

    #[tokio::test]
    async fn test_healthy_snapshot_is_200() {
        let registry = HealthRegistry::new();
        registry.update_service_status("rpc-server", true, None);

        let server = MonitoringServer::new(0, "/health".to_string(), registry);
        server.start().await.unwrap();
        let addr = server.bound_addr().unwrap();

        let (status, body) = fetch(addr, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("\"overall\":\"healthy\""));
        assert!(body.contains("rpc-server"));
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unhealthy_snapshot_is_503() {
        let registry = HealthRegistry::new();
        registry.update_service_status("vpn-supervisor", false, Some("daemon dead"));

        let server = MonitoringServer::new(0, "/health".to_string(), registry);
        server.start().await.unwrap();
        let addr = server.bound_addr().unwrap();

        let (status, body) = fetch(addr, "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body.contains("daemon dead"));
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_path_is_404() {
        let server = MonitoringServer::new(0, "/health".to_string(), HealthRegistry::new());
        server.start().await.unwrap();
        let addr = server.bound_addr().unwrap();

        let (status, _) = fetch(addr, "/metrics").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        server.stop().await.unwrap();
    }
}
