//! Pod-CIDR monitor
//!
//! Periodic reconciliation of the node's Pod CIDR across three states: the
//! daemon's advertised routes, the coordinator's enabled routes, and the
//! on-disk CNI configuration. A CIDR change triggers the full cascade in
//! mandatory order: advertise, settle, enable, rewrite conflist.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clients::ClientRegistry;
use crate::cni::DesiredCniState;
use crate::health::HealthRegistry;
use crate::rpc::RouteValidator;
use crate::service::Service;

const SERVICE_NAME: &str = "pod-cidr-monitor";
const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(300);
/// Settle time between advertising and checking the coordinator
const PROPAGATION_DELAY: Duration = Duration::from_secs(2);

/// Where the monitor learns the node's current Pod CIDR. The Kubernetes
/// adapter implements this; tests inject a stub.
#[async_trait]
pub trait PodCidrSource: Send + Sync {
    async fn current_pod_cidr(&self) -> Result<String>;
}

/// Merge a prefix into an advertised set. Returns None when already present;
/// the advertised set is only ever grown, never replaced with less.
pub fn merge_advertised(existing: &[String], prefix: &str) -> Option<Vec<String>> {
    if existing.iter().any(|route| route == prefix) {
        return None;
    }
    let mut merged = existing.to_vec();
    merged.push(prefix.to_string());
    Some(merged)
}

struct MonitorInner {
    clients: Arc<ClientRegistry>,
    registry: HealthRegistry,
    cidr_source: Arc<dyn PodCidrSource>,
    /// Template for the CNI writer; `pod_cidr` is filled per reconcile
    cni_template: DesiredCniState,
    current_cidr: Mutex<Option<String>>,
    propagation_delay: Duration,
}

impl MonitorInner {
    fn desired(&self, pod_cidr: &str) -> DesiredCniState {
        let mut desired = self.cni_template.clone();
        desired.pod_cidr = pod_cidr.to_string();
        desired
    }

    /// One reconcile tick.
    async fn reconcile(&self) -> Result<()> {
        let cidr = self
            .cidr_source
            .current_pod_cidr()
            .await
            .context("failed to read Pod CIDR")?;

        let changed = {
            let cached = self.current_cidr.lock().unwrap_or_else(|e| e.into_inner());
            cached.as_deref() != Some(cidr.as_str())
        };

        if changed {
            info!("Pod CIDR changed to {}, running full cascade", cidr);
            self.cascade(&cidr).await?;
            let mut cached = self.current_cidr.lock().unwrap_or_else(|e| e.into_inner());
            *cached = Some(cidr);
        } else {
            debug!("Pod CIDR unchanged ({}), validating state", cidr);
            self.repair_drift(&cidr).await?;
        }
        self.registry.update_service_status(SERVICE_NAME, true, None);
        Ok(())
    }

    /// Mandatory order: advertise, settle, enable, rewrite conflist.
    async fn cascade(&self, cidr: &str) -> Result<()> {
        self.update_tailscale_routes(cidr).await?;
        tokio::time::sleep(self.propagation_delay).await;
        self.update_headscale_routes(cidr).await?;
        self.update_cni_configuration(cidr)?;
        Ok(())
    }

    /// Same three repair actions, each gated on observed drift.
    async fn repair_drift(&self, cidr: &str) -> Result<()> {
        self.update_tailscale_routes(cidr).await?;
        self.update_headscale_routes(cidr).await?;
        self.update_cni_configuration(cidr)?;
        Ok(())
    }

    /// Ensure the daemon advertises the CIDR, merging with whatever is
    /// already advertised.
    async fn update_tailscale_routes(&self, cidr: &str) -> Result<()> {
        let tailscale = self.clients.tailscale();
        let prefs = tailscale
            .get_prefs()
            .await
            .context("failed to read daemon preferences")?;

        match merge_advertised(&prefs.advertise_routes, cidr) {
            Some(merged) => {
                info!(
                    "Advertising {} (full set now {} routes)",
                    cidr,
                    merged.len()
                );
                tailscale
                    .advertise_routes(&merged)
                    .await
                    .context("failed to advertise routes")?;
            }
            None => debug!("Daemon already advertises {}", cidr),
        }
        Ok(())
    }

    /// Ensure the coordinator route for the CIDR is enabled. A route that
    /// has not propagated yet is logged and left for the next tick.
    async fn update_headscale_routes(&self, cidr: &str) -> Result<()> {
        let client = self.clients.headscale();
        let routes = tokio::task::spawn_blocking(move || client.get_routes())
            .await
            .context("route fetch task panicked")?
            .context("failed to list coordinator routes")?;

        let Some(route) = routes.iter().find(|route| route.prefix == cidr) else {
            info!("Route {} not visible on coordinator yet", cidr);
            return Ok(());
        };

        if !route.enabled {
            info!("Enabling coordinator route {} ({})", route.id, cidr);
            let client = self.clients.headscale();
            let id = route.id.clone();
            tokio::task::spawn_blocking(move || client.enable_route(&id))
                .await
                .context("route enable task panicked")?
                .context("failed to enable route")?;
        }
        Ok(())
    }

    fn update_cni_configuration(&self, cidr: &str) -> Result<()> {
        let desired = self.desired(cidr);
        self.clients
            .cni()
            .update_incremental(&desired)
            .context("failed to update CNI configuration")?;
        Ok(())
    }

    /// Check both the daemon and the coordinator for the route, remediating
    /// each side that drifted. Succeeds when at least one side is healthy
    /// after remediation; idempotent when everything is already in place.
    async fn validate_route_status(&self, cidr: &str) -> Result<()> {
        let mut tailscale_ok = false;
        let mut headscale_ok = false;

        let tailscale = self.clients.tailscale();
        match tailscale.get_prefs().await {
            Ok(prefs) => match merge_advertised(&prefs.advertise_routes, cidr) {
                None => tailscale_ok = true,
                Some(merged) => match tailscale.advertise_routes(&merged).await {
                    Ok(()) => {
                        info!("Applied missing advertisement for {}", cidr);
                        tailscale_ok = true;
                    }
                    Err(e) => warn!("Failed to apply advertisement for {}: {}", cidr, e),
                },
            },
            Err(e) => warn!("Cannot read daemon preferences: {}", e),
        }

        let client = self.clients.headscale();
        let routes = tokio::task::spawn_blocking(move || client.get_routes()).await;
        match routes {
            Ok(Ok(routes)) => {
                if let Some(route) = routes.iter().find(|route| route.prefix == cidr) {
                    if route.enabled {
                        headscale_ok = true;
                    } else {
                        let client = self.clients.headscale();
                        let id = route.id.clone();
                        let enabled =
                            tokio::task::spawn_blocking(move || client.enable_route(&id)).await;
                        match enabled {
                            Ok(Ok(())) => {
                                info!("Enabled coordinator route for {}", cidr);
                                headscale_ok = true;
                            }
                            Ok(Err(e)) => warn!("Failed to enable route for {}: {}", cidr, e),
                            Err(e) => warn!("Route enable task panicked: {}", e),
                        }
                    }
                }
            }
            Ok(Err(e)) => warn!("Cannot list coordinator routes: {}", e),
            Err(e) => warn!("Route fetch task panicked: {}", e),
        }

        if tailscale_ok || headscale_ok {
            Ok(())
        } else {
            anyhow::bail!(
                "route {} is neither advertised locally nor enabled on the coordinator",
                cidr
            )
        }
    }
}

/// Periodic Pod-CIDR monitor, also serving as the route validator for the
/// RPC server.
pub struct PodCidrMonitor {
    inner: Arc<MonitorInner>,
    interval: Duration,
    running: AtomicBool,
    cancel: AsyncMutex<Option<CancellationToken>>,
}

impl PodCidrMonitor {
    pub fn new(
        clients: Arc<ClientRegistry>,
        registry: HealthRegistry,
        cidr_source: Arc<dyn PodCidrSource>,
        cni_template: DesiredCniState,
    ) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                clients,
                registry,
                cidr_source,
                cni_template,
                current_cidr: Mutex::new(None),
                propagation_delay: PROPAGATION_DELAY,
            }),
            interval: DEFAULT_MONITOR_INTERVAL,
            running: AtomicBool::new(false),
            cancel: AsyncMutex::new(None),
        }
    }

    /// The CIDR seen by the last reconcile
    pub fn current_cidr(&self) -> Option<String> {
        self.inner
            .current_cidr
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Run one reconcile now; the supervisor calls this right after the
    /// daemon comes up instead of waiting a full tick.
    pub async fn reconcile_now(&self) -> Result<()> {
        self.inner.reconcile().await
    }

    /// Shared route validation (also used by the supervisor).
    pub async fn validate_route_status(&self, cidr: &str) -> Result<()> {
        self.inner.validate_route_status(cidr).await
    }
}

#[async_trait]
impl RouteValidator for PodCidrMonitor {
    async fn validate_route(&self, cidr: &str) -> Result<()> {
        self.inner.validate_route_status(cidr).await
    }
}

#[async_trait]
impl Service for PodCidrMonitor {
    fn name(&self) -> &str {
        SERVICE_NAME
    }

    async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let inner = self.inner.clone();
        let interval = self.interval;
        let loop_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = loop_cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = inner.reconcile().await {
                    warn!("Pod CIDR reconcile failed: {:#}", e);
                    inner
                        .registry
                        .update_service_status(SERVICE_NAME, true, Some(&e.to_string()));
                }
            }
        });
        *self.cancel.lock().await = Some(cancel);
        info!("Pod CIDR monitor started (interval {:?})", self.interval);
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

    // Clients are re-fetched through the registry on every tick, so a
    // client swap needs no restart here.
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
    use crate::cni::CniConfigManager;
    use crate::config::{Config, CoordinatorConfig};
    use crate::headscale::HeadscaleClient;
    use crate::tailscale::TailscaleClient;
    use bytes::Bytes;
    use http_body_util::{BodyExt, Full};
    use hyper::body::Incoming;
    use hyper::service::service_fn;
    use hyper::{Request, Response};
    use hyper_util::rt::TokioIo;
    use std::path::PathBuf;
    use std::sync::Mutex as StdMutex;
    use tokio::net::UnixListener;

    struct StaticCidr(String);

    #[async_trait]
    impl PodCidrSource for StaticCidr {
        async fn current_pod_cidr(&self) -> Result<String> {
            Ok(self.0.clone())
        }
    }

    /// tailscaled double with configurable advertised routes; records
    /// every request it sees.
    async fn fake_daemon(
        socket: PathBuf,
        advertised: Vec<String>,
    ) -> Arc<StdMutex<Vec<(String, String, String)>>> {
        let listener = UnixListener::bind(&socket).unwrap();
        let requests: Arc<StdMutex<Vec<(String, String, String)>>> =
            Arc::new(StdMutex::new(Vec::new()));
        let recorded = requests.clone();

        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                let recorded = recorded.clone();
                let advertised = advertised.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let recorded = recorded.clone();
                        let advertised = advertised.clone();
                        async move {
                            let method = req.method().to_string();
                            let path = req.uri().path().to_string();
                            let body = req.into_body().collect().await.unwrap().to_bytes();
                            recorded.lock().unwrap().push((
                                method,
                                path.clone(),
                                String::from_utf8_lossy(&body).to_string(),
                            ));
                            let reply = if path == "/localapi/v0/prefs" {
                                serde_json::json!({
                                    "AdvertiseRoutes": advertised,
                                    "RouteAll": true,
                                })
                                .to_string()
                            } else {
                                "{}".to_string()
                            };
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

    fn template() -> DesiredCniState {
        DesiredCniState {
            pod_cidr: String::new(),
            service_cidr: "10.96.0.0/12".to_string(),
            mtu: 1450,
            node_name: "worker-01".to_string(),
            cluster_cidr: "10.244.0.0/16".to_string(),
            enable_ipv6: false,
            pod_cidr_v6: None,
            dns_service_ip: "10.96.0.10".to_string(),
            cluster_domain: "cluster.local".to_string(),
        }
    }

    fn build_monitor(
        coordinator_url: String,
        socket: PathBuf,
        dir: &tempfile::TempDir,
        cidr: &str,
    ) -> PodCidrMonitor {
        let headscale = Arc::new(
            HeadscaleClient::new(&CoordinatorConfig {
                url: coordinator_url,
                auth_key: "hskey-test".to_string(),
                timeout_secs: 2,
                retries: 0,
            })
            .unwrap(),
        );
        let tailscale = Arc::new(TailscaleClient::new(socket));
        let config_path = dir.path().join("headcni.yaml");
        std::fs::write(
            &config_path,
            "coordinator:\n  url: https://headscale.example.com\n  auth_key: hskey-test\n",
        )
        .unwrap();
        let config = Config::load_from_file(&config_path).unwrap();
        let cni = Arc::new(CniConfigManager::with_paths(
            &config,
            dir.path().join("net.d"),
            dir.path().join("env.yaml"),
        ));
        let clients = Arc::new(ClientRegistry::new(headscale, tailscale, cni));
        let mut monitor = PodCidrMonitor::new(
            clients,
            HealthRegistry::new(),
            Arc::new(StaticCidr(cidr.to_string())),
            template(),
        );
        // Tests should not sit through the real settle delay
        let inner = Arc::get_mut(&mut monitor.inner).unwrap();
        inner.propagation_delay = Duration::from_millis(10);
        monitor
    }

    #[test]
    fn test_merge_advertised_preserves_existing() {
        let existing = vec!["10.244.3.0/24".to_string(), "192.168.9.0/24".to_string()];
        let merged = merge_advertised(&existing, "10.244.7.0/24").unwrap();
        assert_eq!(
            merged,
            vec!["10.244.3.0/24", "192.168.9.0/24", "10.244.7.0/24"]
        );
    }

    #[test]
    fn test_merge_advertised_noop_when_present() {
        let existing = vec!["10.244.3.0/24".to_string()];
        assert!(merge_advertised(&existing, "10.244.3.0/24").is_none());
    }

    #[tokio::test]
    async fn test_cascade_advertises_enables_and_writes_conflist() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("tailscaled.sock");
        // Daemon starts out advertising an unrelated route
        let requests = fake_daemon(socket.clone(), vec!["192.168.9.0/24".to_string()]).await;

        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v1/routes")
            .with_status(200)
            .with_body(
                r#"{"routes":[{"id":"7","prefix":"10.244.3.0/24","advertised":true,"enabled":false,
                               "node":{"id":"A","name":"worker-01"}}]}"#,
            )
            .create_async()
            .await;
        let enable = server
            .mock("POST", "/api/v1/routes/7/enable")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let monitor = build_monitor(server.url(), socket, &dir, "10.244.3.0/24");
        monitor.reconcile_now().await.unwrap();

        enable.assert_async().await;
        assert_eq!(monitor.current_cidr().as_deref(), Some("10.244.3.0/24"));

        // The advertise PATCH carried the merged set, old route preserved
        let recorded = requests.lock().unwrap();
        let patch = recorded
            .iter()
            .find(|(method, _, _)| method == "PATCH")
            .expect("expected an advertise PATCH");
        assert!(patch.2.contains("192.168.9.0/24"));
        assert!(patch.2.contains("10.244.3.0/24"));

        // Conflist landed with the new CIDR
        let conflist =
            std::fs::read_to_string(dir.path().join("net.d").join("10-headcni.conflist"))
                .unwrap();
        assert!(conflist.contains("10.244.3.0/24"));
    }

    #[tokio::test]
    async fn test_validate_route_status_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("tailscaled.sock");
        // Daemon already advertises the CIDR
        let requests = fake_daemon(socket.clone(), vec!["10.244.3.0/24".to_string()]).await;

        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v1/routes")
            .with_status(200)
            .with_body(
                r#"{"routes":[{"id":"7","prefix":"10.244.3.0/24","advertised":true,"enabled":true,
                               "node":{"id":"A","name":"worker-01"}}]}"#,
            )
            .expect_at_least(2)
            .create_async()
            .await;

        let monitor = build_monitor(server.url(), socket, &dir, "10.244.3.0/24");
        monitor.validate_route_status("10.244.3.0/24").await.unwrap();
        monitor.validate_route_status("10.244.3.0/24").await.unwrap();

        // No mutation on either side: the daemon only ever saw GETs, and no
        // enable endpoint was mocked (a POST would have failed the call).
        let recorded = requests.lock().unwrap();
        assert!(recorded.iter().all(|(method, _, _)| method == "GET"));
    }

    #[tokio::test]
    async fn test_validate_route_status_remediates_missing_advertisement() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("tailscaled.sock");
        let requests = fake_daemon(socket.clone(), vec![]).await;

        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v1/routes")
            .with_status(200)
            .with_body(r#"{"routes":[]}"#)
            .create_async()
            .await;

        let monitor = build_monitor(server.url(), socket, &dir, "10.244.3.0/24");
        monitor.validate_route_status("10.244.3.0/24").await.unwrap();

        let recorded = requests.lock().unwrap();
        let patch = recorded
            .iter()
            .find(|(method, _, _)| method == "PATCH")
            .expect("expected a remediation PATCH");
        assert!(patch.2.contains("10.244.3.0/24"));
    }

    #[tokio::test]
    async fn test_validate_route_status_fails_when_both_sides_down() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("missing.sock");

        let monitor =
            build_monitor("http://127.0.0.1:1".to_string(), socket, &dir, "10.244.3.0/24");
        assert!(monitor
            .validate_route_status("10.244.3.0/24")
            .await
            .is_err());
    }
}
