//! Headscale health checks and route conflict detection
//!
//! Periodic tick against the coordinator: reachability statistics plus a
//! sweep over all advertised routes looking for overlapping prefixes.
//! Conflicts are logged with full detail but never flip health; only an
//! unreachable API does that.

use anyhow::{Context, Result};
use async_trait::async_trait;
use ipnet::IpNet;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clients::ClientRegistry;
use crate::headscale::Route;
use crate::health::HealthRegistry;
use crate::mesh_env::MeshEnv;
use crate::service::Service;

const SERVICE_NAME: &str = "headscale-health";
const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(300);
/// Consecutive failures before the log level escalates
const FAILURE_ESCALATION_THRESHOLD: u64 = 3;

/// Reachability statistics for the coordinator
#[derive(Debug, Clone, Default, Serialize)]
pub struct CheckStats {
    pub total_checks: u64,
    pub successful_checks: u64,
    pub failed_checks: u64,
    pub consecutive_failures: u64,
    pub last_error: String,
    pub last_check: Option<String>,
}

/// A pair of routes with overlapping prefixes
#[derive(Debug, Clone)]
pub struct RouteConflict {
    pub local: Route,
    pub other: Route,
}

/// Whether two prefixes overlap under CIDR containment (either direction).
/// Malformed prefixes are logged and treated as non-overlapping.
pub fn cidr_overlaps(a: &str, b: &str) -> bool {
    let parsed_a: IpNet = match a.parse() {
        Ok(net) => net,
        Err(_) => {
            warn!("Malformed route prefix {:?}, treating as non-overlapping", a);
            return false;
        }
    };
    let parsed_b: IpNet = match b.parse() {
        Ok(net) => net,
        Err(_) => {
            warn!("Malformed route prefix {:?}, treating as non-overlapping", b);
            return false;
        }
    };
    parsed_a.contains(&parsed_b) || parsed_b.contains(&parsed_a)
}

/// All conflicts involving the local node: each local route against every
/// remote route, and every pair of local routes.
pub fn find_conflicts(local: &[Route], remote: &[Route]) -> Vec<RouteConflict> {
    let mut conflicts = Vec::new();

    for local_route in local {
        for remote_route in remote {
            if cidr_overlaps(&local_route.prefix, &remote_route.prefix) {
                conflicts.push(RouteConflict {
                    local: local_route.clone(),
                    other: remote_route.clone(),
                });
            }
        }
    }

    for (i, a) in local.iter().enumerate() {
        for b in local.iter().skip(i + 1) {
            if cidr_overlaps(&a.prefix, &b.prefix) {
                conflicts.push(RouteConflict {
                    local: a.clone(),
                    other: b.clone(),
                });
            }
        }
    }

    conflicts
}

/// Split a route table into this node's routes and everyone else's.
pub fn partition_routes(routes: Vec<Route>, local_node_id: &str) -> (Vec<Route>, Vec<Route>) {
    routes
        .into_iter()
        .partition(|route| route.node_id() == local_node_id)
}

struct CheckerInner {
    clients: Arc<ClientRegistry>,
    registry: HealthRegistry,
    env: MeshEnv,
    stats: Mutex<CheckStats>,
}

impl CheckerInner {
    /// Local mesh identity: node hostname in host mode, the persisted
    /// hostname file next to the socket in daemon mode.
    fn local_mesh_name(&self) -> Result<String> {
        if self.env.is_daemon {
            let content = std::fs::read_to_string(&self.env.hostname_path).with_context(|| {
                format!(
                    "failed to read hostname file {}",
                    self.env.hostname_path.display()
                )
            })?;
            Ok(content.trim().to_string())
        } else {
            Ok(self.env.hostname.clone())
        }
    }

    /// One health tick.
    async fn run_check(&self) -> Result<Vec<RouteConflict>> {
        let client = self.clients.headscale();
        let routes = tokio::task::spawn_blocking(move || client.get_routes())
            .await
            .context("route fetch task panicked")?;

        let routes = match routes {
            Ok(routes) => {
                self.record_success();
                routes
            }
            Err(e) => {
                self.record_failure(&e.to_string());
                return Err(e).context("coordinator unreachable");
            }
        };

        let mesh_name = self.local_mesh_name()?;
        let client = self.clients.headscale();
        let name = mesh_name.clone();
        let node = tokio::task::spawn_blocking(move || client.find_node_by_name(&name))
            .await
            .context("node lookup task panicked")?;

        let node = match node {
            Ok(Some(node)) => node,
            Ok(None) => {
                debug!("Node {} not registered with coordinator yet", mesh_name);
                return Ok(Vec::new());
            }
            Err(e) => {
                warn!("Node lookup failed: {}", e);
                return Ok(Vec::new());
            }
        };

        let (local, remote) = partition_routes(routes, &node.id);
        let conflicts = find_conflicts(&local, &remote);
        for conflict in &conflicts {
            warn!(
                "Route conflict: local route {} ({}) overlaps route {} ({}) from node {}",
                conflict.local.id,
                conflict.local.prefix,
                conflict.other.id,
                conflict.other.prefix,
                conflict
                    .other
                    .node
                    .as_ref()
                    .map(|n| n.name.as_str())
                    .unwrap_or("<unknown>"),
            );
        }
        Ok(conflicts)
    }

    fn record_success(&self) {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        stats.total_checks += 1;
        stats.successful_checks += 1;
        if stats.consecutive_failures > 0 {
            info!(
                "Coordinator reachable again after {} failed checks",
                stats.consecutive_failures
            );
        }
        stats.consecutive_failures = 0;
        stats.last_error.clear();
        stats.last_check = Some(chrono::Utc::now().to_rfc3339());
        self.registry.update_service_status(SERVICE_NAME, true, None);
    }

    fn record_failure(&self, message: &str) {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        stats.total_checks += 1;
        stats.failed_checks += 1;
        stats.consecutive_failures += 1;
        stats.last_error = message.to_string();
        stats.last_check = Some(chrono::Utc::now().to_rfc3339());

        if stats.consecutive_failures >= FAILURE_ESCALATION_THRESHOLD {
            error!(
                "Coordinator health check failed {} times in a row: {}",
                stats.consecutive_failures, message
            );
        } else {
            warn!("Coordinator health check failed: {}", message);
        }
        self.registry
            .update_service_status(SERVICE_NAME, true, Some(message));
    }
}

/// Periodic coordinator health checker.
pub struct HeadscaleHealthChecker {
    inner: Arc<CheckerInner>,
    interval: Duration,
    running: AtomicBool,
    cancel: AsyncMutex<Option<CancellationToken>>,
}

impl HeadscaleHealthChecker {
    pub fn new(clients: Arc<ClientRegistry>, registry: HealthRegistry, env: MeshEnv) -> Self {
        Self {
            inner: Arc::new(CheckerInner {
                clients,
                registry,
                env,
                stats: Mutex::new(CheckStats::default()),
            }),
            interval: DEFAULT_CHECK_INTERVAL,
            running: AtomicBool::new(false),
            cancel: AsyncMutex::new(None),
        }
    }

    pub fn stats(&self) -> CheckStats {
        self.inner
            .stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// One tick, exposed for direct testing.
    #[cfg(test)]
    pub(crate) async fn run_check(&self) -> Result<Vec<RouteConflict>> {
        self.inner.run_check().await
    }
}

#[async_trait]
impl Service for HeadscaleHealthChecker {
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
                if let Err(e) = inner.run_check().await {
                    debug!("Health check tick failed: {:#}", e);
                }
            }
        });
        *self.cancel.lock().await = Some(cancel);
        info!("Headscale health checker started (interval {:?})", self.interval);
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
