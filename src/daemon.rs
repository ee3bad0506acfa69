//! Agent wiring and reload transaction
//!
//! Owns the configuration snapshot, the client registry and the service
//! manager. SIGHUP re-reads the configuration; a structural diff decides
//! which clients get recreated, and any failure restores the previous
//! snapshot (configuration and clients both) before surfacing the error.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::clients::{ClientRegistry, ClientSnapshot};
use crate::cni::{CniConfigManager, DesiredCniState};
use crate::config::{Config, ConfigDiff, SharedConfig};
use crate::headscale::HeadscaleClient;
use crate::health::HealthRegistry;
use crate::health_check::HeadscaleHealthChecker;
use crate::k8s::{K8sAdapter, NodeEventHandler, Permissions};
use crate::mesh_env::MeshEnv;
use crate::monitoring::MonitoringServer;
use crate::pod_cidr::{PodCidrMonitor, PodCidrSource};
use crate::rpc::{Callbacks, RouteValidator, RpcServer};
use crate::service::ServiceManager;
use crate::supervisor::{NodeAnnotator, VpnSupervisor};
use crate::tailscale::TailscaleClient;

/// Socket the one-shot CNI binary connects to
pub const DEFAULT_RPC_SOCKET: &str = "/var/run/headcni/headcni.sock";

const STOP_DEADLINE: Duration = Duration::from_secs(30);

/// Pod-CIDR source backed by the Kubernetes adapter.
struct NodeCidrSource {
    k8s: Arc<K8sAdapter>,
    node_name: String,
}

#[async_trait]
impl PodCidrSource for NodeCidrSource {
    async fn current_pod_cidr(&self) -> Result<String> {
        self.k8s.get_pod_cidr(&self.node_name).await
    }
}

/// Annotator backed by the Kubernetes adapter.
struct K8sNodeAnnotator {
    k8s: Arc<K8sAdapter>,
    node_name: String,
}

#[async_trait]
impl NodeAnnotator for K8sNodeAnnotator {
    async fn update_annotations(&self, annotations: BTreeMap<String, String>) -> Result<()> {
        self.k8s
            .update_annotations(&self.node_name, &annotations)
            .await
            .context("node annotation update failed")
    }
}

/// Reacts to node updates by reconciling immediately instead of waiting
/// for the next monitor tick.
struct PodCidrWatchHandler {
    monitor: Arc<PodCidrMonitor>,
    node_name: String,
}

#[async_trait]
impl NodeEventHandler for PodCidrWatchHandler {
    async fn on_update(
        &self,
        old: Option<&k8s_openapi::api::core::v1::Node>,
        new: &k8s_openapi::api::core::v1::Node,
    ) {
        use kube::ResourceExt;
        if new.name_any() != self.node_name {
            return;
        }
        let old_cidr = old.and_then(K8sAdapter::pod_cidr_of);
        let new_cidr = K8sAdapter::pod_cidr_of(new);
        if old_cidr == new_cidr {
            return;
        }
        info!("Node Pod CIDR changed ({:?} -> {:?})", old_cidr, new_cidr);
        if let Err(e) = self.monitor.reconcile_now().await {
            warn!("Event-driven reconcile failed: {:#}", e);
        }
    }
}

struct ReloadSnapshot {
    config: Arc<Config>,
    previous_config: Option<Arc<Config>>,
    clients: ClientSnapshot,
}

/// The assembled agent.
pub struct Daemon {
    config: SharedConfig,
    /// One generation back, so rollback restores what services last saw
    previous_config: Mutex<Option<Arc<Config>>>,
    node_name: String,
    clients: Arc<ClientRegistry>,
    manager: ServiceManager,
    registry: HealthRegistry,
    /// Monitoring endpoint, kept for settings updates on reload
    monitoring: Option<Arc<MonitoringServer>>,
    /// Cancels the node watch task on shutdown
    watch_cancel: CancellationToken,
}

impl Daemon {
    /// Assemble from pre-built parts. Production goes through `bootstrap`;
    /// tests wire their own parts.
    pub fn from_parts(
        config: SharedConfig,
        node_name: String,
        clients: Arc<ClientRegistry>,
        manager: ServiceManager,
        registry: HealthRegistry,
    ) -> Self {
        Self {
            config,
            previous_config: Mutex::new(None),
            node_name,
            clients,
            manager,
            registry,
            monitoring: None,
            watch_cancel: CancellationToken::new(),
        }
    }

    /// Full production construction: Kubernetes access, discovery, client
    /// registry and every service in start order.
    pub async fn bootstrap(config: Config) -> Result<Self> {
        let config = Arc::new(config);
        let shared_config = SharedConfig::new(config.clone());
        let registry = HealthRegistry::new();

        let node_name =
            K8sAdapter::get_current_node_name().context("cannot determine node name")?;
        if let (Ok(ns), Ok(pod)) = (
            std::env::var("POD_NAMESPACE"),
            std::env::var("POD_NAME"),
        ) {
            info!("Running as pod {}/{} on node {}", ns, pod, node_name);
        }
        let k8s = Arc::new(
            K8sAdapter::new(Permissions::default())
                .await
                .context("kubernetes adapter init failed")?,
        );

        let env = MeshEnv::derive(&config, &node_name).context("mesh environment init failed")?;
        info!(
            "Mesh environment: hostname={} nic={} socket={}",
            env.hostname,
            env.nic_name,
            env.socket_path.display()
        );

        let headscale = Arc::new(HeadscaleClient::new(&config.coordinator)?);
        let tailscale = Arc::new(TailscaleClient::new(&env.socket_path));
        let cni = Arc::new(CniConfigManager::new(&config));
        let clients = Arc::new(ClientRegistry::new(headscale, tailscale, cni));

        let dns_service_ip = k8s.discover_dns_service_ip().await;
        let cluster_domain = k8s.discover_cluster_domain().await;
        info!(
            "Cluster DNS {} domain {}",
            dns_service_ip, cluster_domain
        );

        let cni_template = DesiredCniState {
            pod_cidr: String::new(),
            service_cidr: config.network.service_cidr.clone(),
            mtu: config.network.mtu,
            node_name: node_name.clone(),
            cluster_cidr: config.network.pod_cidr_base.clone(),
            enable_ipv6: config.network.enable_ipv6,
            pod_cidr_v6: None,
            dns_service_ip,
            cluster_domain,
        };

        let cidr_source: Arc<dyn PodCidrSource> = Arc::new(NodeCidrSource {
            k8s: k8s.clone(),
            node_name: node_name.clone(),
        });
        let annotator: Arc<dyn NodeAnnotator> = Arc::new(K8sNodeAnnotator {
            k8s: k8s.clone(),
            node_name: node_name.clone(),
        });

        let monitor = Arc::new(PodCidrMonitor::new(
            clients.clone(),
            registry.clone(),
            cidr_source.clone(),
            cni_template,
        ));
        let rpc = Arc::new(RpcServer::new(
            DEFAULT_RPC_SOCKET,
            Callbacks::default(),
            Some(monitor.clone() as Arc<dyn RouteValidator>),
        )?);
        let supervisor = Arc::new(VpnSupervisor::new(
            shared_config.clone(),
            clients.clone(),
            registry.clone(),
            cidr_source,
            Some(annotator),
            node_name.clone(),
        )?);
        let checker = Arc::new(HeadscaleHealthChecker::new(
            clients.clone(),
            registry.clone(),
            env,
        ));

        let mut manager = ServiceManager::new(registry.clone());
        manager.register(rpc);
        manager.register(supervisor);
        manager.register(monitor.clone());
        manager.register(checker);
        let mut monitoring = None;
        if config.monitoring.enabled {
            let server = Arc::new(MonitoringServer::new(
                config.monitoring.port,
                config.monitoring.path.clone(),
                registry.clone(),
            ));
            manager.register(server.clone());
            monitoring = Some(server);
        }

        let mut daemon =
            Self::from_parts(shared_config, node_name.clone(), clients, manager, registry);
        daemon.monitoring = monitoring;

        // Event-driven Pod-CIDR updates; the periodic monitor repairs
        // whatever the watch misses.
        let handler = Arc::new(PodCidrWatchHandler { monitor, node_name });
        let watch_cancel = daemon.watch_cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = k8s.watch_nodes(handler, watch_cancel).await {
                warn!("Node watch ended: {:#}", e);
            }
        });

        Ok(daemon)
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.get()
    }

    fn set_config(&self, config: Arc<Config>) {
        let old = self.config.get();
        self.config.set(config);
        *self
            .previous_config
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(old);
    }

    pub fn clients(&self) -> &Arc<ClientRegistry> {
        &self.clients
    }

    pub fn registry(&self) -> &HealthRegistry {
        &self.registry
    }

    pub async fn start(&self) -> Result<()> {
        self.manager.start_all().await
    }

    pub async fn shutdown(&self) {
        info!("Shutting down services");
        self.watch_cancel.cancel();
        match tokio::time::timeout(STOP_DEADLINE, self.manager.stop_all()).await {
            Ok(Ok(())) => info!("All services stopped"),
            Ok(Err(e)) => warn!("Some services failed to stop: {:#}", e),
            Err(_) => warn!("Service shutdown exceeded {:?}", STOP_DEADLINE),
        }
    }

    /// Recreate only the clients whose configuration fields changed.
    async fn recreate_affected(&self, diff: &ConfigDiff, config: &Arc<Config>) -> Result<()> {
        if diff.coordinator_changed() {
            let client = Arc::new(
                HeadscaleClient::new(&config.coordinator)
                    .context("coordinator client recreation failed")?,
            );
            // Probe before committing so an unreachable coordinator rolls
            // the whole reload back
            let probe = client.clone();
            tokio::task::spawn_blocking(move || probe.check_api_key_health())
                .await
                .context("coordinator probe task panicked")?
                .with_context(|| {
                    format!("new coordinator {} unreachable", config.coordinator.url)
                })?;
            self.clients.set_headscale(client);
            info!("Recreated coordinator client for {}", config.coordinator.url);
        }
        if diff.mesh_changed() {
            let env = MeshEnv::derive(config, &self.node_name)
                .context("mesh environment recreation failed")?;
            self.clients
                .set_tailscale(Arc::new(TailscaleClient::new(&env.socket_path)));
            info!(
                "Recreated mesh daemon client for {}",
                env.socket_path.display()
            );
        }
        if diff.network_changed() {
            self.clients.set_cni(Arc::new(CniConfigManager::new(config)));
            info!("Recreated CNI config manager");
        }
        Ok(())
    }

    fn restore(&self, snapshot: ReloadSnapshot) {
        self.config.set(snapshot.config);
        *self
            .previous_config
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = snapshot.previous_config;
        self.clients.restore(snapshot.clients);
        warn!("Reload failed, previous configuration restored");
    }

    /// SIGHUP entry point: re-read, diff, swap, recreate, reload services,
    /// roll back on failure.
    pub async fn reload(&self) -> Result<()> {
        let current = self.config();
        let path = current.config_path().to_path_buf();
        let new_config =
            Config::load_from_file(&path).context("failed to re-read configuration")?;

        let diff = current.diff(&new_config);
        if diff.is_empty() {
            info!("Configuration unchanged, nothing to reload");
            return Ok(());
        }
        info!("Configuration changed: {:?}", diff.fields());

        let snapshot = ReloadSnapshot {
            config: current.clone(),
            previous_config: self
                .previous_config
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
            clients: self.clients.snapshot(),
        };

        let new_config = Arc::new(new_config);
        self.set_config(new_config.clone());

        if let Err(e) = self.recreate_affected(&diff, &new_config).await {
            self.restore(snapshot);
            return Err(e);
        }

        if diff.monitoring_changed() {
            if let Some(monitoring) = &self.monitoring {
                monitoring.update_settings(
                    new_config.monitoring.port,
                    new_config.monitoring.path.clone(),
                );
            }
        }

        if let Err(e) = self.manager.reload_all().await {
            self.restore(snapshot);
            return Err(e).context("service reload failed");
        }

        info!("Reload complete");
        Ok(())
    }
}
