//! tailscaled supervisor
//!
//! Brings the mesh interface up and keeps it up. Host mode attaches to an
//! existing daemon; daemon mode owns the whole lifecycle: process, socket,
//! state file and kernel interface, driven by a keep-alive state machine.
//! After the daemon is Running the supervisor advertises the Pod CIDR,
//! waits for the coordinator to approve it, annotates the Kubernetes node
//! and maintains the kernel policy rules.

use anyhow::{Context, Result};
use async_trait::async_trait;
use backoff::ExponentialBackoff;
use chrono::Utc;
use ipnet::Ipv4Net;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::authkey::AuthKeyState;
use crate::clients::ClientRegistry;
use crate::config::{Config, MeshConfig, MeshMode, SharedConfig};
use crate::headscale::CreatePreAuthKeyRequest;
use crate::health::HealthRegistry;
use crate::mesh_env::MeshEnv;
use crate::netlink::{self, DesiredRule};
use crate::pod_cidr::{merge_advertised, PodCidrSource};
use crate::service::Service;
use crate::tailscale::UpOptions;

const SERVICE_NAME: &str = "vpn-supervisor";

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
const HEALTH_INTERVAL: Duration = Duration::from_secs(30);
const RULE_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

/// Initial-setup wait for Running + IPs
const READY_TIMEOUT: Duration = Duration::from_secs(60);
const READY_PROBE_INTERVAL: Duration = Duration::from_secs(3);

/// Coordinator route propagation wait
const ROUTE_WAIT_TRIES: u32 = 15;
const ROUTE_WAIT_INTERVAL: Duration = Duration::from_secs(5);

/// Pre-auth key refresh policy; the attempt count comes from
/// `coordinator.retries`
const AUTH_REFRESH_INTERVAL: Duration = Duration::from_secs(3600);
const AUTH_REFRESH_WINDOW_HOURS: i64 = 2;
const AUTH_KEY_LIFETIME_HOURS: i64 = 24;
const AUTH_CREATE_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Policy rule numbering
const RULE_PRIORITY_POD_CIDR: u32 = 3151;
const RULE_PRIORITY_LOCAL_IP: u32 = 3152;
const RULE_PRIORITY_MESH_IP: u32 = 3153;
const RULE_TABLE_MESH: u32 = 53;
const RULE_TABLE_LOCAL: u32 = 52;
const RULE_TABLE_MAIN: u32 = 254;

/// Node annotation keys
pub const ANNOTATION_TAILSCALE_IP: &str = "headcni.io/tailscale-ip";
pub const ANNOTATION_NODE_KEY: &str = "headcni.io/node-key";
pub const ANNOTATION_POD_CIDR: &str = "headcni.io/pod-cidr";

/// Paths the stray-file cleanup must never touch.
const PROTECTED_CLEANUP_PATHS: &[&str] =
    &["/var/lib/tailscale", "/var/run/tailscale", "/usr", "/opt"];

/// Writes node annotations; implemented over the Kubernetes adapter.
#[async_trait]
pub trait NodeAnnotator: Send + Sync {
    async fn update_annotations(&self, annotations: BTreeMap<String, String>) -> Result<()>;
}

// =============================================================================
// Pure decision logic
// =============================================================================

/// One keep-alive observation of the daemon's four artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaemonObservation {
    pub socket: bool,
    pub state: bool,
    pub process: bool,
    pub interface: bool,
}

/// What the keep-alive tick should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonAction {
    /// Wipe stray files, spawn a new daemon with full options
    StartFresh,
    /// Spawn a daemon reusing the on-disk socket and state
    RestartWithExistingData,
    /// Everything present: probe health, re-authenticate on NeedsLogin
    ProbeHealth,
    /// Delete the orphaned interface, then start fresh
    CleanupInterfaceThenStartFresh,
    /// Inconsistent leftovers: clean up and restart
    CleanupAndRestart,
}

/// The daemon-mode state table.
pub fn decide_action(obs: DaemonObservation) -> DaemonAction {
    match (obs.socket, obs.state, obs.process, obs.interface) {
        (false, false, false, false) => DaemonAction::StartFresh,
        (true, true, false, _) => DaemonAction::RestartWithExistingData,
        (false, true, false, _) => DaemonAction::RestartWithExistingData,
        (true, true, true, true) => DaemonAction::ProbeHealth,
        (false, false, false, true) => DaemonAction::CleanupInterfaceThenStartFresh,
        _ => DaemonAction::CleanupAndRestart,
    }
}

/// Whether a path sits under a directory the cleanup must not touch.
pub fn is_protected_path(path: &Path) -> bool {
    PROTECTED_CLEANUP_PATHS
        .iter()
        .any(|protected| path.starts_with(protected))
}

/// ACL tags for pre-auth key creation: configured tags plus the per-node
/// tag, each carrying the `tag:` prefix exactly once.
pub fn build_acl_tags(configured: &[String], node_name: &str) -> Vec<String> {
    let mut tags: Vec<String> = configured
        .iter()
        .map(|tag| {
            if tag.starts_with("tag:") {
                tag.clone()
            } else {
                format!("tag:{}", tag)
            }
        })
        .collect();
    let node_tag = format!("tag:node:{}", node_name);
    if !tags.contains(&node_tag) {
        tags.push(node_tag);
    }
    tags
}

/// The three policy rules for a given mesh IP, machine IP and Pod CIDR.
/// The machine-IP rule is omitted when it equals the mesh IP.
pub fn desired_policy_rules(
    mesh_ip: IpAddr,
    local_ip: Option<IpAddr>,
    pod_cidr: &str,
) -> Vec<DesiredRule> {
    let mut rules = Vec::new();

    if let IpAddr::V4(mesh) = mesh_ip {
        rules.push(DesiredRule {
            priority: RULE_PRIORITY_MESH_IP,
            table: RULE_TABLE_MESH,
            src: Ipv4Net::new(mesh, 32).ok(),
            dst: None,
        });
    }

    if let Some(IpAddr::V4(local)) = local_ip {
        if IpAddr::V4(local) != mesh_ip {
            rules.push(DesiredRule {
                priority: RULE_PRIORITY_LOCAL_IP,
                table: RULE_TABLE_LOCAL,
                src: Ipv4Net::new(local, 32).ok(),
                dst: None,
            });
        }
    }

    if let Ok(pod_net) = pod_cidr.parse::<Ipv4Net>() {
        rules.push(DesiredRule {
            priority: RULE_PRIORITY_POD_CIDR,
            table: RULE_TABLE_MAIN,
            src: None,
            dst: Some(pod_net),
        });
    }

    rules
}

/// Read the pid file and check the process is alive (signal 0).
pub fn daemon_process_alive(pid_path: &Path) -> bool {
    let Ok(content) = std::fs::read_to_string(pid_path) else {
        return false;
    };
    let Ok(pid) = content.trim().parse::<i32>() else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    #[cfg(target_os = "linux")]
    {
        unsafe { libc::kill(pid, 0) == 0 }
    }
    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}

// =============================================================================
// Supervisor
// =============================================================================

struct SupervisorInner {
    shared_config: SharedConfig,
    env: std::sync::RwLock<MeshEnv>,
    clients: Arc<ClientRegistry>,
    registry: HealthRegistry,
    cidr_source: Arc<dyn PodCidrSource>,
    annotator: Option<Arc<dyn NodeAnnotator>>,
    auth_key: AuthKeyState,
    node_name: String,
    /// Whether setup_and_manage_routes completed since the last (re)start
    setup_done: AtomicBool,
    child: AsyncMutex<Option<tokio::process::Child>>,
    /// Rules installed by the maintenance loop, removed on stop
    installed_rules: AsyncMutex<Vec<DesiredRule>>,
}

impl SupervisorInner {
    fn config(&self) -> Arc<Config> {
        self.shared_config.get()
    }

    fn env(&self) -> MeshEnv {
        self.env.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn observe(&self) -> DaemonObservation {
        let env = self.env();
        DaemonObservation {
            socket: env.socket_path.exists(),
            state: env.state_path.exists(),
            process: daemon_process_alive(&env.pid_path),
            interface: netlink::interface_exists(&env.nic_name),
        }
    }

    /// Remove stray socket/state/pid files, honoring the protected paths.
    fn cleanup_stray_files(&self) {
        let env = self.env();
        for path in [&env.socket_path, &env.state_path, &env.pid_path] {
            if path.as_os_str().is_empty() || !path.exists() {
                continue;
            }
            if is_protected_path(path) {
                warn!("Refusing to clean protected path {}", path.display());
                continue;
            }
            if let Err(e) = std::fs::remove_file(path) {
                warn!("Failed to remove stray file {}: {}", path.display(), e);
            } else {
                debug!("Removed stray file {}", path.display());
            }
        }
    }

    async fn cleanup_interface(&self) {
        let env = self.env();
        let extra: Vec<&str> = if self.config().mesh.mode == MeshMode::Host {
            vec![crate::mesh_env::HOST_NIC_NAME]
        } else {
            Vec::new()
        };
        if netlink::is_protected_nic(&env.nic_name, &extra) {
            warn!("Refusing to delete protected interface {}", env.nic_name);
            return;
        }
        #[cfg(target_os = "linux")]
        {
            match netlink::connect() {
                Ok(handle) => {
                    if let Err(e) = netlink::delete_link(&handle, &env.nic_name).await {
                        warn!("Failed to delete interface {}: {:#}", env.nic_name, e);
                    } else {
                        info!("Deleted orphaned interface {}", env.nic_name);
                    }
                }
                Err(e) => warn!("Netlink unavailable for interface cleanup: {:#}", e),
            }
        }
    }

    /// Spawn tailscaled with the environment's socket/state/tun settings and
    /// record its pid.
    async fn spawn_daemon(&self) -> Result<()> {
        let env = self.env();
        let mut command = tokio::process::Command::new("tailscaled");
        command
            .arg(format!("--socket={}", env.socket_path.display()))
            .arg(format!("--state={}", env.state_path.display()))
            .arg(format!("--tun={}", env.nic_name))
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());

        let child = command.spawn().context("failed to spawn tailscaled")?;
        if let Some(pid) = child.id() {
            if let Err(e) = std::fs::write(&env.pid_path, pid.to_string()) {
                warn!("Failed to write pid file: {}", e);
            }
            info!("Spawned tailscaled (pid {})", pid);
        }
        *self.child.lock().await = Some(child);
        self.setup_done.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn kill_daemon(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill tailscaled: {}", e);
            }
        }
    }

    /// One keep-alive tick of the daemon-mode state machine.
    async fn monitor_and_maintain(&self) -> Result<()> {
        let obs = self.observe();
        let action = decide_action(obs);
        debug!(
            "Daemon observation socket={} state={} process={} interface={} -> {:?}",
            obs.socket, obs.state, obs.process, obs.interface, action
        );

        match action {
            DaemonAction::StartFresh => {
                self.cleanup_stray_files();
                self.spawn_daemon().await?;
                self.attempt_login().await?;
            }
            DaemonAction::RestartWithExistingData => {
                info!("Daemon process gone, restarting with existing state");
                self.spawn_daemon().await?;
            }
            DaemonAction::ProbeHealth => {
                let status = self.clients.tailscale().get_status().await;
                match status {
                    Ok(status) if status.needs_login() => {
                        info!("Daemon needs login, re-authenticating");
                        self.attempt_login().await?;
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Daemon health probe failed: {}", e),
                }
            }
            DaemonAction::CleanupInterfaceThenStartFresh => {
                self.cleanup_interface().await;
                self.cleanup_stray_files();
                self.spawn_daemon().await?;
                self.attempt_login().await?;
            }
            DaemonAction::CleanupAndRestart => {
                self.kill_daemon().await;
                self.cleanup_stray_files();
                self.spawn_daemon().await?;
                self.attempt_login().await?;
            }
        }
        Ok(())
    }

    fn up_options(&self, auth_key: String) -> UpOptions {
        let config = self.config();
        UpOptions {
            auth_key,
            hostname: self.env().hostname,
            control_url: config.control_url().to_string(),
            accept_routes: true,
            shields_up: false,
            accept_dns: config.mesh.accept_dns,
        }
    }

    /// Three ordered login strategies; first success wins.
    async fn attempt_login(&self) -> Result<()> {
        let tailscale = self.clients.tailscale();

        // S1: rely on existing login state
        if let Ok(status) = tailscale.get_status().await {
            if status.is_running() && status.has_ips() {
                debug!("Daemon already running with IPs, skipping login");
                return Ok(());
            }
        }
        match tailscale.up_with_options(&self.up_options("auto".to_string())).await {
            Ok(()) => {
                if let Ok(status) = tailscale.get_status().await {
                    if status.is_running() {
                        info!("Login succeeded with existing credentials");
                        return Ok(());
                    }
                }
            }
            Err(e) => debug!("Auto login attempt failed: {}", e),
        }

        // S2: stored pre-auth key
        self.auth_key.cleanup_expired();
        if let Some(key) = self.auth_key.key() {
            match tailscale.up_with_options(&self.up_options(key)).await {
                Ok(()) => {
                    info!("Login succeeded with stored pre-auth key");
                    return Ok(());
                }
                Err(e) => warn!("Login with stored pre-auth key failed: {}", e),
            }
        }

        // S3: mint a fresh key from the coordinator and retry
        let key = self.refresh_auth_key().await?;
        tailscale
            .up_with_options(&self.up_options(key))
            .await
            .context("login with freshly issued pre-auth key failed")?;
        info!("Login succeeded with fresh pre-auth key");
        Ok(())
    }

    /// Create a pre-auth key with bounded fixed-delay retries and store it.
    async fn refresh_auth_key(&self) -> Result<String> {
        let config = self.config();
        let request = CreatePreAuthKeyRequest {
            user: if config.mesh.user.is_empty() {
                "default".to_string()
            } else {
                config.mesh.user.clone()
            },
            reusable: false,
            ephemeral: false,
            acl_tags: build_acl_tags(&config.mesh.acl_tags, &self.node_name),
            expiration: Some(Utc::now() + chrono::Duration::hours(AUTH_KEY_LIFETIME_HOURS)),
        };

        // Retry count comes from coordinator.retries; fixed delay between
        // attempts
        let retries = config.coordinator.retries.max(1);
        let backoff_config = ExponentialBackoff {
            initial_interval: AUTH_CREATE_RETRY_DELAY,
            max_interval: AUTH_CREATE_RETRY_DELAY,
            multiplier: 1.0,
            max_elapsed_time: Some(AUTH_CREATE_RETRY_DELAY * retries),
            ..Default::default()
        };

        let key = backoff::future::retry(backoff_config, || {
            let client = self.clients.headscale();
            let request = request.clone();
            async move {
                match tokio::task::spawn_blocking(move || client.create_pre_auth_key(&request))
                    .await
                {
                    Ok(Ok(key)) => Ok(key),
                    Ok(Err(e)) => {
                        warn!("Pre-auth key creation failed, retrying: {}", e);
                        Err(backoff::Error::transient(anyhow::Error::from(e)))
                    }
                    Err(e) => Err(backoff::Error::permanent(anyhow::anyhow!(
                        "pre-auth key task panicked: {}",
                        e
                    ))),
                }
            }
        })
        .await
        .context("pre-auth key creation failed after retries")?;

        let expires_at = key
            .expiration
            .as_deref()
            .and_then(|s| s.parse::<chrono::DateTime<Utc>>().ok())
            .unwrap_or_else(|| Utc::now() + chrono::Duration::hours(AUTH_KEY_LIFETIME_HOURS));
        self.auth_key.set(key.key.clone(), expires_at);
        info!("Issued fresh pre-auth key (expires {})", expires_at);
        Ok(key.key)
    }

    /// Wait for Running + IPs, bounded.
    async fn wait_until_ready(&self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + READY_TIMEOUT;
        loop {
            match self.clients.tailscale().get_status().await {
                Ok(status) if status.is_running() && status.has_ips() => return Ok(()),
                Ok(status) => {
                    debug!("Daemon not ready yet (state {})", status.backend_state)
                }
                Err(e) => debug!("Daemon status probe failed: {}", e),
            }
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("daemon did not reach Running with IPs in time");
            }
            tokio::time::sleep(READY_PROBE_INTERVAL).await;
        }
    }

    /// Wait for the coordinator to show our route, then enable it (and,
    /// preserving legacy behavior, sweep-enable the other routes returned).
    async fn wait_and_enable_routes(&self, node_id: &str, pod_cidr: &str) -> Result<()> {
        for _try in 0..ROUTE_WAIT_TRIES {
            let client = self.clients.headscale();
            let routes = tokio::task::spawn_blocking(move || client.get_routes())
                .await
                .context("route fetch task panicked")?;

            match routes {
                Ok(routes) => {
                    let ours = routes
                        .iter()
                        .find(|route| route.node_id() == node_id && route.prefix == pod_cidr);
                    if let Some(route) = ours {
                        if !route.enabled {
                            let client = self.clients.headscale();
                            let id = route.id.clone();
                            tokio::task::spawn_blocking(move || client.enable_route(&id))
                                .await
                                .context("route enable task panicked")?
                                .context("failed to enable our route")?;
                            info!("Enabled coordinator route for {}", pod_cidr);
                        }
                        // Legacy sweep: enable whatever else is disabled,
                        // tolerating per-route failures
                        for other in routes.iter().filter(|r| !r.enabled && r.id != route.id) {
                            let client = self.clients.headscale();
                            let id = other.id.clone();
                            let enabled =
                                tokio::task::spawn_blocking(move || client.enable_route(&id))
                                    .await;
                            match enabled {
                                Ok(Ok(())) => debug!("Sweep-enabled route {}", other.id),
                                Ok(Err(e)) => {
                                    warn!("Sweep enable of route {} failed: {}", other.id, e)
                                }
                                Err(e) => warn!("Sweep enable task panicked: {}", e),
                            }
                        }
                        return Ok(());
                    }
                    debug!("Route {} not on coordinator yet", pod_cidr);
                }
                Err(e) => warn!("Route listing failed while waiting: {}", e),
            }
            tokio::time::sleep(ROUTE_WAIT_INTERVAL).await;
        }
        anyhow::bail!(
            "coordinator never showed route {} for node {}",
            pod_cidr,
            node_id
        )
    }

    /// Post-login route setup: accept + advertise, approve on the
    /// coordinator, annotate the node, then hand off to rule maintenance.
    async fn setup_and_manage_routes(
        self_arc: &Arc<SupervisorInner>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let this = self_arc.as_ref();
        let tailscale = this.clients.tailscale();
        let status = tailscale.get_status().await.context("status unavailable")?;
        let mesh_ip = status.mesh_ip().context("daemon has no mesh IP")?;
        let node_key = status.self_node.public_key.clone();

        let pod_cidr = this
            .cidr_source
            .current_pod_cidr()
            .await
            .context("Pod CIDR unavailable")?;

        tailscale
            .accept_routes()
            .await
            .context("failed to enable route acceptance")?;

        let prefs = tailscale.get_prefs().await.context("prefs unavailable")?;
        if let Some(merged) = merge_advertised(&prefs.advertise_routes, &pod_cidr) {
            tailscale
                .advertise_routes(&merged)
                .await
                .context("failed to advertise Pod CIDR")?;
            info!("Advertised Pod CIDR {}", pod_cidr);
        }

        // Resolve our node on the coordinator by mesh hostname
        let mesh_name = this.env().hostname;
        let client = this.clients.headscale();
        let node = tokio::task::spawn_blocking(move || client.find_node_by_name(&mesh_name))
            .await
            .context("node lookup task panicked")?
            .context("node lookup failed")?
            .context("node not registered with coordinator")?;

        this.wait_and_enable_routes(&node.id, &pod_cidr).await?;

        if let Some(annotator) = &this.annotator {
            let mut annotations = BTreeMap::new();
            annotations.insert(ANNOTATION_TAILSCALE_IP.to_string(), mesh_ip.to_string());
            annotations.insert(ANNOTATION_NODE_KEY.to_string(), node_key);
            annotations.insert(ANNOTATION_POD_CIDR.to_string(), pod_cidr.clone());
            if let Err(e) = annotator.update_annotations(annotations).await {
                warn!("Failed to annotate node: {:#}", e);
            }
        }

        SupervisorInner::spawn_rule_maintenance(self_arc.clone(), mesh_ip, pod_cidr, cancel.clone());
        Ok(())
    }

    /// Periodic, idempotent installation of the policy rules.
    fn spawn_rule_maintenance(
        inner: Arc<SupervisorInner>,
        mesh_ip: IpAddr,
        pod_cidr: String,
        cancel: CancellationToken,
    ) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RULE_MAINTENANCE_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                inner.maintain_rules(mesh_ip, &pod_cidr).await;
            }
        });
    }

    async fn maintain_rules(&self, mesh_ip: IpAddr, pod_cidr: &str) {
        let local_ip = crate::tailscale::TailscaleClient::get_local_ip().ok();
        let rules = desired_policy_rules(mesh_ip, local_ip, pod_cidr);

        #[cfg(target_os = "linux")]
        {
            let handle = match netlink::connect() {
                Ok(handle) => handle,
                Err(e) => {
                    warn!("Netlink unavailable for rule maintenance: {:#}", e);
                    return;
                }
            };
            for rule in &rules {
                if let Err(e) = netlink::ensure_rule(&handle, rule).await {
                    warn!(
                        "Failed to ensure rule priority={}: {:#}",
                        rule.priority, e
                    );
                }
            }
        }

        *self.installed_rules.lock().await = rules;
    }

    /// Remove the rules we installed. Best-effort, used on stop.
    async fn remove_rules(&self) {
        let rules = std::mem::take(&mut *self.installed_rules.lock().await);
        if rules.is_empty() {
            return;
        }
        #[cfg(target_os = "linux")]
        {
            let handle = match netlink::connect() {
                Ok(handle) => handle,
                Err(e) => {
                    warn!("Netlink unavailable for rule removal: {:#}", e);
                    return;
                }
            };
            for rule in &rules {
                if let Err(e) = netlink::remove_rule(&handle, rule).await {
                    warn!("Failed to remove rule priority={}: {:#}", rule.priority, e);
                }
            }
        }
        #[cfg(not(target_os = "linux"))]
        let _ = rules;
    }

    /// Health tick shared by both modes: run initial setup once the daemon
    /// is ready, retrying opportunistically if it was skipped.
    async fn health_tick(self_arc: &Arc<SupervisorInner>, cancel: &CancellationToken) {
        let this = self_arc.as_ref();
        if this.setup_done.load(Ordering::SeqCst) {
            match this.clients.tailscale().get_status().await {
                Ok(status) if status.is_running() => {
                    this.registry.update_service_status(SERVICE_NAME, true, None);
                }
                Ok(status) => {
                    this.registry.update_service_status(
                        SERVICE_NAME,
                        true,
                        Some(&format!("daemon state {}", status.backend_state)),
                    );
                }
                Err(e) => {
                    this.registry
                        .update_service_status(SERVICE_NAME, true, Some(&e.to_string()));
                }
            }
            return;
        }

        if let Err(e) = this.wait_until_ready().await {
            debug!("Initial setup still waiting: {:#}", e);
            return;
        }
        match SupervisorInner::setup_and_manage_routes(self_arc, cancel).await {
            Ok(()) => {
                this.setup_done.store(true, Ordering::SeqCst);
                this.registry.update_service_status(SERVICE_NAME, true, None);
                info!("Route setup complete");
            }
            Err(e) => {
                warn!("Route setup failed, will retry: {:#}", e);
                this.registry
                    .update_service_status(SERVICE_NAME, true, Some(&e.to_string()));
            }
        }
    }

    /// Hourly check that refreshes the key before it expires.
    async fn auth_refresh_tick(&self) {
        self.auth_key.cleanup_expired();
        if !self
            .auth_key
            .expires_within(chrono::Duration::hours(AUTH_REFRESH_WINDOW_HOURS))
        {
            return;
        }
        debug!("Pre-auth key expiring soon, refreshing");
        if let Err(e) = self.refresh_auth_key().await {
            warn!("Background pre-auth key refresh failed: {:#}", e);
        }
    }
}

/// Supervisor service for the mesh daemon.
pub struct VpnSupervisor {
    inner: Arc<SupervisorInner>,
    /// Mesh settings the running instance was started with
    started_mesh: std::sync::Mutex<Option<MeshConfig>>,
    running: AtomicBool,
    cancel: AsyncMutex<Option<CancellationToken>>,
}

impl VpnSupervisor {
    pub fn new(
        shared_config: SharedConfig,
        clients: Arc<ClientRegistry>,
        registry: HealthRegistry,
        cidr_source: Arc<dyn PodCidrSource>,
        annotator: Option<Arc<dyn NodeAnnotator>>,
        node_name: String,
    ) -> Result<Self> {
        let env = MeshEnv::derive(&shared_config.get(), &node_name)?;
        Ok(Self {
            inner: Arc::new(SupervisorInner {
                shared_config,
                env: std::sync::RwLock::new(env),
                clients,
                registry,
                cidr_source,
                annotator,
                auth_key: AuthKeyState::new(),
                node_name,
                setup_done: AtomicBool::new(false),
                child: AsyncMutex::new(None),
                installed_rules: AsyncMutex::new(Vec::new()),
            }),
            started_mesh: std::sync::Mutex::new(None),
            running: AtomicBool::new(false),
            cancel: AsyncMutex::new(None),
        })
    }

    pub fn auth_key(&self) -> &AuthKeyState {
        &self.inner.auth_key
    }

    async fn start_host_mode(&self, cancel: &CancellationToken) -> Result<()> {
        let inner = &self.inner;
        let env = inner.env();
        if !env.socket_path.exists() {
            anyhow::bail!(
                "host mode requires a running tailscaled at {}",
                env.socket_path.display()
            );
        }
        let status = inner
            .clients
            .tailscale()
            .get_status()
            .await
            .context("host tailscaled unreachable")?;
        if !status.is_running() {
            anyhow::bail!(
                "host tailscaled is not Running (state {})",
                status.backend_state
            );
        }

        self.spawn_health_loop(cancel.clone());
        Ok(())
    }

    async fn start_daemon_mode(&self, cancel: &CancellationToken) -> Result<()> {
        let inner = &self.inner;
        let env = inner.env();
        std::fs::create_dir_all(&env.config_dir)
            .with_context(|| format!("failed to create {}", env.config_dir.display()))?;

        // Keep-alive state machine
        let keepalive = inner.clone();
        let keepalive_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
            loop {
                tokio::select! {
                    _ = keepalive_cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = keepalive.monitor_and_maintain().await {
                    // The daemon may refuse to come up for a while; keep
                    // retrying under the loop, never exit the process.
                    error!("Daemon keep-alive tick failed: {:#}", e);
                }
            }
        });

        // Background pre-auth key refresher
        let refresher = inner.clone();
        let refresher_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(AUTH_REFRESH_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = refresher_cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                refresher.auth_refresh_tick().await;
            }
        });

        self.spawn_health_loop(cancel.clone());
        Ok(())
    }

    fn spawn_health_loop(&self, cancel: CancellationToken) {
        let inner = self.inner.clone();
        let loop_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEALTH_INTERVAL);
            loop {
                tokio::select! {
                    _ = loop_cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                SupervisorInner::health_tick(&inner, &cancel).await;
            }
        });
    }
}

#[async_trait]
impl Service for VpnSupervisor {
    fn name(&self) -> &str {
        SERVICE_NAME
    }

    async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let config = self.inner.config();

        // Re-derive the environment so a reloaded mesh configuration takes
        // effect on restart
        match MeshEnv::derive(&config, &self.inner.node_name) {
            Ok(env) => {
                *self.inner.env.write().unwrap_or_else(|e| e.into_inner()) = env;
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        }

        let cancel = CancellationToken::new();
        let result = match config.mesh.mode {
            MeshMode::Host => self.start_host_mode(&cancel).await,
            MeshMode::Daemon => self.start_daemon_mode(&cancel).await,
        };
        if let Err(e) = result {
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }

        *self.cancel.lock().await = Some(cancel);
        *self
            .started_mesh
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(config.mesh.clone());
        let env = self.inner.env();
        info!(
            "VPN supervisor started ({} mode, nic {})",
            if env.is_daemon { "daemon" } else { "host" },
            env.nic_name
        );
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(cancel) = self.cancel.lock().await.take() {
            cancel.cancel();
        }
        self.inner.remove_rules().await;
        if self.inner.env().is_daemon {
            self.inner.kill_daemon().await;
        }
        info!("VPN supervisor stopped");
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        let current = self.inner.config().mesh.clone();
        let unchanged = self
            .started_mesh
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            == Some(&current);
        if unchanged && self.is_running() {
            debug!("Mesh configuration unchanged, supervisor reload is a no-op");
            return Ok(());
        }
        self.stop().await?;
        tokio::time::sleep(Duration::from_millis(500)).await;
        self.start().await
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn obs(socket: bool, state: bool, process: bool, interface: bool) -> DaemonObservation {
        DaemonObservation {
            socket,
            state,
            process,
            interface,
        }
    }

    #[test]
    fn test_state_machine_table() {
        assert_eq!(decide_action(obs(false, false, false, false)), DaemonAction::StartFresh);

        assert_eq!(
            decide_action(obs(true, true, false, false)),
            DaemonAction::RestartWithExistingData
        );
        assert_eq!(
            decide_action(obs(true, true, false, true)),
            DaemonAction::RestartWithExistingData
        );
        assert_eq!(
            decide_action(obs(false, true, false, true)),
            DaemonAction::RestartWithExistingData
        );

        assert_eq!(decide_action(obs(true, true, true, true)), DaemonAction::ProbeHealth);

        assert_eq!(
            decide_action(obs(false, false, false, true)),
            DaemonAction::CleanupInterfaceThenStartFresh
        );

        // Inconsistent leftovers
        assert_eq!(
            decide_action(obs(true, false, false, false)),
            DaemonAction::CleanupAndRestart
        );
        assert_eq!(
            decide_action(obs(true, true, true, false)),
            DaemonAction::CleanupAndRestart
        );
        assert_eq!(
            decide_action(obs(false, false, true, true)),
            DaemonAction::CleanupAndRestart
        );
    }

    #[test]
    fn test_protected_cleanup_paths() {
        assert!(is_protected_path(Path::new("/var/lib/tailscale/tailscaled.state")));
        assert!(is_protected_path(Path::new("/var/run/tailscale/tailscaled.sock")));
        assert!(is_protected_path(Path::new("/usr/bin/tailscaled")));
        assert!(is_protected_path(Path::new("/opt/tailscale/sock")));

        assert!(!is_protected_path(Path::new("/var/run/headcni/headcni_tailscale.sock")));
        assert!(!is_protected_path(Path::new("/tmp/tailscaled.pid")));
    }

    #[test]
    fn test_build_acl_tags() {
        let tags = build_acl_tags(
            &["k8s-node".to_string(), "tag:infra".to_string()],
            "worker-01",
        );
        assert_eq!(tags, vec!["tag:k8s-node", "tag:infra", "tag:node:worker-01"]);
    }

    #[test]
    fn test_build_acl_tags_no_duplicate_node_tag() {
        let tags = build_acl_tags(&["tag:node:worker-01".to_string()], "worker-01");
        assert_eq!(tags, vec!["tag:node:worker-01"]);
    }

    #[test]
    fn test_desired_policy_rules_all_three() {
        let mesh = IpAddr::V4(Ipv4Addr::new(100, 64, 0, 7));
        let local = Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)));
        let rules = desired_policy_rules(mesh, local, "10.244.3.0/24");

        assert_eq!(rules.len(), 3);
        assert_eq!(rules[0].priority, 3153);
        assert_eq!(rules[0].table, 53);
        assert_eq!(rules[0].src.unwrap().to_string(), "100.64.0.7/32");

        assert_eq!(rules[1].priority, 3152);
        assert_eq!(rules[1].table, 52);
        assert_eq!(rules[1].src.unwrap().to_string(), "192.168.1.20/32");

        assert_eq!(rules[2].priority, 3151);
        assert_eq!(rules[2].table, 254);
        assert_eq!(rules[2].dst.unwrap().to_string(), "10.244.3.0/24");
    }

    #[test]
    fn test_desired_policy_rules_skips_local_when_equal_to_mesh() {
        let mesh = IpAddr::V4(Ipv4Addr::new(100, 64, 0, 7));
        let rules = desired_policy_rules(mesh, Some(mesh), "10.244.3.0/24");
        assert_eq!(rules.len(), 2);
        assert!(rules.iter().all(|rule| rule.priority != 3152));
    }

    #[test]
    fn test_desired_policy_rules_malformed_cidr() {
        let mesh = IpAddr::V4(Ipv4Addr::new(100, 64, 0, 7));
        let rules = desired_policy_rules(mesh, None, "not-a-cidr");
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].priority, 3153);
    }

    #[test]
    fn test_daemon_process_alive_missing_pid_file() {
        assert!(!daemon_process_alive(Path::new("/nonexistent/tailscaled.pid")));
    }

    #[test]
    fn test_daemon_process_alive_garbage_pid() {
        let dir = tempfile::tempdir().unwrap();
        let pid_path = dir.path().join("tailscaled.pid");
        std::fs::write(&pid_path, "not-a-pid").unwrap();
        assert!(!daemon_process_alive(&pid_path));

        std::fs::write(&pid_path, "-5").unwrap();
        assert!(!daemon_process_alive(&pid_path));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_daemon_process_alive_own_pid() {
        let dir = tempfile::tempdir().unwrap();
        let pid_path = dir.path().join("tailscaled.pid");
        std::fs::write(&pid_path, std::process::id().to_string()).unwrap();
        assert!(daemon_process_alive(&pid_path));
    }
}
