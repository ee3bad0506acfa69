//! Configuration management for the HeadCNI agent
//!
//! Loads configuration from YAML file with environment variable overrides.
//! The loaded `Config` is an immutable snapshot; reload builds a fresh one
//! and swaps it in atomically (see `daemon.rs`).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// How the agent drives the mesh VPN on this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeshMode {
    /// Reuse a tailscaled already running on the host.
    Host,
    /// Supervise a dedicated tailscaled owned by this agent.
    Daemon,
}

impl Default for MeshMode {
    fn default() -> Self {
        MeshMode::Host
    }
}

/// Headscale coordinator connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Base URL of the Headscale API (e.g. https://headscale.example.com)
    pub url: String,

    /// API key for bearer authentication
    pub auth_key: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_coordinator_timeout")]
    pub timeout_secs: u64,

    /// Bounded retry count for write operations
    #[serde(default = "default_coordinator_retries")]
    pub retries: u32,
}

/// Mesh VPN (tailscaled) settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshConfig {
    #[serde(default)]
    pub mode: MeshMode,

    /// Control URL handed to tailscaled (normally the coordinator URL)
    #[serde(default)]
    pub control_url: String,

    /// LocalAPI socket path (None = derived from mode, see mesh_env)
    #[serde(default)]
    pub socket_path: Option<String>,

    /// Mesh interface name (None = derived from mode)
    #[serde(default)]
    pub interface_name: Option<String>,

    #[serde(default = "default_mesh_mtu")]
    pub mtu: u32,

    /// Prefix for generated daemon-mode hostnames
    #[serde(default = "default_hostname_prefix")]
    pub hostname_prefix: String,

    /// Headscale user pre-auth keys are created under
    #[serde(default = "default_mesh_user")]
    pub user: String,

    /// ACL tags requested for this node
    #[serde(default)]
    pub acl_tags: Vec<String>,

    #[serde(default)]
    pub accept_dns: bool,
}

/// Cluster network settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Cluster Pod CIDR base (the per-node CIDR is a subnet of this)
    #[serde(default = "default_pod_cidr_base")]
    pub pod_cidr_base: String,

    #[serde(default = "default_service_cidr")]
    pub service_cidr: String,

    #[serde(default = "default_network_mtu")]
    pub mtu: u32,

    #[serde(default)]
    pub enable_ipv6: bool,

    #[serde(default)]
    pub enable_network_policy: bool,
}

/// DNS settings forwarded to the CNI env file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DnsConfig {
    #[serde(default)]
    pub magic_dns: bool,

    #[serde(default)]
    pub nameservers: Vec<String>,

    #[serde(default)]
    pub search_domains: Vec<String>,

    #[serde(default)]
    pub options: Vec<String>,
}

/// Health endpoint settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_monitoring_port")]
    pub port: u16,

    #[serde(default = "default_monitoring_path")]
    pub path: String,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_monitoring_port(),
            path: default_monitoring_path(),
        }
    }
}

/// Extra CNI plugin appended after the primary plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtraPlugin {
    /// Ascending order of appearance in the conflist
    #[serde(default)]
    pub priority: i32,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Raw plugin blob, passed through as-is
    pub config: serde_json::Value,
}

/// Agent configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub coordinator: CoordinatorConfig,

    #[serde(default = "default_mesh")]
    pub mesh: MeshConfig,

    #[serde(default = "default_network")]
    pub network: NetworkConfig,

    #[serde(default)]
    pub dns: DnsConfig,

    #[serde(default)]
    pub monitoring: MonitoringConfig,

    /// Extra CNI plugins, ordered by `priority`
    #[serde(default)]
    pub cni_plugins: Vec<ExtraPlugin>,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Path where config was loaded from (not serialized)
    #[serde(skip)]
    pub config_path: PathBuf,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_coordinator_timeout() -> u64 {
    10
}

fn default_coordinator_retries() -> u32 {
    3
}

fn default_mesh_mtu() -> u32 {
    1280
}

fn default_hostname_prefix() -> String {
    "headcni".to_string()
}

fn default_mesh_user() -> String {
    "default".to_string()
}

fn default_pod_cidr_base() -> String {
    "10.244.0.0/16".to_string()
}

fn default_service_cidr() -> String {
    "10.96.0.0/12".to_string()
}

fn default_network_mtu() -> u32 {
    1450
}

fn default_monitoring_port() -> u16 {
    9445
}

fn default_monitoring_path() -> String {
    "/health".to_string()
}

fn default_true() -> bool {
    true
}

fn default_mesh() -> MeshConfig {
    MeshConfig {
        mode: MeshMode::Host,
        control_url: String::new(),
        socket_path: None,
        interface_name: None,
        mtu: default_mesh_mtu(),
        hostname_prefix: default_hostname_prefix(),
        user: default_mesh_user(),
        acl_tags: Vec::new(),
        accept_dns: false,
    }
}

fn default_network() -> NetworkConfig {
    NetworkConfig {
        pod_cidr_base: default_pod_cidr_base(),
        service_cidr: default_service_cidr(),
        mtu: default_network_mtu(),
        enable_ipv6: false,
        enable_network_policy: false,
    }
}

impl Config {
    /// Load configuration from default locations
    pub fn load() -> Result<Self> {
        let paths = Self::config_paths();

        for path in &paths {
            if path.exists() {
                return Self::load_from_file(path);
            }
        }

        anyhow::bail!(
            "No configuration found. Tried: {:?}\nOr set HEADCNI_CONFIG to the config file path.",
            paths
        );
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.config_path = path.to_path_buf();

        // Environment variables override file values
        if let Ok(url) = std::env::var("HEADCNI_COORDINATOR_URL") {
            config.coordinator.url = url;
        }
        if let Ok(auth_key) = std::env::var("HEADCNI_AUTH_KEY") {
            config.coordinator.auth_key = auth_key;
        }
        if let Ok(log_level) = std::env::var("HEADCNI_LOG_LEVEL") {
            config.log_level = log_level;
        }

        config.validate()?;
        Ok(config)
    }

    /// Get the path where config was loaded from
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Control URL for tailscaled: explicit, else the coordinator URL
    pub fn control_url(&self) -> &str {
        if self.mesh.control_url.is_empty() {
            &self.coordinator.url
        } else {
            &self.mesh.control_url
        }
    }

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        if self.coordinator.url.is_empty() {
            anyhow::bail!("coordinator.url cannot be empty");
        }
        if !self.coordinator.url.starts_with("http://")
            && !self.coordinator.url.starts_with("https://")
        {
            anyhow::bail!("coordinator.url must start with http:// or https://");
        }
        if self.coordinator.auth_key.is_empty() {
            anyhow::bail!("coordinator.auth_key cannot be empty");
        }
        self.network.pod_cidr_base.parse::<ipnet::IpNet>().with_context(|| {
            format!(
                "network.pod_cidr_base is not a CIDR: {}",
                self.network.pod_cidr_base
            )
        })?;
        self.network.service_cidr.parse::<ipnet::IpNet>().with_context(|| {
            format!(
                "network.service_cidr is not a CIDR: {}",
                self.network.service_cidr
            )
        })?;
        if self.mesh.hostname_prefix.is_empty() {
            anyhow::bail!("mesh.hostname_prefix cannot be empty");
        }
        for plugin in &self.cni_plugins {
            if !plugin.config.is_object() {
                anyhow::bail!("cni_plugins entries must be JSON objects");
            }
        }
        Ok(())
    }

    /// Get list of config file paths to try
    fn config_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        // 1. Explicit override
        if let Ok(path) = std::env::var("HEADCNI_CONFIG") {
            paths.push(PathBuf::from(path));
        }

        // 2. Current directory
        paths.push(PathBuf::from("headcni.yaml"));

        // 3. User config directory
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("headcni").join("config.yaml"));
        }

        // 4. System config
        #[cfg(unix)]
        paths.push(PathBuf::from("/etc/headcni/config.yaml"));

        paths
    }

    /// Structural diff against another snapshot, listing the changed fields
    /// reload cares about.
    pub fn diff(&self, other: &Config) -> ConfigDiff {
        let mut changed = Vec::new();

        if self.coordinator.url != other.coordinator.url {
            changed.push("coordinator.url");
        }
        if self.coordinator.auth_key != other.coordinator.auth_key {
            changed.push("coordinator.auth_key");
        }
        if self.coordinator.timeout_secs != other.coordinator.timeout_secs {
            changed.push("coordinator.timeout_secs");
        }
        if self.coordinator.retries != other.coordinator.retries {
            changed.push("coordinator.retries");
        }
        if self.mesh.mode != other.mesh.mode {
            changed.push("mesh.mode");
        }
        if self.mesh.control_url != other.mesh.control_url {
            changed.push("mesh.control_url");
        }
        if self.mesh.socket_path != other.mesh.socket_path {
            changed.push("mesh.socket_path");
        }
        if self.mesh.mtu != other.mesh.mtu {
            changed.push("mesh.mtu");
        }
        if self.network.mtu != other.network.mtu {
            changed.push("network.mtu");
        }
        if self.network.service_cidr != other.network.service_cidr {
            changed.push("network.service_cidr");
        }
        if self.network.enable_ipv6 != other.network.enable_ipv6 {
            changed.push("network.enable_ipv6");
        }
        if self.monitoring.enabled != other.monitoring.enabled {
            changed.push("monitoring.enabled");
        }
        if self.monitoring.port != other.monitoring.port {
            changed.push("monitoring.port");
        }
        if self.monitoring.path != other.monitoring.path {
            changed.push("monitoring.path");
        }
        if self.log_level != other.log_level {
            changed.push("log_level");
        }

        ConfigDiff { changed }
    }
}

/// Handle to the current configuration snapshot.
///
/// Reload swaps the inner Arc; readers never hold a snapshot across calls
/// but re-fetch through `get`, which takes a read lock.
#[derive(Clone)]
pub struct SharedConfig {
    inner: std::sync::Arc<std::sync::RwLock<std::sync::Arc<Config>>>,
}

impl SharedConfig {
    pub fn new(config: std::sync::Arc<Config>) -> Self {
        Self {
            inner: std::sync::Arc::new(std::sync::RwLock::new(config)),
        }
    }

    pub fn get(&self) -> std::sync::Arc<Config> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set(&self, config: std::sync::Arc<Config>) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = config;
    }
}

/// Fields that differ between two configuration snapshots.
#[derive(Debug, Clone)]
pub struct ConfigDiff {
    changed: Vec<&'static str>,
}

impl ConfigDiff {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty()
    }

    pub fn fields(&self) -> &[&'static str] {
        &self.changed
    }

    pub fn coordinator_changed(&self) -> bool {
        self.changed.iter().any(|f| f.starts_with("coordinator."))
    }

    pub fn mesh_changed(&self) -> bool {
        self.changed.iter().any(|f| f.starts_with("mesh."))
    }

    pub fn network_changed(&self) -> bool {
        self.changed.iter().any(|f| f.starts_with("network."))
    }

    pub fn monitoring_changed(&self) -> bool {
        self.changed.iter().any(|f| f.starts_with("monitoring."))
    }

    pub fn log_level_changed(&self) -> bool {
        self.changed.contains(&"log_level")
    }
}
