//! CNI configuration writer
//!
//! Owns the on-disk conflist and the sidecar env file the CNI binary reads.
//! Prior files in the config directory are renamed aside before the first
//! write; subsequent updates go through an incremental path that rewrites
//! only when the primary plugin drifted.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::StateInconsistency;

pub const DEFAULT_CNI_CONFIG_DIR: &str = "/etc/cni/net.d";
pub const DEFAULT_ENV_FILE: &str = "/var/lib/headcni/env.yaml";
pub const CONFLIST_NAME: &str = "10-headcni.conflist";
pub const BACKUP_SUFFIX: &str = ".headcni_bak";

const CNI_VERSION: &str = "1.0.0";
const NETWORK_NAME: &str = "headcni";

/// Extensions of files we move aside before taking over the directory.
const BACKUP_CANDIDATES: &[&str] = &[".conflist", ".conf", ".json", ".yaml", ".yml"];

/// Values the on-disk files must reflect.
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredCniState {
    pub pod_cidr: String,
    pub service_cidr: String,
    pub mtu: u32,
    pub node_name: String,
    pub cluster_cidr: String,
    pub enable_ipv6: bool,
    pub pod_cidr_v6: Option<String>,
    pub dns_service_ip: String,
    pub cluster_domain: String,
}

/// CNI conflist document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CniConfList {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    pub name: String,
    pub plugins: Vec<serde_json::Value>,
}

/// DNS block of the env file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvDns {
    pub nameservers: Vec<String>,
    pub search: Vec<String>,
    pub options: Vec<String>,
}

/// Sidecar env file consumed by the CNI binary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CniEnvFile {
    pub network: String,
    pub subnet: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_v6: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subnet_v6: Option<String>,
    pub mtu: u32,
    pub ipmasq: bool,
    pub routes: Vec<String>,
    pub dns: EnvDns,
    pub policy: EnvPolicy,
    pub metadata: EnvMetadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvPolicy {
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvMetadata {
    pub generated_at: String,
    pub node_name: String,
    pub cluster_cidr: String,
    pub service_cidr: String,
}

/// Writer for the conflist and env file.
pub struct CniConfigManager {
    config_dir: PathBuf,
    backup_dir: PathBuf,
    env_path: PathBuf,
    network_mtu: u32,
    extra_plugins: Vec<(i32, serde_json::Value)>,
    dns: crate::config::DnsConfig,
    enable_policy: bool,
}

impl CniConfigManager {
    pub fn new(config: &Config) -> Self {
        Self::with_paths(config, DEFAULT_CNI_CONFIG_DIR, DEFAULT_ENV_FILE)
    }

    /// Path-injected constructor, also used by tests.
    pub fn with_paths(
        config: &Config,
        config_dir: impl Into<PathBuf>,
        env_path: impl Into<PathBuf>,
    ) -> Self {
        let config_dir = config_dir.into();
        let mut extra_plugins: Vec<(i32, serde_json::Value)> = config
            .cni_plugins
            .iter()
            .filter(|p| p.enabled)
            .map(|p| (p.priority, p.config.clone()))
            .collect();
        extra_plugins.sort_by_key(|(priority, _)| *priority);

        Self {
            backup_dir: config_dir.clone(),
            config_dir,
            env_path: env_path.into(),
            network_mtu: config.network.mtu,
            extra_plugins,
            dns: config.dns.clone(),
            enable_policy: config.network.enable_network_policy,
        }
    }

    pub fn conflist_path(&self) -> PathBuf {
        self.config_dir.join(CONFLIST_NAME)
    }

    pub fn env_path(&self) -> &Path {
        &self.env_path
    }

    /// Primary plugin blob owned by this agent.
    fn primary_plugin(&self, desired: &DesiredCniState) -> serde_json::Value {
        serde_json::json!({
            "type": "headcni",
            "podCIDR": desired.pod_cidr,
            "serviceCIDR": desired.service_cidr,
            "mtu": desired.mtu,
            "hairpinMode": true,
            "isDefaultGateway": true,
            "ipam": {
                "type": "host-local",
                "subnet": desired.pod_cidr,
                "routes": [ { "dst": "0.0.0.0/0" } ]
            }
        })
    }

    fn build_conflist(&self, desired: &DesiredCniState) -> CniConfList {
        let mut plugins = vec![self.primary_plugin(desired)];
        for (_, blob) in &self.extra_plugins {
            plugins.push(blob.clone());
        }
        CniConfList {
            cni_version: CNI_VERSION.to_string(),
            name: NETWORK_NAME.to_string(),
            plugins,
        }
    }

    /// Reject a conflist that a CNI runtime would refuse.
    fn validate(conflist: &CniConfList) -> Result<(), StateInconsistency> {
        if conflist.cni_version.is_empty() {
            return Err(StateInconsistency("conflist has empty cniVersion".into()));
        }
        if conflist.name.is_empty() {
            return Err(StateInconsistency("conflist has empty name".into()));
        }
        if conflist.plugins.is_empty() {
            return Err(StateInconsistency("conflist has no plugins".into()));
        }
        for (i, plugin) in conflist.plugins.iter().enumerate() {
            let has_type = plugin
                .get("type")
                .and_then(|t| t.as_str())
                .map(|t| !t.is_empty())
                .unwrap_or(false);
            if !has_type {
                return Err(StateInconsistency(format!(
                    "conflist plugin {} has no type",
                    i
                )));
            }
        }
        Ok(())
    }

    /// Rename aside every CNI-looking file already in the config directory.
    fn backup_existing(&self) -> Result<()> {
        if !self.config_dir.exists() {
            return Ok(());
        }
        for entry in fs::read_dir(&self.config_dir)
            .with_context(|| format!("failed to read {}", self.config_dir.display()))?
        {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !BACKUP_CANDIDATES.iter().any(|ext| name.ends_with(ext)) {
                continue;
            }
            let from = entry.path();
            let to = self.backup_dir.join(format!("{}{}", name, BACKUP_SUFFIX));
            info!("Backing up {} -> {}", from.display(), to.display());
            fs::rename(&from, &to)
                .with_context(|| format!("failed to back up {}", from.display()))?;
        }
        Ok(())
    }

    fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, content)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("failed to move {} into place", path.display()))?;
        Ok(())
    }

    /// Full write: back up whatever is there, then emit conflist + env file.
    pub fn write_full(&self, desired: &DesiredCniState) -> Result<()> {
        let conflist = self.build_conflist(desired);
        Self::validate(&conflist)?;

        self.backup_existing()?;

        let json = serde_json::to_vec_pretty(&conflist)?;
        Self::write_atomic(&self.conflist_path(), &json)?;
        info!(
            "Wrote CNI conflist {} (podCIDR={})",
            self.conflist_path().display(),
            desired.pod_cidr
        );

        self.write_env_file(desired)?;
        Ok(())
    }

    /// Incremental update. Returns true when the conflist was rewritten.
    ///
    /// A valid on-disk list whose primary plugin already matches the desired
    /// {podCIDR, serviceCIDR, MTU, IPAM subnet} is left untouched; otherwise
    /// only those fields are replaced. An unreadable or invalid file is
    /// regenerated from scratch.
    pub fn update_incremental(&self, desired: &DesiredCniState) -> Result<bool> {
        let path = self.conflist_path();
        let existing = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(_) => {
                debug!("No conflist at {}, writing full", path.display());
                self.write_full(desired)?;
                return Ok(true);
            }
        };

        let mut conflist: CniConfList = match serde_json::from_str(&existing) {
            Ok(list) => list,
            Err(e) => {
                warn!(
                    "Conflist at {} is invalid ({}), regenerating",
                    path.display(),
                    e
                );
                self.write_full(desired)?;
                return Ok(true);
            }
        };
        if Self::validate(&conflist).is_err() {
            warn!("Conflist at {} failed validation, regenerating", path.display());
            self.write_full(desired)?;
            return Ok(true);
        }

        let primary = &mut conflist.plugins[0];
        let matches = primary.get("podCIDR").and_then(|v| v.as_str())
            == Some(desired.pod_cidr.as_str())
            && primary.get("serviceCIDR").and_then(|v| v.as_str())
                == Some(desired.service_cidr.as_str())
            && primary.get("mtu").and_then(|v| v.as_u64()) == Some(desired.mtu as u64)
            && primary.pointer("/ipam/subnet").and_then(|v| v.as_str())
                == Some(desired.pod_cidr.as_str());

        if matches {
            debug!("Conflist already current, skipping rewrite");
            return Ok(false);
        }

        primary["podCIDR"] = serde_json::Value::String(desired.pod_cidr.clone());
        primary["serviceCIDR"] = serde_json::Value::String(desired.service_cidr.clone());
        primary["mtu"] = serde_json::json!(desired.mtu);
        if let Some(subnet) = primary.pointer_mut("/ipam/subnet") {
            *subnet = serde_json::Value::String(desired.pod_cidr.clone());
        }

        let json = serde_json::to_vec_pretty(&conflist)?;
        Self::write_atomic(&path, &json)?;
        info!(
            "Updated CNI conflist primary plugin (podCIDR={})",
            desired.pod_cidr
        );

        self.write_env_file(desired)?;
        Ok(true)
    }

    /// Emit the sidecar env YAML next to the state directory.
    pub fn write_env_file(&self, desired: &DesiredCniState) -> Result<()> {
        let mut nameservers = self.dns.nameservers.clone();
        if nameservers.is_empty() {
            nameservers.push(desired.dns_service_ip.clone());
        }
        let mut search = self.dns.search_domains.clone();
        if search.is_empty() {
            search.push(format!("svc.{}", desired.cluster_domain));
            search.push(desired.cluster_domain.clone());
        }

        let env = CniEnvFile {
            network: desired.cluster_cidr.clone(),
            subnet: desired.pod_cidr.clone(),
            network_v6: desired
                .enable_ipv6
                .then(|| desired.pod_cidr_v6.clone())
                .flatten(),
            subnet_v6: desired
                .enable_ipv6
                .then(|| desired.pod_cidr_v6.clone())
                .flatten(),
            mtu: desired.mtu,
            ipmasq: true,
            routes: vec![desired.service_cidr.clone()],
            dns: EnvDns {
                nameservers,
                search,
                options: self.dns.options.clone(),
            },
            policy: EnvPolicy {
                enabled: self.enable_policy,
            },
            metadata: EnvMetadata {
                generated_at: Utc::now().to_rfc3339(),
                node_name: desired.node_name.clone(),
                cluster_cidr: desired.cluster_cidr.clone(),
                service_cidr: desired.service_cidr.clone(),
            },
        };

        let yaml = serde_yaml::to_string(&env)?;
        Self::write_atomic(&self.env_path, yaml.as_bytes())?;
        debug!("Wrote CNI env file {}", self.env_path.display());
        Ok(())
    }
}
