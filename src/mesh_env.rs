//! Mesh environment derivation
//!
//! Computes the per-mode file layout (socket, state, pid, hostname file) and
//! the stable mesh hostname for this node. Daemon-mode hostnames are
//! generated once and persisted next to the socket so identity survives
//! restarts; the file is regenerated only when missing or malformed.

use anyhow::{Context, Result};
use rand::Rng;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::{Config, MeshMode};

/// Shared tailscaled socket in host mode
pub const HOST_SOCKET_PATH: &str = "/var/run/tailscale/tailscaled.sock";
/// Canonical shared mesh interface in host mode
pub const HOST_NIC_NAME: &str = "tailscale0";

/// Daemon-mode state directory and file names
pub const DAEMON_STATE_DIR: &str = "/var/run/headcni";
pub const DAEMON_SOCKET_NAME: &str = "headcni_tailscale.sock";
pub const DAEMON_PID_NAME: &str = "tailscaled.pid";
pub const DAEMON_STATE_NAME: &str = "tailscaled.state";
pub const DAEMON_HOSTNAME_NAME: &str = "hostname";
/// Dedicated per-node interface in daemon mode
pub const DAEMON_NIC_NAME: &str = "headcni01";

const HOSTNAME_SUFFIX_LEN: usize = 5;
const BASE32_LOWER: &[u8] = b"abcdefghijklmnopqrstuvwxyz234567";

/// Resolved environment the supervisor operates in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshEnv {
    pub is_daemon: bool,
    /// Daemon state directory; empty-pathed in host mode
    pub config_dir: PathBuf,
    pub socket_path: PathBuf,
    /// Empty in host mode
    pub state_path: PathBuf,
    /// Empty in host mode
    pub pid_path: PathBuf,
    /// Empty in host mode
    pub hostname_path: PathBuf,
    pub hostname: String,
    pub nic_name: String,
}

impl MeshEnv {
    /// Derive the environment from configuration and the current node.
    pub fn derive(config: &Config, node_name: &str) -> Result<Self> {
        match config.mesh.mode {
            MeshMode::Host => Ok(Self {
                is_daemon: false,
                config_dir: PathBuf::new(),
                socket_path: config
                    .mesh
                    .socket_path
                    .as_deref()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(HOST_SOCKET_PATH)),
                state_path: PathBuf::new(),
                pid_path: PathBuf::new(),
                hostname_path: PathBuf::new(),
                hostname: node_name.to_string(),
                nic_name: config
                    .mesh
                    .interface_name
                    .clone()
                    .unwrap_or_else(|| HOST_NIC_NAME.to_string()),
            }),
            MeshMode::Daemon => {
                let socket_path = config
                    .mesh
                    .socket_path
                    .as_deref()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| {
                        Path::new(DAEMON_STATE_DIR).join(DAEMON_SOCKET_NAME)
                    });
                let config_dir = socket_path
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| PathBuf::from(DAEMON_STATE_DIR));
                let hostname_path = config_dir.join(DAEMON_HOSTNAME_NAME);
                let hostname =
                    load_or_generate_hostname(&hostname_path, &config.mesh.hostname_prefix)?;

                Ok(Self {
                    is_daemon: true,
                    state_path: config_dir.join(DAEMON_STATE_NAME),
                    pid_path: config_dir.join(DAEMON_PID_NAME),
                    hostname_path,
                    hostname,
                    nic_name: config
                        .mesh
                        .interface_name
                        .clone()
                        .unwrap_or_else(|| DAEMON_NIC_NAME.to_string()),
                    config_dir,
                    socket_path,
                })
            }
        }
    }
}

/// Acceptance rule for persisted hostnames: prefix match, length bound, and
/// a conservative character set.
pub fn is_valid_hostname(hostname: &str, prefix: &str) -> bool {
    hostname.starts_with(prefix)
        && hostname.len() <= 63
        && !hostname.is_empty()
        && hostname
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

/// Generate `<prefix>-<5 base32 lower chars>`.
pub fn generate_hostname(prefix: &str) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..HOSTNAME_SUFFIX_LEN)
        .map(|_| BASE32_LOWER[rng.gen_range(0..BASE32_LOWER.len())] as char)
        .collect();
    format!("{}-{}", prefix, suffix)
}

/// Read the persisted hostname, or generate and persist a fresh one when
/// the file is missing or fails the acceptance rule.
pub fn load_or_generate_hostname(path: &Path, prefix: &str) -> Result<String> {
    if let Ok(content) = fs::read_to_string(path) {
        let hostname = content.trim().to_string();
        if is_valid_hostname(&hostname, prefix) {
            return Ok(hostname);
        }
        warn!(
            "Hostname file {} is malformed ({:?}), regenerating",
            path.display(),
            hostname
        );
    }

    let hostname = generate_hostname(prefix);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(path, &hostname)
        .with_context(|| format!("failed to persist hostname to {}", path.display()))?;
    info!("Generated mesh hostname {}", hostname);
    Ok(hostname)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CoordinatorConfig, MeshConfig};
    use tempfile::TempDir;

    fn config_with_mode(mode: MeshMode, socket_path: Option<String>) -> Config {
        Config {
            coordinator: CoordinatorConfig {
                url: "https://headscale.example.com".to_string(),
                auth_key: "hskey-test".to_string(),
                timeout_secs: 10,
                retries: 3,
            },
            mesh: MeshConfig {
                mode,
                control_url: String::new(),
                socket_path,
                interface_name: None,
                mtu: 1280,
                hostname_prefix: "headcni".to_string(),
                user: "default".to_string(),
                acl_tags: vec![],
                accept_dns: false,
            },
            network: crate::config::NetworkConfig {
                pod_cidr_base: "10.244.0.0/16".to_string(),
                service_cidr: "10.96.0.0/12".to_string(),
                mtu: 1450,
                enable_ipv6: false,
                enable_network_policy: false,
            },
            dns: Default::default(),
            monitoring: Default::default(),
            cni_plugins: vec![],
            log_level: "info".to_string(),
            config_path: PathBuf::new(),
        }
    }

    #[test]
    fn test_host_mode_env() {
        let config = config_with_mode(MeshMode::Host, None);
        let env = MeshEnv::derive(&config, "worker-01").unwrap();

        assert!(!env.is_daemon);
        assert_eq!(env.socket_path, PathBuf::from(HOST_SOCKET_PATH));
        assert_eq!(env.hostname, "worker-01");
        assert_eq!(env.nic_name, "tailscale0");
        assert_eq!(env.state_path, PathBuf::new());
        assert_eq!(env.pid_path, PathBuf::new());
        assert_eq!(env.hostname_path, PathBuf::new());
    }

    #[test]
    fn test_daemon_mode_env_layout() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("headcni_tailscale.sock");
        let config =
            config_with_mode(MeshMode::Daemon, Some(socket.to_str().unwrap().to_string()));
        let env = MeshEnv::derive(&config, "worker-01").unwrap();

        assert!(env.is_daemon);
        assert_eq!(env.config_dir, dir.path());
        assert_eq!(env.socket_path, socket);
        assert_eq!(env.state_path, dir.path().join("tailscaled.state"));
        assert_eq!(env.pid_path, dir.path().join("tailscaled.pid"));
        assert_eq!(env.hostname_path, dir.path().join("hostname"));
        assert_eq!(env.nic_name, "headcni01");
        assert!(env.hostname.starts_with("headcni-"));
    }

    #[test]
    fn test_hostname_persists_across_derivations() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("headcni_tailscale.sock");
        let config =
            config_with_mode(MeshMode::Daemon, Some(socket.to_str().unwrap().to_string()));

        let first = MeshEnv::derive(&config, "worker-01").unwrap().hostname;
        let second = MeshEnv::derive(&config, "worker-01").unwrap().hostname;
        assert_eq!(first, second);
    }

    #[test]
    fn test_malformed_hostname_regenerated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hostname");
        fs::write(&path, "Not_A-Valid Hostname!").unwrap();

        let hostname = load_or_generate_hostname(&path, "headcni").unwrap();
        assert!(hostname.starts_with("headcni-"));
        assert!(is_valid_hostname(&hostname, "headcni"));
        // The repaired value was persisted
        assert_eq!(fs::read_to_string(&path).unwrap(), hostname);
    }

    #[test]
    fn test_wrong_prefix_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hostname");
        fs::write(&path, "othernode-ab2c3").unwrap();

        let hostname = load_or_generate_hostname(&path, "headcni").unwrap();
        assert!(hostname.starts_with("headcni-"));
    }

    #[test]
    fn test_hostname_validation_rules() {
        assert!(is_valid_hostname("headcni-ab2c3", "headcni"));
        assert!(!is_valid_hostname("other-ab2c3", "headcni"));
        assert!(!is_valid_hostname("headcni-AB2C3", "headcni"));
        assert!(!is_valid_hostname("headcni_ab2c3", "headcni"));
        assert!(!is_valid_hostname(&format!("headcni-{}", "a".repeat(64)), "headcni"));
    }

    #[test]
    fn test_generated_hostname_shape() {
        let hostname = generate_hostname("headcni");
        assert_eq!(hostname.len(), "headcni-".len() + 5);
        assert!(is_valid_hostname(&hostname, "headcni"));
    }
}
