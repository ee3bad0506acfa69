//! Shared client registry
//!
//! Reload replaces client objects; services never hold one across calls but
//! re-fetch through these getters, which take a read lock. The registry also
//! hands out snapshots so a failed reload can restore the previous set.

use std::sync::{Arc, RwLock};

use crate::cni::CniConfigManager;
use crate::headscale::HeadscaleClient;
use crate::tailscale::TailscaleClient;

/// Point-in-time view of the client set, used for rollback.
#[derive(Clone)]
pub struct ClientSnapshot {
    pub headscale: Arc<HeadscaleClient>,
    pub tailscale: Arc<TailscaleClient>,
    pub cni: Arc<CniConfigManager>,
}

pub struct ClientRegistry {
    headscale: RwLock<Arc<HeadscaleClient>>,
    tailscale: RwLock<Arc<TailscaleClient>>,
    cni: RwLock<Arc<CniConfigManager>>,
}

impl ClientRegistry {
    pub fn new(
        headscale: Arc<HeadscaleClient>,
        tailscale: Arc<TailscaleClient>,
        cni: Arc<CniConfigManager>,
    ) -> Self {
        Self {
            headscale: RwLock::new(headscale),
            tailscale: RwLock::new(tailscale),
            cni: RwLock::new(cni),
        }
    }

    pub fn headscale(&self) -> Arc<HeadscaleClient> {
        self.headscale.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn tailscale(&self) -> Arc<TailscaleClient> {
        self.tailscale.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn cni(&self) -> Arc<CniConfigManager> {
        self.cni.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_headscale(&self, client: Arc<HeadscaleClient>) {
        *self.headscale.write().unwrap_or_else(|e| e.into_inner()) = client;
    }

    pub fn set_tailscale(&self, client: Arc<TailscaleClient>) {
        *self.tailscale.write().unwrap_or_else(|e| e.into_inner()) = client;
    }

    pub fn set_cni(&self, manager: Arc<CniConfigManager>) {
        *self.cni.write().unwrap_or_else(|e| e.into_inner()) = manager;
    }

    pub fn snapshot(&self) -> ClientSnapshot {
        ClientSnapshot {
            headscale: self.headscale(),
            tailscale: self.tailscale(),
            cni: self.cni(),
        }
    }

    pub fn restore(&self, snapshot: ClientSnapshot) {
        self.set_headscale(snapshot.headscale);
        self.set_tailscale(snapshot.tailscale);
        self.set_cni(snapshot.cni);
    }
}
