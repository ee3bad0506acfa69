//! Service lifecycle framework
//!
//! Every long-running subsystem implements `Service`; the manager drives
//! them in registration order and mirrors every transition into the health
//! registry.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::health::HealthRegistry;

/// Uniform lifecycle for the agent's subsystems.
///
/// `start` and `stop` are idempotent. `reload` is expected to be a no-op
/// when the service's watched configuration fields are unchanged; the
/// default implementation is stop, a brief wait, then start.
#[async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    async fn reload(&self) -> Result<()> {
        self.stop().await?;
        tokio::time::sleep(Duration::from_millis(500)).await;
        self.start().await
    }

    fn is_running(&self) -> bool;
}

/// Drives all registered services and keeps the health registry current.
pub struct ServiceManager {
    services: Vec<Arc<dyn Service>>,
    registry: HealthRegistry,
}

impl ServiceManager {
    pub fn new(registry: HealthRegistry) -> Self {
        Self {
            services: Vec::new(),
            registry,
        }
    }

    /// Register a service. Start order follows registration order.
    pub fn register(&mut self, service: Arc<dyn Service>) {
        self.services.push(service);
    }

    pub fn registry(&self) -> &HealthRegistry {
        &self.registry
    }

    /// Start every service in registration order. Fails on the first
    /// service that refuses to start, leaving earlier ones running.
    pub async fn start_all(&self) -> Result<()> {
        for service in &self.services {
            let name = service.name().to_string();
            info!("Starting service: {}", name);
            match service.start().await {
                Ok(()) => {
                    self.registry.update_service_status(&name, true, None);
                }
                Err(e) => {
                    self.registry
                        .update_service_status(&name, false, Some(&e.to_string()));
                    return Err(e).with_context(|| format!("failed to start service {}", name));
                }
            }
        }
        Ok(())
    }

    /// Stop every service, tolerating individual failures; errors are
    /// aggregated into a single one.
    pub async fn stop_all(&self) -> Result<()> {
        let mut failures = Vec::new();

        for service in &self.services {
            let name = service.name().to_string();
            info!("Stopping service: {}", name);
            match service.stop().await {
                Ok(()) => {
                    self.registry.update_service_status(&name, false, None);
                }
                Err(e) => {
                    warn!("Failed to stop service {}: {:#}", name, e);
                    self.registry
                        .update_service_status(&name, false, Some(&e.to_string()));
                    failures.push(format!("{}: {:#}", name, e));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("failed to stop {} service(s): {}", failures.len(), failures.join("; "))
        }
    }

    /// Reload every service; a service whose hot reload fails is restarted
    /// via stop/start before giving up on it.
    pub async fn reload_all(&self) -> Result<()> {
        for service in &self.services {
            let name = service.name().to_string();
            if let Err(e) = service.reload().await {
                warn!("Hot reload of {} failed, falling back to restart: {:#}", name, e);

                if let Err(e) = service.stop().await {
                    warn!("Stop during reload fallback of {} failed: {:#}", name, e);
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
                match service.start().await {
                    Ok(()) => {
                        self.registry.update_service_status(&name, true, None);
                    }
                    Err(e) => {
                        error!("Restart of {} during reload failed: {:#}", name, e);
                        self.registry
                            .update_service_status(&name, false, Some(&e.to_string()));
                        return Err(e)
                            .with_context(|| format!("failed to reload service {}", name));
                    }
                }
            } else {
                self.registry
                    .update_service_status(&name, service.is_running(), None);
            }
        }
        Ok(())
    }
}
