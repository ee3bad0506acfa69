//! Process-wide health registry
//!
//! Maps service name to running state, start time and last error. The
//! service manager updates it around every lifecycle transition; the
//! monitoring endpoint serializes the snapshot for GET /health.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// Per-service health entry
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub running: bool,

    /// RFC3339 timestamp of the most recent false->true transition
    pub started_at: Option<String>,

    /// Last error message, cleared on the next successful update
    pub last_error: String,
}

/// Overall process health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallHealth {
    Healthy,
    Unhealthy,
}

/// Snapshot returned to the monitoring endpoint
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub overall: OverallHealth,
    pub services: HashMap<String, ServiceHealth>,
    pub uptime_seconds: u64,
}

/// Concurrency-safe service-name -> health mapping.
///
/// Explicitly constructed and threaded through the service manager; there is
/// no process-global instance.
#[derive(Clone)]
pub struct HealthRegistry {
    inner: Arc<RwLock<HashMap<String, ServiceHealth>>>,
    process_start: Instant,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            process_start: Instant::now(),
        }
    }

    /// Record a service transition.
    ///
    /// Start time is refreshed only on false->true transitions; a successful
    /// update clears the stored error string.
    pub fn update_service_status(&self, name: &str, running: bool, error: Option<&str>) {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let entry = map.entry(name.to_string()).or_insert_with(|| ServiceHealth {
            running: false,
            started_at: None,
            last_error: String::new(),
        });

        if running && !entry.running {
            entry.started_at = Some(chrono::Utc::now().to_rfc3339());
        }
        entry.running = running;
        entry.last_error = match error {
            Some(e) => e.to_string(),
            None => String::new(),
        };
    }

    /// Snapshot of all registered services plus the overall verdict.
    ///
    /// Overall is unhealthy iff any service is stopped or carries an error.
    pub fn get_health_status(&self) -> HealthStatus {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let unhealthy = map
            .values()
            .any(|s| !s.running || !s.last_error.is_empty());

        HealthStatus {
            overall: if unhealthy {
                OverallHealth::Unhealthy
            } else {
                OverallHealth::Healthy
            },
            services: map.clone(),
            uptime_seconds: self.process_start.elapsed().as_secs(),
        }
    }

    /// Running state of a single service, if registered
    pub fn is_running(&self, name: &str) -> Option<bool> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.get(name).map(|s| s.running)
    }
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}
