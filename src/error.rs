//! Error taxonomy for the HeadCNI agent
//!
//! Typed errors for the failure kinds callers branch on; everything else
//! travels as `anyhow::Error` with context.

use thiserror::Error;

/// The Headscale API or tailscaled returned a failure.
///
/// Transient by policy: callers surface it, update health, and retry on the
/// next tick unless a bounded retry is specified for the operation.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Non-2xx response with whatever body the server produced.
    #[error("remote returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The request never got a response (connect/timeout/transport).
    #[error("transport error: {0}")]
    Transport(String),

    /// The response arrived but could not be decoded.
    #[error("invalid response body: {0}")]
    Decode(String),
}

impl RemoteError {
    pub fn status(&self) -> Option<u16> {
        match self {
            RemoteError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Kubernetes access failures the adapter distinguishes for callers.
#[derive(Debug, Error)]
pub enum KubernetesError {
    /// The configured permission level does not allow this resource.
    /// For non-node resources this is demoted to a warning plus defaults.
    #[error("permission denied for {resource}")]
    PermissionDenied { resource: &'static str },

    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("kubernetes request timed out: {0}")]
    Timeout(String),

    #[error("kubernetes api error: {0}")]
    Api(#[from] kube::Error),
}

/// On-disk state this agent owns turned out invalid (CNI file, hostname
/// file, stale pid). Recovered locally by regeneration.
#[derive(Debug, Error)]
#[error("inconsistent local state: {0}")]
pub struct StateInconsistency(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_status() {
        let err = RemoteError::Status {
            status: 404,
            body: "not found".to_string(),
        };
        assert_eq!(err.status(), Some(404));
        assert!(err.to_string().contains("404"));

        let err = RemoteError::Transport("connection refused".to_string());
        assert_eq!(err.status(), None);
    }

    #[test]
    fn test_permission_denied_display() {
        let err = KubernetesError::PermissionDenied { resource: "services" };
        assert!(err.to_string().contains("services"));
    }
}
