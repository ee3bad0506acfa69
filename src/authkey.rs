//! Pre-auth key state
//!
//! In-memory holder for the coordinator-issued pre-auth key the supervisor
//! logs in with. Value and expiration always change together; the hourly
//! refresher (supervisor) reads under the lock and replaces on success.

use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Default)]
struct KeyState {
    key: String,
    expires_at: Option<DateTime<Utc>>,
}

/// Shared, lock-guarded pre-auth key.
#[derive(Debug, Clone, Default)]
pub struct AuthKeyState {
    inner: Arc<Mutex<KeyState>>,
}

impl AuthKeyState {
    pub fn new() -> Self {
        Self::default()
    }

    /// True iff a key is present and its expiration is in the future.
    pub fn is_valid(&self) -> bool {
        let state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        !state.key.is_empty()
            && state
                .expires_at
                .map(|exp| exp > Utc::now())
                .unwrap_or(false)
    }

    /// Current key, if valid.
    pub fn key(&self) -> Option<String> {
        let state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let valid = !state.key.is_empty()
            && state
                .expires_at
                .map(|exp| exp > Utc::now())
                .unwrap_or(false);
        valid.then(|| state.key.clone())
    }

    /// Replace key and expiration atomically.
    pub fn set(&self, key: String, expires_at: DateTime<Utc>) {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.key = key;
        state.expires_at = Some(expires_at);
    }

    /// Clear both fields if the key has expired. Returns true when cleared.
    pub fn cleanup_expired(&self) -> bool {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let expired = !state.key.is_empty()
            && state
                .expires_at
                .map(|exp| exp <= Utc::now())
                .unwrap_or(true);
        if expired {
            state.key.clear();
            state.expires_at = None;
        }
        expired
    }

    /// Whether the key (valid or not) expires within the given window.
    /// An absent or already-expired key counts as needing refresh.
    pub fn expires_within(&self, window: Duration) -> bool {
        let state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match state.expires_at {
            Some(exp) if !state.key.is_empty() => exp <= Utc::now() + window,
            _ => true,
        }
    }
}
