//! Application state shared across handlers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use keyless_core::StatusSnapshot;
use tokio::sync::watch;

/// Shared application state.
pub type SharedState = AppState;

/// Read-only view of the running agent.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    controller_id: String,
    status: watch::Receiver<StatusSnapshot>,
    started_at: DateTime<Utc>,
}

impl AppState {
    /// Create state observing the session loop through `status`.
    #[must_use]
    pub fn new(controller_id: impl Into<String>, status: watch::Receiver<StatusSnapshot>) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                controller_id: controller_id.into(),
                status,
                started_at: Utc::now(),
            }),
        }
    }

    /// Controller id this agent runs as.
    #[must_use]
    pub fn controller_id(&self) -> &str {
        &self.inner.controller_id
    }

    /// Latest published session snapshot.
    #[must_use]
    pub fn snapshot(&self) -> StatusSnapshot {
        self.inner.status.borrow().clone()
    }

    /// Whether the session loop has gone away.
    #[must_use]
    pub fn session_stopped(&self) -> bool {
        self.inner.status.has_changed().is_err()
    }

    /// Seconds since the state was created.
    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        u64::try_from((Utc::now() - self.inner.started_at).num_seconds()).unwrap_or(0)
    }
}
