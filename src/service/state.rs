//! Service state management.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::env_or;
use crate::store::keys::{ACCOUNT_PREFIX, FOLLOW_LIST_PREFIX, POST_INDEX_PREFIX, REFERENCE_INDEX_PREFIX};
use crate::supervisor::Supervisor;

/// Table prefixes the administrative delete endpoint may target.
pub const DELETABLE_PREFIXES: [&str; 4] = [POST_INDEX_PREFIX, REFERENCE_INDEX_PREFIX, ACCOUNT_PREFIX, FOLLOW_LIST_PREFIX];

/// Shared service state.
#[derive(Clone)]
pub struct ServiceState {
    /// The supervisor every handler reads through.
    pub supervisor: Arc<Supervisor>,
    admin_enabled: bool,
    started_at: DateTime<Utc>,
}

impl ServiceState {
    /// State over `supervisor` with administrative endpoints enabled.
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        let started_at = supervisor.now();
        Self { supervisor, admin_enabled: true, started_at }
    }

    /// Create service state from environment variables.
    ///
    /// Reads `NEIGHBORHOOD_ADMIN_ENDPOINTS` (default `true`).
    pub fn from_env(supervisor: Arc<Supervisor>) -> Self {
        let admin_enabled = env_or("NEIGHBORHOOD_ADMIN_ENDPOINTS", true);
        if !admin_enabled {
            tracing::info!("Administrative endpoints disabled");
        }
        Self::new(supervisor).with_admin(admin_enabled)
    }

    /// Enable or disable the administrative endpoints.
    pub fn with_admin(mut self, enabled: bool) -> Self {
        self.admin_enabled = enabled;
        self
    }

    /// Whether administrative endpoints accept requests.
    pub fn admin_enabled(&self) -> bool {
        self.admin_enabled
    }

    /// When the state was built, on the supervisor's clock.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Whether `prefix` lies inside one of [`DELETABLE_PREFIXES`].
    pub fn is_deletable_prefix(prefix: &str) -> bool {
        DELETABLE_PREFIXES.iter().any(|table| prefix.starts_with(table))
    }
}
