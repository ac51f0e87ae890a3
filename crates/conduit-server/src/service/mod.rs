//! Application state and dependency injection.

mod config;
mod relay;

use std::sync::Arc;

use conduit_slots::SlotService;
use jiff::Timestamp;

pub use crate::service::config::{ServiceConfig, ServiceConfigBuilder};
pub use crate::service::relay::{RelaySession, RelaySessions, SessionLimits};

/// Application state.
///
/// Used for the [`State`] extraction (dependency injection).
///
/// [`State`]: axum::extract::State
#[must_use = "state does nothing unless you use it"]
#[derive(Clone)]
pub struct ServiceState {
    pub slots: Arc<SlotService>,
    pub sessions: RelaySessions,
    pub config: ServiceConfig,
    pub started_at: Timestamp,
}

impl ServiceState {
    /// Creates the state serving `slots`.
    pub fn new(slots: Arc<SlotService>, config: ServiceConfig) -> Self {
        Self {
            slots,
            sessions: RelaySessions::new(&config),
            config,
            started_at: Timestamp::now(),
        }
    }

    /// Closes every relay session, then shuts the slot service down.
    pub async fn shutdown(&self) -> conduit_core::Result<()> {
        self.sessions.close_all().await;
        self.slots.shutdown().await
    }
}

impl std::fmt::Debug for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceState")
            .field("slots", &self.slots)
            .field("sessions", &self.sessions)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

macro_rules! impl_di {
    ($($f:ident: $t:ty),+) => {$(
        impl axum::extract::FromRef<ServiceState> for $t {
            fn from_ref(state: &ServiceState) -> Self {
                state.$f.clone()
            }
        }
    )+};
}

impl_di!(slots: Arc<SlotService>);
impl_di!(sessions: RelaySessions);
impl_di!(config: ServiceConfig);
