//! Node health handler.

use axum::Router;
use axum::extract::State;
use axum::routing::get;
use jiff::Timestamp;

use super::response::HealthResponse;
use crate::extract::Json;
use crate::service::ServiceState;

/// Tracing target for monitor operations.
const TRACING_TARGET: &str = "conduit_server::handler::monitors";

/// Reports whether the node is up and how many slots and sessions it holds.
async fn health_status(State(state): State<ServiceState>) -> Json<HealthResponse> {
    let registry = state.slots.registry();
    let response = HealthResponse {
        is_healthy: true,
        slots: registry.len(),
        sessions: state.sessions.len(),
        base_uri: registry.base().to_string(),
        started_at: state.started_at,
        updated_at: Timestamp::now(),
    };

    tracing::trace!(
        target: TRACING_TARGET,
        slots = response.slots,
        sessions = response.sessions,
        "Health status prepared"
    );
    Json(response)
}

/// Returns a [`Router`] with all health monitoring routes.
pub fn routes() -> Router<ServiceState> {
    Router::new().route("/health", get(health_status))
}
