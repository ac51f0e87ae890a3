//! Long-running operation handlers.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::routing::get;
use conduit_core::Operation;
use conduit_slots::SlotService;
use validator::Validate;

use super::request::{OperationPathParams, WaitQuery};
use crate::extract::{Json, Path, Query};
use crate::handler::Result;
use crate::service::{ServiceConfig, ServiceState};

/// Tracing target for operation handlers.
const TRACING_TARGET: &str = "conduit_server::handler::operations";

/// Returns an operation, optionally waiting for it to finish.
///
/// `wait_ms` is capped by the configured long-poll limit. An operation still
/// running when the wait ends is returned as is.
async fn get_operation(
    State(slots): State<Arc<SlotService>>,
    State(config): State<ServiceConfig>,
    Path(path_params): Path<OperationPathParams>,
    Query(query): Query<WaitQuery>,
) -> Result<Json<Operation>> {
    query.validate()?;

    let operation_id = path_params.operation_id;
    let wait = Duration::from_millis(query.wait_ms).min(config.max_wait());
    let operation = if wait.is_zero() {
        slots.operation(operation_id)?
    } else {
        tracing::debug!(
            target: TRACING_TARGET,
            operation_id = %operation_id,
            wait_ms = wait.as_millis() as u64,
            "Waiting for operation"
        );
        slots.await_operation(operation_id, wait).await?
    };

    Ok(Json(operation))
}

/// Lists every operation this node remembers.
async fn list_operations(State(slots): State<Arc<SlotService>>) -> Json<Vec<Operation>> {
    Json(slots.operations().list())
}

/// Returns a [`Router`] with all operation routes.
pub fn routes() -> Router<ServiceState> {
    Router::new()
        .route("/operations", get(list_operations))
        .route("/operations/{operationId}", get(get_operation))
}
