use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use conduit_slots::SlotService;

use super::request::SnapshotPathParams;
use crate::extract::Path;
use crate::handler::Result;
use crate::service::ServiceState;

/// Creates a snapshot that `snapshot:` bindings and snapshot slots can refer to.
async fn create_snapshot(
    State(slots): State<Arc<SlotService>>,
    Path(path_params): Path<SnapshotPathParams>,
) -> Result<StatusCode> {
    slots.create_snapshot(&path_params.snapshot_id).await?;
    Ok(StatusCode::CREATED)
}

/// Returns a [`Router`] with all snapshot routes.
pub fn routes() -> Router<ServiceState> {
    Router::new().route("/snapshots/{snapshotId}", post(create_snapshot))
}
