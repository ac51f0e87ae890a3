//! Data-plane slot handlers.
//!
//! Every slot operation is a `POST` with a JSON body. Long-running
//! operations (`connect`, `destroy`) answer `202 Accepted` with an
//! [`Operation`] that can be polled under `/operations`.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::Router;
use axum::routing::{get, post};
use conduit_core::{
    ChunkStream, ConnectSlotRequest, CreateSlotRequest, OpenOutputSlotRequest, Operation,
    SlotRef, SlotStatus, SlotStatusList,
};
use conduit_slots::{SlotService, frames_from_chunks};
use futures::StreamExt;

use crate::extract::{IdempotencyKey, Json};
use crate::handler::Result;
use crate::service::ServiceState;

/// Tracing target for slot handlers.
const TRACING_TARGET: &str = "conduit_server::handler::slots";

/// Content type of framed slot output.
pub const FRAMED_CONTENT_TYPE: &str = "application/x-conduit-frames";

/// Creates a slot.
#[tracing::instrument(skip_all, fields(task_id = %request.task_id, slot = %request.slot.name))]
async fn create_slot(
    State(slots): State<Arc<SlotService>>,
    Json(request): Json<CreateSlotRequest>,
) -> Result<(StatusCode, Json<SlotStatus>)> {
    let status = slots.create_slot(request).await?;
    Ok((StatusCode::CREATED, Json(status)))
}

/// Lists every slot of this node.
async fn list_slots(State(slots): State<Arc<SlotService>>) -> Json<SlotStatusList> {
    Json(slots.list())
}

/// Connects a local input slot to a producer.
#[tracing::instrument(
    skip_all,
    fields(task_id = %request.from.task_id, slot = %request.from.slot_name)
)]
async fn connect_slot(
    State(slots): State<Arc<SlotService>>,
    idempotency_key: IdempotencyKey,
    Json(request): Json<ConnectSlotRequest>,
) -> Result<(StatusCode, Json<Operation>)> {
    let operation = slots.connect_slot(request, idempotency_key.0)?;

    tracing::debug!(
        target: TRACING_TARGET,
        operation_id = %operation.id,
        "Connect operation started"
    );
    Ok((StatusCode::ACCEPTED, Json(operation)))
}

/// Detaches a slot from its peer.
async fn disconnect_slot(
    State(slots): State<Arc<SlotService>>,
    Json(slot): Json<SlotRef>,
) -> Result<Json<SlotStatus>> {
    Ok(Json(slots.disconnect_slot(&slot).await?))
}

/// Returns the status of a slot.
async fn status_slot(
    State(slots): State<Arc<SlotService>>,
    Json(slot): Json<SlotRef>,
) -> Result<Json<SlotStatus>> {
    Ok(Json(slots.status_slot(&slot)?))
}

/// Destroys a slot.
async fn destroy_slot(
    State(slots): State<Arc<SlotService>>,
    idempotency_key: IdempotencyKey,
    Json(slot): Json<SlotRef>,
) -> Result<(StatusCode, Json<Operation>)> {
    let operation = slots.destroy_slot(&slot, idempotency_key.0)?;
    Ok((StatusCode::ACCEPTED, Json(operation)))
}

/// Streams an output slot as length-prefixed frames ending with end-of-stream.
///
/// Errors found before the first byte (missing slot, wrong direction) are
/// answered with an error status instead of a stream.
#[tracing::instrument(
    skip_all,
    fields(task_id = %request.slot.task_id, slot = %request.slot.slot_name)
)]
async fn open_output_slot(
    State(slots): State<Arc<SlotService>>,
    Json(request): Json<OpenOutputSlotRequest>,
) -> Result<Response> {
    let chunks = slots.open_output_slot(&request)?;

    tracing::debug!(
        target: TRACING_TARGET,
        offset = request.offset,
        "Streaming output slot"
    );
    Ok(framed_response(chunks))
}

/// Frames `chunks` into a streamed response body.
pub(crate) fn framed_response(chunks: ChunkStream) -> Response {
    let frames = frames_from_chunks(chunks).map(|frame| Ok::<_, Infallible>(frame.encode()));
    (
        [(header::CONTENT_TYPE, FRAMED_CONTENT_TYPE)],
        Body::from_stream(frames),
    )
        .into_response()
}

/// Returns a [`Router`] with all slot routes.
pub fn routes() -> Router<ServiceState> {
    Router::new()
        .route("/slots", get(list_slots))
        .route("/slots/create", post(create_slot))
        .route("/slots/connect", post(connect_slot))
        .route("/slots/disconnect", post(disconnect_slot))
        .route("/slots/status", post(status_slot))
        .route("/slots/destroy", post(destroy_slot))
        .route("/slots/open", post(open_output_slot))
}
