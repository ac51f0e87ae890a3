//! Channel manager endpoints.
//!
//! A node running the local channel manager serves these so that peers
//! configured with an HTTP channel manager can bind their slots to it.

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use conduit_core::SlotInstance;
use conduit_slots::SlotService;

use super::request::ChannelPathParams;
use crate::extract::{Json, Path};
use crate::handler::{ErrorKind, Result};
use crate::service::ServiceState;

/// Tracing target for channel handlers.
const TRACING_TARGET: &str = "conduit_server::handler::channels";

async fn create_channel(
    State(slots): State<Arc<SlotService>>,
    Path(path_params): Path<ChannelPathParams>,
) -> Result<StatusCode> {
    slots.registry().channels().create(&path_params.channel_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn destroy_channel(
    State(slots): State<Arc<SlotService>>,
    Path(path_params): Path<ChannelPathParams>,
) -> Result<StatusCode> {
    slots.registry().channels().destroy(&path_params.channel_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Binds a slot to a channel; the channel connects its endpoints once both are bound.
async fn bind_slot(
    State(slots): State<Arc<SlotService>>,
    Path(path_params): Path<ChannelPathParams>,
    Json(instance): Json<SlotInstance>,
) -> Result<StatusCode> {
    ensure_channel(&path_params, &instance)?;

    tracing::debug!(
        target: TRACING_TARGET,
        channel_id = %instance.channel_id,
        uri = %instance.uri,
        "Binding slot"
    );
    slots.registry().channels().bind(&instance).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn unbind_slot(
    State(slots): State<Arc<SlotService>>,
    Path(path_params): Path<ChannelPathParams>,
    Json(instance): Json<SlotInstance>,
) -> Result<StatusCode> {
    ensure_channel(&path_params, &instance)?;
    slots.registry().channels().unbind(&instance).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn ensure_channel(path_params: &ChannelPathParams, instance: &SlotInstance) -> Result<()> {
    if path_params.channel_id == instance.channel_id {
        return Ok(());
    }

    Err(ErrorKind::BadRequest
        .with_message(format!(
            "slot is bound to channel '{}', not '{}'",
            instance.channel_id, path_params.channel_id
        ))
        .with_resource("channel"))
}

/// Returns a [`Router`] with all channel routes.
pub fn routes() -> Router<ServiceState> {
    Router::new()
        .route(
            "/channels/{channelId}",
            post(create_channel).delete(destroy_channel),
        )
        .route("/channels/{channelId}/bind", post(bind_slot))
        .route("/channels/{channelId}/unbind", post(unbind_slot))
}

#[cfg(test)]
mod tests {
    use conduit_core::SlotDirection;

    use super::*;
    use crate::handler::test::{create_test_server_with_router, slot_instance};

    #[tokio::test]
    async fn bind_checks_the_channel() -> anyhow::Result<()> {
        let (server, _state, _dir) = create_test_server_with_router(|_| routes()).await?;
        server.post("/channels/c1").await.assert_status(StatusCode::NO_CONTENT);

        let mut instance = slot_instance("t1", "/out", SlotDirection::Output)?;
        instance.channel_id = "c2".into();
        server
            .post("/channels/c1/bind")
            .json(&instance)
            .await
            .assert_status_bad_request();

        instance.channel_id = "c1".into();
        server
            .post("/channels/c1/bind")
            .json(&instance)
            .await
            .assert_status(StatusCode::NO_CONTENT);
        server
            .post("/channels/c1/unbind")
            .json(&instance)
            .await
            .assert_status(StatusCode::NO_CONTENT);
        server.delete("/channels/c1").await.assert_status(StatusCode::NO_CONTENT);
        Ok(())
    }
}
