//! Relay session handlers.
//!
//! A terminal that cannot accept connections opens a session here and keeps
//! two websockets to it: `control` carries JSON commands and replies,
//! `data` carries binary frames of the output slots the relay opened on the
//! terminal. Slot operations addressed to the session under
//! `/relay/sessions/{sessionId}/slots/...` are forwarded to the terminal.

use std::convert::Infallible;
use std::ops::ControlFlow;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use conduit_core::{
    CommandResult, ConnectSlotRequest, CreateSlotRequest, DataFrame, OpenOutputSlotRequest,
    Operation, RELAY_SCHEME, RelayReply, RelayRequest, SESSION_QUERY, SlotCommand, SlotInstance,
    SlotRef, SlotStatus, SlotUri, normalize_binding, snapshot_binding,
};
use futures::{SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use url::Url;
use validator::Validate;

use super::progress::progress_events;
use super::request::{CreateSessionRequest, ProgressQuery, SessionPathParams};
use super::response::SessionResponse;
use super::slots::framed_response;
use crate::extract::{IdempotencyKey, Json, Path, Query, ValidateJson};
use crate::handler::{Error, ErrorKind, Result};
use crate::service::{RelaySession, RelaySessions, ServiceState};

/// Tracing target for relay handlers.
const TRACING_TARGET: &str = "conduit_server::handler::relay";

/// Returns `host:port` of this node as terminals and peers reach it.
fn relay_authority(base: &Url) -> String {
    match (base.host_str(), base.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        _ => String::new(),
    }
}

fn session_response(session: &RelaySession, authority: &str) -> SessionResponse {
    SessionResponse {
        session_id: session.id().to_string(),
        label: session.label().map(str::to_string),
        base_uri: format!("{RELAY_SCHEME}://{authority}?{SESSION_QUERY}={}", session.id()),
        is_connected: session.is_connected(),
        pending_commands: session.pending_commands(),
        open_streams: session.open_streams(),
        created_at: session.created_at(),
    }
}

fn unexpected_result(command: &str, result: &CommandResult) -> Error<'static> {
    ErrorKind::BadGateway
        .with_message(format!("terminal answered '{command}' with an unexpected result"))
        .with_context(format!("{result:?}"))
}

fn expect_status(command: &str, result: CommandResult) -> Result<SlotStatus> {
    match result {
        CommandResult::Status(status) => Ok(status),
        other => Err(unexpected_result(command, &other)),
    }
}

fn expect_operation(command: &str, result: CommandResult) -> Result<Operation> {
    match result {
        CommandResult::Operation(operation) => Ok(operation),
        other => Err(unexpected_result(command, &other)),
    }
}

/// Opens a session for a terminal.
async fn create_session(
    State(state): State<ServiceState>,
    ValidateJson(request): ValidateJson<CreateSessionRequest>,
) -> Result<(StatusCode, Json<SessionResponse>)> {
    let session = state.sessions.create(request.label)?;
    let authority = relay_authority(state.slots.registry().base());
    Ok((StatusCode::CREATED, Json(session_response(&session, &authority))))
}

async fn list_sessions(State(state): State<ServiceState>) -> Json<Vec<SessionResponse>> {
    let authority = relay_authority(state.slots.registry().base());
    let sessions = state.sessions.list();
    Json(sessions.iter().map(|s| session_response(s, &authority)).collect())
}

async fn get_session(
    State(state): State<ServiceState>,
    Path(path_params): Path<SessionPathParams>,
) -> Result<Json<SessionResponse>> {
    let session = state.sessions.get(path_params.session_id)?;
    let authority = relay_authority(state.slots.registry().base());
    Ok(Json(session_response(&session, &authority)))
}

/// Closes a session and unbinds the slots relayed through it.
async fn delete_session(
    State(state): State<ServiceState>,
    Path(path_params): Path<SessionPathParams>,
) -> Result<StatusCode> {
    let session = state.sessions.remove(path_params.session_id)?;
    let channels = state.slots.registry().channels();
    for instance in session.close().await {
        if let Err(error) = channels.unbind(&instance).await {
            tracing::warn!(
                target: TRACING_TARGET,
                session_id = %session.id(),
                uri = %instance.uri,
                error = %error,
                "Cannot unbind relayed slot"
            );
        }
    }

    Ok(StatusCode::NO_CONTENT)
}

/// Streams the progress events the terminal reports.
async fn session_progress(
    State(sessions): State<RelaySessions>,
    Path(path_params): Path<SessionPathParams>,
    Query(query): Query<ProgressQuery>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    query.validate()?;
    let session = sessions.get(path_params.session_id)?;
    let events = progress_events(session.subscribe(), query.task_id);
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// Upgrades to the session's control channel.
async fn control_channel(
    State(sessions): State<RelaySessions>,
    Path(path_params): Path<SessionPathParams>,
    ws: WebSocketUpgrade,
) -> Result<Response> {
    let session = sessions.get(path_params.session_id)?;
    let commands = session.attach_control()?;
    Ok(ws.on_upgrade(move |socket| serve_control(socket, session, commands)))
}

/// Processes one message from the terminal's control channel.
///
/// Returns `ControlFlow::Break` if the connection should be closed.
fn process_control_message(session: &RelaySession, message: Message) -> ControlFlow<()> {
    match message {
        Message::Text(text) => {
            match serde_json::from_str::<RelayReply>(text.as_str()) {
                Ok(reply) => session.handle_reply(reply),
                Err(error) => tracing::warn!(
                    target: TRACING_TARGET,
                    session_id = %session.id(),
                    error = %error,
                    "Malformed control message ignored"
                ),
            }
            ControlFlow::Continue(())
        }
        Message::Binary(_) => {
            tracing::warn!(
                target: TRACING_TARGET,
                session_id = %session.id(),
                "Binary message on control channel ignored"
            );
            ControlFlow::Continue(())
        }
        Message::Close(_) => ControlFlow::Break(()),
        Message::Ping(_) | Message::Pong(_) => ControlFlow::Continue(()),
    }
}

/// Serves the control channel until either side closes it.
///
/// One task forwards commands to the terminal, the other routes replies; when
/// either ends the other is aborted and pending commands fail.
async fn serve_control(
    socket: WebSocket,
    session: RelaySession,
    mut commands: mpsc::Receiver<RelayRequest>,
) {
    let (mut sender, mut receiver) = socket.split();
    let closed = session.closed();

    let recv_session = session.clone();
    let mut recv_task = tokio::spawn(async move {
        let mut received = 0u64;
        while let Some(Ok(message)) = receiver.next().await {
            received += 1;
            if process_control_message(&recv_session, message).is_break() {
                break;
            }
        }
        received
    });

    let send_session = session.id();
    let mut send_task = tokio::spawn(async move {
        let mut sent = 0u64;
        loop {
            let request = tokio::select! {
                request = commands.recv() => request,
                () = closed.cancelled() => None,
            };
            let Some(request) = request else { break };

            let text = match serde_json::to_string(&request) {
                Ok(text) => text,
                Err(error) => {
                    tracing::error!(
                        target: TRACING_TARGET,
                        session_id = %send_session,
                        error = %error,
                        "Command not encodable"
                    );
                    continue;
                }
            };

            if sender.send(Message::Text(Utf8Bytes::from(text))).await.is_err() {
                break;
            }
            sent += 1;
        }

        let _ = sender.send(Message::Close(None)).await;
        sent
    });

    tokio::select! {
        received = (&mut recv_task) => {
            tracing::debug!(
                target: TRACING_TARGET,
                session_id = %session.id(),
                received = received.unwrap_or_default(),
                "Control channel closed by terminal"
            );
            send_task.abort();
        },
        sent = (&mut send_task) => {
            tracing::debug!(
                target: TRACING_TARGET,
                session_id = %session.id(),
                sent = sent.unwrap_or_default(),
                "Control channel closed by relay"
            );
            recv_task.abort();
        }
    }

    session.detach_control();
}

/// Upgrades to the session's data channel.
async fn data_channel(
    State(sessions): State<RelaySessions>,
    Path(path_params): Path<SessionPathParams>,
    ws: WebSocketUpgrade,
) -> Result<Response> {
    let session = sessions.get(path_params.session_id)?;
    session.attach_data()?;

    Ok(ws
        .on_failed_upgrade({
            let session = session.clone();
            move |_| session.detach_data()
        })
        .on_upgrade(move |socket| serve_data(socket, session)))
}

/// Routes binary frames from the terminal until the channel closes.
async fn serve_data(mut socket: WebSocket, session: RelaySession) {
    let closed = session.closed();
    loop {
        let message = tokio::select! {
            message = socket.recv() => message,
            () = closed.cancelled() => break,
        };

        match message {
            Some(Ok(Message::Binary(bytes))) => match DataFrame::decode(bytes) {
                Ok(frame) => session.handle_data(frame).await,
                Err(error) => tracing::warn!(
                    target: TRACING_TARGET,
                    session_id = %session.id(),
                    error = %error,
                    "Malformed data frame ignored"
                ),
            },
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
            Some(Ok(_)) => {}
        }
    }

    session.detach_data();
}

/// Creates a slot on the terminal.
///
/// A slot bound to a channel is bound here too, under its relay address, so
/// that peers reach it through this node.
async fn relay_create(
    State(state): State<ServiceState>,
    Path(path_params): Path<SessionPathParams>,
    Json(request): Json<CreateSlotRequest>,
) -> Result<(StatusCode, Json<SlotStatus>)> {
    let session = state.sessions.get(path_params.session_id)?;
    let spec = request.slot.clone();
    let task_id = request.task_id.clone();
    let binding = request.channel_id.clone();

    let result = session.command(SlotCommand::Create(request)).await?;
    let status = expect_status("create", result)?;

    let channel_id = normalize_binding(&binding);
    if !channel_id.is_empty() && snapshot_binding(&binding).is_none() && !spec.is_local() {
        let registry = state.slots.registry();
        let authority = relay_authority(registry.base());
        let uri = SlotUri::for_slot(registry.base(), &task_id, &spec.name)?
            .via_relay(&authority, &session.id().to_string())?;
        let instance = SlotInstance {
            spec,
            task_id,
            channel_id: channel_id.to_string(),
            uri,
        };

        tracing::debug!(
            target: TRACING_TARGET,
            session_id = %session.id(),
            uri = %instance.uri,
            channel_id = %instance.channel_id,
            "Binding relayed slot"
        );
        registry.channels().bind(&instance).await?;
        session.remember(instance).await;
    }

    Ok((StatusCode::CREATED, Json(status)))
}

async fn relay_connect(
    State(sessions): State<RelaySessions>,
    Path(path_params): Path<SessionPathParams>,
    idempotency_key: IdempotencyKey,
    Json(request): Json<ConnectSlotRequest>,
) -> Result<(StatusCode, Json<Operation>)> {
    let session = sessions.get(path_params.session_id)?;
    if let Some(key) = idempotency_key.as_deref() {
        tracing::debug!(
            target: TRACING_TARGET,
            session_id = %session.id(),
            idempotency_key = key,
            "Idempotency key is not forwarded to terminals"
        );
    }

    let result = session.command(SlotCommand::Connect(request)).await?;
    Ok((StatusCode::ACCEPTED, Json(expect_operation("connect", result)?)))
}

async fn relay_disconnect(
    State(sessions): State<RelaySessions>,
    Path(path_params): Path<SessionPathParams>,
    Json(slot): Json<SlotRef>,
) -> Result<Json<SlotStatus>> {
    let session = sessions.get(path_params.session_id)?;
    let result = session.command(SlotCommand::Disconnect(slot)).await?;
    Ok(Json(expect_status("disconnect", result)?))
}

async fn relay_status(
    State(sessions): State<RelaySessions>,
    Path(path_params): Path<SessionPathParams>,
    Json(slot): Json<SlotRef>,
) -> Result<Json<SlotStatus>> {
    let session = sessions.get(path_params.session_id)?;
    let result = session.command(SlotCommand::Status(slot)).await?;
    Ok(Json(expect_status("status", result)?))
}

/// Destroys a slot on the terminal and unbinds its relay address.
async fn relay_destroy(
    State(state): State<ServiceState>,
    Path(path_params): Path<SessionPathParams>,
    Json(slot): Json<SlotRef>,
) -> Result<(StatusCode, Json<Operation>)> {
    let session = state.sessions.get(path_params.session_id)?;
    let result = session.command(SlotCommand::Destroy(slot.clone())).await?;
    let operation = expect_operation("destroy", result)?;

    if let Some(instance) = session.forget(&slot).await {
        state.slots.registry().channels().unbind(&instance).await?;
    }

    Ok((StatusCode::ACCEPTED, Json(operation)))
}

async fn relay_open(
    State(sessions): State<RelaySessions>,
    Path(path_params): Path<SessionPathParams>,
    Json(request): Json<OpenOutputSlotRequest>,
) -> Result<Response> {
    let session = sessions.get(path_params.session_id)?;
    let chunks = session.open(request).await?;
    Ok(framed_response(chunks).into_response())
}

/// Returns a [`Router`] with all relay routes.
pub fn routes() -> Router<ServiceState> {
    Router::new()
        .route("/relay/sessions", post(create_session).get(list_sessions))
        .route(
            "/relay/sessions/{sessionId}",
            get(get_session).delete(delete_session),
        )
        .route("/relay/sessions/{sessionId}/control", get(control_channel))
        .route("/relay/sessions/{sessionId}/data", get(data_channel))
        .route("/relay/sessions/{sessionId}/progress", get(session_progress))
        .route("/relay/sessions/{sessionId}/slots/create", post(relay_create))
        .route("/relay/sessions/{sessionId}/slots/connect", post(relay_connect))
        .route("/relay/sessions/{sessionId}/slots/disconnect", post(relay_disconnect))
        .route("/relay/sessions/{sessionId}/slots/status", post(relay_status))
        .route("/relay/sessions/{sessionId}/slots/destroy", post(relay_destroy))
        .route("/relay/sessions/{sessionId}/slots/open", post(relay_open))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::{Bytes, BytesMut};
    use conduit_core::{SlotDirection, SlotFrame, SlotFrameCodec, SlotMedia, SlotSpec};
    use conduit_slots::{RelayAgent, SlotService, SlotsConfig};
    use tokio_stream::wrappers::ReceiverStream;
    use tokio_util::codec::Decoder;

    use super::*;
    use crate::handler::test::create_test_server_with_router;

    /// Runs `terminal` behind `session` over in-process channels.
    fn attach_terminal(
        session: &RelaySession,
        terminal: Arc<SlotService>,
    ) -> anyhow::Result<tokio::task::JoinHandle<conduit_core::Result<()>>> {
        let commands = ReceiverStream::new(session.attach_control()?).map(Ok);
        session.attach_data()?;

        let replies =
            futures::sink::unfold(session.clone(), |session, reply: RelayReply| async move {
                session.handle_reply(reply);
                Ok::<_, conduit_core::Error>(session)
            });
        let data = futures::sink::unfold(session.clone(), |session, frame: DataFrame| async move {
            session.handle_data(frame).await;
            Ok::<_, conduit_core::Error>(session)
        });

        let agent = RelayAgent::new(terminal);
        Ok(tokio::spawn(async move { agent.run(commands, replies, data).await }))
    }

    fn terminal(dir: &std::path::Path) -> anyhow::Result<Arc<SlotService>> {
        Ok(SlotService::builder(SlotsConfig::new("fs://10.0.0.9:9000", dir)).build()?)
    }

    #[tokio::test]
    async fn sessions_are_created_listed_and_deleted() -> anyhow::Result<()> {
        let (server, _state, _dir) = create_test_server_with_router(|_| routes()).await?;

        let response = server
            .post("/relay/sessions")
            .json(&CreateSessionRequest {
                label: Some("edge-1".into()),
            })
            .await;
        response.assert_status(StatusCode::CREATED);
        let session = response.json::<SessionResponse>();
        assert!(session.base_uri.starts_with("relay://"));
        assert!(session.base_uri.ends_with(&format!("session={}", session.session_id)));
        assert!(!session.is_connected);

        let listed = server.get("/relay/sessions").await.json::<Vec<SessionResponse>>();
        assert_eq!(listed.len(), 1);

        let path = format!("/relay/sessions/{}", session.session_id);
        server.delete(&path).await.assert_status(StatusCode::NO_CONTENT);
        server.get(&path).await.assert_status_not_found();
        Ok(())
    }

    #[tokio::test]
    async fn commands_without_terminal_are_bad_gateway() -> anyhow::Result<()> {
        let (server, state, _dir) = create_test_server_with_router(|_| routes()).await?;
        let session = state.sessions.create(None)?;

        let response = server
            .post(&format!("/relay/sessions/{}/slots/status", session.id()))
            .json(&SlotRef::new("t1", "/out"))
            .await;
        response.assert_status(StatusCode::BAD_GATEWAY);
        Ok(())
    }

    #[tokio::test]
    async fn relayed_output_streams_until_eos() -> anyhow::Result<()> {
        let (server, state, _dir) = create_test_server_with_router(|_| routes()).await?;
        let terminal_dir = tempfile::tempdir()?;
        let terminal = terminal(terminal_dir.path())?;

        let session = state.sessions.create(Some("edge".into()))?;
        let running = attach_terminal(&session, terminal.clone())?;
        let base = format!("/relay/sessions/{}", session.id());

        let response = server
            .post(&format!("{base}/slots/create"))
            .json(&CreateSlotRequest {
                task_id: "t1".into(),
                slot: SlotSpec::new("/out", SlotMedia::File, SlotDirection::Output),
                channel_id: String::new(),
            })
            .await;
        response.assert_status(StatusCode::CREATED);

        let slot = terminal.registry().get("t1", "/out")?;
        slot.write(Bytes::from_static(b"hello\n")).await?;
        slot.close_writer().await?;

        let response = server
            .post(&format!("{base}/slots/open"))
            .json(&OpenOutputSlotRequest {
                slot: SlotRef::new("t1", "/out"),
                offset: 0,
            })
            .await;
        response.assert_status_ok();

        let mut codec = SlotFrameCodec::new();
        let mut buffer = BytesMut::from(&response.as_bytes()[..]);
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(&mut buffer)? {
            frames.push(frame);
        }
        assert_eq!(
            frames,
            vec![SlotFrame::Chunk(Bytes::from_static(b"hello\n")), SlotFrame::Eos]
        );

        let missing = server
            .post(&format!("{base}/slots/status"))
            .json(&SlotRef::new("t1", "/missing"))
            .await;
        missing.assert_status_not_found();

        session.close().await;
        running.await??;
        Ok(())
    }

    #[tokio::test]
    async fn channel_bound_slots_are_bound_under_the_relay_address() -> anyhow::Result<()> {
        let (server, state, _dir) = create_test_server_with_router(|_| routes()).await?;
        let terminal_dir = tempfile::tempdir()?;
        let terminal = terminal(terminal_dir.path())?;

        let session = state.sessions.create(None)?;
        let _running = attach_terminal(&session, terminal)?;
        let base = format!("/relay/sessions/{}", session.id());

        server
            .post(&format!("{base}/slots/create"))
            .json(&CreateSlotRequest {
                task_id: "t1".into(),
                slot: SlotSpec::new("/out", SlotMedia::File, SlotDirection::Output),
                channel_id: "channel:c1".into(),
            })
            .await
            .assert_status(StatusCode::CREATED);

        let relayed = session
            .forget(&SlotRef::new("t1", "/out"))
            .await
            .ok_or_else(|| anyhow::anyhow!("slot was not bound through the relay"))?;
        assert_eq!(relayed.channel_id, "c1");
        assert_eq!(relayed.uri.scheme(), RELAY_SCHEME);
        assert_eq!(relayed.uri.session_id(), Some(session.id().to_string()));
        assert_eq!(relayed.uri.slot_name(), "/out");
        Ok(())
    }
}
