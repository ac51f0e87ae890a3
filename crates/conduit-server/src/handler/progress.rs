//! Server-sent progress events.

use std::convert::Infallible;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::get;
use conduit_core::SlotProgress;
use conduit_slots::SlotService;
use futures::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use validator::Validate;

use super::request::ProgressQuery;
use crate::extract::Query;
use crate::handler::Result;
use crate::service::ServiceState;

/// Tracing target for progress streams.
const TRACING_TARGET: &str = "conduit_server::handler::progress";

/// Returns the SSE event name of a progress event.
fn event_name(event: &SlotProgress) -> &'static str {
    match event {
        SlotProgress::Attached { .. } => "attached",
        SlotProgress::Detached { .. } => "detached",
        SlotProgress::CommunicationCompleted { .. } => "communication_completed",
        SlotProgress::Concluded => "concluded",
    }
}

/// Turns a progress subscription into SSE events, optionally for one task.
///
/// Events dropped because the subscriber lagged are logged and skipped.
pub(crate) fn progress_events(
    receiver: broadcast::Receiver<SlotProgress>,
    task_id: Option<String>,
) -> impl Stream<Item = std::result::Result<Event, Infallible>> + Send + 'static {
    BroadcastStream::new(receiver).filter_map(move |event| {
        let event = match event {
            Ok(event) => event,
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                tracing::warn!(target: TRACING_TARGET, skipped, "Progress subscriber lagged");
                return std::future::ready(None);
            }
        };

        let wanted = match (&task_id, event.task_id()) {
            (Some(filter), Some(task)) => filter == task,
            (Some(_), None) => matches!(event, SlotProgress::Concluded),
            (None, _) => true,
        };
        if !wanted {
            return std::future::ready(None);
        }

        let sse = Event::default().event(event_name(&event)).json_data(&event);
        std::future::ready(match sse {
            Ok(sse) => Some(Ok(sse)),
            Err(error) => {
                tracing::error!(
                    target: TRACING_TARGET,
                    error = %error,
                    "Progress event not encodable"
                );
                None
            }
        })
    })
}

/// Streams the registry's progress events.
async fn stream_progress(
    State(slots): State<Arc<SlotService>>,
    Query(query): Query<ProgressQuery>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    query.validate()?;

    tracing::debug!(
        target: TRACING_TARGET,
        task_id = query.task_id.as_deref().unwrap_or_default(),
        "Progress subscriber attached"
    );
    let events = progress_events(slots.subscribe(), query.task_id);
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// Returns a [`Router`] with all progress routes.
pub fn routes() -> Router<ServiceState> {
    Router::new().route("/progress", get(stream_progress))
}

#[cfg(test)]
mod tests {
    use conduit_core::SlotDirection;

    use super::*;
    use crate::handler::test::slot_instance;

    #[tokio::test]
    async fn events_are_filtered_by_task() -> anyhow::Result<()> {
        let (sender, receiver) = broadcast::channel(16);
        let events = progress_events(receiver, Some("t1".into()));
        let mut events = std::pin::pin!(events);

        sender.send(SlotProgress::Attached {
            slot: slot_instance("t2", "/out", SlotDirection::Output)?,
        })?;
        sender.send(SlotProgress::CommunicationCompleted {
            task_id: "t1".into(),
        })?;
        sender.send(SlotProgress::Concluded)?;
        drop(sender);

        let mut received = 0;
        while let Some(event) = events.next().await {
            event?;
            received += 1;
        }
        assert_eq!(received, 2);
        Ok(())
    }

    #[test]
    fn event_names_match_the_wire_tag() -> anyhow::Result<()> {
        let event = SlotProgress::CommunicationCompleted {
            task_id: "t1".into(),
        };
        let json = serde_json::to_value(&event)?;
        assert_eq!(json["event"], event_name(&event));
        Ok(())
    }
}
