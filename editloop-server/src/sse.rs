//! Server-Sent Events stream of a session's turn events.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::state::{AppState, SessionEvent};

/// SSE endpoint handler.
///
/// Events keep their per-turn order; a client that lags loses the skipped
/// events and should refetch `/files`.
pub async fn events_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.event_tx.subscribe();

    let stream = async_stream::stream! {
        yield Ok(Event::default().event("connected").data(format!("{{\"session_id\":{}}}", json_string(&session_id))));

        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(sse_event) = to_sse_event(&session_id, &event) {
                        yield Ok(sse_event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(%session_id, skipped = n, "SSE client lagged, some events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!(%session_id, "event channel closed");
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

/// SSE frame for `event` if it belongs to `session_id`.
fn to_sse_event(session_id: &str, event: &SessionEvent) -> Option<Event> {
    if event.session_id != session_id {
        return None;
    }
    let data = serde_json::to_string(event).ok()?;
    Some(Event::default().event(event.event.name()).data(data))
}

fn json_string(value: &str) -> String {
    serde_json::Value::from(value).to_string()
}

#[cfg(test)]
mod tests {
    use editloop::core::session::{TurnEvent, TurnStatus};

    use super::*;

    fn done(session_id: &str) -> SessionEvent {
        SessionEvent {
            session_id: session_id.to_string(),
            event: TurnEvent::Done {
                turn_id: "t1".to_string(),
                status: TurnStatus::Clean,
                failure: None,
            },
        }
    }

    #[test]
    fn other_sessions_are_filtered_out() {
        assert!(to_sse_event("s1", &done("s2")).is_none());
        assert!(to_sse_event("s1", &done("s1")).is_some());
    }

    #[test]
    fn payload_carries_session_and_event_fields() {
        let value = serde_json::to_value(done("s1")).expect("json");
        assert_eq!(value["session_id"], "s1");
        assert_eq!(value["type"], "done");
        assert_eq!(value["status"], "clean");
    }

    #[test]
    fn session_ids_are_json_escaped() {
        assert_eq!(json_string("a\"b"), "\"a\\\"b\"");
    }
}
