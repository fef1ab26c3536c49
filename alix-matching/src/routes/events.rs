use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use futures::stream::Stream;

use alix_shared::types::auth::AuthUser;

use crate::AppState;

// ---------------------------------------------------------------------------
// GET /match/events
// ---------------------------------------------------------------------------

/// Per-user SSE stream of matchmaking events.
///
/// Each frame carries the event type in the `event:` field and the
/// user-scoped payload as JSON. A heartbeat comment every 15 seconds
/// keeps the connection alive through proxies and load balancers.
pub async fn event_stream(
    auth_user: AuthUser,
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let mut rx = state.bus.subscribe();
    let user_id = auth_user.id;

    tracing::info!(user_id = %user_id, "SSE client connected");

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if !event.involves(user_id) {
                        continue;
                    }

                    let sse_event = SseEvent::default()
                        .event(event.event_type.as_str())
                        .id(event.id.clone())
                        .data(event.client_payload(user_id).to_string());

                    yield Ok(sse_event);
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(user_id = %user_id, "SSE client lagged, skipped {n} events");
                    // Tell the client it missed data so it can resync via /match/status.
                    let warning = SseEvent::default()
                        .event("_warning")
                        .data(format!("{{\"message\":\"lagged, skipped {n} events\"}}"));
                    yield Ok(warning);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    tracing::info!("SSE: event bus closed, ending stream");
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    )
}
