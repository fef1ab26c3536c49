use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use alix_shared::errors::AppResult;
use alix_shared::types::api::ApiResponse;
use alix_shared::types::auth::AuthUser;

use crate::matching::{SessionView, SignalEvent};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct SignalPayload {
    pub event: SignalEvent,
}

// ---------------------------------------------------------------------------
// POST /session/:id/signal
// ---------------------------------------------------------------------------

/// Participants report `joined`, `leave`, or `decline` here; the response
/// is the session as that participant may now see it.
pub async fn signal_session(
    auth_user: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
    Json(payload): Json<SignalPayload>,
) -> AppResult<Json<ApiResponse<SessionView>>> {
    let view = state
        .supervisor
        .signal(session_id, auth_user.id, payload.event)?;
    Ok(Json(ApiResponse::ok(view)))
}
