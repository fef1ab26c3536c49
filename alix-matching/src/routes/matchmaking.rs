use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use validator::Validate;

use alix_shared::errors::{AppError, AppResult, ErrorCode};
use alix_shared::types::api::ApiResponse;
use alix_shared::types::auth::AuthUser;

use crate::matching::{CallStats, MatchFilters, MatchGrant, MatchOutcome, Profile, UserStatus};
use crate::AppState;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Validate)]
pub struct MatchRequestPayload {
    #[serde(default)]
    #[validate]
    pub filters: MatchFilters,
    #[serde(default)]
    #[validate]
    pub profile: Profile,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MatchResponse {
    Waiting { position: usize },
    Matched(MatchGrant),
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub removed: bool,
}

// ---------------------------------------------------------------------------
// POST /match/request
// ---------------------------------------------------------------------------

/// 200 with a grant when an immediate match exists, 202 while queued.
pub async fn request_match(
    auth_user: AuthUser,
    State(state): State<Arc<AppState>>,
    Json(payload): Json<MatchRequestPayload>,
) -> AppResult<(StatusCode, Json<ApiResponse<MatchResponse>>)> {
    payload
        .validate()
        .map_err(|e| AppError::new(ErrorCode::ValidationError, e.to_string()))?;

    let outcome = state.supervisor.request_match(
        auth_user.id,
        payload.filters,
        payload.profile,
        auth_user.is_premium(),
    )?;

    let (status, response) = match outcome {
        MatchOutcome::Waiting { position } => {
            (StatusCode::ACCEPTED, MatchResponse::Waiting { position })
        }
        MatchOutcome::Matched(grant) => (StatusCode::OK, MatchResponse::Matched(grant)),
    };

    Ok((status, Json(ApiResponse::ok(response))))
}

// ---------------------------------------------------------------------------
// POST /match/cancel
// ---------------------------------------------------------------------------

/// Idempotent: cancelling when not waiting still answers 200.
pub async fn cancel_match(
    auth_user: AuthUser,
    State(state): State<Arc<AppState>>,
) -> Json<ApiResponse<CancelResponse>> {
    let removed = state.supervisor.cancel(auth_user.id);
    let message = if removed {
        "match request cancelled"
    } else {
        "no pending match request"
    };
    Json(ApiResponse::ok_with_message(CancelResponse { removed }, message))
}

// ---------------------------------------------------------------------------
// GET /match/status
// ---------------------------------------------------------------------------

pub async fn match_status(
    auth_user: AuthUser,
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<ApiResponse<UserStatus>>> {
    let status = state.supervisor.status(auth_user.id)?;
    Ok(Json(ApiResponse::ok(status)))
}

// ---------------------------------------------------------------------------
// GET /match/stats
// ---------------------------------------------------------------------------

pub async fn call_stats(
    auth_user: AuthUser,
    State(state): State<Arc<AppState>>,
) -> Json<ApiResponse<CallStats>> {
    let stats = state
        .supervisor
        .stats(auth_user.id, auth_user.is_premium());
    Json(ApiResponse::ok(stats))
}
