use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::types::ApiErrorResponse;

/// Application error codes following the pattern E{service}{sequence}
///
/// Ranges:
/// - E0xxx: Shared/infrastructure errors
/// - E1xxx: Identity/token errors
/// - E2xxx: Matching errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    // Shared (E0xxx)
    InternalError,
    ValidationError,
    NotFound,
    Unauthorized,
    Forbidden,
    RateLimited,
    ServiceUnavailable,
    BadRequest,

    // Identity (E1xxx)
    TokenExpired,
    TokenInvalid,

    // Matching (E2xxx)
    AlreadyWaiting,
    AlreadyInSession,
    SessionNotFound,
    InvalidTransition,
    DailyCallLimitReached,
}

impl ErrorCode {
    pub fn code(&self) -> &'static str {
        self.parts().0
    }

    pub fn status_code(&self) -> StatusCode {
        self.parts().1
    }

    /// Wire code and HTTP status, kept side by side so neither can
    /// drift when a code is added.
    fn parts(&self) -> (&'static str, StatusCode) {
        use StatusCode as S;
        match self {
            // Shared
            Self::InternalError => ("E0001", S::INTERNAL_SERVER_ERROR),
            Self::ValidationError => ("E0002", S::BAD_REQUEST),
            Self::NotFound => ("E0003", S::NOT_FOUND),
            Self::Unauthorized => ("E0004", S::UNAUTHORIZED),
            Self::Forbidden => ("E0005", S::FORBIDDEN),
            Self::RateLimited => ("E0006", S::TOO_MANY_REQUESTS),
            Self::ServiceUnavailable => ("E0007", S::INTERNAL_SERVER_ERROR),
            Self::BadRequest => ("E0008", S::BAD_REQUEST),

            // Identity
            Self::TokenExpired => ("E1001", S::UNAUTHORIZED),
            Self::TokenInvalid => ("E1002", S::UNAUTHORIZED),

            // Matching
            Self::AlreadyWaiting => ("E2001", S::CONFLICT),
            Self::AlreadyInSession => ("E2002", S::CONFLICT),
            Self::SessionNotFound => ("E2003", S::NOT_FOUND),
            Self::InvalidTransition => ("E2004", S::CONFLICT),
            Self::DailyCallLimitReached => ("E2005", S::TOO_MANY_REQUESTS),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{message}")]
    Known {
        code: ErrorCode,
        message: String,
        details: Option<serde_json::Value>,
    },

    #[error("internal server error")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Known {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(
        code: ErrorCode,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self::Known {
            code,
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    /// The wire code for this error, for log fields and tests.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Known { code, .. } => code.code(),
            Self::Internal(_) => ErrorCode::InternalError.code(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            AppError::Known {
                code,
                message,
                details,
            } => {
                let mut body = ApiErrorResponse::new(code.code(), message);
                if let Some(details) = details {
                    body = body.with_details(details);
                }
                (code.status_code(), body)
            }
            AppError::Internal(err) => {
                // Never leak internals to the client.
                tracing::error!(error = %err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ApiErrorResponse::new(ErrorCode::InternalError.code(), "internal server error"),
                )
            }
        };

        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
