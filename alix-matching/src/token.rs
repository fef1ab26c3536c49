use chrono::{DateTime, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use alix_shared::AppResult;

/// Claims embedded in a call token. The media gateway verifies these
/// before letting a client publish into a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallTokenClaims {
    pub sub: Uuid,
    pub channel: String,
    pub role: String,
    pub iat: i64,
    pub exp: i64,
}

/// One user's credential for one media channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallGrant {
    pub user_id: Uuid,
    pub call_token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct CallTokenIssuer {
    secret: String,
    ttl_secs: i64,
}

impl CallTokenIssuer {
    pub fn new(secret: impl Into<String>, ttl_secs: i64) -> Self {
        Self {
            secret: secret.into(),
            ttl_secs,
        }
    }

    /// Sign a publisher token bound to a single channel.
    pub fn issue(&self, channel: &str, user_id: Uuid) -> AppResult<CallGrant> {
        let now = Utc::now();
        let expires_at = now + chrono::Duration::seconds(self.ttl_secs);

        let claims = CallTokenClaims {
            sub: user_id,
            channel: channel.to_string(),
            role: "publisher".to_string(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };

        let call_token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| alix_shared::AppError::internal(format!("failed to sign call token: {e}")))?;

        Ok(CallGrant {
            user_id,
            call_token,
            expires_at,
        })
    }
}
