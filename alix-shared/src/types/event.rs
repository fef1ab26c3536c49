use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// RabbitMQ Event envelope wrapping all domain events.
///
/// Routing key format: `alix.{domain}.{entity}.{action}`
/// Example: `alix.matching.session.started`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event<T: Serialize> {
    pub id: Uuid,
    pub source: String,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub data: T,
}

impl<T: Serialize> Event<T> {
    pub fn new(source: impl Into<String>, event_type: impl Into<String>, data: T) -> Self {
        Self {
            id: Uuid::now_v7(),
            source: source.into(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            correlation_id: None,
            user_id: None,
            data,
        }
    }

    pub fn with_user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

/// RabbitMQ routing keys
pub mod routing_keys {
    pub const MATCHING_SESSION_STARTED: &str = "alix.matching.session.started";
    pub const MATCHING_SESSION_ENDED: &str = "alix.matching.session.ended";
}

/// Payloads for the events this service publishes.
pub mod payloads {
    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct CallSessionStarted {
        pub session_id: Uuid,
        pub channel: String,
        pub user_a_id: Uuid,
        pub user_b_id: Uuid,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct CallSessionEnded {
        pub session_id: Uuid,
        pub channel: String,
        pub user_a_id: Uuid,
        pub user_b_id: Uuid,
        pub end_reason: String,
        pub duration_secs: i64,
    }
}
