use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::matching::session::{CallSession, ClosedSession, EndReason};
use crate::token::CallGrant;

/// Canonical event type string, used in JSON payloads and SSE `event:` fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchEventType {
    #[serde(rename = "match.found")]
    MatchFound,
    #[serde(rename = "session.active")]
    SessionActive,
    #[serde(rename = "session.ended")]
    SessionEnded,
}

impl MatchEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MatchFound => "match.found",
            Self::SessionActive => "session.active",
            Self::SessionEnded => "session.ended",
        }
    }
}

impl std::fmt::Display for MatchEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FoundPayload {
    pub session_id: Uuid,
    pub channel: String,
    pub participants: [Uuid; 2],
    /// One grant per participant. Projected down to the caller's own
    /// grant before anything leaves the service.
    pub grants: Vec<CallGrant>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivePayload {
    pub session_id: Uuid,
    pub channel: String,
    pub participants: [Uuid; 2],
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndedPayload {
    pub session_id: Uuid,
    pub channel: String,
    pub participants: [Uuid; 2],
    pub reason: EndReason,
    pub duration_secs: i64,
    pub ended_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MatchEventPayload {
    Found(FoundPayload),
    Active(ActivePayload),
    Ended(EndedPayload),
}

/// A fully self-describing matchmaking event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchEvent {
    /// Globally unique event identifier (format: `evt_<uuid-v4>`).
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: MatchEventType,
    pub created_at: DateTime<Utc>,
    pub data: MatchEventPayload,
}

impl MatchEvent {
    pub fn match_found(session: &CallSession, grants: Vec<CallGrant>) -> Self {
        Self::new(
            MatchEventType::MatchFound,
            MatchEventPayload::Found(FoundPayload {
                session_id: session.id,
                channel: session.channel.clone(),
                participants: session.users,
                grants,
            }),
        )
    }

    pub fn session_active(session: &CallSession) -> Self {
        Self::new(
            MatchEventType::SessionActive,
            MatchEventPayload::Active(ActivePayload {
                session_id: session.id,
                channel: session.channel.clone(),
                participants: session.users,
                connected_at: session.connected_at.unwrap_or_else(Utc::now),
            }),
        )
    }

    pub fn session_ended(closed: &ClosedSession) -> Self {
        Self::new(
            MatchEventType::SessionEnded,
            MatchEventPayload::Ended(EndedPayload {
                session_id: closed.session_id,
                channel: closed.channel.clone(),
                participants: closed.users,
                reason: closed.reason,
                duration_secs: closed.duration_secs,
                ended_at: closed.ended_at,
            }),
        )
    }

    fn new(event_type: MatchEventType, data: MatchEventPayload) -> Self {
        Self {
            id: format!("evt_{}", Uuid::new_v4()),
            event_type,
            created_at: Utc::now(),
            data,
        }
    }

    pub fn participants(&self) -> [Uuid; 2] {
        match &self.data {
            MatchEventPayload::Found(p) => p.participants,
            MatchEventPayload::Active(p) => p.participants,
            MatchEventPayload::Ended(p) => p.participants,
        }
    }

    pub fn involves(&self, user_id: Uuid) -> bool {
        self.participants().contains(&user_id)
    }

    /// The user-scoped JSON a client may see: their own grant, their
    /// peer's id, never the peer's token.
    pub fn client_payload(&self, user_id: Uuid) -> serde_json::Value {
        let peer_id = self.participants().iter().find(|u| **u != user_id).copied();
        match &self.data {
            MatchEventPayload::Found(p) => {
                let grant = p.grants.iter().find(|g| g.user_id == user_id);
                serde_json::json!({
                    "session_id": p.session_id,
                    "channel": p.channel,
                    "peer_id": peer_id,
                    "call_token": grant.map(|g| g.call_token.clone()),
                    "expires_at": grant.map(|g| g.expires_at),
                })
            }
            MatchEventPayload::Active(p) => serde_json::json!({
                "session_id": p.session_id,
                "channel": p.channel,
                "peer_id": peer_id,
                "connected_at": p.connected_at,
            }),
            MatchEventPayload::Ended(p) => serde_json::json!({
                "session_id": p.session_id,
                "channel": p.channel,
                "peer_id": peer_id,
                "reason": p.reason,
                "duration_secs": p.duration_secs,
                "ended_at": p.ended_at,
            }),
        }
    }
}

/// Broadcast-based fan-out for `MatchEvent`: the SSE streams and the
/// RabbitMQ relay each hold their own receiver. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MatchEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(4096);
        Self { tx }
    }

    pub fn with_capacity(cap: usize) -> Self {
        let (tx, _) = broadcast::channel(cap);
        Self { tx }
    }

    /// Publish an event. Returns the number of active subscribers.
    /// send() errors only with zero receivers, which is normal before
    /// any SSE client or the relay has attached.
    pub fn emit(&self, event: MatchEvent) -> usize {
        tracing::debug!(event_type = %event.event_type, event_id = %event.id, "event emitted");
        self.tx.send(event).unwrap_or(0)
    }

    /// Obtain a new receiver. Each receiver sees every event published
    /// after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<MatchEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
