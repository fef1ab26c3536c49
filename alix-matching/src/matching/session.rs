use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};
use uuid::Uuid;

use alix_shared::{AppError, AppResult, ErrorCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Connecting,
    Active,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndReason {
    /// Both users left within the grace window.
    Normal,
    /// Connect deadline or max call duration hit.
    Timeout,
    /// A user backed out before the call connected.
    Decline,
    /// One user left and the other stayed.
    Disconnect,
    Error,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Timeout => "timeout",
            Self::Decline => "decline",
            Self::Disconnect => "disconnect",
            Self::Error => "error",
        }
    }
}

/// Client-reported lifecycle signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalEvent {
    Joined,
    Leave,
    Decline,
}

/// What a signal did to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    NoChange,
    /// Both users joined; the call is now live.
    Activated,
    /// The session ended and can be finalized immediately.
    Ended(EndReason),
    /// The session ended but stays around until the grace window
    /// resolves, in case the peer's own leave arrives right behind.
    EndedPendingGrace,
    /// The peer left within the grace window; disconnect became normal.
    ReasonUpgraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    /// Never connected before the deadline.
    TimedOutConnecting,
    /// Hit the max call duration.
    TimedOutActive,
    /// Grace window passed without the peer leaving.
    GraceElapsed,
}

/// One matched call. Deadlines are stored as monotonic instants and
/// checked by the sweeper, so no timer handle outlives a state change.
#[derive(Debug, Clone)]
pub struct CallSession {
    pub id: Uuid,
    pub channel: String,
    pub users: [Uuid; 2],
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<EndReason>,
    /// Connect deadline while connecting, max-duration deadline once active.
    pub deadline: Instant,
    pub grace_until: Option<Instant>,
    joined: [bool; 2],
    left: [bool; 2],
    connected_mono: Option<Instant>,
    ended_mono: Option<Instant>,
}

impl CallSession {
    pub fn new(id: Uuid, channel: String, users: [Uuid; 2], connect_timeout: Duration) -> Self {
        Self {
            id,
            channel,
            users,
            state: SessionState::Connecting,
            created_at: Utc::now(),
            connected_at: None,
            ended_at: None,
            end_reason: None,
            deadline: Instant::now() + connect_timeout,
            grace_until: None,
            joined: [false; 2],
            left: [false; 2],
            connected_mono: None,
            ended_mono: None,
        }
    }

    pub fn participant_index(&self, user_id: Uuid) -> Option<usize> {
        self.users.iter().position(|u| *u == user_id)
    }

    pub fn peer_of(&self, user_id: Uuid) -> Option<Uuid> {
        match self.participant_index(user_id) {
            Some(idx) => Some(self.users[1 - idx]),
            None => None,
        }
    }

    pub fn is_ended(&self) -> bool {
        self.state == SessionState::Ended
    }

    /// A user reports having joined the media channel. Repeats are no-ops;
    /// once both sides joined the call goes active and the deadline switches
    /// to the max call duration.
    pub fn apply_joined(&mut self, idx: usize, max_call: Duration) -> AppResult<SignalOutcome> {
        match self.state {
            SessionState::Ended => Err(already_ended()),
            SessionState::Active => {
                self.joined[idx] = true;
                Ok(SignalOutcome::NoChange)
            }
            SessionState::Connecting => {
                if self.joined[idx] {
                    return Ok(SignalOutcome::NoChange);
                }
                self.joined[idx] = true;
                if self.joined.iter().all(|j| *j) {
                    self.state = SessionState::Active;
                    self.connected_at = Some(Utc::now());
                    self.connected_mono = Some(Instant::now());
                    self.deadline = Instant::now() + max_call;
                    Ok(SignalOutcome::Activated)
                } else {
                    Ok(SignalOutcome::NoChange)
                }
            }
        }
    }

    /// A user reports leaving. In a connecting session that is a decline;
    /// in an active call it ends the session as a disconnect, upgraded to a
    /// normal end if the peer's leave lands within the grace window.
    pub fn apply_leave(&mut self, idx: usize, grace: Duration) -> AppResult<SignalOutcome> {
        match self.state {
            SessionState::Connecting => {
                self.left[idx] = true;
                self.end(EndReason::Decline);
                Ok(SignalOutcome::Ended(EndReason::Decline))
            }
            SessionState::Active => {
                self.left[idx] = true;
                self.end(EndReason::Disconnect);
                self.grace_until = Some(Instant::now() + grace);
                Ok(SignalOutcome::EndedPendingGrace)
            }
            SessionState::Ended => {
                let within_grace = self
                    .grace_until
                    .map(|g| Instant::now() <= g)
                    .unwrap_or(false);
                if within_grace && !self.left[idx] {
                    self.left[idx] = true;
                    self.end_reason = Some(EndReason::Normal);
                    self.grace_until = None;
                    Ok(SignalOutcome::ReasonUpgraded)
                } else {
                    Err(already_ended())
                }
            }
        }
    }

    /// A user rejects the match before the call connects.
    pub fn apply_decline(&mut self, idx: usize) -> AppResult<SignalOutcome> {
        match self.state {
            SessionState::Connecting => {
                self.left[idx] = true;
                self.end(EndReason::Decline);
                Ok(SignalOutcome::Ended(EndReason::Decline))
            }
            SessionState::Active => Err(AppError::new(
                ErrorCode::InvalidTransition,
                "cannot decline a connected call",
            )),
            SessionState::Ended => Err(already_ended()),
        }
    }

    /// Deadline check, called periodically. Mutates the session when a
    /// deadline passed and tells the caller what happened.
    pub fn sweep_check(&mut self) -> Option<SweepOutcome> {
        let now = Instant::now();
        match self.state {
            SessionState::Connecting if now >= self.deadline => {
                self.end(EndReason::Timeout);
                Some(SweepOutcome::TimedOutConnecting)
            }
            SessionState::Active if now >= self.deadline => {
                self.end(EndReason::Timeout);
                Some(SweepOutcome::TimedOutActive)
            }
            SessionState::Ended => match self.grace_until {
                Some(g) if now > g => {
                    self.grace_until = None;
                    Some(SweepOutcome::GraceElapsed)
                }
                _ => None,
            },
            _ => None,
        }
    }

    fn end(&mut self, reason: EndReason) {
        self.state = SessionState::Ended;
        self.ended_at = Some(Utc::now());
        self.ended_mono = Some(Instant::now());
        self.end_reason = Some(reason);
    }

    /// Connected time in whole seconds. Live sessions measure up to now,
    /// ended ones up to when they ended. Zero if the call never connected.
    pub fn duration_secs(&self) -> i64 {
        match (self.connected_mono, self.ended_mono) {
            (Some(start), Some(end)) => end.saturating_duration_since(start).as_secs() as i64,
            (Some(start), None) => Instant::now().saturating_duration_since(start).as_secs() as i64,
            _ => 0,
        }
    }

    /// Snapshot for the closed-session history.
    pub fn close(&self) -> ClosedSession {
        ClosedSession {
            session_id: self.id,
            channel: self.channel.clone(),
            users: self.users,
            created_at: self.created_at,
            connected_at: self.connected_at,
            ended_at: self.ended_at.unwrap_or_else(Utc::now),
            reason: self.end_reason.unwrap_or(EndReason::Error),
            duration_secs: self.duration_secs(),
        }
    }
}

fn already_ended() -> AppError {
    AppError::new(ErrorCode::InvalidTransition, "session already ended")
}

/// Immutable record of a finished call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedSession {
    pub session_id: Uuid,
    pub channel: String,
    pub users: [Uuid; 2],
    pub created_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub ended_at: DateTime<Utc>,
    pub reason: EndReason,
    pub duration_secs: i64,
}

/// What one participant is allowed to see about a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub session_id: Uuid,
    pub channel: String,
    pub peer_id: Uuid,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<EndReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<i64>,
}

impl SessionView {
    pub fn for_user(session: &CallSession, user_id: Uuid) -> Self {
        Self {
            session_id: session.id,
            channel: session.channel.clone(),
            peer_id: session.peer_of(user_id).unwrap_or(user_id),
            state: session.state,
            created_at: session.created_at,
            connected_at: session.connected_at,
            ended_at: session.ended_at,
            end_reason: session.end_reason,
            duration_secs: session.connected_mono.map(|_| session.duration_secs()),
        }
    }
}
