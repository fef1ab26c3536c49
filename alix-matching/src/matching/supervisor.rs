use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use serde::Serialize;
use tokio::time::Duration;
use uuid::Uuid;

use alix_shared::{AppError, AppResult, ErrorCode};

use crate::config::AppConfig;
use crate::events::bus::{EventBus, MatchEvent};
use crate::token::CallTokenIssuer;

use super::compat::{compatible, MatchFilters, Profile};
use super::pool::{WaitEntry, WaitPool};
use super::session::{
    CallSession, ClosedSession, SessionState, SessionView, SignalEvent, SignalOutcome,
    SweepOutcome,
};

/// Closed sessions are kept long enough to count calls across a full
/// UTC day boundary, then dropped.
const CLOSED_RETENTION_HOURS: i64 = 48;

#[derive(Debug, Clone)]
pub struct MatchLimits {
    pub connect_timeout: Duration,
    pub max_call: Duration,
    pub leave_grace: Duration,
    pub wait_ttl: Option<chrono::Duration>,
    pub daily_call_limit: Option<u32>,
    pub min_counted_call_secs: i64,
    pub channel_prefix: String,
}

impl MatchLimits {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            max_call: Duration::from_secs(config.max_call_secs),
            leave_grace: Duration::from_secs(config.leave_grace_secs),
            wait_ttl: (config.wait_ttl_secs > 0)
                .then(|| chrono::Duration::seconds(config.wait_ttl_secs as i64)),
            daily_call_limit: (config.daily_call_limit > 0).then_some(config.daily_call_limit),
            min_counted_call_secs: config.min_counted_call_secs,
            channel_prefix: config.channel_prefix.clone(),
        }
    }
}

/// Everything the requesting user needs to join their call.
#[derive(Debug, Clone, Serialize)]
pub struct MatchGrant {
    pub session_id: Uuid,
    pub channel: String,
    pub peer_id: Uuid,
    pub call_token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum MatchOutcome {
    Waiting { position: usize },
    Matched(MatchGrant),
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UserStatus {
    Waiting {
        position: usize,
    },
    Matched {
        session: SessionView,
        #[serde(skip_serializing_if = "Option::is_none")]
        call_token: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        expires_at: Option<DateTime<Utc>>,
    },
    Idle,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallStats {
    pub calls_today: u32,
    pub call_secs_today: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily_limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calls_remaining: Option<u32>,
    pub waiting_count: usize,
    pub live_sessions: usize,
}

#[derive(Default)]
struct Inner {
    pool: WaitPool,
    sessions: HashMap<Uuid, CallSession>,
    session_by_user: HashMap<Uuid, Uuid>,
    live_channels: HashSet<String>,
    closed: Vec<ClosedSession>,
}

/// Single authority over the wait pool and every live session.
///
/// All state sits behind one mutex, so each operation observes and
/// mutates the whole matchmaking state atomically. None of the methods
/// await while holding the lock.
pub struct MatchSupervisor {
    inner: Mutex<Inner>,
    limits: MatchLimits,
    issuer: CallTokenIssuer,
    bus: EventBus,
}

impl MatchSupervisor {
    pub fn new(limits: MatchLimits, issuer: CallTokenIssuer, bus: EventBus) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            limits,
            issuer,
            bus,
        }
    }

    /// Match the user with the oldest compatible waiter, or queue them.
    pub fn request_match(
        &self,
        user_id: Uuid,
        filters: MatchFilters,
        profile: Profile,
        unlimited: bool,
    ) -> AppResult<MatchOutcome> {
        counter!("matching_requests_total").increment(1);
        let mut inner = self.inner.lock().unwrap();

        if let Some(session_id) = inner.session_by_user.get(&user_id) {
            return Err(AppError::with_details(
                ErrorCode::AlreadyInSession,
                "user is already in a call",
                serde_json::json!({ "session_id": session_id }),
            ));
        }

        if !unlimited {
            if let Some(limit) = self.limits.daily_call_limit {
                let usage = usage_today(&inner.closed, user_id, self.limits.min_counted_call_secs);
                if usage.counted_calls >= limit {
                    counter!("matching_limit_rejections_total").increment(1);
                    return Err(AppError::with_details(
                        ErrorCode::DailyCallLimitReached,
                        "daily call limit reached",
                        serde_json::json!({
                            "calls_today": usage.counted_calls,
                            "daily_limit": limit,
                        }),
                    ));
                }
            }
        }

        // A re-request while already queued keeps the place in line but
        // picks up the latest filters and profile.
        if inner.pool.refresh(user_id, filters.clone(), profile.clone()) {
            let position = inner.pool.position(user_id).unwrap_or(1);
            tracing::debug!(user_id = %user_id, position, "re-request while waiting");
            return Ok(MatchOutcome::Waiting { position });
        }

        let peer = inner
            .pool
            .dequeue_oldest(|entry| compatible(&filters, &profile, &entry.filters, &entry.profile));

        let peer = match peer {
            Some(peer) => peer,
            None => {
                inner.pool.enqueue(WaitEntry {
                    user_id,
                    filters,
                    profile,
                    enqueued_at: Utc::now(),
                })?;
                let position = inner.pool.position(user_id).unwrap_or_else(|| inner.pool.len());
                tracing::debug!(user_id = %user_id, position, "user queued");
                return Ok(MatchOutcome::Waiting { position });
            }
        };

        let channel = match self.allocate_channel(&inner.live_channels) {
            Some(channel) => channel,
            None => {
                inner.pool.requeue_front(peer);
                return Err(AppError::internal(
                    "channel id collision persisted across retry",
                ));
            }
        };

        let peer_grant = match self.issuer.issue(&channel, peer.user_id) {
            Ok(grant) => grant,
            Err(e) => {
                inner.pool.requeue_front(peer);
                return Err(e);
            }
        };
        let own_grant = match self.issuer.issue(&channel, user_id) {
            Ok(grant) => grant,
            Err(e) => {
                inner.pool.requeue_front(peer);
                return Err(e);
            }
        };

        let session_id = Uuid::new_v4();
        let session = CallSession::new(
            session_id,
            channel.clone(),
            [peer.user_id, user_id],
            self.limits.connect_timeout,
        );

        inner.live_channels.insert(channel.clone());
        inner.session_by_user.insert(peer.user_id, session_id);
        inner.session_by_user.insert(user_id, session_id);

        let waited = Utc::now() - peer.enqueued_at;
        counter!("matching_matches_total").increment(1);
        histogram!("matching_wait_seconds").record(waited.num_milliseconds().max(0) as f64 / 1000.0);
        tracing::info!(
            session_id = %session_id,
            user_a = %peer.user_id,
            user_b = %user_id,
            channel = %channel,
            "match made"
        );

        self.bus
            .emit(MatchEvent::match_found(&session, vec![peer_grant, own_grant.clone()]));
        inner.sessions.insert(session_id, session);

        Ok(MatchOutcome::Matched(MatchGrant {
            session_id,
            channel,
            peer_id: peer.user_id,
            call_token: own_grant.call_token,
            expires_at: own_grant.expires_at,
        }))
    }

    /// Take the user out of the wait pool. Returns whether they were waiting.
    pub fn cancel(&self, user_id: Uuid) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let removed = inner.pool.remove(user_id).is_some();
        if removed {
            counter!("matching_cancels_total").increment(1);
            tracing::debug!(user_id = %user_id, "wait cancelled");
        }
        removed
    }

    /// Apply a lifecycle signal from one participant.
    pub fn signal(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        event: SignalEvent,
    ) -> AppResult<SessionView> {
        let mut inner = self.inner.lock().unwrap();

        let session = inner
            .sessions
            .get_mut(&session_id)
            .ok_or_else(session_not_found)?;
        // Non-participants get the same answer as an unknown id.
        let idx = session
            .participant_index(user_id)
            .ok_or_else(session_not_found)?;

        let outcome = match event {
            SignalEvent::Joined => session.apply_joined(idx, self.limits.max_call)?,
            SignalEvent::Leave => session.apply_leave(idx, self.limits.leave_grace)?,
            SignalEvent::Decline => session.apply_decline(idx)?,
        };
        let snapshot = session.clone();

        match outcome {
            SignalOutcome::NoChange => {}
            SignalOutcome::Activated => {
                tracing::info!(session_id = %session_id, channel = %snapshot.channel, "call connected");
                self.bus.emit(MatchEvent::session_active(&snapshot));
            }
            SignalOutcome::Ended(_) | SignalOutcome::ReasonUpgraded => {
                release_markers(&mut inner, &snapshot);
                self.finalize(&mut inner, &snapshot);
            }
            SignalOutcome::EndedPendingGrace => {
                // Free both users right away; the session object stays
                // until the grace window resolves so the peer's own
                // leave can still upgrade the reason.
                release_markers(&mut inner, &snapshot);
            }
        }

        Ok(SessionView::for_user(&snapshot, user_id))
    }

    /// Reap overdue sessions, expired waits, and stale history.
    /// Returns how many sessions and waits were reaped.
    pub fn sweep(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let mut reaped = 0;

        let mut due = Vec::new();
        for session in inner.sessions.values_mut() {
            if let Some(outcome) = session.sweep_check() {
                due.push((session.clone(), outcome));
            }
        }
        for (snapshot, outcome) in due {
            match outcome {
                SweepOutcome::TimedOutConnecting => {
                    tracing::warn!(session_id = %snapshot.id, "call never connected before deadline");
                }
                SweepOutcome::TimedOutActive => {
                    tracing::info!(session_id = %snapshot.id, "max call duration reached");
                }
                SweepOutcome::GraceElapsed => {}
            }
            release_markers(&mut inner, &snapshot);
            self.finalize(&mut inner, &snapshot);
            reaped += 1;
        }

        if let Some(ttl) = self.limits.wait_ttl {
            let cutoff = Utc::now() - ttl;
            for entry in inner.pool.prune_older_than(cutoff) {
                counter!("matching_wait_expired_total").increment(1);
                tracing::debug!(user_id = %entry.user_id, "wait expired");
                reaped += 1;
            }
        }

        let retention_cutoff = Utc::now() - chrono::Duration::hours(CLOSED_RETENTION_HOURS);
        inner.closed.retain(|c| c.ended_at > retention_cutoff);

        gauge!("matching_wait_pool_size").set(inner.pool.len() as f64);
        gauge!("matching_live_sessions").set(inner.sessions.len() as f64);

        reaped
    }

    /// Where the user currently stands: queued, in a session, or neither.
    pub fn status(&self, user_id: Uuid) -> AppResult<UserStatus> {
        let inner = self.inner.lock().unwrap();

        if let Some(position) = inner.pool.position(user_id) {
            return Ok(UserStatus::Waiting { position });
        }

        if let Some(session_id) = inner.session_by_user.get(&user_id) {
            if let Some(session) = inner.sessions.get(session_id) {
                // Reissue a token while connecting so a client that lost
                // the original response can still join.
                let grant = if session.state == SessionState::Connecting {
                    Some(self.issuer.issue(&session.channel, user_id)?)
                } else {
                    None
                };
                return Ok(UserStatus::Matched {
                    session: SessionView::for_user(session, user_id),
                    call_token: grant.as_ref().map(|g| g.call_token.clone()),
                    expires_at: grant.map(|g| g.expires_at),
                });
            }
        }

        Ok(UserStatus::Idle)
    }

    pub fn stats(&self, user_id: Uuid, unlimited: bool) -> CallStats {
        let inner = self.inner.lock().unwrap();
        let usage = usage_today(&inner.closed, user_id, self.limits.min_counted_call_secs);
        let daily_limit = if unlimited {
            None
        } else {
            self.limits.daily_call_limit
        };
        CallStats {
            calls_today: usage.counted_calls,
            call_secs_today: usage.call_secs,
            daily_limit,
            calls_remaining: daily_limit.map(|l| l.saturating_sub(usage.counted_calls)),
            waiting_count: inner.pool.len(),
            live_sessions: inner.sessions.len(),
        }
    }

    fn allocate_channel(&self, live: &HashSet<String>) -> Option<String> {
        allocate_channel_with(&self.limits.channel_prefix, live, || rand::random::<u128>())
    }

    /// Drop a finished session from the live set, record it, and tell
    /// the world. The session must already be in the ended state.
    fn finalize(&self, inner: &mut Inner, session: &CallSession) {
        inner.sessions.remove(&session.id);
        inner.live_channels.remove(&session.channel);

        let closed = session.close();
        counter!("matching_sessions_ended_total", "reason" => closed.reason.as_str()).increment(1);
        if closed.connected_at.is_some() {
            histogram!("matching_call_duration_seconds").record(closed.duration_secs as f64);
        }
        tracing::info!(
            session_id = %closed.session_id,
            reason = closed.reason.as_str(),
            duration_secs = closed.duration_secs,
            "call ended"
        );

        self.bus.emit(MatchEvent::session_ended(&closed));
        inner.closed.push(closed);
    }
}

/// Remove both users' session markers, unless a marker already points
/// at a newer session (users may re-queue during the grace window).
fn release_markers(inner: &mut Inner, session: &CallSession) {
    for user in session.users {
        if inner.session_by_user.get(&user) == Some(&session.id) {
            inner.session_by_user.remove(&user);
        }
    }
}

fn session_not_found() -> AppError {
    AppError::new(ErrorCode::SessionNotFound, "session not found")
}

/// Fresh channel id, or None when both attempts collided with a live
/// channel. Two collisions in a row point at a broken random source,
/// which callers treat as fatal.
fn allocate_channel_with(
    prefix: &str,
    live: &HashSet<String>,
    mut entropy: impl FnMut() -> u128,
) -> Option<String> {
    for attempt in 0..2 {
        let candidate = format!("{}{:032x}", prefix, entropy());
        if !live.contains(&candidate) {
            return Some(candidate);
        }
        counter!("matching_channel_collisions_total").increment(1);
        tracing::warn!(attempt = attempt + 1, "channel id collision, retrying");
    }
    None
}

struct DailyUsage {
    counted_calls: u32,
    call_secs: i64,
}

/// Today's (UTC) connected calls for one user. A call consumes allowance
/// only past the counted minimum, but every connected second shows up in
/// the usage total.
fn usage_today(closed: &[ClosedSession], user_id: Uuid, min_secs: i64) -> DailyUsage {
    let today = Utc::now().date_naive();
    let mut usage = DailyUsage {
        counted_calls: 0,
        call_secs: 0,
    };
    for c in closed {
        if !c.users.contains(&user_id)
            || c.connected_at.is_none()
            || c.ended_at.date_naive() != today
        {
            continue;
        }
        usage.call_secs += c.duration_secs;
        if c.duration_secs >= min_secs {
            usage.counted_calls += 1;
        }
    }
    usage
}

/// Periodic deadline enforcement. One task per process.
pub fn spawn_sweeper(
    supervisor: Arc<MatchSupervisor>,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        loop {
            tick.tick().await;
            supervisor.sweep();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::compat::Gender;
    use crate::matching::session::EndReason;
    use crate::events::bus::{MatchEventPayload, MatchEventType};

    fn test_limits() -> MatchLimits {
        MatchLimits {
            connect_timeout: Duration::from_secs(20),
            max_call: Duration::from_secs(1800),
            leave_grace: Duration::from_secs(2),
            wait_ttl: Some(chrono::Duration::seconds(120)),
            daily_call_limit: Some(8),
            min_counted_call_secs: 30,
            channel_prefix: "alix_random_".to_string(),
        }
    }

    fn supervisor_with(limits: MatchLimits) -> (Arc<MatchSupervisor>, EventBus) {
        let bus = EventBus::with_capacity(256);
        let supervisor = Arc::new(MatchSupervisor::new(
            limits,
            CallTokenIssuer::new("test-secret", 3600),
            bus.clone(),
        ));
        (supervisor, bus)
    }

    fn supervisor() -> (Arc<MatchSupervisor>, EventBus) {
        supervisor_with(test_limits())
    }

    fn request(sup: &MatchSupervisor, user: Uuid) -> MatchOutcome {
        sup.request_match(user, MatchFilters::default(), Profile::default(), false)
            .unwrap()
    }

    fn grant_of(outcome: MatchOutcome) -> MatchGrant {
        match outcome {
            MatchOutcome::Matched(grant) => grant,
            MatchOutcome::Waiting { .. } => panic!("expected a match"),
        }
    }

    fn profile(gender: Gender) -> Profile {
        Profile {
            gender: Some(gender),
            ..Default::default()
        }
    }

    fn wants(gender: Gender) -> MatchFilters {
        MatchFilters {
            gender: Some(gender),
            ..Default::default()
        }
    }

    #[test]
    fn first_user_waits_second_matches() {
        let (sup, _bus) = supervisor();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        match request(&sup, a) {
            MatchOutcome::Waiting { position } => assert_eq!(position, 1),
            MatchOutcome::Matched(_) => panic!("empty pool cannot match"),
        }

        let grant = grant_of(request(&sup, b));
        assert_eq!(grant.peer_id, a);
        assert!(grant.channel.starts_with("alix_random_"));
        assert_eq!(grant.channel.len(), "alix_random_".len() + 32);
        assert!(!grant.call_token.is_empty());

        // Both now count as in-session.
        assert!(matches!(sup.status(a).unwrap(), UserStatus::Matched { .. }));
        assert!(matches!(sup.status(b).unwrap(), UserStatus::Matched { .. }));
    }

    #[test]
    fn oldest_compatible_wins_and_skips_are_kept() {
        let (sup, _bus) = supervisor();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        // a and b both wait; a is male, b is female.
        sup.request_match(a, wants(Gender::Female), profile(Gender::Male), false)
            .unwrap();
        sup.request_match(b, MatchFilters::default(), profile(Gender::Female), false)
            .unwrap();

        // c only wants women: a is skipped, b matches, a keeps place 1.
        let grant = grant_of(
            sup.request_match(c, wants(Gender::Female), profile(Gender::Female), false)
                .unwrap(),
        );
        assert_eq!(grant.peer_id, b);

        match sup.status(a).unwrap() {
            UserStatus::Waiting { position } => assert_eq!(position, 1),
            other => panic!("expected a to still wait, got {other:?}"),
        }
    }

    #[test]
    fn cancel_is_idempotent() {
        let (sup, _bus) = supervisor();
        let a = Uuid::new_v4();

        request(&sup, a);
        assert!(sup.cancel(a));
        assert!(!sup.cancel(a));
        assert!(matches!(sup.status(a).unwrap(), UserStatus::Idle));

        // A cancelled user is never handed out as a peer.
        let b = Uuid::new_v4();
        match request(&sup, b) {
            MatchOutcome::Waiting { position } => assert_eq!(position, 1),
            MatchOutcome::Matched(_) => panic!("cancelled user must not match"),
        }
    }

    #[test]
    fn re_request_refreshes_filters_without_losing_place() {
        let (sup, _bus) = supervisor();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        sup.request_match(a, MatchFilters::default(), profile(Gender::Female), false)
            .unwrap();
        // a re-requests, now only accepting women.
        let outcome = sup
            .request_match(a, wants(Gender::Female), profile(Gender::Female), false)
            .unwrap();
        match outcome {
            MatchOutcome::Waiting { position } => assert_eq!(position, 1),
            MatchOutcome::Matched(_) => panic!("re-request cannot match itself"),
        }

        // A male peer no longer passes a's filters and queues behind.
        match sup
            .request_match(b, MatchFilters::default(), profile(Gender::Male), false)
            .unwrap()
        {
            MatchOutcome::Waiting { position } => assert_eq!(position, 2),
            MatchOutcome::Matched(_) => panic!("filters should have blocked this"),
        }

        // A female peer matches a, still first in line.
        let grant = grant_of(
            sup.request_match(c, MatchFilters::default(), profile(Gender::Female), false)
                .unwrap(),
        );
        assert_eq!(grant.peer_id, a);
    }

    #[test]
    fn request_while_in_session_conflicts() {
        let (sup, _bus) = supervisor();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        request(&sup, a);
        let grant = grant_of(request(&sup, b));

        let err = sup
            .request_match(a, MatchFilters::default(), Profile::default(), false)
            .unwrap_err();
        assert_eq!(err.code(), "E2002");

        // Once the session is declined both are free again.
        sup.signal(grant.session_id, b, SignalEvent::Decline).unwrap();
        assert!(matches!(request(&sup, a), MatchOutcome::Waiting { .. }));
    }

    #[test]
    fn signals_from_outsiders_and_unknown_sessions_are_not_found() {
        let (sup, _bus) = supervisor();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        request(&sup, a);
        let grant = grant_of(request(&sup, b));

        let err = sup
            .signal(Uuid::new_v4(), a, SignalEvent::Joined)
            .unwrap_err();
        assert_eq!(err.code(), "E2003");

        let outsider = Uuid::new_v4();
        let err = sup
            .signal(grant.session_id, outsider, SignalEvent::Joined)
            .unwrap_err();
        assert_eq!(err.code(), "E2003");
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_full_lifecycle() {
        let (sup, bus) = supervisor();
        let mut rx = bus.subscribe();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        request(&sup, a);
        let grant = grant_of(request(&sup, b));
        let sid = grant.session_id;

        let found = rx.try_recv().unwrap();
        assert_eq!(found.event_type, MatchEventType::MatchFound);
        assert!(found.involves(a) && found.involves(b));

        let view = sup.signal(sid, a, SignalEvent::Joined).unwrap();
        assert_eq!(view.state, SessionState::Connecting);

        let view = sup.signal(sid, b, SignalEvent::Joined).unwrap();
        assert_eq!(view.state, SessionState::Active);
        assert!(view.connected_at.is_some());
        assert_eq!(rx.try_recv().unwrap().event_type, MatchEventType::SessionActive);

        tokio::time::advance(Duration::from_secs(120)).await;

        let view = sup.signal(sid, a, SignalEvent::Leave).unwrap();
        assert_eq!(view.end_reason, Some(EndReason::Disconnect));

        let view = sup.signal(sid, b, SignalEvent::Leave).unwrap();
        assert_eq!(view.end_reason, Some(EndReason::Normal));
        assert_eq!(view.duration_secs, Some(120));

        let ended = rx.try_recv().unwrap();
        assert_eq!(ended.event_type, MatchEventType::SessionEnded);
        match ended.data {
            MatchEventPayload::Ended(p) => {
                assert_eq!(p.reason, EndReason::Normal);
                assert_eq!(p.duration_secs, 120);
            }
            other => panic!("expected ended payload, got {other:?}"),
        }

        assert!(matches!(sup.status(a).unwrap(), UserStatus::Idle));
        assert!(matches!(sup.status(b).unwrap(), UserStatus::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_timeout_frees_both_users() {
        let (sup, bus) = supervisor();
        let mut rx = bus.subscribe();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        request(&sup, a);
        let grant = grant_of(request(&sup, b));
        sup.signal(grant.session_id, a, SignalEvent::Joined).unwrap();
        rx.try_recv().unwrap(); // match.found

        tokio::time::advance(Duration::from_secs(21)).await;
        assert_eq!(sup.sweep(), 1);

        let ended = rx.try_recv().unwrap();
        assert_eq!(ended.event_type, MatchEventType::SessionEnded);
        match ended.data {
            MatchEventPayload::Ended(p) => assert_eq!(p.reason, EndReason::Timeout),
            other => panic!("expected ended payload, got {other:?}"),
        }

        // Both may re-request immediately.
        assert!(matches!(request(&sup, a), MatchOutcome::Waiting { .. }));
        assert!(matches!(request(&sup, b), MatchOutcome::Matched(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn max_duration_cuts_the_call() {
        let (sup, _bus) = supervisor();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        request(&sup, a);
        let grant = grant_of(request(&sup, b));
        sup.signal(grant.session_id, a, SignalEvent::Joined).unwrap();
        sup.signal(grant.session_id, b, SignalEvent::Joined).unwrap();

        tokio::time::advance(Duration::from_secs(1799)).await;
        assert_eq!(sup.sweep(), 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(sup.sweep(), 1);
        assert!(matches!(sup.status(a).unwrap(), UserStatus::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn solo_disconnect_survives_grace() {
        let (sup, bus) = supervisor();
        let mut rx = bus.subscribe();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        request(&sup, a);
        let grant = grant_of(request(&sup, b));
        sup.signal(grant.session_id, a, SignalEvent::Joined).unwrap();
        sup.signal(grant.session_id, b, SignalEvent::Joined).unwrap();

        sup.signal(grant.session_id, a, SignalEvent::Leave).unwrap();
        // Markers are released right away even though the record lingers.
        assert!(matches!(sup.status(b).unwrap(), UserStatus::Idle));

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(sup.sweep(), 1);

        // match.found, session.active, then the final verdict.
        rx.try_recv().unwrap();
        rx.try_recv().unwrap();
        match rx.try_recv().unwrap().data {
            MatchEventPayload::Ended(p) => assert_eq!(p.reason, EndReason::Disconnect),
            other => panic!("expected ended payload, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn requeue_during_grace_is_not_clobbered() {
        let (sup, _bus) = supervisor();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        request(&sup, a);
        let grant = grant_of(request(&sup, b));
        sup.signal(grant.session_id, a, SignalEvent::Joined).unwrap();
        sup.signal(grant.session_id, b, SignalEvent::Joined).unwrap();
        sup.signal(grant.session_id, a, SignalEvent::Leave).unwrap();

        // b re-queues and matches someone new while the old session
        // sits in its grace window.
        let c = Uuid::new_v4();
        request(&sup, b);
        let new_grant = grant_of(request(&sup, c));
        assert_eq!(new_grant.peer_id, b);

        tokio::time::advance(Duration::from_secs(3)).await;
        sup.sweep();

        // The old session's cleanup must not detach b from the new one.
        match sup.status(b).unwrap() {
            UserStatus::Matched { session, .. } => {
                assert_eq!(session.session_id, new_grant.session_id);
            }
            other => panic!("expected b in new session, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn daily_limit_counts_only_real_calls() {
        let mut limits = test_limits();
        limits.daily_call_limit = Some(2);
        let (sup, _bus) = supervisor_with(limits);
        let a = Uuid::new_v4();

        for _ in 0..2 {
            let peer = Uuid::new_v4();
            request(&sup, a);
            let grant = grant_of(request(&sup, peer));
            sup.signal(grant.session_id, a, SignalEvent::Joined).unwrap();
            sup.signal(grant.session_id, peer, SignalEvent::Joined).unwrap();
            tokio::time::advance(Duration::from_secs(60)).await;
            sup.signal(grant.session_id, a, SignalEvent::Leave).unwrap();
            sup.signal(grant.session_id, peer, SignalEvent::Leave).unwrap();
        }

        let err = sup
            .request_match(a, MatchFilters::default(), Profile::default(), false)
            .unwrap_err();
        assert_eq!(err.code(), "E2005");

        let stats = sup.stats(a, false);
        assert_eq!(stats.calls_today, 2);
        assert_eq!(stats.call_secs_today, 120);
        assert_eq!(stats.calls_remaining, Some(0));

        // Premium users are not limited.
        assert!(sup
            .request_match(a, MatchFilters::default(), Profile::default(), true)
            .is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn short_calls_do_not_count_against_the_limit() {
        let mut limits = test_limits();
        limits.daily_call_limit = Some(1);
        let (sup, _bus) = supervisor_with(limits);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        request(&sup, a);
        let grant = grant_of(request(&sup, b));
        sup.signal(grant.session_id, a, SignalEvent::Joined).unwrap();
        sup.signal(grant.session_id, b, SignalEvent::Joined).unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        sup.signal(grant.session_id, a, SignalEvent::Leave).unwrap();
        sup.signal(grant.session_id, b, SignalEvent::Leave).unwrap();

        // 10 seconds is under the counted minimum but still shows as usage.
        let stats = sup.stats(a, false);
        assert_eq!(stats.calls_today, 0);
        assert_eq!(stats.call_secs_today, 10);
        assert!(matches!(request(&sup, a), MatchOutcome::Waiting { .. }));
    }

    #[test]
    fn channel_collision_retries_once_then_fails() {
        let live: HashSet<String> = [format!("alix_random_{:032x}", 7u128)].into();

        // First candidate collides, the retry succeeds.
        let mut draws = [7u128, 8u128].into_iter();
        let channel = allocate_channel_with("alix_random_", &live, || draws.next().unwrap());
        assert_eq!(channel, Some(format!("alix_random_{:032x}", 8u128)));

        // A source that keeps colliding gives up after the retry.
        assert!(allocate_channel_with("alix_random_", &live, || 7u128).is_none());
    }

    #[test]
    fn expired_waits_are_pruned() {
        let mut limits = test_limits();
        limits.wait_ttl = Some(chrono::Duration::seconds(0));
        let (sup, _bus) = supervisor_with(limits);
        let a = Uuid::new_v4();

        request(&sup, a);
        assert_eq!(sup.sweep(), 1);
        assert!(matches!(sup.status(a).unwrap(), UserStatus::Idle));
    }

    #[test]
    fn status_reissues_token_only_while_connecting() {
        let (sup, _bus) = supervisor();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        request(&sup, a);
        let grant = grant_of(request(&sup, b));

        match sup.status(a).unwrap() {
            UserStatus::Matched { call_token, .. } => assert!(call_token.is_some()),
            other => panic!("expected session, got {other:?}"),
        }

        sup.signal(grant.session_id, a, SignalEvent::Joined).unwrap();
        sup.signal(grant.session_id, b, SignalEvent::Joined).unwrap();

        match sup.status(a).unwrap() {
            UserStatus::Matched { call_token, .. } => assert!(call_token.is_none()),
            other => panic!("expected session, got {other:?}"),
        }
    }

    #[test]
    fn channels_are_unique_across_live_sessions() {
        let (sup, _bus) = supervisor();
        let users: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();

        request(&sup, users[0]);
        let first = grant_of(request(&sup, users[1]));
        request(&sup, users[2]);
        let second = grant_of(request(&sup, users[3]));

        assert_ne!(first.channel, second.channel);
        assert_ne!(first.session_id, second.session_id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_pair_everyone_exactly_once() {
        let (sup, _bus) = supervisor();
        let users: Vec<Uuid> = (0..16).map(|_| Uuid::new_v4()).collect();

        let handles: Vec<_> = users
            .iter()
            .map(|user| {
                let sup = sup.clone();
                let user = *user;
                tokio::spawn(async move {
                    sup.request_match(user, MatchFilters::default(), Profile::default(), false)
                })
            })
            .collect();

        let mut matched_pairs = Vec::new();
        let mut waiting = 0;
        for (user, handle) in users.iter().zip(handles) {
            match handle.await.unwrap().unwrap() {
                MatchOutcome::Matched(grant) => matched_pairs.push((grant.peer_id, *user)),
                MatchOutcome::Waiting { .. } => waiting += 1,
            }
        }

        // The pool toggles between empty and one waiter, so exactly
        // half the requests close a pair.
        assert_eq!(matched_pairs.len(), 8);
        assert_eq!(waiting, 8);

        let mut seen = HashSet::new();
        for (x, y) in &matched_pairs {
            assert!(seen.insert(*x), "user matched twice");
            assert!(seen.insert(*y), "user matched twice");
        }
        assert_eq!(seen.len(), 16);

        for user in &users {
            assert!(matches!(
                sup.status(*user).unwrap(),
                UserStatus::Matched { .. }
            ));
        }
    }
}
