pub mod compat;
pub mod pool;
pub mod session;
pub mod supervisor;

pub use compat::{compatible, Gender, MatchFilters, Profile};
pub use pool::{WaitEntry, WaitPool};
pub use session::{
    CallSession, ClosedSession, EndReason, SessionState, SessionView, SignalEvent,
};
pub use supervisor::{
    spawn_sweeper, CallStats, MatchGrant, MatchLimits, MatchOutcome, MatchSupervisor, UserStatus,
};
