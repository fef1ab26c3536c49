pub mod bus;
pub mod relay;

pub use bus::{EventBus, MatchEvent, MatchEventPayload, MatchEventType};
pub use relay::spawn_event_relay;
