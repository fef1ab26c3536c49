pub mod events;
pub mod health;
pub mod matchmaking;
pub mod session;
