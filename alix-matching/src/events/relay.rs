use alix_shared::clients::RabbitMQClient;
use alix_shared::types::event::{payloads, routing_keys, Event};

use super::bus::{EventBus, MatchEvent, MatchEventPayload};

/// Spawn the background task that mirrors bus events onto the message
/// broker for the rest of the platform. Publish failures are logged
/// and skipped; the broker is not on the hot path of matchmaking.
pub fn spawn_event_relay(
    bus: &EventBus,
    rabbitmq: RabbitMQClient,
) -> tokio::task::JoinHandle<()> {
    let mut rx = bus.subscribe();

    tokio::spawn(async move {
        tracing::info!("event relay started");
        loop {
            match rx.recv().await {
                Ok(event) => relay_event(&rabbitmq, &event).await,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("event relay lagged, skipped {n} events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    tracing::info!("event relay shutting down (bus closed)");
                    break;
                }
            }
        }
    })
}

async fn relay_event(rabbitmq: &RabbitMQClient, event: &MatchEvent) {
    match &event.data {
        MatchEventPayload::Found(p) => {
            let event = Event::new(
                "alix-matching",
                routing_keys::MATCHING_SESSION_STARTED,
                payloads::CallSessionStarted {
                    session_id: p.session_id,
                    channel: p.channel.clone(),
                    user_a_id: p.participants[0],
                    user_b_id: p.participants[1],
                },
            )
            .with_user(p.participants[0]);

            if let Err(e) = rabbitmq
                .publish(routing_keys::MATCHING_SESSION_STARTED, &event)
                .await
            {
                tracing::error!(error = %e, "failed to publish session.started event");
            }
        }
        MatchEventPayload::Ended(p) => {
            let event = Event::new(
                "alix-matching",
                routing_keys::MATCHING_SESSION_ENDED,
                payloads::CallSessionEnded {
                    session_id: p.session_id,
                    channel: p.channel.clone(),
                    user_a_id: p.participants[0],
                    user_b_id: p.participants[1],
                    end_reason: p.reason.as_str().to_string(),
                    duration_secs: p.duration_secs,
                },
            )
            .with_user(p.participants[0]);

            if let Err(e) = rabbitmq
                .publish(routing_keys::MATCHING_SESSION_ENDED, &event)
                .await
            {
                tracing::error!(error = %e, "failed to publish session.ended event");
            }
        }
        // Activation is client-facing only; the platform cares about
        // session boundaries.
        MatchEventPayload::Active(_) => {}
    }
}
