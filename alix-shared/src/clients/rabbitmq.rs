use anyhow::Context;
use lapin::options::{BasicPublishOptions, ExchangeDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use serde::Serialize;

use crate::types::Event;

/// Publisher handle for one topic exchange. Cloning shares the channel.
#[derive(Clone)]
pub struct RabbitMQClient {
    channel: Channel,
    exchange: String,
}

impl RabbitMQClient {
    /// Connect and declare the durable topic exchange this client
    /// publishes to.
    pub async fn connect(url: &str, exchange: &str) -> anyhow::Result<Self> {
        let conn = Connection::connect(url, ConnectionProperties::default())
            .await
            .context("failed to connect to RabbitMQ")?;
        let channel = conn
            .create_channel()
            .await
            .context("failed to open RabbitMQ channel")?;

        let options = ExchangeDeclareOptions {
            durable: true,
            ..Default::default()
        };
        channel
            .exchange_declare(exchange, ExchangeKind::Topic, options, FieldTable::default())
            .await
            .with_context(|| format!("failed to declare exchange {exchange}"))?;

        tracing::info!(url = %url, exchange = %exchange, "connected to RabbitMQ");
        Ok(Self {
            channel,
            exchange: exchange.to_string(),
        })
    }

    /// Publish an event as a persistent JSON message under `routing_key`,
    /// waiting for broker confirmation.
    pub async fn publish<T: Serialize>(
        &self,
        routing_key: &str,
        event: &Event<T>,
    ) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(event).context("failed to serialize event")?;

        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2); // persistent

        self.channel
            .basic_publish(
                &self.exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await
            .with_context(|| format!("failed to publish {routing_key}"))?
            .await
            .with_context(|| format!("no broker confirmation for {routing_key}"))?;

        tracing::debug!(
            routing_key = %routing_key,
            event_id = %event.id,
            "event published"
        );

        Ok(())
    }
}
