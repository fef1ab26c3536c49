use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

mod config;
mod events;
mod matching;
mod routes;
mod token;

use alix_shared::clients::RabbitMQClient;
use alix_shared::middleware::{init_metrics, metrics_middleware};
use config::AppConfig;
use events::{spawn_event_relay, EventBus};
use matching::{spawn_sweeper, MatchLimits, MatchSupervisor};
use token::CallTokenIssuer;

pub struct AppState {
    pub supervisor: Arc<MatchSupervisor>,
    pub bus: EventBus,
    pub metrics_handle: PrometheusHandle,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    alix_shared::middleware::init_tracing("alix-matching");

    let config = AppConfig::load()?;
    let port = config.port;

    // Infrastructure clients
    let rabbitmq = RabbitMQClient::connect(&config.rabbitmq_url, &config.events_exchange).await?;
    let metrics_handle = init_metrics();

    let bus = EventBus::new();
    let issuer = CallTokenIssuer::new(
        config.call_token_secret.clone(),
        config.call_token_ttl_secs,
    );
    let supervisor = Arc::new(MatchSupervisor::new(
        MatchLimits::from_config(&config),
        issuer,
        bus.clone(),
    ));

    // Background tasks
    spawn_event_relay(&bus, rabbitmq);
    spawn_sweeper(
        supervisor.clone(),
        Duration::from_millis(config.sweep_interval_ms),
    );

    let state = Arc::new(AppState {
        supervisor,
        bus,
        metrics_handle,
    });

    let app = Router::new()
        // Health & metrics
        .route("/health", get(routes::health::health_check))
        .route("/metrics", get(routes::health::metrics))
        // Matchmaking
        .route("/match/request", post(routes::matchmaking::request_match))
        .route("/match/cancel", post(routes::matchmaking::cancel_match))
        .route("/match/status", get(routes::matchmaking::match_status))
        .route("/match/stats", get(routes::matchmaking::call_stats))
        .route("/match/events", get(routes::events::event_stream))
        // Session lifecycle
        .route("/session/:id/signal", post(routes::session::signal_session))
        .layer(axum::middleware::from_fn(metrics_middleware))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("0.0.0.0:{port}");
    tracing::info!(addr = %addr, "alix-matching starting");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
