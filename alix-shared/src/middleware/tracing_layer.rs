use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber: env-filtered, human-readable in
/// development, JSON lines when `ALIX_ENV=production`.
pub fn init_tracing(service_name: &str) {
    // Filter targets use underscores, binary names use hyphens.
    let target = service_name.replace('-', "_");
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("info,{target}=debug,tower_http=debug")));

    let registry = tracing_subscriber::registry().with(filter);

    match std::env::var("ALIX_ENV").as_deref() {
        Ok("production") => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true),
            )
            .init(),
        _ => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .init(),
    }

    tracing::info!(service = service_name, "tracing initialized");
}
