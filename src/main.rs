use sqlx::postgres::PgPoolOptions;

use prism_gateway::config::AppConfig;
use prism_gateway::repositories::{schema, Repositories};
use prism_gateway::services::dispatch::{upstream_http_client, AdapterRegistry};
use prism_gateway::state::AppState;
use prism_gateway::{create_app, init_tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = AppConfig::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.connection_string())
        .await?;
    schema::initialize(&pool).await?;

    let repos = Repositories::postgres(pool);
    let registry = AdapterRegistry::with_defaults(upstream_http_client());

    let address = config.server.address();
    let state = AppState::build(config, repos, registry);
    let consumer = state.consumer.clone();
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(&address).await?;
    tracing::info!("prism-gateway listening on {address}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Drain queued consume events before exiting; bills must still post.
    consumer.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => tracing::error!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received ctrl-c, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
