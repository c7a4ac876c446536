pub mod cache;
pub mod config;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod repositories;
pub mod services;
pub mod state;

use axum::{
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};

use crate::handlers::{
    chat::{chat_completions, completions},
    health::{health, live, ready, stats},
    models::{list_models, usage_summary},
};
use crate::middleware::{
    api_key_auth_middleware, metrics_handler, metrics_middleware, request_id_middleware,
};
use crate::state::AppState;

pub fn create_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let v1 = Router::new()
        .route("/chat/completions", post(chat_completions))
        .route("/completions", post(completions))
        .route("/models", get(list_models))
        .route("/usage", get(usage_summary))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            api_key_auth_middleware,
        ));

    Router::new()
        .nest("/v1", v1)
        .route("/health", get(health))
        .route("/health/ready", get(ready))
        .route("/health/live", get(live))
        .route("/health/stats", get(stats))
        .route("/metrics", get(metrics_handler))
        .layer(
            ServiceBuilder::new()
                .layer(axum_middleware::from_fn(metrics_middleware))
                .layer(axum_middleware::from_fn(request_id_middleware))
                .layer(cors),
        )
        .with_state(state)
}

/// Log setup: INFO by default, `RUST_LOG` overrides. Safe to call more than
/// once (subsequent calls are no-ops).
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "prism_gateway=info,tower_http=info,sqlx=warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
