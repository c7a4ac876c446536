use axum::{
    extract::{Extension, State},
    Json,
};
use chrono::{Datelike, TimeZone, Utc};

use crate::cache::keys;
use crate::middleware::error_handling::Result;
use crate::models::openai::ModelList;
use crate::models::UsageSummary;
use crate::services::auth_service::AuthContext;
use crate::state::AppState;

/// `GET /v1/models` - active model slugs in OpenAI list shape.
pub async fn list_models(State(state): State<AppState>) -> Result<Json<ModelList>> {
    let cache_key = keys::models_active();
    if let Some(slugs) = state.cache.get_json::<Vec<String>>(&cache_key) {
        return Ok(Json(ModelList::new(slugs)));
    }

    let models = state.repos.models.list_active().await?;
    let slugs: Vec<String> = models.into_iter().map(|m| m.slug).collect();
    state
        .cache
        .set_json(&cache_key, &slugs, state.config.cache.model_ttl);

    Ok(Json(ModelList::new(slugs)))
}

/// `GET /v1/usage` - aggregate counters for the authenticated key over the
/// current calendar month.
pub async fn usage_summary(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<UsageSummary>> {
    let now = Utc::now();
    let month_start = Utc
        .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now);

    let summary = state
        .repos
        .usage_logs
        .summarize_for_key(ctx.api_key.id, month_start)
        .await?;

    Ok(Json(summary))
}
