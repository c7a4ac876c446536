//! Schema bootstrap. Issued at startup so a fresh database serves traffic
//! without an out-of-band migration step; every statement is idempotent.

use sqlx::{Executor, PgPool};

use super::StoreResult;

pub async fn initialize(pool: &PgPool) -> StoreResult<()> {
    pool.execute(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id UUID PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            email TEXT NOT NULL UNIQUE,
            password_hash TEXT,
            status TEXT NOT NULL DEFAULT 'active'
                CHECK (status IN ('active', 'suspended', 'deleted')),
            balance NUMERIC(18,6) NOT NULL DEFAULT 0 CHECK (balance >= 0),
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );

        CREATE TABLE IF NOT EXISTS api_keys (
            id UUID PRIMARY KEY,
            user_id UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            key TEXT NOT NULL UNIQUE,
            key_prefix TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active'
                CHECK (status IN ('active', 'revoked', 'expired')),
            permissions TEXT,
            expires_at TIMESTAMPTZ,
            last_used_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );

        CREATE INDEX IF NOT EXISTS idx_api_keys_user ON api_keys(user_id);

        CREATE TABLE IF NOT EXISTS providers (
            id UUID PRIMARY KEY,
            slug TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            base_url TEXT NOT NULL,
            credential TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active'
                CHECK (status IN ('active', 'disabled')),
            health TEXT NOT NULL DEFAULT 'healthy'
                CHECK (health IN ('healthy', 'degraded', 'unhealthy')),
            priority INTEGER NOT NULL DEFAULT 100,
            timeout_secs INTEGER NOT NULL DEFAULT 60,
            retry_attempts INTEGER NOT NULL DEFAULT 2,
            health_check_url TEXT,
            health_check_interval_secs INTEGER NOT NULL DEFAULT 60,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );

        CREATE TABLE IF NOT EXISTS models (
            id UUID PRIMARY KEY,
            slug TEXT NOT NULL UNIQUE,
            display_name TEXT,
            model_type TEXT NOT NULL DEFAULT 'chat'
                CHECK (model_type IN ('chat', 'completion', 'embedding')),
            context_length INTEGER,
            max_tokens INTEGER,
            supports_streaming BOOLEAN NOT NULL DEFAULT TRUE,
            supports_functions BOOLEAN NOT NULL DEFAULT FALSE,
            status TEXT NOT NULL DEFAULT 'active'
                CHECK (status IN ('active', 'disabled')),
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );

        CREATE TABLE IF NOT EXISTS provider_model_support (
            id UUID PRIMARY KEY,
            provider_id UUID NOT NULL REFERENCES providers(id) ON DELETE CASCADE,
            model_slug TEXT NOT NULL,
            upstream_model_name TEXT,
            enabled BOOLEAN NOT NULL DEFAULT TRUE,
            priority INTEGER NOT NULL DEFAULT 100,
            UNIQUE (provider_id, model_slug)
        );

        CREATE INDEX IF NOT EXISTS idx_support_model_slug
            ON provider_model_support(model_slug);

        CREATE TABLE IF NOT EXISTS model_pricing (
            id UUID PRIMARY KEY,
            model_id UUID NOT NULL REFERENCES models(id) ON DELETE CASCADE,
            pricing_type TEXT NOT NULL
                CHECK (pricing_type IN ('input', 'output', 'request')),
            price_per_unit NUMERIC(18,8) NOT NULL,
            unit TEXT NOT NULL DEFAULT 'token'
                CHECK (unit IN ('token', 'request', 'character')),
            currency TEXT NOT NULL DEFAULT 'USD',
            effective_from TIMESTAMPTZ NOT NULL,
            effective_until TIMESTAMPTZ
        );

        CREATE INDEX IF NOT EXISTS idx_pricing_current
            ON model_pricing(model_id, pricing_type, effective_from DESC);

        CREATE TABLE IF NOT EXISTS quotas (
            id UUID PRIMARY KEY,
            scope_kind TEXT NOT NULL CHECK (scope_kind IN ('user', 'api_key')),
            scope_id UUID NOT NULL,
            quota_type TEXT NOT NULL CHECK (quota_type IN ('requests', 'tokens', 'cost')),
            period TEXT NOT NULL CHECK (period IN ('minute', 'hour', 'day', 'month', 'none')),
            limit_value NUMERIC(18,6) NOT NULL,
            status TEXT NOT NULL DEFAULT 'active'
                CHECK (status IN ('active', 'disabled')),
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );

        CREATE INDEX IF NOT EXISTS idx_quotas_scope ON quotas(scope_kind, scope_id);

        CREATE TABLE IF NOT EXISTS quota_usage (
            id UUID PRIMARY KEY,
            scope_kind TEXT NOT NULL,
            scope_id UUID NOT NULL,
            quota_id UUID NOT NULL REFERENCES quotas(id) ON DELETE CASCADE,
            period_start TIMESTAMPTZ,
            period_end TIMESTAMPTZ,
            used_value NUMERIC(18,6) NOT NULL DEFAULT 0,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );

        -- Conflict target of the atomic increment; NULL starts collapse so a
        -- running cap keeps a single row.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_quota_usage_window
            ON quota_usage(scope_kind, scope_id, quota_id,
                           COALESCE(period_start, '-infinity'::timestamptz));

        CREATE TABLE IF NOT EXISTS usage_logs (
            id UUID PRIMARY KEY,
            user_id UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            api_key_id UUID NOT NULL,
            provider_id UUID NOT NULL,
            model_id UUID NOT NULL,
            request_id UUID NOT NULL,
            method TEXT NOT NULL,
            endpoint TEXT NOT NULL,
            input_tokens INTEGER NOT NULL DEFAULT 0,
            output_tokens INTEGER NOT NULL DEFAULT 0,
            request_bytes BIGINT NOT NULL DEFAULT 0,
            response_bytes BIGINT NOT NULL DEFAULT 0,
            duration_ms BIGINT NOT NULL DEFAULT 0,
            status_code INTEGER NOT NULL,
            cost NUMERIC(18,6) NOT NULL DEFAULT 0,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );

        CREATE INDEX IF NOT EXISTS idx_usage_logs_key_date
            ON usage_logs(api_key_id, created_at DESC);
        CREATE INDEX IF NOT EXISTS idx_usage_logs_user_date
            ON usage_logs(user_id, created_at DESC);

        CREATE TABLE IF NOT EXISTS billing_records (
            id UUID PRIMARY KEY,
            user_id UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            usage_log_id UUID,
            amount NUMERIC(18,6) NOT NULL,
            currency TEXT NOT NULL DEFAULT 'USD',
            billing_type TEXT NOT NULL
                CHECK (billing_type IN ('usage', 'credit', 'refund', 'adjustment')),
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'processed', 'failed')),
            description TEXT,
            processed_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );

        CREATE INDEX IF NOT EXISTS idx_billing_user_date
            ON billing_records(user_id, created_at DESC);
        "#,
    )
    .await?;

    tracing::info!("database schema initialized");
    Ok(())
}
