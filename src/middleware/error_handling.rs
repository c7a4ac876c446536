// ============================================================================
// Error Handling - Caller-Visible Taxonomy
// ============================================================================
//
// Internal errors (store, cache, lock, billing) are logged server-side with
// full detail and surface as a generic 500. Caller-visible classes map onto
// fixed machine-readable codes; quota denials additionally carry the
// X-RateLimit-* and Retry-After headers.
//
// Wire shape:
//   {"success": false,
//    "error": {"code": "...", "message": "...", "details": {...}?},
//    "timestamp": "..."}
//
// ============================================================================

use axum::{
    http::{header::RETRY_AFTER, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use thiserror::Error;

use crate::models::{QuotaPeriod, QuotaType, Scope};
use crate::repositories::StoreError;

/// Everything a 429 needs to explain itself to the caller.
#[derive(Debug, Clone)]
pub struct QuotaDenial {
    pub scope: Scope,
    pub quota_type: QuotaType,
    pub period: QuotaPeriod,
    pub limit: Decimal,
    pub used: Decimal,
    pub reset_at: Option<DateTime<Utc>>,
}

impl QuotaDenial {
    pub fn remaining(&self) -> Decimal {
        (self.limit - self.used).max(Decimal::ZERO)
    }

    fn retry_after_secs(&self) -> i64 {
        self.reset_at
            .map(|at| (at - Utc::now()).num_seconds().max(0))
            .unwrap_or(0)
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("missing API key")]
    MissingApiKey,
    #[error("invalid API key")]
    InvalidApiKey,
    #[error("API key expired")]
    ApiKeyExpired,
    #[error("API key revoked")]
    ApiKeyRevoked,
    #[error("user is not active")]
    UserInactive,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("unsupported model: {0}")]
    UnsupportedModel(String),
    #[error("quota exceeded for {}", .0.scope)]
    QuotaDenied(QuotaDenial),
    #[error("insufficient balance")]
    InsufficientBalance { balance: Decimal, required: Decimal },
    #[error("no provider available for model {model}")]
    NoProviderAvailable { model: String },
    #[error("all providers failed: {detail}")]
    UpstreamExhausted { detail: String },
    #[error("upstream rejected the request ({status})")]
    UpstreamClient { status: u16, body: String },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::MissingApiKey
            | GatewayError::InvalidApiKey
            | GatewayError::ApiKeyExpired
            | GatewayError::ApiKeyRevoked => StatusCode::UNAUTHORIZED,
            GatewayError::UserInactive => StatusCode::FORBIDDEN,
            GatewayError::InvalidRequest(_) | GatewayError::UnsupportedModel(_) => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::QuotaDenied(_) => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::InsufficientBalance { .. } => StatusCode::PAYMENT_REQUIRED,
            GatewayError::NoProviderAvailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamExhausted { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamClient { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            GatewayError::Store(_) | GatewayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::MissingApiKey => "MISSING_API_KEY",
            GatewayError::InvalidApiKey => "INVALID_API_KEY",
            GatewayError::ApiKeyExpired => "API_KEY_EXPIRED",
            GatewayError::ApiKeyRevoked => "API_KEY_REVOKED",
            GatewayError::UserInactive => "USER_INACTIVE",
            GatewayError::InvalidRequest(_) => "INVALID_REQUEST",
            GatewayError::UnsupportedModel(_) => "UNSUPPORTED_MODEL",
            // Periodic caps read as rate limits; running caps as quotas.
            GatewayError::QuotaDenied(denial) => match denial.period {
                QuotaPeriod::None => "QUOTA_EXCEEDED",
                _ => "RATE_LIMIT_EXCEEDED",
            },
            GatewayError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            GatewayError::NoProviderAvailable { .. } => "NO_PROVIDER_AVAILABLE",
            GatewayError::UpstreamExhausted { .. } => "UPSTREAM_ERROR",
            GatewayError::UpstreamClient { .. } => "UPSTREAM_ERROR",
            GatewayError::Store(_) | GatewayError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    fn client_message(&self) -> String {
        match self {
            // Detail stays server-side for these.
            GatewayError::Store(e) => {
                tracing::error!(error = %e, "store error");
                "Internal server error".to_string()
            }
            GatewayError::Internal(e) => {
                tracing::error!(error = %e, "internal error");
                "Internal server error".to_string()
            }
            GatewayError::UpstreamClient { status, .. } => {
                format!("Upstream provider rejected the request ({status})")
            }
            other => other.to_string(),
        }
    }

    fn details(&self) -> Option<Value> {
        match self {
            GatewayError::QuotaDenied(denial) => Some(json!({
                "scope": denial.scope.to_string(),
                "quota_type": denial.quota_type,
                "period": denial.period,
                "limit": denial.limit,
                "used": denial.used,
                "remaining": denial.remaining(),
                "reset_at": denial.reset_at,
            })),
            GatewayError::InsufficientBalance { balance, required } => Some(json!({
                "balance": balance,
                "required": required,
            })),
            GatewayError::UpstreamClient { body, .. } if !body.is_empty() => {
                Some(json!({ "upstream": body }))
            }
            GatewayError::UpstreamExhausted { detail } => Some(json!({ "last_error": detail })),
            _ => None,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut error = json!({
            "code": self.code(),
            "message": self.client_message(),
        });
        if let Some(details) = self.details() {
            error["details"] = details;
        }
        let body = Json(json!({
            "success": false,
            "error": error,
            "timestamp": Utc::now(),
        }));

        let mut response = (status, body).into_response();

        if let GatewayError::QuotaDenied(denial) = &self {
            let mut pairs = vec![
                ("x-ratelimit-limit", denial.limit.to_string()),
                ("x-ratelimit-remaining", denial.remaining().to_string()),
            ];
            if let Some(reset_at) = denial.reset_at {
                pairs.push(("x-ratelimit-reset", reset_at.timestamp().to_string()));
            }
            let headers = response.headers_mut();
            for (name, value) in pairs {
                if let Ok(value) = HeaderValue::from_str(&value) {
                    headers.insert(name, value);
                }
            }
            if let Ok(value) = HeaderValue::from_str(&denial.retry_after_secs().to_string()) {
                headers.insert(RETRY_AFTER, value);
            }
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn denial(period: QuotaPeriod) -> QuotaDenial {
        QuotaDenial {
            scope: Scope::api_key(Uuid::nil()),
            quota_type: QuotaType::Requests,
            period,
            limit: dec!(2),
            used: dec!(2),
            reset_at: Some(Utc::now() + chrono::Duration::seconds(30)),
        }
    }

    #[test]
    fn codes_follow_taxonomy() {
        assert_eq!(GatewayError::MissingApiKey.code(), "MISSING_API_KEY");
        assert_eq!(GatewayError::ApiKeyExpired.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(GatewayError::UserInactive.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            GatewayError::InsufficientBalance { balance: dec!(0), required: dec!(1) }.status(),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            GatewayError::QuotaDenied(denial(QuotaPeriod::Minute)).code(),
            "RATE_LIMIT_EXCEEDED"
        );
        assert_eq!(
            GatewayError::QuotaDenied(denial(QuotaPeriod::None)).code(),
            "QUOTA_EXCEEDED"
        );
    }

    #[test]
    fn upstream_client_status_passes_through() {
        let err = GatewayError::UpstreamClient { status: 400, body: "bad".into() };
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.code(), "UPSTREAM_ERROR");
    }

    #[tokio::test]
    async fn quota_denial_sets_rate_limit_headers() {
        let response = GatewayError::QuotaDenied(denial(QuotaPeriod::Minute)).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let headers = response.headers();
        assert_eq!(headers.get("x-ratelimit-limit").unwrap(), "2");
        assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "0");
        assert!(headers.contains_key("x-ratelimit-reset"));
        assert!(headers.contains_key("retry-after"));
    }
}
