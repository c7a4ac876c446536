// ============================================================================
// API Key Authentication Middleware
// ============================================================================
//
// Every `/v1/*` route runs through here. The key is taken from
// `Authorization: Bearer <key>` (preferred), `X-API-Key`, or the `api_key`
// query parameter; the validated `AuthContext` lands in request extensions
// for the handlers.
//
// ============================================================================

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};

use crate::middleware::error_handling::GatewayError;
use crate::state::AppState;

pub const API_KEY_HEADER: &str = "x-api-key";
const API_KEY_QUERY_PARAM: &str = "api_key";

/// Pull the presented key out of a request, in documented precedence order.
pub fn extract_api_key(request: &Request) -> Option<String> {
    if let Some(bearer) = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
    {
        return Some(bearer.trim().to_string());
    }

    if let Some(key) = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
    {
        return Some(key.trim().to_string());
    }

    request.uri().query().and_then(|query| {
        query.split('&').find_map(|pair| {
            pair.split_once('=')
                .filter(|(name, _)| *name == API_KEY_QUERY_PARAM)
                .map(|(_, value)| value.to_string())
        })
    })
}

pub async fn api_key_auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    let Some(presented) = extract_api_key(&request) else {
        crate::middleware::metrics::record_auth_failure("missing_key");
        return Err(GatewayError::MissingApiKey);
    };

    let context = state.auth.validate(&presented).await?;
    request.extensions_mut().insert(context);
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;

    fn request(builder: axum::http::request::Builder) -> Request {
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn bearer_header_wins() {
        let req = request(
            HttpRequest::builder()
                .uri("/v1/models?api_key=from-query")
                .header(header::AUTHORIZATION, "Bearer from-bearer")
                .header(API_KEY_HEADER, "from-header"),
        );
        assert_eq!(extract_api_key(&req).as_deref(), Some("from-bearer"));
    }

    #[test]
    fn x_api_key_header_is_second() {
        let req = request(
            HttpRequest::builder()
                .uri("/v1/models?api_key=from-query")
                .header(API_KEY_HEADER, "from-header"),
        );
        assert_eq!(extract_api_key(&req).as_deref(), Some("from-header"));
    }

    #[test]
    fn query_param_is_last_resort() {
        let req = request(HttpRequest::builder().uri("/v1/models?foo=1&api_key=from-query"));
        assert_eq!(extract_api_key(&req).as_deref(), Some("from-query"));
    }

    #[test]
    fn missing_key_is_none() {
        let req = request(HttpRequest::builder().uri("/v1/models"));
        assert_eq!(extract_api_key(&req), None);

        let req = request(
            HttpRequest::builder()
                .uri("/v1/models")
                .header(header::AUTHORIZATION, "Basic dXNlcg=="),
        );
        assert_eq!(extract_api_key(&req), None);
    }
}
