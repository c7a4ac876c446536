// ============================================================================
// Upstream Dispatcher - One Call to One Provider
// ============================================================================
//
// Adapters translate the canonical (OpenAI-shaped) request to a vendor wire
// format and back. They are selected per dispatch by provider slug from a
// registry populated at startup; unknown slugs fall back to the
// OpenAI-compatible adapter, which is what most aggregator providers speak.
//
// Streaming dispatches hand back a channel of raw SSE bytes (proxied to the
// caller unmodified) plus a oneshot that resolves to the usage read from the
// terminal chunk once the stream ends.
//
// ============================================================================

pub mod anthropic;
pub mod openai;

pub use anthropic::AnthropicAdapter;
pub use openai::OpenAiAdapter;

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::models::openai::{ChatCompletionRequest, ChatCompletionResponse, Usage};
use crate::services::router_service::Candidate;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("network error: {0}")]
    Network(String),
    #[error("upstream timed out")]
    Timeout,
    #[error("upstream returned {status}")]
    UpstreamStatus { status: u16, body: String },
    #[error("invalid upstream response: {0}")]
    InvalidResponse(String),
}

impl DispatchError {
    /// Retryable outcomes advance the failover iterator; the rest are
    /// caller-visible and abort it.
    pub fn is_retryable(&self) -> bool {
        match self {
            DispatchError::Network(_) | DispatchError::Timeout => true,
            DispatchError::UpstreamStatus { status, .. } => *status >= 500,
            DispatchError::InvalidResponse(_) => true,
        }
    }

    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DispatchError::Timeout
        } else {
            DispatchError::Network(err.to_string())
        }
    }
}

/// A live streaming dispatch: raw SSE bytes plus the deferred usage summary.
pub struct StreamHandle {
    pub chunks: mpsc::Receiver<Result<Bytes, DispatchError>>,
    pub usage: oneshot::Receiver<Option<Usage>>,
}

#[async_trait]
pub trait UpstreamAdapter: Send + Sync {
    async fn dispatch(
        &self,
        target: &Candidate,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, DispatchError>;

    async fn dispatch_stream(
        &self,
        target: &Candidate,
        request: &ChatCompletionRequest,
    ) -> Result<StreamHandle, DispatchError>;
}

/// Dispatcher lookup table keyed by provider slug. New providers register at
/// startup; no runtime hierarchy.
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn UpstreamAdapter>>,
    fallback: Option<Arc<dyn UpstreamAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self { adapters: HashMap::new(), fallback: None }
    }

    /// Registry with the built-in adapters: `openai` and `anthropic` by
    /// slug, OpenAI-compatible as the fallback for everything else.
    pub fn with_defaults(http: reqwest::Client) -> Self {
        let openai: Arc<dyn UpstreamAdapter> = Arc::new(OpenAiAdapter::new(http.clone()));
        let mut registry = Self::new();
        registry.register("openai", Arc::clone(&openai));
        registry.register("anthropic", Arc::new(AnthropicAdapter::new(http)));
        registry.fallback = Some(openai);
        registry
    }

    pub fn register(&mut self, slug: &str, adapter: Arc<dyn UpstreamAdapter>) {
        self.adapters.insert(slug.to_string(), adapter);
    }

    pub fn set_fallback(&mut self, adapter: Arc<dyn UpstreamAdapter>) {
        self.fallback = Some(adapter);
    }

    pub fn resolve(&self, slug: &str) -> Option<Arc<dyn UpstreamAdapter>> {
        self.adapters
            .get(slug)
            .or(self.fallback.as_ref())
            .map(Arc::clone)
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty() && self.fallback.is_none()
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared upstream HTTP client. Connect timeout is enforced here; the
/// overall deadline is the per-provider timeout applied at the call site.
pub fn upstream_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(DispatchError::Network("reset".into()).is_retryable());
        assert!(DispatchError::Timeout.is_retryable());
        assert!(DispatchError::UpstreamStatus { status: 500, body: String::new() }.is_retryable());
        assert!(DispatchError::UpstreamStatus { status: 503, body: String::new() }.is_retryable());
        assert!(!DispatchError::UpstreamStatus { status: 400, body: String::new() }.is_retryable());
        assert!(!DispatchError::UpstreamStatus { status: 429, body: String::new() }.is_retryable());
    }

    #[test]
    fn registry_falls_back_to_openai_compatible() {
        let registry = AdapterRegistry::with_defaults(reqwest::Client::new());
        assert!(registry.resolve("openai").is_some());
        assert!(registry.resolve("anthropic").is_some());
        assert!(registry.resolve("some-aggregator").is_some());
        assert!(!registry.is_empty());
    }

    #[test]
    fn empty_registry_resolves_nothing() {
        let registry = AdapterRegistry::new();
        assert!(registry.resolve("openai").is_none());
        assert!(registry.is_empty());
    }
}
