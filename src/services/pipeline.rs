// ============================================================================
// Request Pipeline - Lifecycle Orchestration
// ============================================================================
//
// validate -> quota check -> balance gate -> route -> dispatch (failover)
// -> usage log -> async consume -> locked settle -> respond.
//
// Once an upstream response has been observed, the usage log, consume events
// and settlement are protected completions: for streaming responses they run
// in a detached task after the last chunk, so client disconnects cannot
// cancel them. No bill without a usage log, no usage log without a
// dispatched request.
//
// ============================================================================

use bytes::Bytes;
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::cache::{keys, CacheService};
use crate::middleware::error_handling::{GatewayError, Result};
use crate::middleware::metrics;
use crate::models::openai::{ChatCompletionRequest, ChatCompletionResponse, Usage};
use crate::models::{Model, QuotaType, Scope, UsageLog};
use crate::repositories::{ModelStore, StoreError, UsageLogStore};
use crate::services::auth_service::AuthContext;
use crate::services::billing_service::BillingService;
use crate::services::dispatch::{AdapterRegistry, DispatchError, StreamHandle};
use crate::services::quota_service::{QuotaDecision, QuotaService};
use crate::services::quota_worker::{ConsumeEvent, QuotaConsumer};
use crate::services::router_service::{Candidate, RouterService};
use crate::services::tool_mediator::ToolMediator;

/// What the handler sends back: a complete JSON body or a live SSE stream.
pub enum PipelineReply {
    Complete(ChatCompletionResponse),
    Stream(mpsc::Receiver<std::result::Result<Bytes, std::io::Error>>),
}

pub struct RequestPipeline {
    quota: Arc<QuotaService>,
    consumer: Arc<QuotaConsumer>,
    billing: Arc<BillingService>,
    router: Arc<RouterService>,
    models: Arc<dyn ModelStore>,
    usage_logs: Arc<dyn UsageLogStore>,
    registry: Arc<AdapterRegistry>,
    mediator: Arc<ToolMediator>,
    cache: Arc<CacheService>,
    model_ttl: std::time::Duration,
}

struct DispatchSuccess {
    response: UpstreamOutcome,
    candidate: Candidate,
    duration_ms: i64,
}

enum UpstreamOutcome {
    Complete(ChatCompletionResponse),
    Stream(StreamHandle),
}

impl RequestPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        quota: Arc<QuotaService>,
        consumer: Arc<QuotaConsumer>,
        billing: Arc<BillingService>,
        router: Arc<RouterService>,
        models: Arc<dyn ModelStore>,
        usage_logs: Arc<dyn UsageLogStore>,
        registry: Arc<AdapterRegistry>,
        mediator: Arc<ToolMediator>,
        cache: Arc<CacheService>,
        model_ttl: std::time::Duration,
    ) -> Self {
        Self {
            quota,
            consumer,
            billing,
            router,
            models,
            usage_logs,
            registry,
            mediator,
            cache,
            model_ttl,
        }
    }

    pub async fn chat_completion(
        &self,
        ctx: &AuthContext,
        request: ChatCompletionRequest,
        request_id: Uuid,
        endpoint: &'static str,
        request_bytes: i64,
    ) -> Result<PipelineReply> {
        if request.messages.is_empty() {
            return Err(GatewayError::InvalidRequest("messages must not be empty".into()));
        }
        if request.model.trim().is_empty() {
            return Err(GatewayError::InvalidRequest("model is required".into()));
        }

        let model = self.load_model(&request.model).await?;
        let wants_stream = request.wants_stream();
        if wants_stream && !model.supports_streaming {
            return Err(GatewayError::InvalidRequest(format!(
                "model {} does not support streaming",
                model.slug
            )));
        }

        // Upper-bound token estimate for admission; billing uses actuals.
        let prompt_estimate = request.estimated_prompt_tokens();
        let max_output = request
            .max_tokens
            .or(model.max_tokens.map(|t| t as u32))
            .unwrap_or(1024);
        let token_estimate = prompt_estimate + max_output;

        let scopes = [Scope::api_key(ctx.api_key.id), Scope::user(ctx.user.id)];
        for scope in &scopes {
            self.admit(scope, QuotaType::Requests, Decimal::ONE).await?;
            self.admit(scope, QuotaType::Tokens, Decimal::from(token_estimate)).await?;
        }

        let estimated_cost = self
            .billing
            .estimate_cost(model.id, prompt_estimate, max_output)
            .await
            .map_err(GatewayError::Store)?;
        self.billing.check_balance(&ctx.user, estimated_cost)?;

        let success = self.dispatch_with_failover(&model, &request, wants_stream).await?;

        match success.response {
            UpstreamOutcome::Complete(response) => {
                self.finish_complete(
                    ctx,
                    &model,
                    &success.candidate,
                    response,
                    request_id,
                    endpoint,
                    request_bytes,
                    prompt_estimate,
                    success.duration_ms,
                )
                .await
            }
            UpstreamOutcome::Stream(handle) => Ok(self.finish_stream(
                ctx,
                &model,
                &success.candidate,
                handle,
                request_id,
                endpoint,
                request_bytes,
                prompt_estimate,
            )),
        }
    }

    async fn admit(&self, scope: &Scope, quota_type: QuotaType, amount: Decimal) -> Result<()> {
        match self.quota.check(scope, quota_type, amount).await.map_err(GatewayError::Store)? {
            QuotaDecision::Allowed(_) => Ok(()),
            QuotaDecision::Denied(denial) => {
                metrics::QUOTA_DENIALS.with_label_values(&[quota_type.as_str()]).inc();
                Err(GatewayError::QuotaDenied(denial))
            }
        }
    }

    async fn load_model(&self, slug: &str) -> Result<Model> {
        let cache_key = keys::model_by_slug(slug);
        if let Some(model) = self.cache.get_json::<Model>(&cache_key) {
            return Ok(model);
        }
        match self.models.get_by_slug(slug).await {
            Ok(model) => {
                self.cache.set_json(&cache_key, &model, self.model_ttl);
                Ok(model)
            }
            Err(StoreError::NotFound) => Err(GatewayError::UnsupportedModel(slug.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Walk the router's candidates until one accepts. Retryable failures
    /// advance; fatal outcomes surface immediately.
    async fn dispatch_with_failover(
        &self,
        model: &Model,
        request: &ChatCompletionRequest,
        wants_stream: bool,
    ) -> Result<DispatchSuccess> {
        let candidates = self.router.candidates(&model.slug).await?;
        if candidates.is_empty() {
            return Err(GatewayError::NoProviderAvailable { model: model.slug.clone() });
        }

        let mut last_error: Option<DispatchError> = None;

        for candidate in candidates {
            let Some(adapter) = self.registry.resolve(&candidate.provider_slug) else {
                tracing::warn!(provider = %candidate.provider_slug, "no adapter registered, skipping");
                continue;
            };

            let started = Instant::now();
            let attempt = if wants_stream {
                match tokio::time::timeout(
                    candidate.timeout,
                    adapter.dispatch_stream(&candidate, request),
                )
                .await
                {
                    Ok(Ok(handle)) => Ok(UpstreamOutcome::Stream(handle)),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(DispatchError::Timeout),
                }
            } else if self.mediator.applies_to(request) {
                match tokio::time::timeout(
                    // Two legs plus tool execution ride inside one deadline.
                    candidate.timeout * 2,
                    self.mediator.mediate(Arc::clone(&adapter), &candidate, request),
                )
                .await
                {
                    Ok(Ok(response)) => Ok(UpstreamOutcome::Complete(response)),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(DispatchError::Timeout),
                }
            } else {
                match tokio::time::timeout(candidate.timeout, adapter.dispatch(&candidate, request))
                    .await
                {
                    Ok(Ok(response)) => Ok(UpstreamOutcome::Complete(response)),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(DispatchError::Timeout),
                }
            };

            let duration_ms = started.elapsed().as_millis() as i64;
            match attempt {
                Ok(response) => {
                    self.router.record_success(candidate.provider_id);
                    metrics::UPSTREAM_DISPATCHES
                        .with_label_values(&[candidate.provider_slug.as_str(), "success"])
                        .inc();
                    return Ok(DispatchSuccess { response, candidate, duration_ms });
                }
                Err(error) => {
                    self.router.record_failure(candidate.provider_id, &error);
                    metrics::UPSTREAM_DISPATCHES
                        .with_label_values(&[candidate.provider_slug.as_str(), "failure"])
                        .inc();
                    tracing::warn!(
                        provider = %candidate.provider_slug,
                        model = %model.slug,
                        error = %error,
                        "upstream dispatch failed"
                    );

                    if error.is_retryable() {
                        last_error = Some(error);
                        continue;
                    }
                    // Caller-visible outcome: no failover.
                    return Err(match error {
                        DispatchError::UpstreamStatus { status, body } => {
                            GatewayError::UpstreamClient { status, body }
                        }
                        other => GatewayError::UpstreamExhausted { detail: other.to_string() },
                    });
                }
            }
        }

        Err(match last_error {
            Some(error) => GatewayError::UpstreamExhausted { detail: error.to_string() },
            None => GatewayError::NoProviderAvailable { model: model.slug.clone() },
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_complete(
        &self,
        ctx: &AuthContext,
        model: &Model,
        candidate: &Candidate,
        response: ChatCompletionResponse,
        request_id: Uuid,
        endpoint: &'static str,
        request_bytes: i64,
        prompt_estimate: u32,
        duration_ms: i64,
    ) -> Result<PipelineReply> {
        let usage = response.usage.unwrap_or_else(|| Usage::new(prompt_estimate, 0));
        let response_bytes = serde_json::to_vec(&response).map(|b| b.len() as i64).unwrap_or(0);

        let cost = self
            .billing
            .calculate_cost(model.id, usage.prompt_tokens, usage.completion_tokens, 1)
            .await
            .map_err(GatewayError::Store)?;

        let usage_log = self.build_usage_log(
            ctx, model, candidate, request_id, endpoint, request_bytes, response_bytes,
            duration_ms, usage, cost,
        );

        if let Err(e) = self.usage_logs.insert(&usage_log).await {
            // No bill without a usage log; the response still goes out.
            tracing::error!(request_id = %request_id, error = %e, "usage log insert failed");
            self.publish_consume(ctx, &usage, request_id).await;
            return Ok(PipelineReply::Complete(response));
        }

        self.publish_consume(ctx, &usage, request_id).await;

        match self.billing.settle(&usage_log).await {
            Ok(_) => Ok(PipelineReply::Complete(response)),
            Err(err @ GatewayError::InsufficientBalance { .. }) => Err(err),
            Err(e) => {
                // Recorded as failed in the ledger; the served response is
                // not retracted.
                tracing::error!(request_id = %request_id, error = %e, "billing settlement failed");
                Ok(PipelineReply::Complete(response))
            }
        }
    }

    /// Streaming completion: proxy chunks, then run the accounting in a
    /// detached task once the upstream stream ends.
    #[allow(clippy::too_many_arguments)]
    fn finish_stream(
        &self,
        ctx: &AuthContext,
        model: &Model,
        candidate: &Candidate,
        mut handle: StreamHandle,
        request_id: Uuid,
        endpoint: &'static str,
        request_bytes: i64,
        prompt_estimate: u32,
    ) -> PipelineReply {
        let (out_tx, out_rx) = mpsc::channel::<std::result::Result<Bytes, std::io::Error>>(64);

        let ctx = ctx.clone();
        let model = model.clone();
        let candidate = candidate.clone();
        let billing = Arc::clone(&self.billing);
        let usage_logs = Arc::clone(&self.usage_logs);
        let consumer = Arc::clone(&self.consumer);
        let pipeline_scopes =
            [Scope::api_key(ctx.api_key.id), Scope::user(ctx.user.id)];

        tokio::spawn(async move {
            let started = Instant::now();
            let mut response_bytes: i64 = 0;
            let mut client_connected = true;

            while let Some(chunk) = handle.chunks.recv().await {
                match chunk {
                    Ok(bytes) => {
                        response_bytes += bytes.len() as i64;
                        if client_connected && out_tx.send(Ok(bytes)).await.is_err() {
                            // Keep draining for the usage summary; the
                            // accounting below is a protected completion.
                            client_connected = false;
                            tracing::debug!(request_id = %request_id, "client disconnected mid-stream");
                        }
                    }
                    Err(e) => {
                        if client_connected {
                            let _ = out_tx
                                .send(Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))
                                .await;
                        }
                        break;
                    }
                }
            }
            drop(out_tx);

            let usage = handle
                .usage
                .await
                .ok()
                .flatten()
                .unwrap_or_else(|| Usage::new(prompt_estimate, 0));
            let duration_ms = started.elapsed().as_millis() as i64;

            let cost = match billing
                .calculate_cost(model.id, usage.prompt_tokens, usage.completion_tokens, 1)
                .await
            {
                Ok(cost) => cost,
                Err(e) => {
                    tracing::error!(request_id = %request_id, error = %e, "stream cost calculation failed");
                    Decimal::ZERO
                }
            };

            let usage_log = UsageLog {
                id: Uuid::new_v4(),
                user_id: ctx.user.id,
                api_key_id: ctx.api_key.id,
                provider_id: candidate.provider_id,
                model_id: model.id,
                request_id,
                method: "POST".to_string(),
                endpoint: endpoint.to_string(),
                input_tokens: usage.prompt_tokens as i32,
                output_tokens: usage.completion_tokens as i32,
                request_bytes,
                response_bytes,
                duration_ms,
                status_code: 200,
                cost,
                created_at: Utc::now(),
            };

            match usage_logs.insert(&usage_log).await {
                Ok(()) => {
                    if let Err(e) = billing.settle(&usage_log).await {
                        tracing::error!(request_id = %request_id, error = %e, "stream settlement failed");
                    }
                }
                Err(e) => {
                    tracing::error!(request_id = %request_id, error = %e, "stream usage log insert failed");
                }
            }

            for scope in pipeline_scopes {
                consumer
                    .publish(ConsumeEvent {
                        scope,
                        quota_type: QuotaType::Requests,
                        amount: Decimal::ONE,
                        timestamp: Utc::now(),
                        request_id,
                    })
                    .await;
                consumer
                    .publish(ConsumeEvent {
                        scope,
                        quota_type: QuotaType::Tokens,
                        amount: Decimal::from(usage.total_tokens),
                        timestamp: Utc::now(),
                        request_id,
                    })
                    .await;
            }
        });

        PipelineReply::Stream(out_rx)
    }

    async fn publish_consume(&self, ctx: &AuthContext, usage: &Usage, request_id: Uuid) {
        for scope in [Scope::api_key(ctx.api_key.id), Scope::user(ctx.user.id)] {
            self.consumer
                .publish(ConsumeEvent {
                    scope,
                    quota_type: QuotaType::Requests,
                    amount: Decimal::ONE,
                    timestamp: Utc::now(),
                    request_id,
                })
                .await;
            self.consumer
                .publish(ConsumeEvent {
                    scope,
                    quota_type: QuotaType::Tokens,
                    amount: Decimal::from(usage.total_tokens),
                    timestamp: Utc::now(),
                    request_id,
                })
                .await;
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_usage_log(
        &self,
        ctx: &AuthContext,
        model: &Model,
        candidate: &Candidate,
        request_id: Uuid,
        endpoint: &'static str,
        request_bytes: i64,
        response_bytes: i64,
        duration_ms: i64,
        usage: Usage,
        cost: Decimal,
    ) -> UsageLog {
        UsageLog {
            id: Uuid::new_v4(),
            user_id: ctx.user.id,
            api_key_id: ctx.api_key.id,
            provider_id: candidate.provider_id,
            model_id: model.id,
            request_id,
            method: "POST".to_string(),
            endpoint: endpoint.to_string(),
            input_tokens: usage.prompt_tokens as i32,
            output_tokens: usage.completion_tokens as i32,
            request_bytes,
            response_bytes,
            duration_ms,
            status_code: 200,
            cost,
            created_at: Utc::now(),
        }
    }
}
