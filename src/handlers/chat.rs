// ============================================================================
// Completion Handlers - OpenAI-Compatible Surface
// ============================================================================

use axum::{
    body::{Body, Bytes},
    extract::{Extension, State},
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::middleware::error_handling::{GatewayError, Result};
use crate::models::openai::{
    ChatCompletionRequest, ChatMessage, CompletionRequest, CompletionResponse,
};
use crate::services::auth_service::AuthContext;
use crate::services::pipeline::PipelineReply;
use crate::state::AppState;

/// `POST /v1/chat/completions`
pub async fn chat_completions(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Extension(request_id): Extension<Uuid>,
    body: Bytes,
) -> Result<Response> {
    let request_bytes = body.len() as i64;
    let request: ChatCompletionRequest = serde_json::from_slice(&body)
        .map_err(|e| GatewayError::InvalidRequest(format!("invalid request body: {e}")))?;

    let reply = state
        .pipeline
        .chat_completion(&ctx, request, request_id, "/v1/chat/completions", request_bytes)
        .await?;

    Ok(render_reply(reply, |response| Json(response).into_response()))
}

/// `POST /v1/completions` - legacy prompt-based surface, served through the
/// chat pipeline and projected back into the completions shape.
pub async fn completions(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Extension(request_id): Extension<Uuid>,
    body: Bytes,
) -> Result<Response> {
    let request_bytes = body.len() as i64;
    let request: CompletionRequest = serde_json::from_slice(&body)
        .map_err(|e| GatewayError::InvalidRequest(format!("invalid request body: {e}")))?;
    if request.prompt.is_empty() {
        return Err(GatewayError::InvalidRequest("prompt must not be empty".into()));
    }

    let chat_request = ChatCompletionRequest {
        model: request.model,
        messages: vec![ChatMessage::user(request.prompt)],
        tools: None,
        tool_choice: None,
        max_tokens: request.max_tokens,
        temperature: request.temperature,
        top_p: request.top_p,
        stream: request.stream,
        stream_options: None,
        stop: request.stop,
        user: None,
    };

    let reply = state
        .pipeline
        .chat_completion(&ctx, chat_request, request_id, "/v1/completions", request_bytes)
        .await?;

    Ok(render_reply(reply, |response| {
        Json(CompletionResponse::from_chat(response)).into_response()
    }))
}

fn render_reply(
    reply: PipelineReply,
    complete: impl FnOnce(crate::models::openai::ChatCompletionResponse) -> Response,
) -> Response {
    match reply {
        PipelineReply::Complete(response) => complete(response),
        PipelineReply::Stream(rx) => {
            let body = Body::from_stream(ReceiverStream::new(rx));
            Response::builder()
                .header(header::CONTENT_TYPE, "text/event-stream")
                .header(header::CACHE_CONTROL, "no-cache")
                .header(header::CONNECTION, "keep-alive")
                .body(body)
                .unwrap_or_else(|_| Body::empty().into_response())
        }
    }
}
