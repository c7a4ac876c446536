//! OpenAI-compatible adapter. The canonical format *is* this wire format,
//! so request shaping is limited to renaming the model and forcing the
//! stream options the gateway needs.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};

use super::{DispatchError, StreamHandle, UpstreamAdapter};
use crate::models::openai::{ChatCompletionRequest, ChatCompletionResponse, Usage};
use crate::services::router_service::Candidate;

pub struct OpenAiAdapter {
    http: reqwest::Client,
}

impl OpenAiAdapter {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    fn completions_url(base_url: &str) -> String {
        format!("{}/chat/completions", base_url.trim_end_matches('/'))
    }

    fn shape_request(target: &Candidate, request: &ChatCompletionRequest, stream: bool) -> ChatCompletionRequest {
        let mut shaped = request.clone();
        shaped.model = target.upstream_model_name.clone();
        shaped.stream = Some(stream);
        // Usage on the terminal chunk is how streamed tokens get counted.
        shaped.stream_options = stream.then(|| json!({ "include_usage": true }));
        shaped
    }

    async fn send(
        &self,
        target: &Candidate,
        body: &ChatCompletionRequest,
    ) -> Result<reqwest::Response, DispatchError> {
        let response = self
            .http
            .post(Self::completions_url(&target.base_url))
            .bearer_auth(&target.credential)
            .json(body)
            .send()
            .await
            .map_err(DispatchError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DispatchError::UpstreamStatus { status: status.as_u16(), body });
        }
        Ok(response)
    }
}

#[async_trait]
impl UpstreamAdapter for OpenAiAdapter {
    async fn dispatch(
        &self,
        target: &Candidate,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, DispatchError> {
        let shaped = Self::shape_request(target, request, false);
        let response = self.send(target, &shaped).await?;
        response
            .json::<ChatCompletionResponse>()
            .await
            .map_err(|e| DispatchError::InvalidResponse(e.to_string()))
    }

    async fn dispatch_stream(
        &self,
        target: &Candidate,
        request: &ChatCompletionRequest,
    ) -> Result<StreamHandle, DispatchError> {
        let shaped = Self::shape_request(target, request, true);
        let response = self.send(target, &shaped).await?;

        let (chunk_tx, chunk_rx) = mpsc::channel(64);
        let (usage_tx, usage_rx) = oneshot::channel();

        tokio::spawn(async move {
            let mut upstream = response.bytes_stream();
            let mut scanner = SseUsageScanner::default();

            while let Some(chunk) = upstream.next().await {
                match chunk {
                    Ok(bytes) => {
                        scanner.feed(&bytes);
                        // Forward verbatim; the caller gets the upstream's
                        // bytes, not a re-serialization.
                        if chunk_tx.send(Ok(bytes)).await.is_err() {
                            // Client went away. Keep draining so the usage
                            // summary still arrives for settlement.
                        }
                    }
                    Err(e) => {
                        let _ = chunk_tx.send(Err(DispatchError::from_reqwest(e))).await;
                        break;
                    }
                }
            }

            let _ = usage_tx.send(scanner.into_usage());
        });

        Ok(StreamHandle { chunks: chunk_rx, usage: usage_rx })
    }
}

/// Incremental scanner over SSE bytes that remembers the last `usage` object
/// seen in a `data:` payload. OpenAI-compatible providers deliver it on the
/// terminal chunk when `stream_options.include_usage` is set.
#[derive(Default)]
pub struct SseUsageScanner {
    buffer: String,
    usage: Option<Usage>,
}

impl SseUsageScanner {
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            self.scan_line(line.trim());
        }
    }

    fn scan_line(&mut self, line: &str) {
        let Some(payload) = line.strip_prefix("data:") else { return };
        let payload = payload.trim();
        if payload.is_empty() || payload == "[DONE]" {
            return;
        }
        let Ok(value) = serde_json::from_str::<Value>(payload) else { return };
        if let Some(usage) = value.get("usage") {
            if !usage.is_null() {
                if let Ok(parsed) = serde_json::from_value::<Usage>(usage.clone()) {
                    self.usage = Some(parsed);
                }
            }
        }
    }

    pub fn into_usage(self) -> Option<Usage> {
        self.usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scanner_reads_usage_from_terminal_chunk() {
        let mut scanner = SseUsageScanner::default();
        scanner.feed(b"data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}],\"usage\":null}\n\n");
        scanner.feed(b"data: {\"choices\":[],\"usage\":{\"prompt_tokens\":10,\"completion_tokens\":20,\"total_tokens\":30}}\n\n");
        scanner.feed(b"data: [DONE]\n\n");

        let usage = scanner.into_usage().unwrap();
        assert_eq!(usage.prompt_tokens, 10);
        assert_eq!(usage.completion_tokens, 20);
        assert_eq!(usage.total_tokens, 30);
    }

    #[test]
    fn scanner_handles_split_lines() {
        let mut scanner = SseUsageScanner::default();
        scanner.feed(b"data: {\"usage\":{\"prompt_tokens\":1,");
        scanner.feed(b"\"completion_tokens\":2,\"total_tokens\":3}}\n");
        assert_eq!(scanner.into_usage().unwrap().total_tokens, 3);
    }

    #[test]
    fn scanner_ignores_non_data_lines() {
        let mut scanner = SseUsageScanner::default();
        scanner.feed(b"event: ping\n: comment\n\n");
        assert!(scanner.into_usage().is_none());
    }

    #[test]
    fn url_building_tolerates_trailing_slash() {
        assert_eq!(
            OpenAiAdapter::completions_url("https://api.openai.com/v1/"),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            OpenAiAdapter::completions_url("https://api.openai.com/v1"),
            "https://api.openai.com/v1/chat/completions"
        );
    }
}
