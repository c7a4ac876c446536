//! Anthropic Messages adapter. Translates the canonical request into the
//! `/v1/messages` wire format and the response (including the streaming
//! event grammar) back into OpenAI-shaped objects, so callers see one
//! format regardless of the selected provider.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};

use super::{DispatchError, StreamHandle, UpstreamAdapter};
use crate::models::openai::{
    ChatCompletionRequest, ChatCompletionResponse, ChatChoice, ChatMessage, FunctionCall,
    ToolCall, Usage, ROLE_ASSISTANT, ROLE_SYSTEM, ROLE_TOOL,
};
use crate::services::router_service::Candidate;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: Value,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    id: String,
    model: String,
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    input: Option<Value>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

pub struct AnthropicAdapter {
    http: reqwest::Client,
}

impl AnthropicAdapter {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    fn messages_url(base_url: &str) -> String {
        format!("{}/messages", base_url.trim_end_matches('/'))
    }

    fn translate_request(
        target: &Candidate,
        request: &ChatCompletionRequest,
        stream: bool,
    ) -> AnthropicRequest {
        let mut system_parts = Vec::new();
        let mut messages = Vec::new();

        for message in &request.messages {
            match message.role.as_str() {
                ROLE_SYSTEM => system_parts.push(message.content_text()),
                ROLE_TOOL => messages.push(AnthropicMessage {
                    role: "user".to_string(),
                    content: json!([{
                        "type": "tool_result",
                        "tool_use_id": message.tool_call_id.clone().unwrap_or_default(),
                        "content": message.content_text(),
                    }]),
                }),
                ROLE_ASSISTANT if message.tool_calls.is_some() => {
                    let mut blocks = Vec::new();
                    let text = message.content_text();
                    if !text.is_empty() {
                        blocks.push(json!({ "type": "text", "text": text }));
                    }
                    for call in message.tool_calls.as_deref().unwrap_or(&[]) {
                        let input: Value = serde_json::from_str(&call.function.arguments)
                            .unwrap_or(Value::Object(Default::default()));
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": call.id,
                            "name": call.function.name,
                            "input": input,
                        }));
                    }
                    messages.push(AnthropicMessage {
                        role: "assistant".to_string(),
                        content: Value::Array(blocks),
                    });
                }
                role => {
                    let mapped = if role == ROLE_ASSISTANT { "assistant" } else { "user" };
                    messages.push(AnthropicMessage {
                        role: mapped.to_string(),
                        content: Value::String(message.content_text()),
                    });
                }
            }
        }

        let tools = request.tools.as_ref().map(|tools| {
            tools
                .iter()
                .map(|tool| {
                    json!({
                        "name": tool.function.name,
                        "description": tool.function.description,
                        "input_schema": tool.function.parameters.clone()
                            .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                    })
                })
                .collect()
        });

        AnthropicRequest {
            model: target.upstream_model_name.clone(),
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            messages,
            system: (!system_parts.is_empty()).then(|| system_parts.join("\n\n")),
            temperature: request.temperature,
            top_p: request.top_p,
            stream: stream.then_some(true),
            tools,
        }
    }

    fn translate_response(response: AnthropicResponse) -> ChatCompletionResponse {
        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for block in response.content {
            match block.block_type.as_str() {
                "text" => text.push_str(block.text.as_deref().unwrap_or_default()),
                "tool_use" => tool_calls.push(ToolCall {
                    id: block.id.unwrap_or_default(),
                    call_type: "function".to_string(),
                    function: FunctionCall {
                        name: block.name.unwrap_or_default(),
                        arguments: block
                            .input
                            .map(|v| v.to_string())
                            .unwrap_or_else(|| "{}".to_string()),
                    },
                }),
                _ => {}
            }
        }

        let finish_reason = Some(map_stop_reason(response.stop_reason.as_deref()).to_string());

        ChatCompletionResponse {
            id: response.id,
            object: "chat.completion".to_string(),
            created: Utc::now().timestamp(),
            model: response.model,
            choices: vec![ChatChoice {
                index: 0,
                message: ChatMessage {
                    role: ROLE_ASSISTANT.to_string(),
                    content: Some(Value::String(text)),
                    name: None,
                    tool_call_id: None,
                    tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                },
                finish_reason,
            }],
            usage: Some(Usage::new(
                response.usage.input_tokens,
                response.usage.output_tokens,
            )),
        }
    }

    async fn send(
        &self,
        target: &Candidate,
        body: &AnthropicRequest,
    ) -> Result<reqwest::Response, DispatchError> {
        let response = self
            .http
            .post(Self::messages_url(&target.base_url))
            .header("x-api-key", &target.credential)
            .header("anthropic-version", ANTHROPIC_VERSION)
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

fn map_stop_reason(stop_reason: Option<&str>) -> &'static str {
    match stop_reason {
        Some("max_tokens") => "length",
        Some("tool_use") => "tool_calls",
        _ => "stop",
    }
}

#[async_trait]
impl UpstreamAdapter for AnthropicAdapter {
    async fn dispatch(
        &self,
        target: &Candidate,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, DispatchError> {
        let body = Self::translate_request(target, request, false);
        let response = self.send(target, &body).await?;
        let parsed = response
            .json::<AnthropicResponse>()
            .await
            .map_err(|e| DispatchError::InvalidResponse(e.to_string()))?;
        Ok(Self::translate_response(parsed))
    }

    async fn dispatch_stream(
        &self,
        target: &Candidate,
        request: &ChatCompletionRequest,
    ) -> Result<StreamHandle, DispatchError> {
        let body = Self::translate_request(target, request, true);
        let response = self.send(target, &body).await?;

        let (chunk_tx, chunk_rx) = mpsc::channel(64);
        let (usage_tx, usage_rx) = oneshot::channel();
        let model = target.upstream_model_name.clone();

        tokio::spawn(async move {
            let mut upstream = response.bytes_stream();
            let mut translator = StreamTranslator::new(model);

            while let Some(chunk) = upstream.next().await {
                match chunk {
                    Ok(bytes) => {
                        for out in translator.feed(&bytes) {
                            if chunk_tx.send(Ok(out)).await.is_err() {
                                // Client gone; keep consuming for the usage
                                // summary.
                            }
                        }
                    }
                    Err(e) => {
                        let _ = chunk_tx.send(Err(DispatchError::from_reqwest(e))).await;
                        break;
                    }
                }
            }

            let _ = usage_tx.send(translator.into_usage());
        });

        Ok(StreamHandle { chunks: chunk_rx, usage: usage_rx })
    }
}

/// Translates Anthropic streaming events into OpenAI `chat.completion.chunk`
/// SSE lines, accumulating the usage counters from `message_start` and
/// `message_delta`.
struct StreamTranslator {
    buffer: String,
    model: String,
    stream_id: String,
    created: i64,
    input_tokens: u32,
    output_tokens: u32,
    finished: bool,
}

impl StreamTranslator {
    fn new(model: String) -> Self {
        Self {
            buffer: String::new(),
            model,
            stream_id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            created: Utc::now().timestamp(),
            input_tokens: 0,
            output_tokens: 0,
            finished: false,
        }
    }

    fn feed(&mut self, bytes: &[u8]) -> Vec<Bytes> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));
        let mut out = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            if let Some(chunk) = self.translate_line(line.trim()) {
                out.push(chunk);
            }
        }
        out
    }

    fn translate_line(&mut self, line: &str) -> Option<Bytes> {
        let payload = line.strip_prefix("data:")?.trim();
        if payload.is_empty() {
            return None;
        }
        let event: Value = serde_json::from_str(payload).ok()?;

        match event.get("type").and_then(Value::as_str)? {
            "message_start" => {
                self.input_tokens = event
                    .pointer("/message/usage/input_tokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as u32;
                Some(self.chunk(json!({ "role": "assistant", "content": "" }), None))
            }
            "content_block_delta" => {
                let text = event.pointer("/delta/text").and_then(Value::as_str)?;
                Some(self.chunk(json!({ "content": text }), None))
            }
            "message_delta" => {
                if let Some(output) = event.pointer("/usage/output_tokens").and_then(Value::as_u64) {
                    self.output_tokens = output as u32;
                }
                let stop_reason = event.pointer("/delta/stop_reason").and_then(Value::as_str);
                Some(self.chunk(json!({}), Some(map_stop_reason(stop_reason))))
            }
            "message_stop" => {
                self.finished = true;
                Some(Bytes::from_static(b"data: [DONE]\n\n"))
            }
            _ => None,
        }
    }

    fn chunk(&self, delta: Value, finish_reason: Option<&str>) -> Bytes {
        let body = json!({
            "id": self.stream_id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }],
        });
        Bytes::from(format!("data: {body}\n\n"))
    }

    fn into_usage(self) -> Option<Usage> {
        (self.finished || self.output_tokens > 0)
            .then(|| Usage::new(self.input_tokens, self.output_tokens))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::openai::ToolDefinition;

    fn candidate() -> Candidate {
        Candidate {
            provider_id: uuid::Uuid::new_v4(),
            provider_slug: "anthropic".into(),
            base_url: "https://api.anthropic.com/v1".into(),
            credential: "secret".into(),
            timeout: std::time::Duration::from_secs(30),
            upstream_model_name: "claude-3-5-sonnet-20241022".into(),
            edge_priority: 1,
            provider_priority: 1,
        }
    }

    fn request(messages: Vec<ChatMessage>) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "claude-3-5-sonnet".into(),
            messages,
            tools: None,
            tool_choice: None,
            max_tokens: None,
            temperature: Some(0.5),
            top_p: None,
            stream: None,
            stream_options: None,
            stop: None,
            user: None,
        }
    }

    #[test]
    fn system_messages_lift_into_system_field() {
        let mut msgs = vec![ChatMessage::user("hi")];
        msgs.insert(0, ChatMessage {
            role: ROLE_SYSTEM.to_string(),
            content: Some(Value::String("be terse".into())),
            name: None,
            tool_call_id: None,
            tool_calls: None,
        });
        let translated = AnthropicAdapter::translate_request(&candidate(), &request(msgs), false);
        assert_eq!(translated.system.as_deref(), Some("be terse"));
        assert_eq!(translated.messages.len(), 1);
        assert_eq!(translated.max_tokens, DEFAULT_MAX_TOKENS);
        assert_eq!(translated.model, "claude-3-5-sonnet-20241022");
    }

    #[test]
    fn tool_definitions_become_input_schemas() {
        let mut req = request(vec![ChatMessage::user("search something")]);
        req.tools = Some(vec![ToolDefinition {
            tool_type: "function".into(),
            function: crate::models::openai::FunctionDefinition {
                name: "search".into(),
                description: Some("web search".into()),
                parameters: Some(json!({"type":"object","properties":{"query":{"type":"string"}}})),
            },
        }]);
        let translated = AnthropicAdapter::translate_request(&candidate(), &req, false);
        let tools = translated.tools.unwrap();
        assert_eq!(tools[0]["name"], "search");
        assert!(tools[0]["input_schema"]["properties"]["query"].is_object());
    }

    #[test]
    fn response_translation_maps_tool_use() {
        let response = AnthropicResponse {
            id: "msg_1".into(),
            model: "claude-3-5-sonnet-20241022".into(),
            content: vec![
                ContentBlock {
                    block_type: "text".into(),
                    text: Some("let me look".into()),
                    id: None,
                    name: None,
                    input: None,
                },
                ContentBlock {
                    block_type: "tool_use".into(),
                    text: None,
                    id: Some("toolu_1".into()),
                    name: Some("search".into()),
                    input: Some(json!({"query": "rust"})),
                },
            ],
            stop_reason: Some("tool_use".into()),
            usage: AnthropicUsage { input_tokens: 11, output_tokens: 7 },
        };

        let translated = AnthropicAdapter::translate_response(response);
        let message = translated.first_message().unwrap();
        assert_eq!(message.content_text(), "let me look");
        let calls = translated.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.name, "search");
        assert_eq!(translated.choices[0].finish_reason.as_deref(), Some("tool_calls"));
        assert_eq!(translated.usage.unwrap().total_tokens, 18);
    }

    #[test]
    fn stream_translator_produces_openai_chunks() {
        let mut translator = StreamTranslator::new("claude-3-5-sonnet-20241022".into());
        let mut out = Vec::new();
        out.extend(translator.feed(
            b"data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":9}}}\n",
        ));
        out.extend(translator.feed(
            b"data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"hel\"}}\n",
        ));
        out.extend(translator.feed(
            b"data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":4}}\n",
        ));
        out.extend(translator.feed(b"data: {\"type\":\"message_stop\"}\n"));

        assert_eq!(out.len(), 4);
        let first = String::from_utf8(out[0].to_vec()).unwrap();
        assert!(first.contains("chat.completion.chunk"));
        let second = String::from_utf8(out[1].to_vec()).unwrap();
        assert!(second.contains("hel"));
        let last = String::from_utf8(out[3].to_vec()).unwrap();
        assert_eq!(last, "data: [DONE]\n\n");

        let usage = translator.into_usage().unwrap();
        assert_eq!(usage.prompt_tokens, 9);
        assert_eq!(usage.completion_tokens, 4);
    }

    #[test]
    fn stop_reason_mapping() {
        assert_eq!(map_stop_reason(Some("end_turn")), "stop");
        assert_eq!(map_stop_reason(Some("max_tokens")), "length");
        assert_eq!(map_stop_reason(Some("tool_use")), "tool_calls");
        assert_eq!(map_stop_reason(None), "stop");
    }
}
