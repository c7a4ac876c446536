// ============================================================================
// Tool-Call Mediator - One-Round Search/Crawl Augmentation
// ============================================================================
//
// Optional pre/post-processing around the dispatcher: when enabled and the
// request either declares tools or trips the intent heuristics, the gateway
// tool schemas (search, news, crawler) ride along on the first leg. If the
// model answers with tool calls, each one is executed over HTTP, its result
// appended as a tool-role message, and the augmented conversation is
// re-dispatched once. One round, statically bounded: a tool_use answer on
// the second leg is returned to the caller as-is.
//
// A failed tool execution becomes a tool message describing the failure; it
// never aborts the outer request.
//
// ============================================================================

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::config::FunctionCallConfig;
use crate::middleware::metrics;
use crate::models::openai::{
    ChatCompletionRequest, ChatCompletionResponse, ChatMessage, FunctionDefinition, ToolCall,
    ToolDefinition,
};
use crate::services::dispatch::{DispatchError, UpstreamAdapter};
use crate::services::router_service::Candidate;

const TOOL_SEARCH: &str = "search";
const TOOL_NEWS: &str = "news";
const TOOL_CRAWLER: &str = "crawler";

/// At most this many calls from one response are executed.
const MAX_TOOL_CALLS: usize = 4;

static INTENT_HINTS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(search|look up|latest|today'?s|current|news about|what happened)\b")
        .expect("intent regex")
});

pub struct ToolMediator {
    http: reqwest::Client,
    config: FunctionCallConfig,
}

impl ToolMediator {
    pub fn new(config: FunctionCallConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.search.timeout)
            .build()
            .unwrap_or_default();
        Self { http, config }
    }

    /// Whether this request should go through the mediator at all.
    pub fn applies_to(&self, request: &ChatCompletionRequest) -> bool {
        if !self.config.enabled {
            return false;
        }
        if request.tools.as_ref().map(|t| !t.is_empty()).unwrap_or(false) {
            return true;
        }
        request
            .last_user_text()
            .map(|text| INTENT_HINTS.is_match(&text))
            .unwrap_or(false)
    }

    /// The gateway's own tool schemas, offered to the model on the first leg.
    pub fn gateway_tools() -> Vec<ToolDefinition> {
        let function = |name: &str, description: &str, parameters: Value| ToolDefinition {
            tool_type: "function".to_string(),
            function: FunctionDefinition {
                name: name.to_string(),
                description: Some(description.to_string()),
                parameters: Some(parameters),
            },
        };

        vec![
            function(
                TOOL_SEARCH,
                "Search the web for current information",
                json!({
                    "type": "object",
                    "properties": {
                        "query": { "type": "string", "description": "Search query" }
                    },
                    "required": ["query"]
                }),
            ),
            function(
                TOOL_NEWS,
                "Search recent news articles",
                json!({
                    "type": "object",
                    "properties": {
                        "query": { "type": "string", "description": "News query" }
                    },
                    "required": ["query"]
                }),
            ),
            function(
                TOOL_CRAWLER,
                "Fetch the readable content of a web page",
                json!({
                    "type": "object",
                    "properties": {
                        "url": { "type": "string", "description": "Page URL to fetch" }
                    },
                    "required": ["url"]
                }),
            ),
        ]
    }

    /// Run the mediated conversation against one candidate. Usage from both
    /// legs is summed so billing sees the full token spend.
    pub async fn mediate(
        &self,
        adapter: Arc<dyn UpstreamAdapter>,
        target: &Candidate,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, DispatchError> {
        let mut first_leg = request.clone();
        if first_leg.tools.as_ref().map(|t| t.is_empty()).unwrap_or(true) {
            first_leg.tools = Some(Self::gateway_tools());
        }

        let first = adapter.dispatch(target, &first_leg).await?;
        let tool_calls = first.tool_calls().to_vec();
        if tool_calls.is_empty() {
            return Ok(first);
        }

        let mut conversation = first_leg.clone();
        if let Some(message) = first.first_message() {
            conversation.messages.push(message.clone());
        }
        for call in tool_calls.iter().take(MAX_TOOL_CALLS) {
            let content = self.execute_tool(call).await;
            conversation.messages.push(ChatMessage::tool(call.id.clone(), content));
        }
        // Second leg answers from the tool results; no further rounds.
        conversation.tool_choice = Some(Value::String("none".to_string()));

        let mut second = adapter.dispatch(target, &conversation).await?;
        second.usage = match (first.usage, second.usage) {
            (Some(mut a), Some(b)) => {
                a.accumulate(&b);
                Some(a)
            }
            (a, b) => a.or(b),
        };
        Ok(second)
    }

    /// Execute one tool call. Failures come back as descriptive content, not
    /// errors.
    pub async fn execute_tool(&self, call: &ToolCall) -> String {
        let arguments: Value = match serde_json::from_str(&call.function.arguments) {
            Ok(value) => value,
            Err(e) => return format!("tool error: invalid arguments: {e}"),
        };

        metrics::TOOL_EXECUTIONS.with_label_values(&[call.function.name.as_str()]).inc();

        let result = match call.function.name.as_str() {
            TOOL_SEARCH => self.run_search(&arguments, "search").await,
            TOOL_NEWS => self.run_search(&arguments, "news").await,
            TOOL_CRAWLER => self.run_crawler(&arguments).await,
            other => Err(format!("unknown tool: {other}")),
        };

        match result {
            Ok(content) => self.bound_content(content),
            Err(reason) => {
                tracing::warn!(tool = %call.function.name, %reason, "tool execution failed");
                format!("tool error: {reason}")
            }
        }
    }

    async fn run_search(&self, arguments: &Value, endpoint: &str) -> Result<String, String> {
        let query = arguments
            .get("query")
            .and_then(Value::as_str)
            .ok_or_else(|| "missing required parameter: query".to_string())?;

        let url = format!("{}/{endpoint}", self.config.search.base_url.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .header("x-api-key", &self.config.search.api_key)
            .json(&json!({ "q": query, "num": self.config.search.max_results }))
            .send()
            .await
            .map_err(|e| format!("search request failed: {e}"))?;

        if !response.status().is_success() {
            return Err(format!("search service returned {}", response.status()));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| format!("search response unreadable: {e}"))?;

        let results = body
            .get("results")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if results.is_empty() {
            return Ok(format!("no results for: {query}"));
        }

        let rendered: Vec<String> = results
            .iter()
            .take(self.config.search.max_results)
            .map(|entry| {
                format!(
                    "{}\n{}\n{}",
                    entry.get("title").and_then(Value::as_str).unwrap_or(""),
                    entry.get("url").and_then(Value::as_str).unwrap_or(""),
                    entry.get("snippet").and_then(Value::as_str).unwrap_or(""),
                )
            })
            .collect();
        Ok(rendered.join("\n---\n"))
    }

    async fn run_crawler(&self, arguments: &Value) -> Result<String, String> {
        let url = arguments
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| "missing required parameter: url".to_string())?;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(format!("refusing non-http url: {url}"));
        }

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| format!("crawl failed: {e}"))?;
        if !response.status().is_success() {
            return Err(format!("crawl target returned {}", response.status()));
        }
        response.text().await.map_err(|e| format!("crawl body unreadable: {e}"))
    }

    fn bound_content(&self, content: String) -> String {
        let max = self.config.search.max_content_bytes;
        if content.len() <= max {
            return content;
        }
        let mut cut = max;
        while cut > 0 && !content.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…[truncated]", &content[..cut])
    }
}
