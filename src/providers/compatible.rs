//! Generic OpenAI-compatible provider.
//! NVIDIA's integrate API, OpenAI and OpenRouter all speak the same
//! `/chat/completions` format, so a single implementation serves them all.

use crate::providers::traits::{
    ChatRequest, ChatResponse, FinishReason, Provider, ProviderError, TokenUsage, ToolCall,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;

/// A provider that speaks the OpenAI-compatible chat completions API.
pub struct OpenAiCompatibleProvider {
    pub(crate) name: String,
    pub(crate) base_url: String,
    pub(crate) api_key: Option<String>,
    /// When false, requests go out without credentials if no key is set (local servers).
    require_api_key: bool,
    key_hint: String,
    default_model: String,
    extra_body: Map<String, Value>,
    client: Client,
}

impl OpenAiCompatibleProvider {
    pub fn new(name: &str, base_url: &str, api_key: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key
                .map(str::trim)
                .filter(|key| !key.is_empty())
                .map(ToString::to_string),
            require_api_key: true,
            key_hint: "Add an apiKey for this provider to ~/.nanobot/config.json.".to_string(),
            default_model: crate::config::DEFAULT_MODEL.to_string(),
            extra_body: Map::new(),
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(120))
                .connect_timeout(std::time::Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    pub fn with_default_model(mut self, model: &str) -> Self {
        self.default_model = model.to_string();
        self
    }

    /// Fields merged into every request body, overriding generated ones.
    pub fn with_extra_body(mut self, extra_body: Map<String, Value>) -> Self {
        self.extra_body = extra_body;
        self
    }

    /// Text appended to the missing-key error.
    pub fn with_key_hint(mut self, hint: impl Into<String>) -> Self {
        self.key_hint = hint.into();
        self
    }

    /// Send requests without credentials when no key is configured.
    pub fn allow_missing_key(mut self) -> Self {
        self.require_api_key = false;
        self
    }

    /// Build the full URL for chat completions, detecting if base_url already includes the path.
    fn chat_completions_url(&self) -> String {
        let has_full_endpoint = reqwest::Url::parse(&self.base_url)
            .map(|url| {
                url.path()
                    .trim_end_matches('/')
                    .ends_with("/chat/completions")
            })
            .unwrap_or_else(|_| {
                self.base_url
                    .trim_end_matches('/')
                    .ends_with("/chat/completions")
            });

        if has_full_endpoint {
            self.base_url.clone()
        } else {
            format!("{}/chat/completions", self.base_url)
        }
    }

    fn credential(&self) -> Result<Option<&str>, ProviderError> {
        match self.api_key.as_deref() {
            Some(key) => Ok(Some(key)),
            None if self.require_api_key => Err(ProviderError::MissingApiKey {
                provider: self.name.clone(),
                hint: self.key_hint.clone(),
            }),
            None => Ok(None),
        }
    }

    fn apply_auth_header(
        &self,
        req: reqwest::RequestBuilder,
        api_key: Option<&str>,
    ) -> reqwest::RequestBuilder {
        match api_key {
            Some(api_key) => req.bearer_auth(api_key),
            None => req,
        }
    }

    fn build_request_body(
        &self,
        request: &ChatRequest<'_>,
        model: &str,
        temperature: f64,
        stream: bool,
    ) -> Value {
        let tools = request.tools.filter(|tools| !tools.is_empty());
        let api_request = ApiChatRequest {
            model,
            messages: request.messages,
            temperature,
            max_tokens: request.max_tokens,
            stream,
            chat_template_kwargs: (request.enable_thinking && wants_thinking_kwargs(model))
                .then_some(ChatTemplateKwargs {
                    enable_thinking: true,
                    clear_thinking: false,
                }),
            tool_choice: tools.map(|_| "auto"),
            tools,
        };

        let mut body = serde_json::to_value(&api_request).unwrap_or_else(|_| json!({}));
        if let Value::Object(map) = &mut body {
            for (key, value) in &self.extra_body {
                map.insert(key.clone(), value.clone());
            }
        }
        body
    }

    async fn send(
        &self,
        body: &Value,
        api_key: Option<&str>,
    ) -> Result<reqwest::Response, ProviderError> {
        let url = self.chat_completions_url();
        tracing::debug!(provider = %self.name, url = %url, "Sending chat completion request");

        let response = self
            .apply_auth_header(self.client.post(&url).json(body), api_key)
            .send()
            .await
            .map_err(|source| ProviderError::Transport {
                provider: self.name.clone(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(super::api_error(&self.name, response).await);
        }
        Ok(response)
    }
}

/// GLM models on NVIDIA's API expose reasoning through chat template kwargs.
fn wants_thinking_kwargs(model: &str) -> bool {
    model.to_ascii_lowercase().contains("glm")
}

#[derive(Debug, Serialize)]
struct ApiChatRequest<'a> {
    model: &'a str,
    messages: &'a [crate::providers::traits::ChatMessage],
    temperature: f64,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    chat_template_kwargs: Option<ChatTemplateKwargs>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [Value]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
}

#[derive(Debug, Serialize)]
struct ChatTemplateKwargs {
    enable_thinking: bool,
    clear_thinking: bool,
}

#[derive(Debug, Deserialize)]
struct ApiChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

/// `reasoning_content` is also sent by thinking models; it is deliberately not read.
#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ApiToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ApiToolCall {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<ApiFunction>,
}

#[derive(Debug, Deserialize)]
struct ApiFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

impl From<ApiUsage> for TokenUsage {
    fn from(usage: ApiUsage) -> Self {
        Self {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        }
    }
}

/// Decode tool-call arguments. Strings are parsed as JSON; if that fails the
/// raw text is kept under `"raw"`.
fn parse_tool_arguments(arguments: Option<Value>) -> Value {
    match arguments {
        Some(Value::String(raw)) => {
            serde_json::from_str(&raw).unwrap_or_else(|_| json!({ "raw": raw }))
        }
        Some(Value::Null) | None => json!({}),
        Some(other) => other,
    }
}

fn tool_call_id(id: Option<String>) -> String {
    id.filter(|id| !id.is_empty())
        .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()))
}

fn parse_chat_response(
    provider: &str,
    response: ApiChatResponse,
) -> Result<ChatResponse, ProviderError> {
    let usage = response.usage.map(TokenUsage::from);
    let choice =
        response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::EmptyResponse {
                provider: provider.to_string(),
            })?;

    let tool_calls = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .filter_map(|tc| {
            let function = tc.function?;
            let name = function.name.filter(|name| !name.is_empty())?;
            Some(ToolCall {
                id: tool_call_id(tc.id),
                name,
                arguments: parse_tool_arguments(function.arguments),
            })
        })
        .collect();

    Ok(ChatResponse {
        content: choice.message.content.unwrap_or_default(),
        tool_calls,
        finish_reason: FinishReason::from_api(choice.finish_reason.as_deref()),
        usage,
    })
}

// ══════════════════════════════════════════════════════════
// SSE streaming types for OpenAI-compatible chat completions
// ══════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
struct StreamChatResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCall>>,
}

#[derive(Debug, Deserialize)]
struct StreamToolCall {
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunction>,
}

#[derive(Debug, Deserialize)]
struct StreamFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

fn sse_data(line: &str) -> Option<String> {
    let data = line.strip_prefix("data:")?.trim();
    if data.is_empty() || data == "[DONE]" {
        None
    } else {
        Some(data.to_string())
    }
}

/// Drain complete SSE lines from a raw byte buffer and extract `data:` payloads.
///
/// The unterminated tail stays in `buffer`. Only whole lines are decoded, so a
/// multi-byte character split across network chunks is never mangled.
fn parse_sse_lines(buffer: &mut Vec<u8>) -> Vec<String> {
    let Some(idx) = buffer.iter().rposition(|&b| b == b'\n') else {
        return Vec::new();
    };
    let complete: Vec<u8> = buffer.drain(..=idx).collect();
    String::from_utf8_lossy(&complete)
        .lines()
        .filter_map(sse_data)
        .collect()
}

/// Accumulator for streaming tool call deltas.
#[derive(Default)]
struct ToolCallAccumulator {
    calls: Vec<(Option<String>, String, String)>, // (id, name, arguments)
}

impl ToolCallAccumulator {
    fn push_delta(&mut self, delta: &StreamToolCall) {
        let index = delta.index.unwrap_or(0);

        while self.calls.len() <= index {
            self.calls.push((None, String::new(), String::new()));
        }

        if let Some(id) = &delta.id {
            self.calls[index].0 = Some(id.clone());
        }
        if let Some(func) = &delta.function {
            if let Some(name) = &func.name {
                self.calls[index].1.push_str(name);
            }
            if let Some(args) = &func.arguments {
                self.calls[index].2.push_str(args);
            }
        }
    }

    fn into_tool_calls(self) -> Vec<ToolCall> {
        self.calls
            .into_iter()
            .filter(|(_, name, _)| !name.is_empty())
            .map(|(id, name, arguments)| ToolCall {
                id: tool_call_id(id),
                name,
                arguments: parse_tool_arguments(
                    (!arguments.is_empty()).then_some(Value::String(arguments)),
                ),
            })
            .collect()
    }
}

/// Running state of a streamed completion.
#[derive(Default)]
struct StreamState {
    content: String,
    tools: ToolCallAccumulator,
    finish_reason: Option<String>,
    usage: Option<TokenUsage>,
}

impl StreamState {
    fn apply(&mut self, payload: &str, tx: &mpsc::UnboundedSender<String>) {
        let Ok(chunk) = serde_json::from_str::<StreamChatResponse>(payload) else {
            tracing::debug!(payload, "Skipping unparseable SSE payload");
            return;
        };
        if let Some(usage) = chunk.usage {
            self.usage = Some(usage.into());
        }
        for choice in chunk.choices {
            if let Some(content) = choice.delta.content {
                if !content.is_empty() {
                    self.content.push_str(&content);
                    let _ = tx.send(content);
                }
            }
            if let Some(tool_calls) = &choice.delta.tool_calls {
                for tc in tool_calls {
                    self.tools.push_delta(tc);
                }
            }
            if choice.finish_reason.is_some() {
                self.finish_reason = choice.finish_reason;
            }
        }
    }

    fn finish(self) -> ChatResponse {
        ChatResponse {
            content: self.content,
            tool_calls: self.tools.into_tool_calls(),
            finish_reason: FinishReason::from_api(self.finish_reason.as_deref()),
            usage: self.usage,
        }
    }
}

#[async_trait]
impl Provider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn chat(
        &self,
        request: ChatRequest<'_>,
        model: &str,
        temperature: f64,
    ) -> anyhow::Result<ChatResponse> {
        let api_key = self.credential()?;
        let body = self.build_request_body(&request, model, temperature, false);
        let response = self.send(&body, api_key).await?;

        let text = response
            .text()
            .await
            .map_err(|source| ProviderError::Transport {
                provider: self.name.clone(),
                source,
            })?;
        let parsed: ApiChatResponse =
            serde_json::from_str(&text).map_err(|source| ProviderError::Decode {
                provider: self.name.clone(),
                source,
            })?;

        let chat_response = parse_chat_response(&self.name, parsed)?;
        tracing::debug!(
            provider = %self.name,
            model,
            finish_reason = chat_response.finish_reason.as_str(),
            tool_calls = chat_response.tool_calls.len(),
            "Chat completion received"
        );
        Ok(chat_response)
    }

    async fn stream_chat(
        &self,
        request: ChatRequest<'_>,
        model: &str,
        temperature: f64,
        tx: mpsc::UnboundedSender<String>,
    ) -> anyhow::Result<ChatResponse> {
        let api_key = self.credential()?;
        let body = self.build_request_body(&request, model, temperature, true);
        let response = self.send(&body, api_key).await?;

        let mut state = StreamState::default();
        let mut sse_buf: Vec<u8> = Vec::new();
        let mut byte_stream = response.bytes_stream();

        while let Some(chunk_result) = byte_stream.next().await {
            let bytes = chunk_result.map_err(|source| ProviderError::Transport {
                provider: self.name.clone(),
                source,
            })?;
            sse_buf.extend_from_slice(&bytes);

            for payload in parse_sse_lines(&mut sse_buf) {
                state.apply(&payload, &tx);
            }
        }

        // Stream ended without a trailing newline.
        if let Some(payload) = sse_data(String::from_utf8_lossy(&sse_buf).trim_end()) {
            state.apply(&payload, &tx);
        }

        Ok(state.finish())
    }
}
