use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// A single chat message in OpenAI wire format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Parsed arguments. Unparseable argument strings arrive as `{"raw": "<string>"}`.
    pub arguments: serde_json::Value,
}

/// Token accounting reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Why the model stopped generating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    /// The request failed; the response content carries the error text.
    Error,
    Other(String),
}

impl FinishReason {
    /// Map the API's `finish_reason`. A missing value means a normal stop.
    pub fn from_api(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            None | Some("" | "stop") => Self::Stop,
            Some("length") => Self::Length,
            Some("tool_calls" | "function_call") => Self::ToolCalls,
            Some("content_filter") => Self::ContentFilter,
            Some("error") => Self::Error,
            Some(other) => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::ToolCalls => "tool_calls",
            Self::ContentFilter => "content_filter",
            Self::Error => "error",
            Self::Other(other) => other,
        }
    }
}

impl Serialize for FinishReason {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for FinishReason {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::from_api(Some(&raw)))
    }
}

/// Normalized result of a chat completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: FinishReason,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
}

impl ChatResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
            finish_reason: FinishReason::Stop,
            usage: None,
        }
    }

    /// Turn a failed call into a response the caller can still display.
    pub fn from_error(error: &anyhow::Error) -> Self {
        Self {
            content: format!("Error calling LLM: {error}"),
            tool_calls: Vec::new(),
            finish_reason: FinishReason::Error,
            usage: None,
        }
    }
}

/// Everything a provider needs besides model and temperature.
#[derive(Debug, Clone, Copy)]
pub struct ChatRequest<'a> {
    pub messages: &'a [ChatMessage],
    /// Tool definitions in OpenAI function-calling format.
    pub tools: Option<&'a [serde_json::Value]>,
    pub max_tokens: u32,
    /// Request reasoning output from models that support it.
    pub enable_thinking: bool,
}

impl<'a> ChatRequest<'a> {
    pub fn new(messages: &'a [ChatMessage]) -> Self {
        Self {
            messages,
            tools: None,
            max_tokens: 16384,
            enable_thinking: true,
        }
    }
}

/// Failures at the provider boundary.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("{provider} API key not set. {hint}")]
    MissingApiKey { provider: String, hint: String },

    #[error("{provider} API error ({status}): {message}")]
    Api {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("No response from {provider}")]
    EmptyResponse { provider: String },

    #[error("{provider} request failed: {source}")]
    Transport {
        provider: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{provider} returned an unreadable response: {source}")]
    Decode {
        provider: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ProviderError {
    /// True when the endpoint rejected the credential (HTTP 401/403).
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::Api { status: 401 | 403, .. })
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    /// Display name used in errors and logs.
    fn name(&self) -> &str;

    /// Model used when the caller has none configured.
    fn default_model(&self) -> &str;

    async fn chat(
        &self,
        request: ChatRequest<'_>,
        model: &str,
        temperature: f64,
    ) -> anyhow::Result<ChatResponse>;

    /// Stream content deltas over `tx` and return the assembled response.
    ///
    /// The default sends the whole reply as one delta.
    async fn stream_chat(
        &self,
        request: ChatRequest<'_>,
        model: &str,
        temperature: f64,
        tx: mpsc::UnboundedSender<String>,
    ) -> anyhow::Result<ChatResponse> {
        let response = self.chat(request, model, temperature).await?;
        if !response.content.is_empty() {
            let _ = tx.send(response.content.clone());
        }
        Ok(response)
    }
}
