use crate::agent::conversation::Conversation;
use crate::config::Config;
use crate::infra::{UsageEvent, UsageTracker};
use crate::providers::{ChatMessage, ChatRequest, ChatResponse, Provider};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Sends conversations to one provider with fixed generation settings.
pub struct Agent {
    provider: Arc<dyn Provider>,
    /// Name recorded in usage events (the config key, e.g. `"nvidia"`).
    provider_name: String,
    model: String,
    temperature: f64,
    max_tokens: u32,
    enable_thinking: bool,
    tools: Vec<serde_json::Value>,
    usage: Option<Arc<dyn UsageTracker>>,
}

impl Agent {
    pub fn new(provider: Arc<dyn Provider>, model: &str) -> Self {
        let defaults = crate::config::AgentDefaults::default();
        Self {
            provider_name: provider.name().to_ascii_lowercase(),
            provider,
            model: model.to_string(),
            temperature: defaults.temperature,
            max_tokens: defaults.max_tokens,
            enable_thinking: defaults.enable_thinking,
            tools: Vec::new(),
            usage: None,
        }
    }

    /// Agent with generation settings from `agents.defaults`.
    pub fn from_config(config: &Config, provider: Arc<dyn Provider>, provider_name: &str) -> Self {
        let defaults = &config.agents.defaults;
        Self::new(provider, &defaults.model)
            .with_provider_name(provider_name)
            .with_temperature(defaults.temperature)
            .with_max_tokens(defaults.max_tokens)
            .with_thinking(defaults.enable_thinking)
            .with_tools(defaults.tools.clone())
    }

    pub fn with_provider_name(mut self, name: &str) -> Self {
        self.provider_name = name.to_string();
        self
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_thinking(mut self, enable_thinking: bool) -> Self {
        self.enable_thinking = enable_thinking;
        self
    }

    /// Tool definitions offered to the model on every call.
    pub fn with_tools(mut self, tools: Vec<serde_json::Value>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_usage_tracker(mut self, usage: Arc<dyn UsageTracker>) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }

    /// Send `text` with the conversation so far and append the reply.
    ///
    /// Failures come back as a response with `finish_reason = error`; the
    /// conversation is left exactly as it was before the call.
    pub async fn process_message(&self, conversation: &mut Conversation, text: &str) -> ChatResponse {
        self.try_process_message(conversation, text)
            .await
            .unwrap_or_else(|e| ChatResponse::from_error(&e))
    }

    /// Like [`Agent::process_message`] but keeps the provider error.
    pub async fn try_process_message(
        &self,
        conversation: &mut Conversation,
        text: &str,
    ) -> anyhow::Result<ChatResponse> {
        let pending = conversation.with_user_turn(text);
        let result = self
            .provider
            .chat(self.request(&pending), &self.model, self.temperature)
            .await;
        self.finish(conversation, pending, result).await
    }

    /// Stream the reply's content deltas over `tx` while building the response.
    pub async fn try_stream_message(
        &self,
        conversation: &mut Conversation,
        text: &str,
        tx: mpsc::UnboundedSender<String>,
    ) -> anyhow::Result<ChatResponse> {
        let pending = conversation.with_user_turn(text);
        let result = self
            .provider
            .stream_chat(self.request(&pending), &self.model, self.temperature, tx)
            .await;
        self.finish(conversation, pending, result).await
    }

    fn request<'a>(&'a self, conversation: &'a Conversation) -> ChatRequest<'a> {
        ChatRequest {
            messages: conversation.messages(),
            tools: (!self.tools.is_empty()).then_some(self.tools.as_slice()),
            max_tokens: self.max_tokens,
            enable_thinking: self.enable_thinking,
        }
    }

    /// Commit `pending` (history plus the user turn) only when the call succeeded.
    async fn finish(
        &self,
        conversation: &mut Conversation,
        mut pending: Conversation,
        result: anyhow::Result<ChatResponse>,
    ) -> anyhow::Result<ChatResponse> {
        match result {
            Ok(response) => {
                pending.push(ChatMessage::assistant(response.content.clone()));
                *conversation = pending;
                self.record_usage(response.usage, false).await;
                tracing::debug!(
                    provider = %self.provider_name,
                    model = %self.model,
                    finish_reason = response.finish_reason.as_str(),
                    "Agent turn complete"
                );
                Ok(response)
            }
            Err(e) => {
                self.record_usage(None, true).await;
                tracing::warn!(provider = %self.provider_name, model = %self.model, "LLM call failed: {e}");
                Err(e)
            }
        }
    }

    async fn record_usage(&self, usage: Option<crate::providers::TokenUsage>, failed: bool) {
        let Some(tracker) = &self.usage else {
            return;
        };
        let event = UsageEvent::new(&self.provider_name, &self.model, usage, failed);
        if let Err(e) = tracker.record(event).await {
            tracing::debug!("Failed to record usage: {e}");
        }
    }
}
