use crate::providers::TokenUsage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// One completed (or failed) model call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageEvent {
    pub provider: String,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    /// The call ended in an error response.
    #[serde(default)]
    pub failed: bool,
    pub timestamp: DateTime<Utc>,
}

impl UsageEvent {
    /// Build an event stamped now. Calls without reported usage count zero tokens.
    pub fn new(provider: &str, model: &str, usage: Option<TokenUsage>, failed: bool) -> Self {
        let usage = usage.unwrap_or_default();
        Self {
            provider: provider.to_string(),
            model: model.to_string(),
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
            failed,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum UsagePeriod {
    Hour,
    Day,
    Week,
    Month,
    #[default]
    All,
}

impl FromStr for UsagePeriod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hour" => Ok(Self::Hour),
            "day" => Ok(Self::Day),
            "week" => Ok(Self::Week),
            "month" => Ok(Self::Month),
            "all" | "" => Ok(Self::All),
            other => anyhow::bail!("Unknown usage period: {other} (use hour, day, week, month or all)"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UsageSummary {
    pub total_requests: u64,
    pub failed_requests: u64,
    pub total_prompt_tokens: u64,
    pub total_completion_tokens: u64,
    pub total_tokens: u64,
    pub period: UsagePeriod,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UsageBreakdown {
    pub provider: String,
    pub model: String,
    pub requests: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[async_trait]
pub trait UsageTracker: Send + Sync {
    async fn record(&self, event: UsageEvent) -> anyhow::Result<()>;
    async fn summary(&self, period: UsagePeriod) -> anyhow::Result<UsageSummary>;
    /// Per provider/model totals, sorted by provider then model.
    async fn breakdown(&self, period: UsagePeriod) -> anyhow::Result<Vec<UsageBreakdown>>;
    fn name(&self) -> &str;
}
