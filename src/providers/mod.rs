//! Provider subsystem for model inference backends.
//!
//! Every supported backend speaks the OpenAI chat completions format, so the
//! factory maps a provider name to an [`OpenAiCompatibleProvider`] configured
//! with the right base URL, credential and request extras.
//!
//! # Extension
//!
//! To add a hosted provider, add an entry to [`list_providers`]. Anything else
//! with an `apiBase` in config, or a `custom:<URL>` name, works without code changes.

pub mod compatible;
pub mod registry;
pub mod traits;

pub use compatible::OpenAiCompatibleProvider;
pub use registry::DefaultProviderRegistry;
pub use traits::{
    ChatMessage, ChatRequest, ChatResponse, FinishReason, Provider, ProviderError, TokenUsage,
    ToolCall,
};

use crate::config::{Config, ProviderConfig};

const MAX_API_ERROR_CHARS: usize = 200;

/// Information about a supported provider for display purposes.
#[derive(Debug, Clone, Copy)]
pub struct ProviderInfo {
    /// Canonical name used in config (e.g. `"nvidia"`)
    pub name: &'static str,
    /// Human-readable display name
    pub display_name: &'static str,
    /// Alternative names accepted in config
    pub aliases: &'static [&'static str],
    pub base_url: &'static str,
    /// Environment variable consulted when config has no key
    pub env_var: &'static str,
    pub default_model: &'static str,
    /// Where to get a key, shown in missing-key errors
    pub key_url: &'static str,
}

/// Return the list of all known providers for display in `nanobot providers`.
pub fn list_providers() -> Vec<ProviderInfo> {
    vec![
        ProviderInfo {
            name: "nvidia",
            display_name: "NVIDIA NIM",
            aliases: &["nim"],
            base_url: crate::config::NVIDIA_API_BASE,
            env_var: "NVIDIA_API_KEY",
            default_model: crate::config::DEFAULT_MODEL,
            key_url: "https://build.nvidia.com",
        },
        ProviderInfo {
            name: "openai",
            display_name: "OpenAI",
            aliases: &[],
            base_url: "https://api.openai.com/v1",
            env_var: "OPENAI_API_KEY",
            default_model: "gpt-4o-mini",
            key_url: "https://platform.openai.com/api-keys",
        },
        ProviderInfo {
            name: "openrouter",
            display_name: "OpenRouter",
            aliases: &[],
            base_url: "https://openrouter.ai/api/v1",
            env_var: "OPENROUTER_API_KEY",
            default_model: "z-ai/glm-4.7",
            key_url: "https://openrouter.ai/keys",
        },
    ]
}

/// Look up a known provider by canonical name or alias (case-insensitive).
pub fn find_provider(name: &str) -> Option<ProviderInfo> {
    let name = name.trim();
    list_providers().into_iter().find(|info| {
        info.name.eq_ignore_ascii_case(name)
            || info.aliases.iter().any(|alias| alias.eq_ignore_ascii_case(name))
    })
}

fn is_secret_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':')
}

fn token_end(input: &str, from: usize) -> usize {
    let mut end = from;
    for (i, c) in input[from..].char_indices() {
        if is_secret_char(c) {
            end = from + i + c.len_utf8();
        } else {
            break;
        }
    }
    end
}

/// Scrub known secret-like token prefixes from provider error strings.
///
/// Redacts tokens with prefixes like `nvapi-`, `sk-`, `sk-or-`, `ghp_` and
/// `github_pat_`.
pub fn scrub_secret_patterns(input: &str) -> String {
    const PREFIXES: [&str; 7] = [
        "nvapi-",
        "sk-",
        "xoxb-",
        "ghp_",
        "gho_",
        "ghu_",
        "github_pat_",
    ];

    let mut scrubbed = input.to_string();

    for prefix in PREFIXES {
        let mut search_from = 0;
        loop {
            let Some(rel) = scrubbed[search_from..].find(prefix) else {
                break;
            };

            let start = search_from + rel;
            let content_start = start + prefix.len();
            let end = token_end(&scrubbed, content_start);

            if end == content_start {
                search_from = content_start;
                continue;
            }

            scrubbed.replace_range(start..end, "[REDACTED]");
            search_from = start + "[REDACTED]".len();
        }
    }

    scrubbed
}

/// Sanitize API error text by scrubbing secrets and truncating length.
pub fn sanitize_api_error(input: &str) -> String {
    let scrubbed = scrub_secret_patterns(input.trim());

    if scrubbed.chars().count() <= MAX_API_ERROR_CHARS {
        return scrubbed;
    }

    let end = scrubbed
        .char_indices()
        .nth(MAX_API_ERROR_CHARS)
        .map_or(scrubbed.len(), |(idx, _)| idx);

    format!("{}...", &scrubbed[..end])
}

/// Build a sanitized provider error from a failed HTTP response.
pub async fn api_error(provider: &str, response: reqwest::Response) -> ProviderError {
    let status = response.status();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<failed to read provider error body>".to_string());
    let message = match sanitize_api_error(&body) {
        sanitized if sanitized.is_empty() => status
            .canonical_reason()
            .unwrap_or("no response body")
            .to_string(),
        sanitized => sanitized,
    };
    tracing::warn!(provider, status = status.as_u16(), "Provider returned an error");
    ProviderError::Api {
        provider: provider.to_string(),
        status: status.as_u16(),
        message,
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Resolve API key for a provider from config and environment variables.
///
/// Precedence: the configured key (with `$VAR` expanded), the provider's own
/// environment variable, then `NANOBOT_API_KEY`. A `$VAR` reference that
/// stays unresolved is treated as no key.
pub fn resolve_provider_credential(name: &str, settings: Option<&ProviderConfig>) -> Option<String> {
    if let Some(key) = settings
        .and_then(ProviderConfig::resolved_api_key)
        .filter(|key| !key.starts_with('$'))
    {
        return Some(key);
    }

    if let Some(value) = find_provider(name).and_then(|info| non_empty_env(info.env_var)) {
        return Some(value);
    }

    non_empty_env("NANOBOT_API_KEY")
}

/// Factory: create the provider called `name` with its settings from config.
///
/// `name` may be a known provider or alias, `custom:<URL>`, or any name whose
/// settings carry an `apiBase`.
pub fn create_provider(
    name: &str,
    settings: Option<&ProviderConfig>,
) -> anyhow::Result<Box<dyn Provider>> {
    let name = name.trim();
    let api_key = resolve_provider_credential(name, settings);
    let api_base = settings
        .and_then(|s| s.api_base.as_deref())
        .map(str::trim)
        .filter(|base| !base.is_empty());
    let extra_body = settings.map(|s| s.extra_body.clone()).unwrap_or_default();

    let custom_url = name
        .split_once(':')
        .filter(|(prefix, _)| prefix.eq_ignore_ascii_case("custom"))
        .map(|(_, url)| url);
    if let Some(url) = custom_url {
        let url = url.trim();
        if url.is_empty() {
            anyhow::bail!("Custom provider requires a URL, e.g. custom:http://localhost:8000/v1");
        }
        let provider =
            OpenAiCompatibleProvider::new("Custom", url, api_key.as_deref())
                .with_extra_body(extra_body)
                .allow_missing_key();
        return Ok(Box::new(provider));
    }

    if let Some(info) = find_provider(name) {
        let provider = OpenAiCompatibleProvider::new(
            info.display_name,
            api_base.unwrap_or(info.base_url),
            api_key.as_deref(),
        )
        .with_default_model(info.default_model)
        .with_extra_body(extra_body)
        .with_key_hint(format!(
            "Set providers.{}.apiKey in ~/.nanobot/config.json or export {} (get a key at {}).",
            info.name, info.env_var, info.key_url
        ));
        return Ok(Box::new(provider));
    }

    match api_base {
        Some(base) => Ok(Box::new(
            OpenAiCompatibleProvider::new(name, base, api_key.as_deref())
                .with_extra_body(extra_body)
                .allow_missing_key(),
        )),
        None if name.is_empty() => anyhow::bail!("Provider name must not be empty"),
        None => anyhow::bail!(
            "Unknown provider: {name}. Use one of nvidia, openai, openrouter, \
             custom:<URL>, or set providers.{name}.apiBase in config."
        ),
    }
}

/// Create the provider selected by config, or `override_name` when given.
pub fn create_provider_from_config(
    config: &Config,
    override_name: Option<&str>,
) -> anyhow::Result<Box<dyn Provider>> {
    let name = override_name
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map_or_else(|| config.active_provider_name(), ToString::to_string);
    let settings = config.provider_config(&name).or_else(|| {
        find_provider(&name).and_then(|info| config.provider_config(info.name))
    });
    tracing::debug!(provider = %name, configured = settings.is_some(), "Creating provider");
    create_provider(&name, settings)
}
