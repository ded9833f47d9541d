use anyhow::{Context, Result};
use directories::UserDirs;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
#[cfg(unix)]
use tokio::fs::File;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

pub const CONFIG_FILE_NAME: &str = "config.json";
pub const DEFAULT_PROVIDER: &str = "nvidia";
pub const NVIDIA_API_BASE: &str = "https://integrate.api.nvidia.com/v1";
pub const DEFAULT_MODEL: &str = "z-ai/glm4.7";

/// Providers tried in order when `agents.defaults.provider` is unset.
const PROVIDER_PREFERENCE: &[&str] = &["nvidia", "openai", "openrouter"];

// ── Top-level config ──────────────────────────────────────────────

/// Top-level nanobot configuration, loaded from `config.json`.
///
/// Resolution order: `NANOBOT_CONFIG_DIR` env → `~/.nanobot/config.json`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Workspace directory - computed from the config dir, not serialized
    #[serde(skip)]
    pub workspace_dir: PathBuf,
    /// Path to config.json - computed from the config dir, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Provider credentials keyed by provider name (`"nvidia"`, `"openai"`, ...).
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,

    /// Agent settings (`agents.defaults`).
    #[serde(default)]
    pub agents: AgentsConfig,

    /// Gateway server configuration: host, port, auth token.
    #[serde(default)]
    pub gateway: GatewayConfig,
}

/// Credentials and endpoint for a single provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    /// API key. A value like `"$NVIDIA_API_KEY"` is read from that environment variable.
    #[serde(default, alias = "api_key")]
    pub api_key: Option<String>,
    /// Base URL of the OpenAI-compatible API (e.g. `"https://integrate.api.nvidia.com/v1"`).
    #[serde(default, alias = "api_base", skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
    /// Extra top-level fields merged into every request body.
    #[serde(
        default,
        alias = "extra_body",
        skip_serializing_if = "serde_json::Map::is_empty"
    )]
    pub extra_body: serde_json::Map<String, serde_json::Value>,
}

impl ProviderConfig {
    /// The configured key with `$VAR` references resolved. Empty keys are `None`.
    pub fn resolved_api_key(&self) -> Option<String> {
        let raw = self
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())?;
        Some(expand_env_reference(raw))
    }

    fn has_api_key(&self) -> bool {
        self.resolved_api_key()
            .is_some_and(|key| !key.starts_with('$'))
    }
}

/// Resolve a `$VAR` / `${VAR}` reference. Unset variables keep the literal.
pub(crate) fn expand_env_reference(raw: &str) -> String {
    if !raw.starts_with('$') {
        return raw.to_string();
    }
    match shellexpand::env(raw) {
        Ok(expanded) if !expanded.trim().is_empty() => expanded.trim().to_string(),
        _ => raw.to_string(),
    }
}

/// `agents` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentsConfig {
    /// Generation parameters applied when none are given on the command line.
    #[serde(default)]
    pub defaults: AgentDefaults,
}

/// `agents.defaults` section.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentDefaults {
    /// Model identifier sent to the provider. Default: `"z-ai/glm4.7"`.
    #[serde(default = "default_model")]
    pub model: String,
    /// Maximum tokens in a response. Default: `16384`.
    #[serde(default = "default_max_tokens", alias = "max_tokens")]
    pub max_tokens: u32,
    /// Sampling temperature (0.0–2.0). Default: `1.0`.
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// Provider to use. When unset the first provider with a key wins.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Ask GLM models for reasoning output. Default: `true`.
    #[serde(default = "default_true", alias = "enable_thinking")]
    pub enable_thinking: bool,
    /// Replaces the built-in system prompt when set.
    #[serde(default, alias = "system_prompt", skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Conversation messages retained per session, excluding the system prompt. Default: `50`.
    #[serde(default = "default_max_history_messages", alias = "max_history_messages")]
    pub max_history_messages: usize,
    /// Print tokens as they arrive in interactive mode. Default: `false`.
    #[serde(default)]
    pub stream: bool,
    /// OpenAI function definitions offered to the model on every call.
    /// Tool calls in replies are returned to the caller, not executed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<serde_json::Value>,
}

fn default_model() -> String {
    DEFAULT_MODEL.into()
}

fn default_max_tokens() -> u32 {
    16384
}

fn default_temperature() -> f64 {
    1.0
}

fn default_max_history_messages() -> usize {
    50
}

fn default_true() -> bool {
    true
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            provider: None,
            enable_thinking: true,
            system_prompt: None,
            max_history_messages: default_max_history_messages(),
            stream: false,
            tools: Vec::new(),
        }
    }
}

// ── Gateway ──────────────────────────────────────────────────────

/// Gateway server configuration (`gateway` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Gateway host (default: 0.0.0.0)
    #[serde(default = "default_gateway_host")]
    pub host: String,
    /// Gateway port (default: 18790)
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    /// When set, `/v1/*` and `/api/*` require `Authorization: Bearer <token>`.
    #[serde(default, alias = "auth_token", skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout_secs", alias = "request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Maximum accepted request body size.
    #[serde(default = "default_max_body_bytes", alias = "max_body_bytes")]
    pub max_body_bytes: usize,
    /// Sessions kept in memory; the least recently active is evicted beyond this. Default: `1000`.
    #[serde(default = "default_max_sessions", alias = "max_sessions")]
    pub max_sessions: usize,
}

fn default_gateway_host() -> String {
    "0.0.0.0".into()
}

fn default_gateway_port() -> u16 {
    18790
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_max_body_bytes() -> usize {
    64 * 1024
}

fn default_max_sessions() -> usize {
    1000
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_gateway_host(),
            port: default_gateway_port(),
            auth_token: None,
            request_timeout_secs: default_request_timeout_secs(),
            max_body_bytes: default_max_body_bytes(),
            max_sessions: default_max_sessions(),
        }
    }
}

// ── Config impl ──────────────────────────────────────────────────

impl Default for Config {
    fn default() -> Self {
        let home =
            UserDirs::new().map_or_else(|| PathBuf::from("."), |u| u.home_dir().to_path_buf());
        let nanobot_dir = home.join(".nanobot");

        let mut providers = BTreeMap::new();
        providers.insert(
            DEFAULT_PROVIDER.to_string(),
            ProviderConfig {
                api_key: None,
                api_base: Some(NVIDIA_API_BASE.to_string()),
                extra_body: serde_json::Map::new(),
            },
        );

        Self {
            workspace_dir: nanobot_dir.join("workspace"),
            config_path: nanobot_dir.join(CONFIG_FILE_NAME),
            providers,
            agents: AgentsConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

fn default_config_dir() -> Result<PathBuf> {
    let home = UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .context("Could not find home directory")?;
    Ok(home.join(".nanobot"))
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ConfigResolutionSource {
    EnvConfigDir,
    DefaultConfigDir,
}

impl ConfigResolutionSource {
    const fn as_str(self) -> &'static str {
        match self {
            Self::EnvConfigDir => "NANOBOT_CONFIG_DIR",
            Self::DefaultConfigDir => "default",
        }
    }
}

fn resolve_config_dir() -> Result<(PathBuf, ConfigResolutionSource)> {
    if let Ok(custom_config_dir) = std::env::var("NANOBOT_CONFIG_DIR") {
        let custom_config_dir = custom_config_dir.trim();
        if !custom_config_dir.is_empty() {
            let expanded = shellexpand::tilde(custom_config_dir);
            return Ok((
                PathBuf::from(expanded.as_ref()),
                ConfigResolutionSource::EnvConfigDir,
            ));
        }
    }

    Ok((
        default_config_dir()?,
        ConfigResolutionSource::DefaultConfigDir,
    ))
}

fn parse_bool_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

impl Config {
    pub async fn load_or_init() -> Result<Self> {
        let (nanobot_dir, resolution_source) = resolve_config_dir()?;
        let config_path = nanobot_dir.join(CONFIG_FILE_NAME);
        let workspace_dir = nanobot_dir.join("workspace");

        fs::create_dir_all(&nanobot_dir).await.with_context(|| {
            format!(
                "Failed to create config directory: {}",
                nanobot_dir.display()
            )
        })?;

        if config_path.exists() {
            // Warn if config file is world-readable (may contain API keys)
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Ok(meta) = fs::metadata(&config_path).await {
                    if meta.permissions().mode() & 0o004 != 0 {
                        tracing::warn!(
                            "Config file {:?} is world-readable (mode {:o}). \
                             Consider restricting with: chmod 600 {:?}",
                            config_path,
                            meta.permissions().mode() & 0o777,
                            config_path,
                        );
                    }
                }
            }

            let contents = fs::read_to_string(&config_path)
                .await
                .context("Failed to read config file")?;
            let mut config = Self::from_json_str(&contents)
                .with_context(|| format!("Failed to parse {}", config_path.display()))?;
            config.config_path = config_path;
            config.workspace_dir = workspace_dir;

            config.apply_env_overrides();
            config.validate()?;
            tracing::info!(
                path = %config.config_path.display(),
                source = resolution_source.as_str(),
                initialized = false,
                "Config loaded"
            );
            Ok(config)
        } else {
            let mut config = Config::default();
            config.config_path = config_path;
            config.workspace_dir = workspace_dir;
            config.save().await?;

            config.apply_env_overrides();
            config.validate()?;
            tracing::info!(
                path = %config.config_path.display(),
                source = resolution_source.as_str(),
                initialized = true,
                "Config loaded"
            );
            Ok(config)
        }
    }

    /// Parse a config document. Computed paths keep their defaults.
    pub fn from_json_str(contents: &str) -> Result<Self> {
        let parsed: Config =
            serde_json::from_str(contents).context("Config file is not valid JSON")?;
        let defaults = Config::default();
        Ok(Config {
            workspace_dir: defaults.workspace_dir,
            config_path: defaults.config_path,
            ..parsed
        })
    }

    /// Name of the provider requests are sent to.
    pub fn active_provider_name(&self) -> String {
        if let Some(explicit) = self
            .agents
            .defaults
            .provider
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
        {
            // URL paths are case-sensitive; only the prefix is normalized.
            return match explicit.split_once(':') {
                Some((prefix, url)) if prefix.eq_ignore_ascii_case("custom") => {
                    format!("custom:{}", url.trim())
                }
                _ => explicit.to_ascii_lowercase(),
            };
        }

        let preferred = PROVIDER_PREFERENCE.iter().find(|name| {
            self.providers
                .get(**name)
                .is_some_and(ProviderConfig::has_api_key)
        });
        if let Some(name) = preferred {
            return (*name).to_string();
        }

        self.providers
            .iter()
            .find(|(_, provider)| provider.has_api_key())
            .map_or_else(|| DEFAULT_PROVIDER.to_string(), |(name, _)| name.clone())
    }

    /// Settings for `name`, if present in the `providers` map.
    pub fn provider_config(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers
            .get(name)
            .or_else(|| {
                self.providers
                    .iter()
                    .find(|(key, _)| key.eq_ignore_ascii_case(name))
                    .map(|(_, provider)| provider)
            })
    }

    /// Validate configuration values that would cause runtime failures.
    pub fn validate(&self) -> Result<()> {
        let defaults = &self.agents.defaults;
        if !(0.0..=2.0).contains(&defaults.temperature) {
            anyhow::bail!(
                "agents.defaults.temperature must be between 0.0 and 2.0 (got {})",
                defaults.temperature
            );
        }
        if defaults.max_tokens == 0 {
            anyhow::bail!("agents.defaults.maxTokens must be greater than 0");
        }
        if defaults.max_history_messages == 0 {
            anyhow::bail!("agents.defaults.maxHistoryMessages must be greater than 0");
        }
        if defaults.model.trim().is_empty() {
            anyhow::bail!("agents.defaults.model must not be empty");
        }

        if self.gateway.host.trim().is_empty() {
            anyhow::bail!("gateway.host must not be empty");
        }
        if self.gateway.max_sessions == 0 {
            anyhow::bail!("gateway.maxSessions must be greater than 0");
        }

        for (name, provider) in &self.providers {
            let Some(base) = provider.api_base.as_deref() else {
                continue;
            };
            let url = reqwest::Url::parse(base)
                .with_context(|| format!("providers.{name}.apiBase is not a valid URL: {base}"))?;
            if !matches!(url.scheme(), "http" | "https") {
                anyhow::bail!("providers.{name}.apiBase must use http or https (got {base})");
            }
        }

        Ok(())
    }

    /// Apply environment variable overrides to config
    pub fn apply_env_overrides(&mut self) {
        if let Some(provider) = non_empty_env("NANOBOT_PROVIDER") {
            self.agents.defaults.provider = Some(provider);
        }

        if let Some(model) = non_empty_env("NANOBOT_MODEL") {
            self.agents.defaults.model = model;
        }

        // API key lands on whichever provider is active after the provider override.
        if let Some(key) = non_empty_env("NANOBOT_API_KEY") {
            let active = self.active_provider_name();
            self.providers.entry(active).or_default().api_key = Some(key);
        }

        if let Some(temp_str) = non_empty_env("NANOBOT_TEMPERATURE") {
            if let Ok(temp) = temp_str.parse::<f64>() {
                if (0.0..=2.0).contains(&temp) {
                    self.agents.defaults.temperature = temp;
                }
            }
        }

        if let Some(raw) = non_empty_env("NANOBOT_MAX_TOKENS") {
            match raw.parse::<u32>() {
                Ok(tokens) if tokens > 0 => self.agents.defaults.max_tokens = tokens,
                _ => tracing::warn!(value = %raw, "Ignoring invalid NANOBOT_MAX_TOKENS"),
            }
        }

        if let Some(flag) = non_empty_env("NANOBOT_ENABLE_THINKING") {
            if let Some(enabled) = parse_bool_flag(&flag) {
                self.agents.defaults.enable_thinking = enabled;
            }
        }

        if let Some(host) = non_empty_env("NANOBOT_GATEWAY_HOST") {
            self.gateway.host = host;
        }

        if let Some(port_str) = non_empty_env("NANOBOT_GATEWAY_PORT") {
            if let Ok(port) = port_str.parse::<u16>() {
                self.gateway.port = port;
            }
        }
    }

    pub async fn save(&self) -> Result<()> {
        let mut json = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        json.push('\n');

        let parent_dir = self
            .config_path
            .parent()
            .context("Config path must have a parent directory")?;

        fs::create_dir_all(parent_dir).await.with_context(|| {
            format!(
                "Failed to create config directory: {}",
                parent_dir.display()
            )
        })?;

        let file_name = self
            .config_path
            .file_name()
            .and_then(|v| v.to_str())
            .unwrap_or(CONFIG_FILE_NAME);
        let temp_path = parent_dir.join(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4()));
        let backup_path = parent_dir.join(format!("{file_name}.bak"));

        let mut options = OpenOptions::new();
        options.create_new(true).write(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut temp_file = options.open(&temp_path).await.with_context(|| {
            format!(
                "Failed to create temporary config file: {}",
                temp_path.display()
            )
        })?;
        temp_file
            .write_all(json.as_bytes())
            .await
            .context("Failed to write temporary config contents")?;
        temp_file
            .sync_all()
            .await
            .context("Failed to fsync temporary config file")?;
        drop(temp_file);

        let had_existing_config = self.config_path.exists();
        if had_existing_config {
            fs::copy(&self.config_path, &backup_path)
                .await
                .with_context(|| {
                    format!(
                        "Failed to create config backup before atomic replace: {}",
                        backup_path.display()
                    )
                })?;
        }

        if let Err(e) = fs::rename(&temp_path, &self.config_path).await {
            let _ = fs::remove_file(&temp_path).await;
            if had_existing_config && backup_path.exists() {
                fs::copy(&backup_path, &self.config_path)
                    .await
                    .context("Failed to restore config backup")?;
            }
            anyhow::bail!("Failed to atomically replace config file: {e}");
        }

        sync_directory(parent_dir).await?;

        if had_existing_config {
            let _ = fs::remove_file(&backup_path).await;
        }

        Ok(())
    }

    /// Config as JSON with API keys and tokens masked.
    pub fn to_masked_json(&self) -> Result<serde_json::Value> {
        let mut value = serde_json::to_value(self).context("Failed to serialize config")?;
        crate::security::mask_secrets(&mut value);
        Ok(value)
    }
}

async fn sync_directory(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let dir = File::open(path)
            .await
            .with_context(|| format!("Failed to open directory for fsync: {}", path.display()))?;
        dir.sync_all()
            .await
            .with_context(|| format!("Failed to fsync directory metadata: {}", path.display()))?;
        Ok(())
    }

    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::env_lock;

    const GUIDE_EXAMPLE: &str = r#"{
  "providers": {
    "nvidia": {
      "apiKey": "nvapi-example-key",
      "apiBase": "https://integrate.api.nvidia.com/v1"
    }
  },
  "agents": {
    "defaults": {
      "model": "z-ai/glm4.7",
      "maxTokens": 16384,
      "temperature": 1.0
    }
  }
}"#;

    fn clear_nanobot_env() {
        for key in [
            "NANOBOT_CONFIG_DIR",
            "NANOBOT_PROVIDER",
            "NANOBOT_MODEL",
            "NANOBOT_API_KEY",
            "NANOBOT_TEMPERATURE",
            "NANOBOT_MAX_TOKENS",
            "NANOBOT_ENABLE_THINKING",
            "NANOBOT_GATEWAY_HOST",
            "NANOBOT_GATEWAY_PORT",
        ] {
            std::env::remove_var(key);
        }
    }

    // ── Defaults ─────────────────────────────────────────────

    #[test]
    fn config_default_has_sane_values() {
        let c = Config::default();
        assert_eq!(c.agents.defaults.model, "z-ai/glm4.7");
        assert_eq!(c.agents.defaults.max_tokens, 16384);
        assert!((c.agents.defaults.temperature - 1.0).abs() < f64::EPSILON);
        assert!(c.agents.defaults.enable_thinking);
        assert_eq!(
            c.providers["nvidia"].api_base.as_deref(),
            Some(NVIDIA_API_BASE)
        );
        assert!(c.providers["nvidia"].api_key.is_none());
        assert!(c.config_path.ends_with(".nanobot/config.json"));
        assert!(c.workspace_dir.ends_with(".nanobot/workspace"));
    }

    #[test]
    fn gateway_config_default_values() {
        let g = GatewayConfig::default();
        assert_eq!(g.port, 18790);
        assert_eq!(g.host, "0.0.0.0");
        assert!(g.auth_token.is_none());
        assert_eq!(g.request_timeout_secs, 120);
        assert_eq!(g.max_body_bytes, 65536);
    }

    // ── Parsing ──────────────────────────────────────────────

    #[test]
    fn parses_setup_guide_example() {
        let config = Config::from_json_str(GUIDE_EXAMPLE).unwrap();
        let nvidia = config.provider_config("nvidia").unwrap();
        assert_eq!(nvidia.api_key.as_deref(), Some("nvapi-example-key"));
        assert_eq!(nvidia.api_base.as_deref(), Some(NVIDIA_API_BASE));
        assert_eq!(config.agents.defaults.model, "z-ai/glm4.7");
        assert_eq!(config.agents.defaults.max_tokens, 16384);
        assert_eq!(config.gateway.port, 18790);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_document_uses_defaults() {
        let config = Config::from_json_str("{}").unwrap();
        assert!(config.providers.is_empty());
        assert_eq!(config.agents.defaults.max_history_messages, 50);
        assert!(!config.agents.defaults.stream);
        assert!(config.config_path.ends_with("config.json"));
    }

    #[test]
    fn snake_case_keys_are_accepted() {
        let raw = r#"{
            "providers": { "openai": { "api_key": "sk-test", "api_base": "https://api.openai.com/v1" } },
            "agents": { "defaults": { "max_tokens": 512, "enable_thinking": false } }
        }"#;
        let config = Config::from_json_str(raw).unwrap();
        assert_eq!(config.providers["openai"].api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.agents.defaults.max_tokens, 512);
        assert!(!config.agents.defaults.enable_thinking);
    }

    #[test]
    fn invalid_json_is_rejected_with_context() {
        let err = Config::from_json_str("{ providers: ").unwrap_err();
        assert!(err.to_string().contains("not valid JSON"));
    }

    #[test]
    fn serialized_config_uses_camel_case() {
        let json = serde_json::to_string(&Config::default()).unwrap();
        assert!(json.contains("\"maxTokens\""));
        assert!(json.contains("\"apiBase\""));
        assert!(json.contains("\"apiKey\":null"));
        assert!(!json.contains("config_path"));
        assert!(!json.contains("workspace_dir"));
    }

    #[test]
    fn config_schema_export_contains_expected_contract_shape() {
        let schema = schemars::schema_for!(Config);
        let schema_json = serde_json::to_value(&schema).expect("schema should serialize to json");

        let properties = schema_json
            .get("properties")
            .and_then(serde_json::Value::as_object)
            .expect("schema should expose top-level properties");

        assert!(properties.contains_key("providers"));
        assert!(properties.contains_key("agents"));
        assert!(properties.contains_key("gateway"));
        assert!(!properties.contains_key("workspaceDir"));
        assert!(!properties.contains_key("configPath"));
    }

    // ── API key references ───────────────────────────────────

    #[test]
    fn resolved_api_key_reads_env_reference() {
        let _env_guard = env_lock();
        std::env::set_var("NANOBOT_TEST_REF_KEY", "nvapi-from-env");
        let provider = ProviderConfig {
            api_key: Some("$NANOBOT_TEST_REF_KEY".into()),
            ..ProviderConfig::default()
        };
        assert_eq!(provider.resolved_api_key().as_deref(), Some("nvapi-from-env"));
        std::env::remove_var("NANOBOT_TEST_REF_KEY");
    }

    #[test]
    fn resolved_api_key_keeps_literal_when_env_unset() {
        let _env_guard = env_lock();
        std::env::remove_var("NANOBOT_TEST_MISSING_KEY");
        let provider = ProviderConfig {
            api_key: Some("$NANOBOT_TEST_MISSING_KEY".into()),
            ..ProviderConfig::default()
        };
        assert_eq!(
            provider.resolved_api_key().as_deref(),
            Some("$NANOBOT_TEST_MISSING_KEY")
        );
        assert!(!provider.has_api_key());
    }

    #[test]
    fn resolved_api_key_treats_blank_as_missing() {
        let provider = ProviderConfig {
            api_key: Some("   ".into()),
            ..ProviderConfig::default()
        };
        assert!(provider.resolved_api_key().is_none());
    }

    // ── Provider selection ───────────────────────────────────

    #[test]
    fn active_provider_prefers_explicit_setting() {
        let mut config = Config::default();
        config.agents.defaults.provider = Some("OpenRouter".into());
        assert_eq!(config.active_provider_name(), "openrouter");
    }

    #[test]
    fn active_provider_keeps_custom_url_case() {
        let mut config = Config::default();
        config.agents.defaults.provider = Some("Custom:http://Host:8000/Deploy/V1".into());
        assert_eq!(
            config.active_provider_name(),
            "custom:http://Host:8000/Deploy/V1"
        );
    }

    #[test]
    fn active_provider_picks_first_keyed_in_preference_order() {
        let mut config = Config::from_json_str(
            r#"{ "providers": {
                "openrouter": { "apiKey": "or-key" },
                "openai": { "apiKey": "sk-key" },
                "nvidia": { "apiKey": "" }
            } }"#,
        )
        .unwrap();
        assert_eq!(config.active_provider_name(), "openai");

        config.providers.remove("openai");
        assert_eq!(config.active_provider_name(), "openrouter");
    }

    #[test]
    fn active_provider_falls_back_to_other_keyed_providers_then_nvidia() {
        let config = Config::from_json_str(
            r#"{ "providers": { "local": { "apiKey": "x", "apiBase": "http://localhost:8000/v1" } } }"#,
        )
        .unwrap();
        assert_eq!(config.active_provider_name(), "local");

        let empty = Config::from_json_str("{}").unwrap();
        assert_eq!(empty.active_provider_name(), "nvidia");
    }

    #[test]
    fn provider_config_lookup_is_case_insensitive() {
        let config = Config::from_json_str(r#"{ "providers": { "NVIDIA": { "apiKey": "k" } } }"#)
            .unwrap();
        assert!(config.provider_config("nvidia").is_some());
        assert!(config.provider_config("openai").is_none());
    }

    // ── Validation ───────────────────────────────────────────

    #[test]
    fn validate_rejects_out_of_range_temperature() {
        let mut config = Config::default();
        config.agents.defaults.temperature = 2.5;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("temperature"));
    }

    #[test]
    fn validate_rejects_zero_max_tokens() {
        let mut config = Config::default();
        config.agents.defaults.max_tokens = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_api_base() {
        let mut config = Config::default();
        config.providers.insert(
            "broken".into(),
            ProviderConfig {
                api_base: Some("not a url".into()),
                ..ProviderConfig::default()
            },
        );
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("providers.broken.apiBase"));

        config.providers.insert(
            "broken".into(),
            ProviderConfig {
                api_base: Some("ftp://example.com".into()),
                ..ProviderConfig::default()
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_gateway_host() {
        let mut config = Config::default();
        config.gateway.host = "  ".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_max_sessions() {
        let mut config = Config::default();
        config.gateway.max_sessions = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_tools_and_session_cap() {
        let config = Config::from_json_str(
            r#"{
                "agents": { "defaults": { "tools": [
                    { "type": "function", "function": { "name": "get_time", "parameters": {} } }
                ] } },
                "gateway": { "maxSessions": 5 }
            }"#,
        )
        .unwrap();
        assert_eq!(config.agents.defaults.tools.len(), 1);
        assert_eq!(config.agents.defaults.tools[0]["function"]["name"], "get_time");
        assert_eq!(config.gateway.max_sessions, 5);
        assert_eq!(Config::default().gateway.max_sessions, 1000);
    }

    // ── Env override tests ───────────────────────────────────

    #[test]
    fn env_override_api_key_targets_active_provider() {
        let _env_guard = env_lock();
        clear_nanobot_env();
        let mut config = Config::default();

        std::env::set_var("NANOBOT_API_KEY", "nvapi-env-key");
        config.apply_env_overrides();
        assert_eq!(
            config.providers["nvidia"].api_key.as_deref(),
            Some("nvapi-env-key")
        );

        clear_nanobot_env();
    }

    #[test]
    fn env_override_provider_then_api_key() {
        let _env_guard = env_lock();
        clear_nanobot_env();
        let mut config = Config::default();

        std::env::set_var("NANOBOT_PROVIDER", "openai");
        std::env::set_var("NANOBOT_API_KEY", "sk-env");
        config.apply_env_overrides();
        assert_eq!(config.agents.defaults.provider.as_deref(), Some("openai"));
        assert_eq!(config.providers["openai"].api_key.as_deref(), Some("sk-env"));
        assert!(config.providers["nvidia"].api_key.is_none());

        clear_nanobot_env();
    }

    #[test]
    fn env_override_model_and_max_tokens() {
        let _env_guard = env_lock();
        clear_nanobot_env();
        let mut config = Config::default();

        std::env::set_var("NANOBOT_MODEL", "meta/llama-3.1-8b-instruct");
        std::env::set_var("NANOBOT_MAX_TOKENS", "1024");
        config.apply_env_overrides();
        assert_eq!(config.agents.defaults.model, "meta/llama-3.1-8b-instruct");
        assert_eq!(config.agents.defaults.max_tokens, 1024);

        clear_nanobot_env();
    }

    #[test]
    fn env_override_invalid_values_ignored() {
        let _env_guard = env_lock();
        clear_nanobot_env();
        let mut config = Config::default();

        std::env::set_var("NANOBOT_TEMPERATURE", "3.5");
        std::env::set_var("NANOBOT_MAX_TOKENS", "0");
        std::env::set_var("NANOBOT_GATEWAY_PORT", "not_a_port");
        std::env::set_var("NANOBOT_ENABLE_THINKING", "maybe");
        config.apply_env_overrides();
        assert!((config.agents.defaults.temperature - 1.0).abs() < f64::EPSILON);
        assert_eq!(config.agents.defaults.max_tokens, 16384);
        assert_eq!(config.gateway.port, 18790);
        assert!(config.agents.defaults.enable_thinking);

        clear_nanobot_env();
    }

    #[test]
    fn env_override_gateway_and_thinking() {
        let _env_guard = env_lock();
        clear_nanobot_env();
        let mut config = Config::default();

        std::env::set_var("NANOBOT_GATEWAY_HOST", "127.0.0.1");
        std::env::set_var("NANOBOT_GATEWAY_PORT", "9090");
        std::env::set_var("NANOBOT_TEMPERATURE", "0.2");
        std::env::set_var("NANOBOT_ENABLE_THINKING", "off");
        config.apply_env_overrides();
        assert_eq!(config.gateway.host, "127.0.0.1");
        assert_eq!(config.gateway.port, 9090);
        assert!((config.agents.defaults.temperature - 0.2).abs() < f64::EPSILON);
        assert!(!config.agents.defaults.enable_thinking);

        clear_nanobot_env();
    }

    #[test]
    fn env_override_empty_values_ignored() {
        let _env_guard = env_lock();
        clear_nanobot_env();
        let mut config = Config::default();

        std::env::set_var("NANOBOT_MODEL", "");
        std::env::set_var("NANOBOT_API_KEY", "   ");
        config.apply_env_overrides();
        assert_eq!(config.agents.defaults.model, DEFAULT_MODEL);
        assert!(config.providers["nvidia"].api_key.is_none());

        clear_nanobot_env();
    }

    // ── Load / save ──────────────────────────────────────────

    #[tokio::test]
    async fn load_or_init_creates_default_config_file() {
        let _env_guard = env_lock();
        clear_nanobot_env();
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().join("nanobot-home");
        std::env::set_var("NANOBOT_CONFIG_DIR", &dir);

        let config = Config::load_or_init().await.unwrap();
        assert_eq!(config.config_path, dir.join("config.json"));
        assert_eq!(config.workspace_dir, dir.join("workspace"));
        assert!(config.config_path.exists());

        let written = std::fs::read_to_string(&config.config_path).unwrap();
        let reparsed = Config::from_json_str(&written).unwrap();
        assert_eq!(reparsed.agents.defaults.model, DEFAULT_MODEL);
        assert!(reparsed.providers.contains_key("nvidia"));

        clear_nanobot_env();
    }

    #[tokio::test]
    async fn load_or_init_reads_existing_config() {
        let _env_guard = env_lock();
        clear_nanobot_env();
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("config.json"), GUIDE_EXAMPLE).unwrap();
        std::env::set_var("NANOBOT_CONFIG_DIR", tmp.path());

        let config = Config::load_or_init().await.unwrap();
        assert_eq!(
            config.providers["nvidia"].api_key.as_deref(),
            Some("nvapi-example-key")
        );
        assert_eq!(config.active_provider_name(), "nvidia");

        clear_nanobot_env();
    }

    #[tokio::test]
    async fn load_or_init_rejects_invalid_values() {
        let _env_guard = env_lock();
        clear_nanobot_env();
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("config.json"),
            r#"{ "agents": { "defaults": { "temperature": 9.0 } } }"#,
        )
        .unwrap();
        std::env::set_var("NANOBOT_CONFIG_DIR", tmp.path());

        assert!(Config::load_or_init().await.is_err());

        clear_nanobot_env();
    }

    #[tokio::test]
    async fn save_replaces_existing_file_and_removes_backup() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut config = Config::default();
        config.config_path = tmp.path().join("config.json");

        config.save().await.unwrap();
        config.agents.defaults.model = "meta/llama-3.3-70b-instruct".into();
        config.save().await.unwrap();

        let written = std::fs::read_to_string(&config.config_path).unwrap();
        assert!(written.contains("meta/llama-3.3-70b-instruct"));
        assert!(!tmp.path().join("config.json.bak").exists());

        let leftovers: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn new_config_file_has_restricted_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::TempDir::new().unwrap();
        let mut config = Config::default();
        config.config_path = tmp.path().join("config.json");
        config.save().await.unwrap();

        let mode = std::fs::metadata(&config.config_path)
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(
            mode, 0o600,
            "New config file should be owner-only (0600), got {mode:o}"
        );
    }

    #[test]
    fn masked_json_hides_api_keys() {
        let config = Config::from_json_str(GUIDE_EXAMPLE).unwrap();
        let masked = config.to_masked_json().unwrap();
        assert_eq!(masked["providers"]["nvidia"]["apiKey"], "***MASKED***");
        assert_eq!(masked["agents"]["defaults"]["model"], "z-ai/glm4.7");
    }
}
