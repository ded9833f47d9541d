//! Default provider registry implementation.
//!
//! Holds the providers built from config, keyed by name, and picks one for a
//! request: the preferred name, then the default, then the first registered.

use super::traits::Provider;
use crate::config::Config;
use parking_lot::RwLock;
use std::sync::Arc;

/// Named providers with default fallback resolution.
pub struct DefaultProviderRegistry {
    entries: RwLock<Vec<(String, Arc<dyn Provider>)>>,
    default: RwLock<Option<String>>,
}

impl DefaultProviderRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            default: RwLock::new(None),
        }
    }

    /// Build every configured provider, with the active one as default.
    ///
    /// The active provider is always registered even when it has no
    /// settings, so its missing-key error surfaces on first use. Other
    /// entries that fail to build are skipped with a warning.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let registry = Self::new();
        let active = config.active_provider_name();

        registry.register(&active, super::create_provider_from_config(config, Some(&active))?);
        for name in config.providers.keys() {
            if name.eq_ignore_ascii_case(&active) {
                continue;
            }
            match super::create_provider(name, config.provider_config(name)) {
                Ok(provider) => registry.register(name, provider),
                Err(e) => tracing::warn!(provider = %name, "Skipping provider: {e}"),
            }
        }
        registry.set_default(&active);
        Ok(registry)
    }

    /// Register `provider` under `name`, replacing an earlier entry of the same name.
    pub fn register(&self, name: &str, provider: Box<dyn Provider>) {
        let provider: Arc<dyn Provider> = Arc::from(provider);
        let mut entries = self.entries.write();
        match entries.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
            Some(entry) => entry.1 = provider,
            None => entries.push((name.to_string(), provider)),
        }
    }

    /// Set the default provider name for `resolve()` fallback.
    pub fn set_default(&self, name: &str) {
        *self.default.write() = Some(name.to_string());
    }

    pub fn default_name(&self) -> Option<String> {
        self.default.read().clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.entries
            .read()
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, provider)| Arc::clone(provider))
    }

    pub fn list(&self) -> Vec<String> {
        self.entries.read().iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn resolve(&self, preferred: Option<&str>) -> anyhow::Result<Arc<dyn Provider>> {
        // Try preferred provider first.
        if let Some(provider) = preferred.and_then(|name| self.get(name)) {
            return Ok(provider);
        }

        // Try default provider.
        let default_name = self.default_name();
        if let Some(provider) = default_name.as_deref().and_then(|name| self.get(name)) {
            return Ok(provider);
        }

        // Try first registered provider.
        if let Some((_, provider)) = self.entries.read().first() {
            return Ok(Arc::clone(provider));
        }

        anyhow::bail!("No provider available in registry")
    }
}

impl Default for DefaultProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}
