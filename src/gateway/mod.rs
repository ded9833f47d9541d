//! HTTP gateway exposing the agent over a small JSON API.
//!
//! `GET /health` is public. `/v1/*` and `/api/*` require
//! `Authorization: Bearer <gateway.authToken>` when a token is configured.

pub mod api;
pub mod sessions;

pub use sessions::SessionStore;

use crate::agent::{build_system_prompt, Conversation};
use crate::config::Config;
use crate::infra::UsageTracker;
use crate::providers::DefaultProviderRegistry;
use anyhow::{Context, Result};
use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Shared state for every gateway request.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<DefaultProviderRegistry>,
    pub usage: Arc<dyn UsageTracker>,
    pub sessions: Arc<SessionStore>,
    pub system_prompt: Arc<str>,
    pub started_at: Instant,
}

impl AppState {
    pub async fn from_config(config: Config) -> Result<Self> {
        let registry = DefaultProviderRegistry::from_config(&config)?;
        let system_prompt = build_system_prompt(&config, &config.agents.defaults.model).await?;
        Ok(Self::new(config, registry, &system_prompt))
    }

    pub fn new(config: Config, registry: DefaultProviderRegistry, system_prompt: &str) -> Self {
        let sessions = Arc::new(SessionStore::new(config.gateway.max_sessions));
        Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            usage: crate::infra::create_usage_tracker(),
            sessions,
            system_prompt: Arc::from(system_prompt),
            started_at: Instant::now(),
        }
    }

    /// Name of the provider chat requests go to.
    pub fn provider_name(&self) -> String {
        self.registry
            .default_name()
            .unwrap_or_else(|| self.config.active_provider_name())
    }

    /// A copy of the session's history, or a fresh conversation.
    pub fn checkout_session(&self, session_id: &str) -> Conversation {
        self.sessions.get(session_id).unwrap_or_else(|| {
            Conversation::new(
                Some(&*self.system_prompt),
                self.config.agents.defaults.max_history_messages,
            )
        })
    }

    pub fn store_session(&self, session_id: &str, conversation: Conversation) {
        self.sessions.store(session_id, conversation);
    }
}

/// Build the gateway router with body-size and timeout limits applied.
pub fn router(state: AppState) -> Router {
    let max_body = state.config.gateway.max_body_bytes;
    let timeout = Duration::from_secs(state.config.gateway.request_timeout_secs.max(1));

    Router::new()
        .route("/health", get(api::handle_health))
        .route("/v1/chat", post(api::handle_chat))
        .route("/v1/sessions/{id}", delete(api::handle_session_delete))
        .route("/api/status", get(api::handle_api_status))
        .route("/api/config", get(api::handle_api_config))
        .route("/api/usage", get(api::handle_api_usage))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(max_body))
        .layer(TimeoutLayer::new(timeout))
}

/// Run the gateway until ctrl-c.
pub async fn run_gateway(host: &str, port: u16, config: Config) -> Result<()> {
    if config.gateway.auth_token.is_none() && !is_loopback(host) {
        tracing::warn!(
            host,
            "Gateway is reachable from the network without gateway.authToken"
        );
    }

    let state = AppState::from_config(config).await?;
    let provider = state.provider_name();
    let model = state.config.agents.defaults.model.clone();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind((host, port))
        .await
        .with_context(|| format!("Failed to bind gateway to {host}:{port}"))?;
    let addr = listener.local_addr()?;

    println!("{} Gateway listening on http://{addr}", crate::logo());
    println!("   Provider: {provider}  Model: {model}");
    println!("   Press Ctrl+C to stop.");
    tracing::info!(%addr, provider = %provider, model = %model, "Gateway started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Gateway server error")?;

    tracing::info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
}

fn is_loopback(host: &str) -> bool {
    matches!(host, "localhost" | "::1") || host.starts_with("127.")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_detection() {
        assert!(is_loopback("127.0.0.1"));
        assert!(is_loopback("localhost"));
        assert!(!is_loopback("0.0.0.0"));
    }

    #[test]
    fn sessions_start_with_system_prompt() {
        let state = AppState::new(Config::default(), DefaultProviderRegistry::new(), "sys");
        let conv = state.checkout_session("abc");
        assert_eq!(conv.system_prompt(), Some("sys"));
        assert!(conv.is_empty());
        assert!(state.sessions.is_empty());

        state.store_session("abc", conv);
        assert_eq!(state.sessions.len(), 1);
    }

    #[test]
    fn session_count_follows_configured_cap() {
        let mut config = Config::default();
        config.gateway.max_sessions = 2;
        let state = AppState::new(config, DefaultProviderRegistry::new(), "sys");
        for id in ["a", "b", "c", "d"] {
            let conv = state.checkout_session(id);
            state.store_session(id, conv);
        }
        assert_eq!(state.sessions.len(), 2);
        assert!(state.sessions.contains("d"));
    }
}
