//! REST API handlers for the gateway.
//!
//! All `/v1/*` and `/api/*` routes require bearer token authentication when
//! `gateway.authToken` is set.

use super::AppState;
use crate::agent::Agent;
use crate::infra::{UsagePeriod, UsageTracker as _};
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use serde_json::json;

// ── Bearer token auth extractor ─────────────────────────────────

/// Extract and validate bearer token from Authorization header.
fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Verify the bearer token against `gateway.authToken`. Returns an error response if unauthorized.
fn require_auth(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = state
        .config
        .gateway
        .auth_token
        .as_deref()
        .filter(|token| !token.is_empty())
    else {
        return Ok(());
    };

    match extract_bearer_token(headers) {
        Some(token) if token == expected => Ok(()),
        _ => Err(error_response(
            StatusCode::UNAUTHORIZED,
            "Unauthorized: send Authorization: Bearer <gateway.authToken>",
        )),
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

// ── Request bodies and query parameters ─────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatBody {
    pub message: String,
    #[serde(default, alias = "session_id")]
    pub session_id: Option<String>,
}

#[derive(Deserialize)]
pub struct UsageQuery {
    pub period: Option<String>,
}

// ── Handlers ────────────────────────────────────────────────────

/// GET /health — liveness probe, no auth
pub async fn handle_health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// POST /v1/chat — send a message within a session
pub async fn handle_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ChatBody>, axum::extract::rejection::JsonRejection>,
) -> Response {
    if let Err(e) = require_auth(&state, &headers) {
        return e;
    }

    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return error_response(rejection.status(), rejection.body_text());
        }
    };
    let message = body.message.trim();
    if message.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "message must not be empty");
    }

    let session_id = body
        .session_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let provider_name = state.provider_name();
    let provider = match state.registry.resolve(Some(&provider_name)) {
        Ok(provider) => provider,
        Err(e) => return error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    };
    let agent = Agent::from_config(&state.config, provider, &provider_name)
        .with_usage_tracker(state.usage.clone());

    // The history is copied out so no lock is held while the model runs.
    let mut conversation = state.checkout_session(&session_id);
    let result = agent.try_process_message(&mut conversation, message).await;

    match result {
        Ok(response) => {
            state.store_session(&session_id, conversation);
            Json(json!({
                "response": response.content,
                "finishReason": response.finish_reason,
                "usage": response.usage,
                "toolCalls": response.tool_calls,
                "sessionId": session_id,
            }))
            .into_response()
        }
        Err(e) => {
            let failed = crate::providers::ChatResponse::from_error(&e);
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({
                    "error": failed.content,
                    "response": failed.content,
                    "finishReason": failed.finish_reason,
                    "usage": null,
                    "toolCalls": [],
                    "sessionId": session_id,
                })),
            )
                .into_response()
        }
    }
}

/// DELETE /v1/sessions/{id} — forget a session's history
pub async fn handle_session_delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Err(e) = require_auth(&state, &headers) {
        return e;
    }

    if state.sessions.remove(&id) {
        Json(json!({ "deleted": id })).into_response()
    } else {
        error_response(StatusCode::NOT_FOUND, format!("Unknown session: {id}"))
    }
}

/// GET /api/status — system status overview
pub async fn handle_api_status(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(e) = require_auth(&state, &headers) {
        return e;
    }

    let defaults = &state.config.agents.defaults;
    let sessions = state.sessions.len();

    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "provider": state.provider_name(),
        "providers": state.registry.list(),
        "model": defaults.model,
        "temperature": defaults.temperature,
        "maxTokens": defaults.max_tokens,
        "enableThinking": defaults.enable_thinking,
        "uptimeSeconds": state.started_at.elapsed().as_secs(),
        "gatewayPort": state.config.gateway.port,
        "sessions": sessions,
    }))
    .into_response()
}

/// GET /api/config — current config with secrets masked
pub async fn handle_api_config(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(e) = require_auth(&state, &headers) {
        return e;
    }

    match state.config.to_masked_json() {
        Ok(value) => Json(value).into_response(),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to serialize config: {e}"),
        ),
    }
}

/// GET /api/usage — token usage summary and per-model breakdown
pub async fn handle_api_usage(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<UsageQuery>,
) -> Response {
    if let Err(e) = require_auth(&state, &headers) {
        return e;
    }

    let period: UsagePeriod = match params.period.as_deref().unwrap_or("all").parse() {
        Ok(period) => period,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };

    let summary = state.usage.summary(period).await;
    let breakdown = state.usage.breakdown(period).await;
    match (summary, breakdown) {
        (Ok(summary), Ok(breakdown)) => {
            Json(json!({ "summary": summary, "breakdown": breakdown })).into_response()
        }
        (Err(e), _) | (_, Err(e)) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Usage lookup failed: {e}"),
        ),
    }
}
