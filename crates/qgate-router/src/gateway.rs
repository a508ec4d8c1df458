use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::{json, Value as JsonValue};
use tokio_stream::wrappers::ReceiverStream;

use qgate_common::GatewayConfig;
use qgate_core::{Dispatcher, UpstreamBody, UpstreamHttpResponse};

#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<ArcSwap<GatewayConfig>>,
    pub dispatcher: Arc<Dispatcher>,
}

/// OpenAI-compatible surface plus the ancillary web-search tool, behind the
/// single shared bearer.
pub fn gateway_router(state: GatewayState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/tools/web_search", post(web_search))
        .layer(middleware::from_fn_with_state(state.clone(), bearer_auth))
        .route("/health", get(health))
        .with_state(state)
}

async fn bearer_auth(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    req: axum::http::Request<Body>,
    next: Next,
) -> Result<Response, Response> {
    let expected = state.config.load().api_key.clone();
    match extract_bearer(&headers) {
        Some(key) if key == expected => Ok(next.run(req).await),
        Some(_) => Err(json_error(StatusCode::FORBIDDEN, "invalid api key")),
        None => Err(json_error(StatusCode::UNAUTHORIZED, "missing api key")),
    }
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get("x-api-key") {
        if let Ok(text) = value.to_str() {
            let text = text.trim();
            if !text.is_empty() {
                return Some(text.to_string());
            }
        }
    }
    let auth = headers.get("authorization")?.to_str().ok()?.trim();
    let token = auth
        .strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))?;
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

async fn chat_completions(State(state): State<GatewayState>, body: Bytes) -> Response {
    let Ok(mut payload) = serde_json::from_slice::<JsonValue>(&body) else {
        return json_error(StatusCode::BAD_REQUEST, "invalid JSON body");
    };
    remap_model(&mut payload, &state.config.load().model_mappings);
    let response = state.dispatcher.handle_chat(&payload).await;
    into_axum_response(response)
}

#[derive(serde::Deserialize)]
struct SearchBody {
    query: Option<String>,
}

async fn web_search(State(state): State<GatewayState>, body: Bytes) -> Response {
    let parsed: SearchBody = match serde_json::from_slice(&body) {
        Ok(parsed) => parsed,
        Err(_) => return json_error(StatusCode::BAD_REQUEST, "invalid JSON body"),
    };
    let query = match parsed.query.as_deref().map(str::trim) {
        Some(query) if !query.is_empty() => query.to_string(),
        _ => return json_error(StatusCode::BAD_REQUEST, "missing query"),
    };
    let response = state.dispatcher.handle_search(&query).await;
    into_axum_response(response)
}

async fn health(State(state): State<GatewayState>) -> Json<JsonValue> {
    let providers = state.dispatcher.pool().len().await;
    Json(json!({ "status": "ok", "providers": providers }))
}

/// Inbound model name rewrite: exact match first, then longest prefix.
pub fn remap_model(payload: &mut JsonValue, mappings: &HashMap<String, String>) {
    if mappings.is_empty() {
        return;
    }
    let Some(model) = payload.get("model").and_then(JsonValue::as_str) else {
        return;
    };
    let replacement = mappings.get(model).cloned().or_else(|| {
        mappings
            .iter()
            .filter(|(prefix, _)| model.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, target)| target.clone())
    });
    if let Some(target) = replacement {
        payload["model"] = JsonValue::String(target);
    }
}

/// Mirror a core response into axum, streaming SSE bodies chunk by chunk.
pub fn into_axum_response(response: UpstreamHttpResponse) -> Response {
    let status =
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut out = match response.body {
        UpstreamBody::Bytes(bytes) => Response::new(Body::from(bytes)),
        UpstreamBody::Stream(rx) => Response::new(Body::from_stream(
            ReceiverStream::new(rx).map(Ok::<Bytes, Infallible>),
        )),
    };
    *out.status_mut() = status;
    for (name, value) in &response.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            out.headers_mut().insert(name, value);
        }
    }
    out
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remap_prefers_exact_match_over_prefix() {
        let mappings = HashMap::from([
            ("coder".to_string(), "qwen3-coder-plus".to_string()),
            ("coder-mini".to_string(), "qwen3-coder-flash".to_string()),
        ]);
        let mut payload = json!({ "model": "coder-mini" });
        remap_model(&mut payload, &mappings);
        assert_eq!(payload["model"], "qwen3-coder-flash");

        let mut payload = json!({ "model": "coder-mini-extra" });
        remap_model(&mut payload, &mappings);
        assert_eq!(payload["model"], "qwen3-coder-flash");

        let mut payload = json!({ "model": "unrelated" });
        remap_model(&mut payload, &mappings);
        assert_eq!(payload["model"], "unrelated");
    }

    #[test]
    fn bearer_extraction_accepts_both_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer sk-abc".parse().unwrap());
        assert_eq!(extract_bearer(&headers).as_deref(), Some("sk-abc"));

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "sk-xyz".parse().unwrap());
        assert_eq!(extract_bearer(&headers).as_deref(), Some("sk-xyz"));

        assert!(extract_bearer(&HeaderMap::new()).is_none());
    }
}
