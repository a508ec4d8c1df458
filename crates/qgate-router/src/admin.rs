use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, patch, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tokio::sync::Mutex;
use tracing::info;

use qgate_common::GatewayConfig;
use qgate_core::{
    generate_pkce, AuthManager, DeviceExchange, ProviderPool, QuotaManager, ScanMode,
};
use qgate_storage::{BlobStore, SeaOrmStorage, Storage};

/// One in-flight device-code enrollment, keyed by device code.
#[derive(Clone)]
struct PendingAuth {
    code_verifier: String,
    creds_key: String,
}

#[derive(Clone)]
pub struct AdminState {
    pub config: Arc<ArcSwap<GatewayConfig>>,
    pub storage: Arc<SeaOrmStorage>,
    pub blob: Arc<dyn BlobStore>,
    pub client: Arc<dyn qgate_core::UpstreamClient>,
    pub quota: Arc<QuotaManager>,
    pub pool: Arc<ProviderPool>,
    pending_auth: Arc<Mutex<HashMap<String, PendingAuth>>>,
}

impl AdminState {
    pub fn new(
        config: Arc<ArcSwap<GatewayConfig>>,
        storage: Arc<SeaOrmStorage>,
        blob: Arc<dyn BlobStore>,
        client: Arc<dyn qgate_core::UpstreamClient>,
        quota: Arc<QuotaManager>,
        pool: Arc<ProviderPool>,
    ) -> Self {
        Self {
            config,
            storage,
            blob,
            client,
            quota,
            pool,
            pending_auth: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

pub fn admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/api/stats", get(stats))
        .route("/api/auth/start", post(auth_start))
        .route("/api/auth/poll", post(auth_poll))
        .route("/api/providers/alias", patch(rename_alias))
        .route("/api/providers", delete(remove_provider))
        .route("/api/providers/rescan", post(rescan))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth))
        .with_state(state)
}

async fn admin_auth(
    State(state): State<AdminState>,
    headers: HeaderMap,
    req: axum::http::Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let expected = state.config.load().admin_key.clone();
    let provided = headers
        .get("x-admin-key")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    match provided {
        Some(key) if key == expected => Ok(next.run(req).await),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

async fn stats(State(state): State<AdminState>) -> Json<JsonValue> {
    let snapshots = state.pool.snapshots().await;
    let ids: Vec<String> = snapshots.iter().map(|s| s.id.clone()).collect();
    let usage = state.quota.usage_batch(&ids).await;
    let globals = state.storage.global_counters().await.unwrap_or_default();
    let audit = state.quota.recent_audit(50).await;

    let providers: Vec<JsonValue> = snapshots
        .into_iter()
        .map(|snapshot| {
            let account_usage = usage.get(&snapshot.id).copied().unwrap_or_default();
            json!({
                "id": snapshot.id,
                "alias": snapshot.alias,
                "status": snapshot.status,
                "last_error": snapshot.last_error,
                "total_requests": snapshot.total_requests,
                "error_count": snapshot.error_count,
                "last_latency_ms": snapshot.last_latency_ms,
                "last_used_at_ms": snapshot.last_used_at_ms,
                "retry_after_ms": snapshot.retry_after_ms,
                "usage": account_usage,
            })
        })
        .collect();

    Json(json!({
        "uptime_start": globals.get("uptime_start"),
        "globals": globals,
        "providers": providers,
        "recent_audit": audit,
    }))
}

async fn auth_start(State(state): State<AdminState>) -> Response {
    let (code_verifier, code_challenge) = generate_pkce();
    let creds_key = qgate_core::credential::new_creds_key();
    let auth = AuthManager::new(
        &creds_key,
        state.config.load().oauth_client_id.clone(),
        state.blob.clone(),
        state.client.clone(),
    );

    match auth.start_device_auth(&code_challenge).await {
        Ok(device) => {
            state.pending_auth.lock().await.insert(
                device.device_code.clone(),
                PendingAuth {
                    code_verifier,
                    creds_key,
                },
            );
            Json(json!({
                "device_code": device.device_code,
                "user_code": device.user_code,
                "verification_uri": device.verification_uri,
                "verification_uri_complete": device.verification_uri_complete,
                "expires_in": device.expires_in,
                "interval": device.interval,
            }))
            .into_response()
        }
        Err(err) => gateway_error(StatusCode::BAD_GATEWAY, &err.to_string()),
    }
}

#[derive(Deserialize)]
struct AuthPollBody {
    device_code: Option<String>,
}

async fn auth_poll(State(state): State<AdminState>, body: Json<AuthPollBody>) -> Response {
    let Some(device_code) = body.device_code.clone() else {
        return gateway_error(StatusCode::BAD_REQUEST, "missing device_code");
    };
    let pending = state.pending_auth.lock().await.get(&device_code).cloned();
    let Some(pending) = pending else {
        return gateway_error(StatusCode::NOT_FOUND, "unknown device_code");
    };

    let auth = AuthManager::new(
        &pending.creds_key,
        state.config.load().oauth_client_id.clone(),
        state.blob.clone(),
        state.client.clone(),
    );
    match auth
        .exchange_device_code(&device_code, &pending.code_verifier)
        .await
    {
        Ok(DeviceExchange::Pending) => Json(json!({ "status": "pending" })).into_response(),
        Ok(DeviceExchange::Complete(_)) => {
            state.pending_auth.lock().await.remove(&device_code);
            state.pool.register_account(&pending.creds_key).await;
            info!(event = "account_enrolled", provider = %pending.creds_key);
            Json(json!({ "status": "complete", "id": pending.creds_key })).into_response()
        }
        Err(err) => gateway_error(StatusCode::BAD_GATEWAY, &err.to_string()),
    }
}

#[derive(Deserialize)]
struct IdQuery {
    id: Option<String>,
}

#[derive(Deserialize)]
struct AliasBody {
    alias: Option<String>,
}

async fn rename_alias(
    State(state): State<AdminState>,
    Query(query): Query<IdQuery>,
    body: Json<AliasBody>,
) -> Response {
    let Some(id) = query.id else {
        return gateway_error(StatusCode::BAD_REQUEST, "missing id");
    };
    let alias = match body.alias.as_deref().map(str::trim) {
        Some(alias) if !alias.is_empty() => alias.to_string(),
        _ => return gateway_error(StatusCode::BAD_REQUEST, "missing alias"),
    };
    if state.pool.rename_alias(&id, &alias).await {
        Json(json!({ "success": true, "id": id, "alias": alias })).into_response()
    } else {
        gateway_error(StatusCode::INTERNAL_SERVER_ERROR, "alias update failed")
    }
}

async fn remove_provider(
    State(state): State<AdminState>,
    Query(query): Query<IdQuery>,
) -> Response {
    let Some(id) = query.id else {
        return gateway_error(StatusCode::BAD_REQUEST, "missing id");
    };
    if state.pool.remove(&id).await {
        info!(event = "account_removed", provider = %id);
        Json(json!({ "success": true, "id": id })).into_response()
    } else {
        gateway_error(StatusCode::NOT_FOUND, "unknown provider")
    }
}

#[derive(Deserialize)]
struct RescanQuery {
    mode: Option<String>,
}

async fn rescan(State(state): State<AdminState>, Query(query): Query<RescanQuery>) -> Response {
    let mode = match query.mode.as_deref() {
        Some("full") => ScanMode::Full,
        Some("light") | None => ScanMode::Light,
        Some(other) => {
            return gateway_error(
                StatusCode::BAD_REQUEST,
                &format!("unknown rescan mode: {other}"),
            )
        }
    };
    let size = state.pool.refresh(mode).await;
    Json(json!({ "success": true, "providers": size })).into_response()
}

fn gateway_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}
