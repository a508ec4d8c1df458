use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info, warn};

use crate::auth_manager::{AuthError, AuthManager};
use crate::clock;
use crate::credential::{chat_api_base, normalized_resource_base};
use crate::dedup::{dedup_stream, SseDedup};
use crate::deferred::DeferredTasks;
use crate::error::AccountFailure;
use crate::payload::{prepare_chat_payload, wants_stream};
use crate::quota::{QuotaManager, UsageKind};
use crate::upstream_client::{
    Headers, TransportError, TransportErrorKind, UpstreamBody, UpstreamClient,
    UpstreamHttpRequest, UpstreamHttpResponse,
};

pub const COOLDOWN_MS: i64 = 15_000;

const CHAT_TIMEOUT: Duration = Duration::from_secs(60);
const SEARCH_TIMEOUT: Duration = Duration::from_secs(30);
const QWEN_USER_AGENT: &str = "QwenCode/0.9.1 (linux; x64)";

/// Hop-by-hop headers never forwarded from upstream.
const FILTERED_HEADERS: [&str; 4] = [
    "content-encoding",
    "content-length",
    "transfer-encoding",
    "connection",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderStatus {
    Initializing,
    Active,
    Error,
    Inactive,
}

impl ProviderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderStatus::Initializing => "initializing",
            ProviderStatus::Active => "active",
            ProviderStatus::Error => "error",
            ProviderStatus::Inactive => "inactive",
        }
    }
}

/// In-memory runtime state for one account; never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderRuntimeState {
    pub id: String,
    pub alias: Option<String>,
    pub status: ProviderStatus,
    pub last_error: Option<String>,
    pub total_requests: u64,
    pub error_count: u64,
    pub last_latency_ms: Option<u64>,
    pub last_used_at_ms: Option<i64>,
    pub retry_after_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub content: String,
    pub score: Option<f64>,
    #[serde(rename = "publishedDate")]
    pub published_date: Option<String>,
}

/// One upstream OAuth identity plus its runtime circuit breaker.
///
/// State machine: `initializing -> (active | error)`; a runtime failure sets
/// `error` plus a cooldown, and the next successful attempt after the
/// cooldown is itself the recovery signal. There is no recovery probe.
pub struct AccountProvider {
    id: String,
    auth: AuthManager,
    client: Arc<dyn UpstreamClient>,
    quota: Arc<QuotaManager>,
    deferred: DeferredTasks,
    state: Mutex<ProviderRuntimeState>,
    retry_after_ms: AtomicI64,
}

impl AccountProvider {
    pub fn new(
        id: &str,
        auth: AuthManager,
        client: Arc<dyn UpstreamClient>,
        quota: Arc<QuotaManager>,
        deferred: DeferredTasks,
    ) -> Self {
        let id = qgate_storage::canonical_id(id).to_string();
        Self {
            state: Mutex::new(ProviderRuntimeState {
                id: id.clone(),
                alias: None,
                status: ProviderStatus::Initializing,
                last_error: None,
                total_requests: 0,
                error_count: 0,
                last_latency_ms: None,
                last_used_at_ms: None,
                retry_after_ms: 0,
            }),
            id,
            auth,
            client,
            quota,
            deferred,
            retry_after_ms: AtomicI64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn auth(&self) -> &AuthManager {
        &self.auth
    }

    pub fn alias(&self) -> String {
        let state = self.lock_state();
        state
            .alias
            .clone()
            .unwrap_or_else(|| self.auth.cached_alias())
    }

    pub fn set_alias(&self, alias: Option<String>) {
        self.lock_state().alias = alias;
    }

    pub fn snapshot(&self) -> ProviderRuntimeState {
        let mut state = self.lock_state().clone();
        state.retry_after_ms = self.retry_after_ms.load(Ordering::SeqCst);
        state
    }

    /// Load credentials and assume `active` without probing. A cold-start
    /// probe would burn free-tier quota and, fanned out across many
    /// instances, can trigger a spurious 429 storm.
    pub async fn initialize(&self) {
        match self.auth.get_valid().await {
            Ok(_) => {
                let mut state = self.lock_state();
                state.status = ProviderStatus::Active;
                state.last_error = None;
            }
            Err(AuthError::NoCredentials) => {
                let mut state = self.lock_state();
                state.status = ProviderStatus::Error;
                state.last_error = Some("Missing Credentials".to_string());
            }
            Err(AuthError::AuthExpired) => {
                let mut state = self.lock_state();
                state.status = ProviderStatus::Error;
                state.last_error = Some("Unauthorized (Please Login)".to_string());
            }
            Err(err) => {
                warn!(event = "provider_init_failed", provider = %self.id, error = %err);
                let mut state = self.lock_state();
                state.status = ProviderStatus::Error;
                state.last_error = Some(err.to_string());
            }
        }
    }

    /// Circuit breaker: eligible once the cooldown timestamp has passed.
    pub fn can_attempt(&self, now_ms: i64) -> bool {
        now_ms >= self.retry_after_ms.load(Ordering::SeqCst)
    }

    pub async fn handle_chat(
        &self,
        payload: &JsonValue,
    ) -> Result<UpstreamHttpResponse, AccountFailure> {
        let started = Instant::now();
        let result = self.chat_inner(payload).await;
        match &result {
            Ok(response) => {
                self.mark_success(started.elapsed().as_millis() as u64);
                let quota = self.quota.clone();
                let id = self.id.clone();
                self.deferred
                    .defer(async move { quota.increment_usage(&id, UsageKind::Chat) });
                debug!(event = "chat_ok", provider = %self.id, status = response.status);
            }
            Err(failure) => {
                self.mark_failure(failure);
                self.quota
                    .record_failure(&self.id, UsageKind::Chat, &failure.audit_reason());
                info!(event = "chat_failed", provider = %self.id, error = %failure);
            }
        }
        result
    }

    async fn chat_inner(
        &self,
        payload: &JsonValue,
    ) -> Result<UpstreamHttpResponse, AccountFailure> {
        let mut creds = self.auth.get_valid().await.map_err(map_auth_error)?;
        let is_stream = wants_stream(payload);
        let mut body = payload.clone();
        prepare_chat_payload(&mut body);
        let encoded = Bytes::from(body.to_string());

        let mut force_refreshed = false;
        loop {
            let url = format!(
                "{}/chat/completions",
                chat_api_base(creds.resource_url.as_deref())
            );
            let mut request = UpstreamHttpRequest::post(url, CHAT_TIMEOUT)
                .header("authorization", format!("Bearer {}", creds.access_token))
                .header("x-dashscope-authtype", "qwen-oauth")
                .header("x-dashscope-cachecontrol", "enable")
                .header("x-dashscope-useragent", QWEN_USER_AGENT)
                .header("user-agent", QWEN_USER_AGENT)
                .header("content-type", "application/json");
            request.body = Some(encoded.clone());
            request.is_stream = is_stream;

            let response = self
                .client
                .send(request)
                .await
                .map_err(|err| map_transport_error(err, CHAT_TIMEOUT))?;

            if response.status == 401 && !force_refreshed {
                // Single forced refresh, then one retry. AUTH_EXPIRED from
                // the refresh itself bubbles up untouched.
                force_refreshed = true;
                creds = self
                    .auth
                    .refresh(&creds.refresh_token)
                    .await
                    .map_err(map_auth_error)?;
                continue;
            }

            if !response.is_success() {
                let detail = response
                    .body
                    .as_bytes()
                    .map(|b| String::from_utf8_lossy(b).to_string())
                    .unwrap_or_default();
                return Err(classify_upstream_error(response.status, &detail));
            }

            return Ok(self.build_passthrough(response));
        }
    }

    fn build_passthrough(&self, response: UpstreamHttpResponse) -> UpstreamHttpResponse {
        let headers: Headers = response
            .headers
            .iter()
            .filter(|(name, _)| {
                !FILTERED_HEADERS
                    .iter()
                    .any(|h| name.eq_ignore_ascii_case(h))
            })
            .cloned()
            .collect();

        let is_sse = response
            .header("content-type")
            .map(|v| v.contains("text/event-stream"))
            .unwrap_or(false);

        let body = match response.body {
            UpstreamBody::Stream(rx) if is_sse => UpstreamBody::Stream(dedup_stream(rx)),
            UpstreamBody::Bytes(bytes) if is_sse => {
                let mut dedup = SseDedup::new();
                let mut out = Vec::new();
                for event in dedup.push(&bytes) {
                    out.extend_from_slice(&event);
                }
                if let Some(rest) = dedup.finish() {
                    out.extend_from_slice(&rest);
                }
                UpstreamBody::Bytes(Bytes::from(out))
            }
            other => other,
        };

        UpstreamHttpResponse {
            status: response.status,
            headers,
            body,
        }
    }

    pub async fn handle_search(
        &self,
        query: &str,
    ) -> Result<Vec<SearchResult>, AccountFailure> {
        let result = self.search_inner(query).await;
        match &result {
            Ok(_) => {
                self.mark_success(0);
                let quota = self.quota.clone();
                let id = self.id.clone();
                self.deferred
                    .defer(async move { quota.increment_usage(&id, UsageKind::Search) });
            }
            Err(failure) => {
                self.mark_failure(failure);
                self.quota
                    .record_failure(&self.id, UsageKind::Search, &failure.audit_reason());
            }
        }
        result
    }

    async fn search_inner(&self, query: &str) -> Result<Vec<SearchResult>, AccountFailure> {
        let creds = self.auth.get_valid().await.map_err(map_auth_error)?;
        let url = format!(
            "{}/api/v1/indices/plugin/web_search",
            normalized_resource_base(creds.resource_url.as_deref())
        );
        let request = UpstreamHttpRequest::post(url, SEARCH_TIMEOUT)
            .header("authorization", format!("Bearer {}", creds.access_token))
            .header("x-dashscope-authtype", "qwen-oauth")
            .header("user-agent", QWEN_USER_AGENT)
            .json_body(&json!({ "uq": query, "page": 1, "rows": 10 }));

        let response = self
            .client
            .send(request)
            .await
            .map_err(|err| map_transport_error(err, SEARCH_TIMEOUT))?;

        let bytes = response.body.as_bytes().cloned().unwrap_or_default();
        if !response.is_success() {
            let detail = String::from_utf8_lossy(&bytes).to_string();
            return Err(classify_upstream_error(response.status, &detail));
        }

        let parsed: JsonValue = serde_json::from_slice(&bytes)
            .map_err(|err| AccountFailure::InvalidPayload(err.to_string()))?;
        let status = parsed
            .get("status")
            .or_else(|| parsed.get("data").and_then(|d| d.get("status")))
            .and_then(JsonValue::as_i64)
            .unwrap_or(0);
        if status != 0 {
            return Err(AccountFailure::InvalidPayload(format!(
                "search status {status}"
            )));
        }

        Ok(normalize_search_results(&parsed))
    }

    fn mark_success(&self, latency_ms: u64) {
        let now = clock::now_unix_ms();
        self.retry_after_ms.store(0, Ordering::SeqCst);
        let mut state = self.lock_state();
        state.status = ProviderStatus::Active;
        state.last_error = None;
        state.total_requests += 1;
        state.last_latency_ms = Some(latency_ms);
        state.last_used_at_ms = Some(now);
    }

    fn mark_failure(&self, failure: &AccountFailure) {
        let now = clock::now_unix_ms();
        self.retry_after_ms.store(now + COOLDOWN_MS, Ordering::SeqCst);
        let mut state = self.lock_state();
        state.status = ProviderStatus::Error;
        state.last_error = Some(failure.to_string());
        state.error_count += 1;
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ProviderRuntimeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn map_auth_error(err: AuthError) -> AccountFailure {
    match err {
        AuthError::NoCredentials => AccountFailure::MissingCredentials,
        AuthError::AuthExpired => AccountFailure::AuthExpired,
        AuthError::LockWaitTimeout => AccountFailure::RefreshLockTimeout,
        AuthError::Transport(message) => AccountFailure::Transport(message),
        AuthError::Http { status, detail } => AccountFailure::Upstream { status, detail },
        other => AccountFailure::Transport(other.to_string()),
    }
}

fn map_transport_error(err: TransportError, limit: Duration) -> AccountFailure {
    match err.kind {
        TransportErrorKind::Timeout => AccountFailure::Timeout(limit.as_secs()),
        _ => AccountFailure::Transport(err.message),
    }
}

/// 429 bodies naming free-tier exhaustion are a distinct failure class so
/// operators can tell quota exhaustion from burst throttling.
fn classify_upstream_error(status: u16, body: &str) -> AccountFailure {
    if status == 429 {
        let lowered = body.to_ascii_lowercase();
        if lowered.contains("insufficient_quota")
            || lowered.contains("free allocated quota exceeded")
        {
            return AccountFailure::QuotaExceeded;
        }
        return AccountFailure::RateLimited;
    }
    AccountFailure::Upstream {
        status,
        detail: body.chars().take(512).collect(),
    }
}

fn normalize_search_results(payload: &JsonValue) -> Vec<SearchResult> {
    let data = payload.get("data");
    let items = data
        .and_then(JsonValue::as_array)
        .or_else(|| {
            data.and_then(|d| d.get("items"))
                .and_then(JsonValue::as_array)
        })
        .or_else(|| {
            data.and_then(|d| d.get("results"))
                .and_then(JsonValue::as_array)
        });

    let Some(items) = items else {
        return Vec::new();
    };

    items
        .iter()
        .map(|item| SearchResult {
            title: str_field(item, "title"),
            url: str_field(item, "url"),
            content: str_field(item, "snippet"),
            score: item.get("_score").and_then(JsonValue::as_f64),
            published_date: item
                .get("timestamp_format")
                .and_then(JsonValue::as_str)
                .map(|s| s.to_string()),
        })
        .collect()
}

fn str_field(item: &JsonValue, key: &str) -> String {
    item.get(key)
        .and_then(JsonValue::as_str)
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream_client::test_support::MockUpstreamClient;
    use qgate_common::QuotaConfig;
    use qgate_storage::{BlobStore, MemoryBlobStore};
    use serde_json::json;

    async fn provider_with(
        client: Arc<MockUpstreamClient>,
    ) -> (AccountProvider, Arc<MemoryBlobStore>) {
        let blob = Arc::new(MemoryBlobStore::new());
        blob.set(
            "qwen_creds_ab12cd34.json",
            &json!({
                "accessToken": "at",
                "refreshToken": "rt",
                "resourceUrl": "portal.qwen.ai",
                "expiryUnixMs": 0
            }),
            None,
        )
        .await
        .unwrap();
        let auth = AuthManager::new(
            "qwen_creds_ab12cd34.json",
            "client-id",
            blob.clone(),
            client.clone(),
        );
        let quota = QuotaManager::new(None, QuotaConfig::default(), true);
        let provider = AccountProvider::new(
            "qwen_creds_ab12cd34.json",
            auth,
            client,
            quota,
            DeferredTasks::spawn(),
        );
        (provider, blob)
    }

    fn chat_payload() -> JsonValue {
        json!({
            "model": "coder-model",
            "messages": [{ "role": "user", "content": "hi" }],
        })
    }

    #[tokio::test]
    async fn successful_chat_marks_active_and_sets_headers() {
        let client = Arc::new(MockUpstreamClient::new());
        client.push_json(200, json!({ "choices": [] }));
        let (provider, _) = provider_with(client.clone()).await;

        let response = provider.handle_chat(&chat_payload()).await.unwrap();
        assert_eq!(response.status, 200);

        let snapshot = provider.snapshot();
        assert_eq!(snapshot.status, ProviderStatus::Active);
        assert_eq!(snapshot.total_requests, 1);
        assert_eq!(snapshot.retry_after_ms, 0);

        let requests = client.requests();
        assert_eq!(requests.len(), 1);
        let req = &requests[0];
        assert_eq!(
            req.url,
            "https://portal.qwen.ai/v1/chat/completions"
        );
        let header = |name: &str| {
            req.headers
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
        };
        assert_eq!(header("x-dashscope-authtype").as_deref(), Some("qwen-oauth"));
        assert_eq!(header("authorization").as_deref(), Some("Bearer at"));
        assert_eq!(
            header("user-agent").as_deref(),
            Some("QwenCode/0.9.1 (linux; x64)")
        );

        // The outbound body carries the injected system message.
        let body: JsonValue = serde_json::from_slice(req.body.as_ref().unwrap()).unwrap();
        assert_eq!(body["messages"][0]["role"], "system");
    }

    #[tokio::test]
    async fn unauthorized_once_refreshes_and_retries() {
        let client = Arc::new(MockUpstreamClient::new());
        client.push_json(401, json!({ "error": "invalid token" }));
        client.push_json(
            200,
            json!({ "access_token": "at2", "refresh_token": "rt2", "expires_in": 3600 }),
        );
        client.push_json(200, json!({ "choices": [] }));
        let (provider, blob) = provider_with(client.clone()).await;

        let response = provider.handle_chat(&chat_payload()).await.unwrap();
        assert_eq!(response.status, 200);

        let requests = client.requests();
        assert_eq!(requests.len(), 3);
        assert!(requests[1].url.contains("oauth2/token"));

        // The rotated credential was persisted.
        let stored = blob.get("qwen_creds_ab12cd34.json").await.unwrap().unwrap();
        assert_eq!(stored["accessToken"], "at2");
        assert_eq!(provider.snapshot().status, ProviderStatus::Active);
    }

    #[tokio::test]
    async fn second_unauthorized_fails_without_more_retries() {
        let client = Arc::new(MockUpstreamClient::new());
        client.push_json(401, json!({}));
        client.push_json(
            200,
            json!({ "access_token": "at2", "refresh_token": "rt2", "expires_in": 3600 }),
        );
        client.push_json(401, json!({}));
        let (provider, _) = provider_with(client.clone()).await;

        let failure = provider.handle_chat(&chat_payload()).await.unwrap_err();
        assert!(matches!(failure, AccountFailure::Upstream { status: 401, .. }));
        assert_eq!(client.requests().len(), 3);
    }

    #[tokio::test]
    async fn quota_exhausted_body_is_distinct_from_rate_limit() {
        let client = Arc::new(MockUpstreamClient::new());
        client.push_json(429, json!({ "error": "insufficient_quota" }));
        let (provider, _) = provider_with(client.clone()).await;
        let failure = provider.handle_chat(&chat_payload()).await.unwrap_err();
        assert!(matches!(failure, AccountFailure::QuotaExceeded));

        let client = Arc::new(MockUpstreamClient::new());
        client.push_json(429, json!({ "error": "Too Many Requests" }));
        let (provider, _) = provider_with(client.clone()).await;
        let failure = provider.handle_chat(&chat_payload()).await.unwrap_err();
        assert!(matches!(failure, AccountFailure::RateLimited));
    }

    #[tokio::test]
    async fn failure_opens_the_circuit_breaker() {
        let client = Arc::new(MockUpstreamClient::new());
        client.push_json(500, json!({}));
        let (provider, _) = provider_with(client.clone()).await;

        let failure = provider.handle_chat(&chat_payload()).await.unwrap_err();
        assert!(matches!(failure, AccountFailure::Upstream { status: 500, .. }));

        let now = clock::now_unix_ms();
        assert!(!provider.can_attempt(now));
        assert!(provider.can_attempt(now + COOLDOWN_MS + 1));
        assert_eq!(provider.snapshot().status, ProviderStatus::Error);
    }

    #[tokio::test]
    async fn timeout_is_reported_with_its_deadline() {
        let client = Arc::new(MockUpstreamClient::new());
        client.push_transport(TransportError::timeout(CHAT_TIMEOUT));
        let (provider, _) = provider_with(client.clone()).await;

        let failure = provider.handle_chat(&chat_payload()).await.unwrap_err();
        assert_eq!(failure.to_string(), "Upstream Timeout (60s)");
    }

    #[tokio::test]
    async fn streamed_response_is_deduplicated() {
        let client = Arc::new(MockUpstreamClient::new());
        let event = |content: &str| {
            Bytes::from(format!(
                "data: {{\"choices\":[{{\"delta\":{{\"content\":\"{content}\"}}}}]}}\n\n"
            ))
        };
        client.push_stream(
            200,
            vec![
                event("hello"),
                event("hello"),
                event("world"),
                Bytes::from_static(b"data: [DONE]\n\n"),
            ],
        );
        let (provider, _) = provider_with(client.clone()).await;

        let mut payload = chat_payload();
        payload["stream"] = json!(true);
        let response = provider.handle_chat(&payload).await.unwrap();

        let UpstreamBody::Stream(mut rx) = response.body else {
            panic!("expected a stream body");
        };
        let mut seen = Vec::new();
        while let Some(chunk) = rx.recv().await {
            seen.push(String::from_utf8_lossy(&chunk).to_string());
        }
        assert_eq!(seen.len(), 3);
        assert!(seen[0].contains("hello"));
        assert!(seen[1].contains("world"));
        assert_eq!(seen[2], "data: [DONE]\n\n");
    }

    #[tokio::test]
    async fn hop_by_hop_headers_are_filtered() {
        let client = Arc::new(MockUpstreamClient::new());
        client.push_body(
            200,
            vec![
                ("content-type".to_string(), "application/json".to_string()),
                ("content-length".to_string(), "2".to_string()),
                ("transfer-encoding".to_string(), "chunked".to_string()),
                ("x-request-id".to_string(), "abc".to_string()),
            ],
            Bytes::from_static(b"{}"),
        );
        let (provider, _) = provider_with(client.clone()).await;

        let response = provider.handle_chat(&chat_payload()).await.unwrap();
        let names: Vec<&str> = response.headers.iter().map(|(k, _)| k.as_str()).collect();
        assert!(names.contains(&"content-type"));
        assert!(names.contains(&"x-request-id"));
        assert!(!names.contains(&"content-length"));
        assert!(!names.contains(&"transfer-encoding"));
    }

    #[tokio::test]
    async fn search_normalizes_result_items() {
        let client = Arc::new(MockUpstreamClient::new());
        client.push_json(
            200,
            json!({
                "status": 0,
                "data": [{
                    "title": "Rust",
                    "url": "https://rust-lang.org",
                    "snippet": "a language",
                    "_score": 0.9,
                    "timestamp_format": "2024-01-01"
                }]
            }),
        );
        let (provider, _) = provider_with(client.clone()).await;

        let results = provider.handle_search("rust").await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].title, "Rust");
        assert_eq!(results[0].content, "a language");
        assert_eq!(results[0].published_date.as_deref(), Some("2024-01-01"));

        let requests = client.requests();
        let req = &requests[0];
        assert_eq!(
            req.url,
            "https://portal.qwen.ai/api/v1/indices/plugin/web_search"
        );
        let body: JsonValue = serde_json::from_slice(req.body.as_ref().unwrap()).unwrap();
        assert_eq!(body, json!({ "uq": "rust", "page": 1, "rows": 10 }));
    }

    #[tokio::test]
    async fn search_with_nonzero_status_is_a_functional_failure() {
        let client = Arc::new(MockUpstreamClient::new());
        client.push_json(200, json!({ "status": 7, "data": [] }));
        let (provider, _) = provider_with(client.clone()).await;

        let failure = provider.handle_search("rust").await.unwrap_err();
        assert!(matches!(failure, AccountFailure::InvalidPayload(_)));
    }

    #[tokio::test]
    async fn initialize_without_credentials_marks_error() {
        let client = Arc::new(MockUpstreamClient::new());
        let blob = Arc::new(MemoryBlobStore::new());
        let auth = AuthManager::new("qwen_creds_none.json", "cid", blob, client.clone());
        let quota = QuotaManager::new(None, QuotaConfig::default(), true);
        let provider = AccountProvider::new(
            "qwen_creds_none.json",
            auth,
            client,
            quota,
            DeferredTasks::spawn(),
        );

        provider.initialize().await;
        let snapshot = provider.snapshot();
        assert_eq!(snapshot.status, ProviderStatus::Error);
        assert_eq!(snapshot.last_error.as_deref(), Some("Missing Credentials"));
    }
}
