use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value as JsonValue};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use qgate_storage::{BlobStore, ProviderRegistry};

use crate::account::{AccountProvider, ProviderRuntimeState, ProviderStatus};
use crate::auth_manager::AuthManager;
use crate::clock;
use crate::credential::{CREDS_KEY_PREFIX, OAUTH_CREDS_KEY_PREFIX};
use crate::deferred::DeferredTasks;
use crate::error::AccountFailure;
use crate::quota::{Admission, QuotaManager, UsageKind};
use crate::upstream_client::{UpstreamClient, UpstreamHttpResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// Registry + static seed list. The relational store is the authority.
    Light,
    /// Additionally lists the blob store by credential-key prefixes; the
    /// list operation is the most quota-sensitive dependency, so full scans
    /// happen only on admin request, cold bootstrap, or an opt-in interval.
    Full,
}

pub struct PoolOptions {
    pub scan_interval: Duration,
    pub static_ids: Vec<String>,
    pub oauth_client_id: String,
}

/// Discovers, refreshes, and rotates across per-account providers.
///
/// The provider list is replaced wholesale under a write lock, never mutated
/// in place, so dispatches always see a consistent snapshot. Overlapping
/// scans coalesce behind one async mutex. `current_index` is per-process by
/// design: round-robin fairness across instances holds in expectation.
pub struct ProviderPool {
    providers: RwLock<Vec<Arc<AccountProvider>>>,
    current_index: AtomicUsize,
    last_scan_at_ms: AtomicI64,
    scan_interval_ms: i64,
    scan_lock: Mutex<()>,
    registry: ProviderRegistry,
    blob: Arc<dyn BlobStore>,
    client: Arc<dyn UpstreamClient>,
    quota: Arc<QuotaManager>,
    deferred: DeferredTasks,
    static_ids: Vec<String>,
    oauth_client_id: String,
}

impl ProviderPool {
    pub fn new(
        options: PoolOptions,
        registry: ProviderRegistry,
        blob: Arc<dyn BlobStore>,
        client: Arc<dyn UpstreamClient>,
        quota: Arc<QuotaManager>,
        deferred: DeferredTasks,
    ) -> Self {
        Self {
            providers: RwLock::new(Vec::new()),
            current_index: AtomicUsize::new(0),
            last_scan_at_ms: AtomicI64::new(0),
            scan_interval_ms: (options.scan_interval.as_millis() as i64).max(5_000),
            scan_lock: Mutex::new(()),
            registry,
            blob,
            client,
            quota,
            deferred,
            static_ids: options
                .static_ids
                .iter()
                .map(|id| qgate_storage::canonical_id(id).to_string())
                .collect(),
            oauth_client_id: options.oauth_client_id,
        }
    }

    pub async fn len(&self) -> usize {
        self.providers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.providers.read().await.is_empty()
    }

    pub async fn snapshots(&self) -> Vec<ProviderRuntimeState> {
        let providers = self.providers.read().await;
        providers.iter().map(|p| p.snapshot()).collect()
    }

    pub async fn provider_ids(&self) -> Vec<String> {
        let providers = self.providers.read().await;
        providers.iter().map(|p| p.id().to_string()).collect()
    }

    async fn ensure_fresh(&self) {
        let now = clock::now_unix_ms();
        if now - self.last_scan_at_ms.load(Ordering::SeqCst) > self.scan_interval_ms {
            self.refresh(ScanMode::Light).await;
        }
    }

    /// Rebuild the provider list. Existing providers are kept (preserving
    /// cooldown and runtime state); new accounts are initialized
    /// concurrently, with per-account failures isolated. Returns the pool
    /// size.
    pub async fn refresh(&self, mode: ScanMode) -> usize {
        let requested_at = clock::now_unix_ms();
        let _guard = self.scan_lock.lock().await;
        // A scan that completed while this one queued is fresh enough.
        if mode == ScanMode::Light && self.last_scan_at_ms.load(Ordering::SeqCst) >= requested_at
        {
            return self.providers.read().await.len();
        }

        let mut ids: BTreeSet<String> = BTreeSet::new();
        let mut alias_map: HashMap<String, String> = HashMap::new();
        match self.registry.load().await {
            Ok(records) => {
                for record in records {
                    if let Some(alias) = record.alias {
                        alias_map.insert(record.id.clone(), alias);
                    }
                    ids.insert(record.id);
                }
            }
            Err(err) => {
                warn!(event = "registry_load_failed", error = %err);
            }
        }
        ids.extend(self.static_ids.iter().cloned());

        let cold_bootstrap = ids.is_empty();
        let mut discovered: Vec<String> = Vec::new();
        if mode == ScanMode::Full || cold_bootstrap {
            for prefix in [
                CREDS_KEY_PREFIX.to_string(),
                OAUTH_CREDS_KEY_PREFIX.to_string(),
                format!("./{CREDS_KEY_PREFIX}"),
                format!("./{OAUTH_CREDS_KEY_PREFIX}"),
            ] {
                match self.blob.list_prefix(&prefix).await {
                    Ok(keys) => {
                        for key in keys {
                            let canonical = qgate_storage::canonical_id(&key).to_string();
                            if ids.insert(canonical.clone()) {
                                discovered.push(canonical);
                            }
                        }
                    }
                    Err(err) => {
                        warn!(event = "kv_scan_failed", prefix = %prefix, error = %err);
                    }
                }
            }
        }
        // Converge the registry on what the blob store actually holds, so
        // later light scans see accounts found by a full scan.
        for id in &discovered {
            if let Err(err) = self.registry.enroll(id, None).await {
                warn!(event = "registry_enroll_failed", provider = %id, error = %err);
            }
        }

        let existing: HashMap<String, Arc<AccountProvider>> = {
            let providers = self.providers.read().await;
            providers
                .iter()
                .map(|p| (p.id().to_string(), p.clone()))
                .collect()
        };

        let mut next: Vec<Arc<AccountProvider>> = Vec::with_capacity(ids.len());
        let mut fresh: Vec<Arc<AccountProvider>> = Vec::new();
        for id in &ids {
            match existing.get(id) {
                Some(provider) => next.push(provider.clone()),
                None => {
                    let auth = AuthManager::new(
                        id,
                        self.oauth_client_id.clone(),
                        self.blob.clone(),
                        self.client.clone(),
                    );
                    let provider = Arc::new(AccountProvider::new(
                        id,
                        auth,
                        self.client.clone(),
                        self.quota.clone(),
                        self.deferred.clone(),
                    ));
                    fresh.push(provider.clone());
                    next.push(provider);
                }
            }
        }
        futures_util::future::join_all(fresh.iter().map(|p| p.initialize())).await;

        for provider in &next {
            provider.set_alias(alias_map.get(provider.id()).cloned());
        }

        let len = next.len();
        {
            let mut providers = self.providers.write().await;
            *providers = next;
            if self.current_index.load(Ordering::SeqCst) >= len {
                self.current_index.store(0, Ordering::SeqCst);
            }
        }
        self.last_scan_at_ms
            .store(clock::now_unix_ms(), Ordering::SeqCst);
        info!(event = "pool_refreshed", mode = ?mode, size = len, new = fresh.len());
        len
    }

    /// Rotate chat across the pool. The first actually-attempted provider
    /// advances `current_index` one past itself, so successes round-robin.
    pub async fn dispatch_chat(&self, payload: &JsonValue) -> UpstreamHttpResponse {
        self.ensure_fresh().await;
        let providers: Vec<Arc<AccountProvider>> = self.providers.read().await.clone();
        let n = providers.len();
        if n == 0 {
            return UpstreamHttpResponse::json(
                500,
                &json!({ "error": "No Qwen providers configured" }),
            );
        }

        let mut outcome = RotationOutcome::default();
        let start = self.current_index.load(Ordering::SeqCst) % n;
        for k in 0..n {
            let index = (start + k) % n;
            let provider = &providers[index];
            let is_last_candidate = k == n - 1;

            // Circuit breaker; the last candidate is attempted regardless so
            // a pool of one cannot deadlock itself into a cooldown.
            if !provider.can_attempt(clock::now_unix_ms()) && !is_last_candidate {
                outcome.cooldown_skipped += 1;
                continue;
            }

            if let Admission::Limited(_) = self.quota.check(provider.id(), UsageKind::Chat).await
            {
                outcome.quota_blocked += 1;
                continue;
            }

            if outcome.attempts == 0 {
                self.current_index
                    .store((index + 1) % n, Ordering::SeqCst);
            }
            outcome.attempts += 1;

            match provider.handle_chat(payload).await {
                Ok(response) => return response,
                Err(failure) => outcome.record(provider.alias(), failure),
            }
        }

        outcome.into_chat_response(&providers)
    }

    /// Same rotation skeleton for the web-search tool, with a simpler
    /// aggregate outcome table.
    pub async fn dispatch_search(&self, query: &str) -> UpstreamHttpResponse {
        self.ensure_fresh().await;
        let providers: Vec<Arc<AccountProvider>> = self.providers.read().await.clone();
        let n = providers.len();
        if n == 0 {
            return UpstreamHttpResponse::json(
                500,
                &json!({ "error": "No Qwen providers configured" }),
            );
        }

        let mut outcome = RotationOutcome::default();
        let start = self.current_index.load(Ordering::SeqCst) % n;
        for k in 0..n {
            let index = (start + k) % n;
            let provider = &providers[index];
            let is_last_candidate = k == n - 1;

            if !provider.can_attempt(clock::now_unix_ms()) && !is_last_candidate {
                outcome.cooldown_skipped += 1;
                continue;
            }

            if let Admission::Limited(_) =
                self.quota.check(provider.id(), UsageKind::Search).await
            {
                outcome.quota_blocked += 1;
                continue;
            }

            if outcome.attempts == 0 {
                self.current_index
                    .store((index + 1) % n, Ordering::SeqCst);
            }
            outcome.attempts += 1;

            match provider.handle_search(query).await {
                Ok(results) => {
                    return UpstreamHttpResponse::json(
                        200,
                        &json!({ "success": true, "query": query, "results": results }),
                    )
                }
                Err(failure) => outcome.record(provider.alias(), failure),
            }
        }

        outcome.into_search_response(&providers)
    }

    // ---- admin surface ----

    pub async fn find(&self, id: &str) -> Option<Arc<AccountProvider>> {
        let id = qgate_storage::canonical_id(id);
        let providers = self.providers.read().await;
        providers.iter().find(|p| p.id() == id).cloned()
    }

    /// Admin removal: credential blob, registry row, and pool slot.
    pub async fn remove(&self, id: &str) -> bool {
        let id = qgate_storage::canonical_id(id).to_string();
        let removed = {
            let mut providers = self.providers.write().await;
            let before = providers.len();
            let mut target: Option<Arc<AccountProvider>> = None;
            providers.retain(|p| {
                if p.id() == id {
                    target = Some(p.clone());
                    false
                } else {
                    true
                }
            });
            if self.current_index.load(Ordering::SeqCst) >= providers.len() {
                self.current_index.store(0, Ordering::SeqCst);
            }
            (before != providers.len()).then_some(target).flatten()
        };

        if let Some(provider) = &removed {
            if let Err(err) = provider.auth().remove().await {
                warn!(event = "credential_delete_failed", provider = %id, error = %err);
            }
        }
        if let Err(err) = self.registry.remove(&id).await {
            warn!(event = "registry_delete_failed", provider = %id, error = %err);
        }
        removed.is_some()
    }

    /// Register a freshly enrolled account and fold it into the pool.
    pub async fn register_account(&self, id: &str) -> bool {
        let id = qgate_storage::canonical_id(id).to_string();
        if let Err(err) = self.registry.enroll(&id, None).await {
            warn!(event = "registry_enroll_failed", provider = %id, error = %err);
            return false;
        }
        self.refresh(ScanMode::Light).await;
        true
    }

    /// Admin alias rename. The registry row is authoritative; the credential
    /// blob copy is refreshed as a cache.
    pub async fn rename_alias(&self, id: &str, alias: &str) -> bool {
        let id = qgate_storage::canonical_id(id).to_string();
        if let Err(err) = self.registry.rename(&id, alias).await {
            warn!(event = "alias_rename_failed", provider = %id, error = %err);
            return false;
        }
        if let Some(provider) = self.find(&id).await {
            provider.set_alias(Some(alias.to_string()));
            if let Err(err) = provider
                .auth()
                .update_alias(Some(alias.to_string()))
                .await
            {
                warn!(event = "alias_cache_write_failed", provider = %id, error = %err);
            }
        }
        true
    }
}

#[derive(Default)]
struct RotationOutcome {
    attempts: u32,
    auth_expired: u32,
    rate_limited: u32,
    quota_exceeded: u32,
    quota_blocked: u32,
    cooldown_skipped: u32,
    errors: Vec<String>,
}

impl RotationOutcome {
    fn record(&mut self, alias: String, failure: AccountFailure) {
        match &failure {
            AccountFailure::AuthExpired => self.auth_expired += 1,
            AccountFailure::RateLimited => self.rate_limited += 1,
            AccountFailure::QuotaExceeded => self.quota_exceeded += 1,
            _ => {}
        }
        self.errors.push(format!("{alias}: {failure}"));
    }

    fn all_auth_expired_states(providers: &[Arc<AccountProvider>]) -> bool {
        providers.iter().all(|p| {
            let snapshot = p.snapshot();
            snapshot.status == ProviderStatus::Error
                && snapshot.last_error.as_deref() == Some("Unauthorized (Please Login)")
        })
    }

    fn into_chat_response(self, providers: &[Arc<AccountProvider>]) -> UpstreamHttpResponse {
        let n = providers.len() as u32;
        if self.attempts == 0 {
            if Self::all_auth_expired_states(providers) {
                return all_unauthorized();
            }
            if self.quota_blocked == n {
                return UpstreamHttpResponse::json(
                    429,
                    &json!({
                        "error": "All providers quota limited",
                        "details": "Every account hit its configured daily or per-minute admission limit. Retry later.",
                    }),
                );
            }
            let last_errors: Vec<String> = providers
                .iter()
                .filter_map(|p| p.snapshot().last_error)
                .collect();
            return UpstreamHttpResponse::json(
                503,
                &json!({
                    "error": "No available providers",
                    "details": "Every account is cooling down or blocked at admission.",
                    "errors": last_errors,
                }),
            );
        }

        if self.auth_expired == self.attempts {
            return all_unauthorized();
        }
        if self.rate_limited == self.attempts {
            return UpstreamHttpResponse::json(
                429,
                &json!({
                    "error": "All providers rate limited",
                    "details": "Upstream throttled every account (HTTP 429). Retry shortly.",
                }),
            );
        }
        if self.quota_exceeded == self.attempts {
            return UpstreamHttpResponse::json(
                429,
                &json!({
                    "error": "All providers quota exceeded",
                    "details": "Qwen free-tier quota is exhausted on every account. Re-login or wait for the daily quota reset.",
                }),
            );
        }

        let details = self.errors.last().cloned().unwrap_or_default();
        UpstreamHttpResponse::json(
            500,
            &json!({
                "error": "All providers failed",
                "details": details,
                "attempts": self.attempts,
                "errors": self.errors,
            }),
        )
    }

    fn into_search_response(self, providers: &[Arc<AccountProvider>]) -> UpstreamHttpResponse {
        let n = providers.len() as u32;
        if self.attempts == 0 {
            if Self::all_auth_expired_states(providers) {
                return all_unauthorized();
            }
            if self.quota_blocked == n {
                return UpstreamHttpResponse::json(
                    429,
                    &json!({
                        "error": "All providers quota limited",
                        "details": "Every account hit its configured daily or per-minute admission limit. Retry later.",
                    }),
                );
            }
            return UpstreamHttpResponse::json(
                503,
                &json!({
                    "error": "No available providers",
                    "details": "Every account is cooling down or blocked at admission.",
                    "errors": self.errors,
                }),
            );
        }

        if self.auth_expired == self.attempts {
            return all_unauthorized();
        }
        if self.rate_limited + self.quota_exceeded == self.attempts {
            return UpstreamHttpResponse::json(
                429,
                &json!({
                    "error": "All providers rate limited",
                    "details": "Upstream throttled every account (HTTP 429). Retry shortly.",
                }),
            );
        }

        let details = self.errors.last().cloned().unwrap_or_default();
        UpstreamHttpResponse::json(
            500,
            &json!({
                "error": "All providers failed",
                "details": details,
                "attempts": self.attempts,
                "errors": self.errors,
            }),
        )
    }
}

fn all_unauthorized() -> UpstreamHttpResponse {
    UpstreamHttpResponse::json(
        401,
        &json!({
            "error": "All providers unauthorized",
            "details": "All Qwen accounts need re-authentication. Open the admin console and log in again.",
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream_client::test_support::MockUpstreamClient;
    use bytes::Bytes;
    use qgate_common::{QuotaConfig, QuotaLimits};
    use qgate_storage::{BlobStore, MemoryBlobStore, SeaOrmStorage, Storage};
    use serde_json::json;

    async fn seeded_blob(ids: &[&str]) -> Arc<MemoryBlobStore> {
        let blob = Arc::new(MemoryBlobStore::new());
        for id in ids {
            blob.set(
                id,
                &json!({
                    "accessToken": format!("at-{id}"),
                    "refreshToken": format!("rt-{id}"),
                    "resourceUrl": "portal.qwen.ai",
                    "expiryUnixMs": 0
                }),
                None,
            )
            .await
            .unwrap();
        }
        blob
    }

    async fn pool_with(
        ids: &[&str],
        client: Arc<MockUpstreamClient>,
        quota_config: QuotaConfig,
    ) -> (ProviderPool, Arc<SeaOrmStorage>) {
        let storage = Arc::new(SeaOrmStorage::connect("sqlite::memory:").await.unwrap());
        storage.sync().await.unwrap();
        let registry = ProviderRegistry::new(storage.clone());
        let quota = crate::quota::QuotaManager::new(
            Some(storage.clone() as Arc<dyn Storage>),
            quota_config,
            true,
        );
        let blob = seeded_blob(ids).await;
        let pool = ProviderPool::new(
            PoolOptions {
                scan_interval: Duration::from_secs(30),
                static_ids: ids.iter().map(|s| s.to_string()).collect(),
                oauth_client_id: "client-id".to_string(),
            },
            registry,
            blob,
            client,
            quota,
            DeferredTasks::spawn(),
        );
        pool.refresh(ScanMode::Light).await;
        (pool, storage)
    }

    fn chat_payload() -> JsonValue {
        json!({ "model": "m", "messages": [{ "role": "user", "content": "hi" }] })
    }

    fn body_json(response: UpstreamHttpResponse) -> (u16, JsonValue) {
        let bytes = match response.body {
            crate::upstream_client::UpstreamBody::Bytes(b) => b,
            _ => Bytes::new(),
        };
        (
            response.status,
            serde_json::from_slice(&bytes).unwrap_or(JsonValue::Null),
        )
    }

    #[tokio::test]
    async fn empty_pool_maps_to_configured_error() {
        let client = Arc::new(MockUpstreamClient::new());
        let (pool, _) = pool_with(&[], client, QuotaConfig::default()).await;
        let (status, body) = body_json(pool.dispatch_chat(&chat_payload()).await);
        assert_eq!(status, 500);
        assert_eq!(body["error"], "No Qwen providers configured");
    }

    #[tokio::test]
    async fn success_advances_round_robin_past_the_winner() {
        let client = Arc::new(MockUpstreamClient::new());
        client.push_json(200, json!({ "choices": [] }));
        client.push_json(200, json!({ "choices": [] }));
        let (pool, _) = pool_with(
            &["qwen_creds_aa.json", "qwen_creds_bb.json"],
            client.clone(),
            QuotaConfig::default(),
        )
        .await;

        assert_eq!(pool.current_index.load(Ordering::SeqCst), 0);
        let response = pool.dispatch_chat(&chat_payload()).await;
        assert_eq!(response.status, 200);
        assert_eq!(pool.current_index.load(Ordering::SeqCst), 1);

        // Second dispatch starts from the other account.
        pool.dispatch_chat(&chat_payload()).await;
        let requests = client.requests();
        assert!(requests[0].headers.iter().any(|(_, v)| v == "Bearer at-qwen_creds_aa.json"));
        assert!(requests[1].headers.iter().any(|(_, v)| v == "Bearer at-qwen_creds_bb.json"));
        assert_eq!(pool.current_index.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rate_limited_account_fails_over_to_the_next() {
        let client = Arc::new(MockUpstreamClient::new());
        client.push_json(429, json!({ "error": "Too Many Requests" }));
        client.push_json(200, json!({ "choices": [] }));
        let (pool, _) = pool_with(
            &["qwen_creds_aa.json", "qwen_creds_bb.json"],
            client.clone(),
            QuotaConfig::default(),
        )
        .await;

        let response = pool.dispatch_chat(&chat_payload()).await;
        assert_eq!(response.status, 200);

        // The throttled account is in cooldown now.
        let snapshots = pool.snapshots().await;
        let failed = snapshots
            .iter()
            .find(|s| s.id == "qwen_creds_aa.json")
            .unwrap();
        assert_eq!(failed.status, ProviderStatus::Error);
        assert!(failed.retry_after_ms > clock::now_unix_ms());
    }

    #[tokio::test]
    async fn all_quota_exceeded_maps_to_429_with_distinct_body() {
        let client = Arc::new(MockUpstreamClient::new());
        client.push_json(429, json!({ "error": "insufficient_quota" }));
        client.push_json(429, json!({ "error": "free allocated quota exceeded" }));
        let (pool, storage) = pool_with(
            &["qwen_creds_aa.json", "qwen_creds_bb.json"],
            client,
            QuotaConfig::default(),
        )
        .await;

        let (status, body) = body_json(pool.dispatch_chat(&chat_payload()).await);
        assert_eq!(status, 429);
        assert_eq!(body["error"], "All providers quota exceeded");
        assert!(body["details"].as_str().unwrap().contains("Re-login"));

        // Two distinct quota-exceeded audit rows eventually land.
        let mut audited = 0;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let rows = storage.recent_audit(10, true).await.unwrap();
            audited = rows
                .iter()
                .filter(|r| r.outcome == "error:upstream_quota_exceeded")
                .count();
            if audited == 2 {
                break;
            }
        }
        assert_eq!(audited, 2);
    }

    #[tokio::test]
    async fn all_auth_expired_maps_to_401() {
        let client = Arc::new(MockUpstreamClient::new());
        // Both accounts: chat 401, then the forced refresh is rejected.
        client.push_json(401, json!({}));
        client.push_json(400, json!({ "error": "invalid_grant" }));
        client.push_json(401, json!({}));
        client.push_json(400, json!({ "error": "invalid_grant" }));
        let (pool, _) = pool_with(
            &["qwen_creds_aa.json", "qwen_creds_bb.json"],
            client,
            QuotaConfig::default(),
        )
        .await;

        let (status, body) = body_json(pool.dispatch_chat(&chat_payload()).await);
        assert_eq!(status, 401);
        assert_eq!(body["error"], "All providers unauthorized");
    }

    #[tokio::test]
    async fn single_provider_in_cooldown_is_attempted_as_last_candidate() {
        let client = Arc::new(MockUpstreamClient::new());
        client.push_json(500, json!({}));
        client.push_json(200, json!({ "choices": [] }));
        let (pool, _) = pool_with(&["qwen_creds_aa.json"], client.clone(), QuotaConfig::default())
            .await;

        let first = pool.dispatch_chat(&chat_payload()).await;
        assert_eq!(first.status, 500);

        // Still in cooldown, but as the only (= last) candidate it runs.
        let second = pool.dispatch_chat(&chat_payload()).await;
        assert_eq!(second.status, 200);
        assert_eq!(client.requests().len(), 2);
    }

    #[tokio::test]
    async fn admission_blocks_map_to_quota_limited() {
        let client = Arc::new(MockUpstreamClient::new());
        let config = QuotaConfig {
            chat: QuotaLimits::new(0, 1),
            search: QuotaLimits::new(0, 0),
        };
        client.push_json(200, json!({ "choices": [] }));
        let (pool, _) = pool_with(&["qwen_creds_aa.json"], client, config).await;

        assert_eq!(pool.dispatch_chat(&chat_payload()).await.status, 200);
        // Wait for the deferred usage increment to land in the RPM window.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (status, body) = body_json(pool.dispatch_chat(&chat_payload()).await);
        assert_eq!(status, 429);
        assert_eq!(body["error"], "All providers quota limited");
    }

    #[tokio::test]
    async fn removal_clamps_the_rotation_index() {
        let client = Arc::new(MockUpstreamClient::new());
        client.push_json(200, json!({ "choices": [] }));
        let (pool, _) = pool_with(
            &["qwen_creds_aa.json", "qwen_creds_bb.json"],
            client,
            QuotaConfig::default(),
        )
        .await;

        pool.dispatch_chat(&chat_payload()).await;
        assert_eq!(pool.current_index.load(Ordering::SeqCst), 1);

        assert!(pool.remove("qwen_creds_bb.json").await);
        assert_eq!(pool.current_index.load(Ordering::SeqCst), 0);
        assert_eq!(pool.len().await, 1);
        assert!(!pool.remove("qwen_creds_bb.json").await);
    }

    #[tokio::test]
    async fn full_scan_discovers_kv_only_accounts_and_enrolls_them() {
        let storage = Arc::new(SeaOrmStorage::connect("sqlite::memory:").await.unwrap());
        storage.sync().await.unwrap();
        let registry = ProviderRegistry::new(storage.clone());
        let quota = crate::quota::QuotaManager::new(
            Some(storage.clone() as Arc<dyn Storage>),
            QuotaConfig::default(),
            true,
        );
        let blob = seeded_blob(&["qwen_creds_kv.json"]).await;
        let client = Arc::new(MockUpstreamClient::new());
        let pool = ProviderPool::new(
            PoolOptions {
                scan_interval: Duration::from_secs(30),
                static_ids: Vec::new(),
                oauth_client_id: "client-id".to_string(),
            },
            registry,
            blob,
            client,
            quota,
            DeferredTasks::spawn(),
        );

        // Cold bootstrap: empty registry + empty static list forces a full scan.
        assert_eq!(pool.refresh(ScanMode::Light).await, 1);
        assert_eq!(pool.provider_ids().await, vec!["qwen_creds_kv.json"]);
        let records = storage.provider_records().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "qwen_creds_kv.json");
    }

    #[tokio::test]
    async fn alias_rename_updates_registry_and_credential_cache() {
        let client = Arc::new(MockUpstreamClient::new());
        let (pool, storage) = pool_with(&["qwen_creds_aa.json"], client, QuotaConfig::default())
            .await;

        assert!(pool.rename_alias("qwen_creds_aa.json", "work-account").await);
        let records = storage.provider_records().await.unwrap();
        assert_eq!(records[0].alias.as_deref(), Some("work-account"));

        let provider = pool.find("qwen_creds_aa.json").await.unwrap();
        assert_eq!(provider.alias(), "work-account");
    }
}
