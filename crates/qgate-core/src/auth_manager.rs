use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use base64::Engine;
use bytes::Bytes;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Digest;
use tracing::{info, warn};

use qgate_storage::{BlobError, BlobStore};

use crate::clock;
use crate::credential::{
    canonical_creds_key, legacy_creds_key, short_account_id, QwenCredential,
};
use crate::upstream_client::{UpstreamBody, UpstreamClient, UpstreamHttpRequest};

pub const DEVICE_CODE_URL: &str = "https://chat.qwen.ai/api/v1/oauth2/device/code";
pub const TOKEN_URL: &str = "https://chat.qwen.ai/api/v1/oauth2/token";
pub const OAUTH_SCOPE: &str = "openid profile email model.completion";
const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

const MEMORY_TTL: Duration = Duration::from_secs(5);
const REFRESH_LOCK_TTL: Duration = Duration::from_secs(60);
const LOCK_WAIT_ATTEMPTS: u32 = 30;
const LOCK_WAIT_INTERVAL: Duration = Duration::from_millis(500);
const OAUTH_TIMEOUT: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub type AuthResult<T> = Result<T, AuthError>;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("NO_CREDS")]
    NoCredentials,
    /// Refresh token rejected with 400/401. Terminal for this account until
    /// an admin re-auths; never retried at this layer.
    #[error("AUTH_EXPIRED")]
    AuthExpired,
    #[error("Timeout or failure waiting for token update")]
    LockWaitTimeout,
    #[error("oauth transport: {0}")]
    Transport(String),
    #[error("oauth endpoint returned {status}: {detail}")]
    Http { status: u16, detail: String },
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error("credential decode: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub verification_uri_complete: String,
    pub expires_in: i64,
    pub interval: i64,
}

#[derive(Debug)]
pub enum DeviceExchange {
    /// Upstream said `authorization_pending` or `slow_down`.
    Pending,
    Complete(QwenCredential),
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    token_type: Option<String>,
    scope: Option<String>,
    resource_url: Option<String>,
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize, Default)]
struct TokenErrorBody {
    error: Option<String>,
}

/// Per-account credential lifecycle: device-code enrollment, cached loads
/// with one-way legacy-key migration, and expiry-driven refresh serialized
/// across instances by a blob-store lock.
pub struct AuthManager {
    creds_key: String,
    client_id: String,
    blob: Arc<dyn BlobStore>,
    client: Arc<dyn UpstreamClient>,
    memory: Mutex<Option<(QwenCredential, Instant)>>,
    legacy_checked: AtomicBool,
}

impl AuthManager {
    pub fn new(
        creds_key: &str,
        client_id: impl Into<String>,
        blob: Arc<dyn BlobStore>,
        client: Arc<dyn UpstreamClient>,
    ) -> Self {
        Self {
            creds_key: canonical_creds_key(creds_key).to_string(),
            client_id: client_id.into(),
            blob,
            client,
            memory: Mutex::new(None),
            legacy_checked: AtomicBool::new(false),
        }
    }

    pub fn creds_key(&self) -> &str {
        &self.creds_key
    }

    /// Memory alias when loaded, else the account id with known affixes
    /// stripped.
    pub fn cached_alias(&self) -> String {
        let memory = self.memory.lock().unwrap_or_else(|e| e.into_inner());
        memory
            .as_ref()
            .and_then(|(creds, _)| creds.alias.clone())
            .unwrap_or_else(|| short_account_id(&self.creds_key))
    }

    /// Valid credential, refreshing inside the 5-minute safety window.
    pub async fn get_valid(&self) -> AuthResult<QwenCredential> {
        let creds = self.load().await?.ok_or(AuthError::NoCredentials)?;
        if creds.needs_refresh(clock::now_unix_ms()) {
            return self.refresh(&creds.refresh_token).await;
        }
        Ok(creds)
    }

    async fn load(&self) -> AuthResult<Option<QwenCredential>> {
        {
            let memory = self.memory.lock().unwrap_or_else(|e| e.into_inner());
            if let Some((creds, at)) = memory.as_ref() {
                if at.elapsed() < MEMORY_TTL {
                    return Ok(Some(creds.clone()));
                }
            }
        }

        if let Some(value) = self.blob.get(&self.creds_key).await? {
            let creds: QwenCredential = serde_json::from_value(value)?;
            self.cache(&creds);
            return Ok(Some(creds));
        }

        if !self.legacy_checked.swap(true, Ordering::SeqCst) {
            if let Some(creds) = self.migrate_legacy().await? {
                return Ok(Some(creds));
            }
        }

        Ok(None)
    }

    /// One-way migration of the `./`-prefixed legacy key. After this, exactly
    /// one canonical key exists for the account.
    async fn migrate_legacy(&self) -> AuthResult<Option<QwenCredential>> {
        let legacy_key = legacy_creds_key(&self.creds_key);
        let Some(value) = self.blob.get(&legacy_key).await? else {
            return Ok(None);
        };
        let creds: QwenCredential = serde_json::from_value(value.clone())?;
        self.blob.set(&self.creds_key, &value, None).await?;
        self.blob.delete(&legacy_key).await?;
        info!(event = "legacy_creds_migrated", key = %self.creds_key);
        self.cache(&creds);
        Ok(Some(creds))
    }

    /// Persist under the canonical key and refresh the memory copy.
    pub async fn save(&self, creds: &QwenCredential) -> AuthResult<()> {
        let value = serde_json::to_value(creds)?;
        self.blob.set(&self.creds_key, &value, None).await?;
        self.cache(creds);
        Ok(())
    }

    /// Replace the cached alias inside the credential blob. The registry owns
    /// the authoritative alias; this copy only keeps offline tooling readable.
    pub async fn update_alias(&self, alias: Option<String>) -> AuthResult<()> {
        if let Some(value) = self.blob.get(&self.creds_key).await? {
            let mut creds: QwenCredential = serde_json::from_value(value)?;
            creds.alias = alias;
            self.save(&creds).await?;
        }
        Ok(())
    }

    pub async fn remove(&self) -> AuthResult<()> {
        self.blob.delete(&self.creds_key).await?;
        self.blob.delete(&legacy_creds_key(&self.creds_key)).await?;
        let mut memory = self.memory.lock().unwrap_or_else(|e| e.into_inner());
        *memory = None;
        Ok(())
    }

    fn cache(&self, creds: &QwenCredential) {
        let mut memory = self.memory.lock().unwrap_or_else(|e| e.into_inner());
        *memory = Some((creds.clone(), Instant::now()));
    }

    /// Serialized token rotation. The lock is the only safe way to refresh
    /// across stateless instances: two racers would each rotate the refresh
    /// token and the vendor silently invalidates one of them.
    pub async fn refresh(&self, refresh_token: &str) -> AuthResult<QwenCredential> {
        let lock_name = format!("token_refresh:{}", self.creds_key);
        match self.blob.acquire_lock(&lock_name, REFRESH_LOCK_TTL).await? {
            Some(token) => {
                let result = self.refresh_locked(refresh_token).await;
                if let Err(err) = self.blob.release_lock(&lock_name, &token).await {
                    warn!(event = "refresh_lock_release_failed", key = %self.creds_key, error = %err);
                }
                result
            }
            None => self.wait_for_other_writer(refresh_token).await,
        }
    }

    async fn refresh_locked(&self, refresh_token: &str) -> AuthResult<QwenCredential> {
        // Reload the latest copy: the previous lock holder may have rotated
        // the token while this request was queueing.
        let stored = match self.blob.get(&self.creds_key).await? {
            Some(value) => Some(serde_json::from_value::<QwenCredential>(value)?),
            None => None,
        };
        if let Some(stored) = &stored {
            if stored.refresh_token != refresh_token {
                self.cache(stored);
                return Ok(stored.clone());
            }
        }

        let request = UpstreamHttpRequest::post(TOKEN_URL, OAUTH_TIMEOUT).form_body(&[
            ("grant_type", "refresh_token"),
            ("client_id", &self.client_id),
            ("refresh_token", refresh_token),
        ]);
        let response = self
            .client
            .send(request)
            .await
            .map_err(|err| AuthError::Transport(err.message))?;

        let body = body_bytes(response.body);
        if !(200..300).contains(&response.status) {
            if response.status == 400 || response.status == 401 {
                warn!(event = "refresh_token_rejected", key = %self.creds_key, status = response.status);
                return Err(AuthError::AuthExpired);
            }
            return Err(AuthError::Http {
                status: response.status,
                detail: String::from_utf8_lossy(&body).to_string(),
            });
        }

        let parsed: TokenResponse = serde_json::from_slice(&body)?;
        let now = clock::now_unix_ms();
        let creds = QwenCredential {
            access_token: parsed.access_token,
            refresh_token: parsed
                .refresh_token
                .unwrap_or_else(|| refresh_token.to_string()),
            token_type: parsed.token_type,
            scope: parsed.scope,
            resource_url: parsed
                .resource_url
                .or_else(|| stored.as_ref().and_then(|s| s.resource_url.clone())),
            expiry_unix_ms: parsed
                .expires_in
                .map(|secs| now + secs * 1000)
                .unwrap_or(0),
            alias: stored.and_then(|s| s.alias),
        };
        // A failing credential write must fail the request: correctness
        // depends on the rotated token being durable.
        self.save(&creds).await?;
        info!(event = "token_refreshed", key = %self.creds_key);
        Ok(creds)
    }

    /// Lock acquisition failed: another instance is rotating. Poll the store
    /// until a different refresh token shows up as proof it finished.
    async fn wait_for_other_writer(&self, refresh_token: &str) -> AuthResult<QwenCredential> {
        for _ in 0..LOCK_WAIT_ATTEMPTS {
            tokio::time::sleep(LOCK_WAIT_INTERVAL).await;
            if let Some(value) = self.blob.get(&self.creds_key).await? {
                let creds: QwenCredential = serde_json::from_value(value)?;
                if creds.refresh_token != refresh_token {
                    self.cache(&creds);
                    return Ok(creds);
                }
            }
        }
        Err(AuthError::LockWaitTimeout)
    }

    pub async fn start_device_auth(&self, code_challenge: &str) -> AuthResult<DeviceAuthorization> {
        let request = UpstreamHttpRequest::post(DEVICE_CODE_URL, OAUTH_TIMEOUT).form_body(&[
            ("client_id", &self.client_id),
            ("scope", OAUTH_SCOPE),
            ("code_challenge", code_challenge),
            ("code_challenge_method", "S256"),
        ]);
        let response = self
            .client
            .send(request)
            .await
            .map_err(|err| AuthError::Transport(err.message))?;
        let body = body_bytes(response.body);
        if !(200..300).contains(&response.status) {
            return Err(AuthError::Http {
                status: response.status,
                detail: String::from_utf8_lossy(&body).to_string(),
            });
        }
        Ok(serde_json::from_slice(&body)?)
    }

    /// Poll the token endpoint for a device-code grant. The completed
    /// credential is persisted under the canonical key before returning.
    pub async fn exchange_device_code(
        &self,
        device_code: &str,
        code_verifier: &str,
    ) -> AuthResult<DeviceExchange> {
        let request = UpstreamHttpRequest::post(TOKEN_URL, OAUTH_TIMEOUT).form_body(&[
            ("grant_type", DEVICE_CODE_GRANT),
            ("client_id", &self.client_id),
            ("device_code", device_code),
            ("code_verifier", code_verifier),
        ]);
        let response = self
            .client
            .send(request)
            .await
            .map_err(|err| AuthError::Transport(err.message))?;
        let body = body_bytes(response.body);

        if !(200..300).contains(&response.status) {
            let parsed: TokenErrorBody = serde_json::from_slice(&body).unwrap_or_default();
            match parsed.error.as_deref() {
                Some("authorization_pending") | Some("slow_down") => {
                    return Ok(DeviceExchange::Pending)
                }
                _ => {
                    return Err(AuthError::Http {
                        status: response.status,
                        detail: String::from_utf8_lossy(&body).to_string(),
                    })
                }
            }
        }

        let parsed: TokenResponse = serde_json::from_slice(&body)?;
        let now = clock::now_unix_ms();
        let creds = QwenCredential {
            access_token: parsed.access_token,
            refresh_token: parsed.refresh_token.unwrap_or_default(),
            token_type: parsed.token_type,
            scope: parsed.scope,
            resource_url: parsed.resource_url,
            expiry_unix_ms: parsed
                .expires_in
                .map(|secs| now + secs * 1000)
                .unwrap_or(0),
            alias: None,
        };
        self.save(&creds).await?;
        Ok(DeviceExchange::Complete(creds))
    }

    /// One-shot validity check: a minimal chat call with a tight deadline.
    /// Returns the HTTP status, or `None` when the transport failed.
    pub async fn probe_status(&self, creds: &QwenCredential) -> Option<u16> {
        let url = format!(
            "{}/chat/completions",
            crate::credential::chat_api_base(creds.resource_url.as_deref())
        );
        let request = UpstreamHttpRequest::post(url, PROBE_TIMEOUT)
            .header("authorization", format!("Bearer {}", creds.access_token))
            .json_body(&serde_json::json!({
                "model": "qwen3-coder-plus",
                "messages": [{ "role": "user", "content": "hi" }],
                "max_tokens": 1,
            }));
        match self.client.send(request).await {
            Ok(response) => Some(response.status),
            Err(_) => None,
        }
    }
}

fn body_bytes(body: UpstreamBody) -> Bytes {
    match body {
        UpstreamBody::Bytes(bytes) => bytes,
        UpstreamBody::Stream(_) => Bytes::new(),
    }
}

/// PKCE pair for the device-code flow.
pub fn generate_pkce() -> (String, String) {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    let verifier = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes);
    let digest = sha2::Sha256::digest(verifier.as_bytes());
    let challenge = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest);
    (verifier, challenge)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream_client::test_support::MockUpstreamClient;
    use qgate_storage::MemoryBlobStore;
    use serde_json::json;

    fn creds_value(refresh_token: &str) -> serde_json::Value {
        json!({
            "accessToken": "at",
            "refreshToken": refresh_token,
            "resourceUrl": "portal.qwen.ai",
            "expiryUnixMs": 0
        })
    }

    fn manager(
        blob: Arc<MemoryBlobStore>,
        client: Arc<MockUpstreamClient>,
    ) -> AuthManager {
        AuthManager::new(
            "qwen_creds_ab12cd34.json",
            "client-id",
            blob,
            client,
        )
    }

    #[tokio::test]
    async fn missing_credentials_fail_with_no_creds() {
        let blob = Arc::new(MemoryBlobStore::new());
        let client = Arc::new(MockUpstreamClient::new());
        let auth = manager(blob, client);
        assert!(matches!(
            auth.get_valid().await,
            Err(AuthError::NoCredentials)
        ));
    }

    #[tokio::test]
    async fn legacy_key_migrates_one_way() {
        let blob = Arc::new(MemoryBlobStore::new());
        blob.set("./qwen_creds_ab12cd34.json", &creds_value("rt"), None)
            .await
            .unwrap();
        let client = Arc::new(MockUpstreamClient::new());
        let auth = manager(blob.clone(), client);

        let creds = auth.get_valid().await.unwrap();
        assert_eq!(creds.refresh_token, "rt");
        assert!(blob.get("qwen_creds_ab12cd34.json").await.unwrap().is_some());
        assert!(blob
            .get("./qwen_creds_ab12cd34.json")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn expiring_credential_triggers_refresh() {
        let blob = Arc::new(MemoryBlobStore::new());
        let now = clock::now_unix_ms();
        blob.set(
            "qwen_creds_ab12cd34.json",
            &json!({
                "accessToken": "old",
                "refreshToken": "rt-old",
                "expiryUnixMs": now + 60_000
            }),
            None,
        )
        .await
        .unwrap();

        let client = Arc::new(MockUpstreamClient::new());
        client.push_json(
            200,
            json!({
                "access_token": "new",
                "refresh_token": "rt-new",
                "token_type": "Bearer",
                "expires_in": 3600
            }),
        );
        let auth = manager(blob.clone(), client.clone());

        let creds = auth.get_valid().await.unwrap();
        assert_eq!(creds.access_token, "new");
        assert_eq!(creds.refresh_token, "rt-new");
        assert!(creds.expiry_unix_ms > now);

        // Persisted under the canonical key, no legacy prefix.
        let stored: QwenCredential = serde_json::from_value(
            blob.get("qwen_creds_ab12cd34.json").await.unwrap().unwrap(),
        )
        .unwrap();
        assert_eq!(stored.access_token, "new");

        let requests = client.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].url, TOKEN_URL);
    }

    #[tokio::test]
    async fn refresh_rejection_is_terminal() {
        let blob = Arc::new(MemoryBlobStore::new());
        blob.set("qwen_creds_ab12cd34.json", &creds_value("rt"), None)
            .await
            .unwrap();
        let client = Arc::new(MockUpstreamClient::new());
        client.push_json(400, json!({ "error": "invalid_grant" }));
        let auth = manager(blob, client);

        assert!(matches!(
            auth.refresh("rt").await,
            Err(AuthError::AuthExpired)
        ));
    }

    #[tokio::test]
    async fn refresh_yields_to_a_newer_stored_token() {
        let blob = Arc::new(MemoryBlobStore::new());
        blob.set("qwen_creds_ab12cd34.json", &creds_value("rt-rotated"), None)
            .await
            .unwrap();
        let client = Arc::new(MockUpstreamClient::new());
        let auth = manager(blob, client.clone());

        // Caller still holds the stale token; the store already rotated.
        let creds = auth.refresh("rt-stale").await.unwrap();
        assert_eq!(creds.refresh_token, "rt-rotated");
        assert!(client.requests().is_empty());
    }

    #[tokio::test]
    async fn contended_refresh_waits_for_the_winner() {
        let blob = Arc::new(MemoryBlobStore::new());
        blob.set("qwen_creds_ab12cd34.json", &creds_value("rt"), None)
            .await
            .unwrap();
        // Simulate another instance holding the lock.
        let lock_token = blob
            .acquire_lock("token_refresh:qwen_creds_ab12cd34.json", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        let client = Arc::new(MockUpstreamClient::new());
        let auth = Arc::new(manager(blob.clone(), client.clone()));

        let waiter = {
            let auth = auth.clone();
            tokio::spawn(async move { auth.refresh("rt").await })
        };

        // The "winner" publishes a rotated credential while the waiter polls.
        tokio::time::sleep(Duration::from_millis(100)).await;
        blob.set("qwen_creds_ab12cd34.json", &creds_value("rt-next"), None)
            .await
            .unwrap();
        blob.release_lock("token_refresh:qwen_creds_ab12cd34.json", &lock_token)
            .await
            .unwrap();

        let creds = waiter.await.unwrap().unwrap();
        assert_eq!(creds.refresh_token, "rt-next");
        // The waiter never called the token endpoint itself.
        assert!(client.requests().is_empty());
    }

    #[tokio::test]
    async fn device_exchange_reports_pending() {
        let blob = Arc::new(MemoryBlobStore::new());
        let client = Arc::new(MockUpstreamClient::new());
        client.push_json(400, json!({ "error": "authorization_pending" }));
        let auth = manager(blob, client);

        assert!(matches!(
            auth.exchange_device_code("dc", "verifier").await.unwrap(),
            DeviceExchange::Pending
        ));
    }

    #[tokio::test]
    async fn device_exchange_persists_the_credential() {
        let blob = Arc::new(MemoryBlobStore::new());
        let client = Arc::new(MockUpstreamClient::new());
        client.push_json(
            200,
            json!({
                "access_token": "at",
                "refresh_token": "rt",
                "resource_url": "portal.qwen.ai",
                "expires_in": 3600
            }),
        );
        let auth = manager(blob.clone(), client);

        match auth.exchange_device_code("dc", "verifier").await.unwrap() {
            DeviceExchange::Complete(creds) => assert_eq!(creds.access_token, "at"),
            other => panic!("unexpected exchange outcome: {other:?}"),
        }
        assert!(blob.get("qwen_creds_ab12cd34.json").await.unwrap().is_some());
    }

    #[test]
    fn pkce_challenge_is_derived_from_verifier() {
        let (verifier, challenge) = generate_pkce();
        let digest = sha2::Sha256::digest(verifier.as_bytes());
        let expected = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest);
        assert_eq!(challenge, expected);
    }
}
