use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use qgate_storage::{BlobStore, Storage};

use crate::clock;
use crate::upstream_client::{UpstreamClient, UpstreamHttpRequest};

const STATE_KEY: &str = "alert_state.json";
const AUTH_FAILED_WINDOW_MINUTES: i64 = 30;
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);
/// Recovery fires this many points under the alert threshold to avoid
/// flapping around the boundary.
const RECOVERY_HYSTERESIS: u32 = 5;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
struct AlertState {
    /// Sorted comma-joined ids of persistently auth-failed accounts.
    #[serde(default)]
    auth_failed_fingerprint: String,
    #[serde(default)]
    quota_alerted: bool,
}

pub struct AlertOptions {
    pub webhook_url: String,
    pub quota_threshold_percent: u32,
    pub per_account_daily_limit: u32,
}

/// Periodic audit-table scan emitting alert/recovery webhooks for two
/// conditions: accounts that are persistently auth-failed, and global daily
/// chat volume crossing the configured threshold. Tick-to-tick transitions
/// are deduplicated through one blob-store state key, so any instance may run
/// the tick.
pub struct AlertEngine {
    storage: Arc<dyn Storage>,
    blob: Arc<dyn BlobStore>,
    client: Arc<dyn UpstreamClient>,
    options: AlertOptions,
}

impl AlertEngine {
    pub fn new(
        storage: Arc<dyn Storage>,
        blob: Arc<dyn BlobStore>,
        client: Arc<dyn UpstreamClient>,
        options: AlertOptions,
    ) -> Self {
        Self {
            storage,
            blob,
            client,
            options,
        }
    }

    pub async fn tick(&self) {
        let mut state = self.load_state().await;
        let before = state.clone();

        self.scan_auth_failures(&mut state).await;
        self.scan_daily_quota(&mut state).await;

        if state != before {
            self.save_state(&state).await;
        }
    }

    async fn scan_auth_failures(&self, state: &mut AlertState) {
        let now = clock::now_unix_ms();
        let since = clock::beijing_minute(now - AUTH_FAILED_WINDOW_MINUTES * 60 * 1000);
        let sums = match self.storage.chat_outcomes_since(&since).await {
            Ok(sums) => sums,
            Err(err) => {
                warn!(event = "alert_auth_scan_failed", error = %err);
                return;
            }
        };

        let mut failed: Vec<String> = sums
            .into_iter()
            .filter(|s| s.auth_expired > 0 && s.success == 0)
            .map(|s| s.provider_id)
            .collect();
        failed.sort();
        let fingerprint = failed.join(",");

        if fingerprint == state.auth_failed_fingerprint {
            return;
        }

        if !fingerprint.is_empty() {
            self.send_webhook(&format!(
                "[qgate] ALERT: {} account(s) persistently auth-failed in the last {} minutes: {}",
                failed.len(),
                AUTH_FAILED_WINDOW_MINUTES,
                fingerprint
            ))
            .await;
        } else {
            self.send_webhook(
                "[qgate] RECOVERY: all accounts are authenticating again",
            )
            .await;
        }
        state.auth_failed_fingerprint = fingerprint;
    }

    async fn scan_daily_quota(&self, state: &mut AlertState) {
        let today = clock::beijing_date(clock::now_unix_ms());
        let total = match self.storage.chat_attempts_on(&today).await {
            Ok(total) => total,
            Err(err) => {
                warn!(event = "alert_quota_scan_failed", error = %err);
                return;
            }
        };
        let provider_count = match self.storage.provider_records().await {
            Ok(records) => records.len() as i64,
            Err(err) => {
                warn!(event = "alert_quota_scan_failed", error = %err);
                return;
            }
        };

        let limit = provider_count * self.options.per_account_daily_limit as i64;
        if limit <= 0 {
            return;
        }
        let percent = ((total.max(0) * 100) / limit) as u32;
        let threshold = self.options.quota_threshold_percent;

        if !state.quota_alerted && percent >= threshold {
            self.send_webhook(&format!(
                "[qgate] ALERT: global daily chat quota at {percent}% ({total}/{limit} requests)"
            ))
            .await;
            state.quota_alerted = true;
        } else if state.quota_alerted
            && percent < threshold.saturating_sub(RECOVERY_HYSTERESIS)
        {
            self.send_webhook(&format!(
                "[qgate] RECOVERY: global daily chat quota back to {percent}%"
            ))
            .await;
            state.quota_alerted = false;
        }
    }

    /// Payload shape is auto-detected from the destination URL.
    async fn send_webhook(&self, message: &str) {
        let url = &self.options.webhook_url;
        let payload = if url.contains("dingtalk") {
            json!({ "msgtype": "text", "text": { "content": message } })
        } else if url.contains("feishu") || url.contains("larksuite") {
            json!({ "msg_type": "text", "content": { "text": message } })
        } else {
            json!({ "text": message })
        };

        let request = UpstreamHttpRequest::post(url.clone(), WEBHOOK_TIMEOUT).json_body(&payload);
        match self.client.send(request).await {
            Ok(response) if response.is_success() => {
                info!(event = "alert_webhook_sent", status = response.status);
            }
            Ok(response) => {
                warn!(event = "alert_webhook_rejected", status = response.status);
            }
            Err(err) => {
                warn!(event = "alert_webhook_failed", error = %err.message);
            }
        }
    }

    async fn load_state(&self) -> AlertState {
        match self.blob.get(STATE_KEY).await {
            Ok(Some(value)) => serde_json::from_value(value).unwrap_or_default(),
            Ok(None) => AlertState::default(),
            Err(err) => {
                warn!(event = "alert_state_read_failed", error = %err);
                AlertState::default()
            }
        }
    }

    async fn save_state(&self, state: &AlertState) {
        let value = match serde_json::to_value(state) {
            Ok(value) => value,
            Err(_) => return,
        };
        if let Err(err) = self.blob.set(STATE_KEY, &value, None).await {
            warn!(event = "alert_state_write_failed", error = %err);
        }
    }
}
