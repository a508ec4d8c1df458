use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum GatewayConfigError {
    #[error("missing required gateway config field: {0}")]
    MissingField(&'static str),
}

/// Per-kind admission limits. `0` means "not enforced".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaLimits {
    pub daily: u32,
    pub rpm: u32,
}

impl QuotaLimits {
    pub const fn new(daily: u32, rpm: u32) -> Self {
        Self { daily, rpm }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaConfig {
    pub chat: QuotaLimits,
    pub search: QuotaLimits,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            chat: QuotaLimits::new(2000, 60),
            search: QuotaLimits::new(2000, 60),
        }
    }
}

/// Final, merged gateway configuration used by the running process.
///
/// Merge order (after DB connection): CLI > ENV > DB, then persist back to DB.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Shared bearer expected on the OpenAI-compatible surface.
    pub api_key: String,
    /// Key expected in `X-Admin-Key` on the admin surface.
    pub admin_key: String,
    /// Database DSN used by this process.
    pub dsn: String,
    /// Public OAuth client identifier for the Qwen device-code flow.
    pub oauth_client_id: String,
    pub quota: QuotaConfig,
    /// When false, `outcome='success'` rows are filtered from recent-audit reads.
    pub audit_success_logs: bool,
    /// Lower bound of the pool light-rescan interval, clamped to >= 5 seconds.
    pub provider_scan_seconds: u64,
    /// When > 0, a periodic full KV scan of the blob store is permitted.
    pub provider_full_kv_scan_minutes: u64,
    /// Static seed list of canonical credential keys, unioned with the registry.
    #[serde(default)]
    pub auth_files: Vec<String>,
    /// Inbound model name -> upstream model name (exact, then prefix match).
    #[serde(default)]
    pub model_mappings: HashMap<String, String>,
    /// Alert webhook destination (DingTalk/Feishu detected from the URL).
    #[serde(default)]
    pub alert_webhook_url: Option<String>,
    /// Daily-quota alert threshold in percent.
    pub alert_quota_threshold: u32,
    /// Alert scan cadence in minutes.
    pub alert_interval_minutes: u64,
    /// Free-tier per-account daily request allowance used for the quota alert.
    pub per_account_daily_limit: u32,
}

impl GatewayConfig {
    pub fn scan_interval_seconds(&self) -> u64 {
        self.provider_scan_seconds.max(5)
    }
}

/// Optional layer used for merging gateway config.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GatewayConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub api_key: Option<String>,
    pub admin_key: Option<String>,
    pub dsn: Option<String>,
    pub oauth_client_id: Option<String>,
    pub quota: Option<QuotaConfig>,
    pub audit_success_logs: Option<bool>,
    pub provider_scan_seconds: Option<u64>,
    pub provider_full_kv_scan_minutes: Option<u64>,
    pub auth_files: Option<Vec<String>>,
    pub model_mappings: Option<HashMap<String, String>>,
    pub alert_webhook_url: Option<String>,
    pub alert_quota_threshold: Option<u32>,
    pub alert_interval_minutes: Option<u64>,
    pub per_account_daily_limit: Option<u32>,
}

/// Public client id of the Qwen CLI device-code application.
pub const DEFAULT_OAUTH_CLIENT_ID: &str = "f0304373b74a44d2b584a3fb70ca9e56";

impl GatewayConfigPatch {
    pub fn overlay(&mut self, other: GatewayConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.api_key.is_some() {
            self.api_key = other.api_key;
        }
        if other.admin_key.is_some() {
            self.admin_key = other.admin_key;
        }
        if other.dsn.is_some() {
            self.dsn = other.dsn;
        }
        if other.oauth_client_id.is_some() {
            self.oauth_client_id = other.oauth_client_id;
        }
        if other.quota.is_some() {
            self.quota = other.quota;
        }
        if other.audit_success_logs.is_some() {
            self.audit_success_logs = other.audit_success_logs;
        }
        if other.provider_scan_seconds.is_some() {
            self.provider_scan_seconds = other.provider_scan_seconds;
        }
        if other.provider_full_kv_scan_minutes.is_some() {
            self.provider_full_kv_scan_minutes = other.provider_full_kv_scan_minutes;
        }
        if other.auth_files.is_some() {
            self.auth_files = other.auth_files;
        }
        if other.model_mappings.is_some() {
            self.model_mappings = other.model_mappings;
        }
        if other.alert_webhook_url.is_some() {
            self.alert_webhook_url = other.alert_webhook_url;
        }
        if other.alert_quota_threshold.is_some() {
            self.alert_quota_threshold = other.alert_quota_threshold;
        }
        if other.alert_interval_minutes.is_some() {
            self.alert_interval_minutes = other.alert_interval_minutes;
        }
        if other.per_account_daily_limit.is_some() {
            self.per_account_daily_limit = other.per_account_daily_limit;
        }
    }

    pub fn into_config(self) -> Result<GatewayConfig, GatewayConfigError> {
        Ok(GatewayConfig {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(8788),
            api_key: self.api_key.ok_or(GatewayConfigError::MissingField("api_key"))?,
            admin_key: self
                .admin_key
                .ok_or(GatewayConfigError::MissingField("admin_key"))?,
            dsn: self.dsn.ok_or(GatewayConfigError::MissingField("dsn"))?,
            oauth_client_id: self
                .oauth_client_id
                .unwrap_or_else(|| DEFAULT_OAUTH_CLIENT_ID.to_string()),
            quota: self.quota.unwrap_or_default(),
            audit_success_logs: self.audit_success_logs.unwrap_or(true),
            provider_scan_seconds: self.provider_scan_seconds.unwrap_or(30),
            provider_full_kv_scan_minutes: self.provider_full_kv_scan_minutes.unwrap_or(0),
            auth_files: self.auth_files.unwrap_or_default(),
            model_mappings: self.model_mappings.unwrap_or_default(),
            alert_webhook_url: self.alert_webhook_url,
            alert_quota_threshold: self.alert_quota_threshold.unwrap_or(80),
            alert_interval_minutes: self.alert_interval_minutes.unwrap_or(5),
            per_account_daily_limit: self.per_account_daily_limit.unwrap_or(2000),
        })
    }
}

impl From<GatewayConfig> for GatewayConfigPatch {
    fn from(value: GatewayConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            api_key: Some(value.api_key),
            admin_key: Some(value.admin_key),
            dsn: Some(value.dsn),
            oauth_client_id: Some(value.oauth_client_id),
            quota: Some(value.quota),
            audit_success_logs: Some(value.audit_success_logs),
            provider_scan_seconds: Some(value.provider_scan_seconds),
            provider_full_kv_scan_minutes: Some(value.provider_full_kv_scan_minutes),
            auth_files: Some(value.auth_files),
            model_mappings: Some(value.model_mappings),
            alert_webhook_url: value.alert_webhook_url,
            alert_quota_threshold: Some(value.alert_quota_threshold),
            alert_interval_minutes: Some(value.alert_interval_minutes),
            per_account_daily_limit: Some(value.per_account_daily_limit),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_patch() -> GatewayConfigPatch {
        GatewayConfigPatch {
            api_key: Some("sk-test".to_string()),
            admin_key: Some("admin".to_string()),
            dsn: Some("sqlite::memory:".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn overlay_prefers_incoming_fields() {
        let mut base = minimal_patch();
        base.port = Some(9000);
        base.overlay(GatewayConfigPatch {
            port: Some(9100),
            oauth_client_id: Some("custom".to_string()),
            ..Default::default()
        });
        let config = base.into_config().unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.oauth_client_id, "custom");
        assert_eq!(config.quota.chat.daily, 2000);
    }

    #[test]
    fn missing_api_key_is_an_error() {
        let mut patch = minimal_patch();
        patch.api_key = None;
        assert!(patch.into_config().is_err());
    }

    #[test]
    fn scan_interval_is_clamped() {
        let mut patch = minimal_patch();
        patch.provider_scan_seconds = Some(1);
        let config = patch.into_config().unwrap();
        assert_eq!(config.scan_interval_seconds(), 5);
    }
}
