use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Canonical credential keys look like `qwen_creds_<8-hex>.json`. A legacy
/// `./`-prefixed form may still exist in the blob store and is migrated on
/// first read.
pub const CREDS_KEY_PREFIX: &str = "qwen_creds_";
/// Older enrollments used this prefix; still honored by full scans.
pub const OAUTH_CREDS_KEY_PREFIX: &str = "oauth_creds_";

pub const DEFAULT_RESOURCE_BASE: &str = "https://portal.qwen.ai";

/// Refresh this many ms before the recorded expiry.
pub const EXPIRY_SAFETY_WINDOW_MS: i64 = 300_000;

/// One upstream OAuth identity. Only the two tokens are required; everything
/// else the vendor may omit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QwenCredential {
    #[serde(alias = "access_token")]
    pub access_token: String,
    #[serde(alias = "refresh_token")]
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "token_type")]
    pub token_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Bare host or full URL; normalized at use time.
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "resource_url")]
    pub resource_url: Option<String>,
    /// Treated as absent when zero.
    #[serde(default, alias = "expiry_date")]
    pub expiry_unix_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl QwenCredential {
    pub fn expiry(&self) -> Option<i64> {
        (self.expiry_unix_ms != 0).then_some(self.expiry_unix_ms)
    }

    /// Inside the 5-minute safety window (or past expiry).
    pub fn needs_refresh(&self, now_ms: i64) -> bool {
        match self.expiry() {
            Some(expiry) => now_ms >= expiry - EXPIRY_SAFETY_WINDOW_MS,
            None => false,
        }
    }
}

/// `https://<host>` with no trailing slash; `https://` is prepended when the
/// stored value is a bare host, and a `/v1` suffix is stripped so callers can
/// append the path shape they need.
pub fn normalized_resource_base(resource_url: Option<&str>) -> String {
    let raw = resource_url
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_RESOURCE_BASE);
    let with_scheme = if raw.starts_with("http://") || raw.starts_with("https://") {
        raw.to_string()
    } else {
        format!("https://{raw}")
    };
    let trimmed = with_scheme.trim_end_matches('/');
    trimmed
        .strip_suffix("/v1")
        .unwrap_or(trimmed)
        .to_string()
}

/// `<base>/v1` for the OpenAI-compatible surface.
pub fn chat_api_base(resource_url: Option<&str>) -> String {
    format!("{}/v1", normalized_resource_base(resource_url))
}

pub fn canonical_creds_key(id: &str) -> &str {
    qgate_storage::canonical_id(id)
}

pub fn legacy_creds_key(canonical: &str) -> String {
    format!("./{canonical}")
}

/// Fresh canonical key for a newly enrolled account.
pub fn new_creds_key() -> String {
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut hex = String::with_capacity(8);
    for b in bytes {
        hex.push_str(&format!("{b:02x}"));
    }
    format!("{CREDS_KEY_PREFIX}{hex}.json")
}

/// Display alias fallback: the account id with known prefixes/suffixes
/// stripped.
pub fn short_account_id(id: &str) -> String {
    let id = canonical_creds_key(id);
    let id = id
        .strip_prefix(CREDS_KEY_PREFIX)
        .or_else(|| id.strip_prefix(OAUTH_CREDS_KEY_PREFIX))
        .unwrap_or(id);
    id.strip_suffix(".json").unwrap_or(id).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_round_trips_byte_identical() {
        let cred = QwenCredential {
            access_token: "at".to_string(),
            refresh_token: "rt".to_string(),
            token_type: Some("Bearer".to_string()),
            scope: Some("openid".to_string()),
            resource_url: Some("portal.qwen.ai".to_string()),
            expiry_unix_ms: 1_700_000_000_000,
            alias: None,
        };
        let encoded = serde_json::to_string(&cred).unwrap();
        let decoded: QwenCredential = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, cred);
        assert_eq!(serde_json::to_string(&decoded).unwrap(), encoded);
    }

    #[test]
    fn snake_case_aliases_are_accepted() {
        let cred: QwenCredential = serde_json::from_value(serde_json::json!({
            "access_token": "at",
            "refresh_token": "rt",
            "resource_url": "https://portal.qwen.ai/v1",
            "expiry_date": 5
        }))
        .unwrap();
        assert_eq!(cred.access_token, "at");
        assert_eq!(cred.expiry_unix_ms, 5);
    }

    #[test]
    fn zero_expiry_reads_as_absent() {
        let cred: QwenCredential = serde_json::from_value(serde_json::json!({
            "accessToken": "at",
            "refreshToken": "rt"
        }))
        .unwrap();
        assert_eq!(cred.expiry(), None);
        assert!(!cred.needs_refresh(i64::MAX));
    }

    #[test]
    fn expiry_window_boundary_triggers_refresh() {
        let cred = QwenCredential {
            access_token: "at".to_string(),
            refresh_token: "rt".to_string(),
            token_type: None,
            scope: None,
            resource_url: None,
            expiry_unix_ms: 1_000_000,
            alias: None,
        };
        assert!(cred.needs_refresh(1_000_000 - EXPIRY_SAFETY_WINDOW_MS));
        assert!(!cred.needs_refresh(1_000_000 - EXPIRY_SAFETY_WINDOW_MS - 1));
    }

    #[test]
    fn resource_base_normalization() {
        assert_eq!(
            normalized_resource_base(Some("portal.qwen.ai")),
            "https://portal.qwen.ai"
        );
        assert_eq!(
            normalized_resource_base(Some("https://portal.qwen.ai/v1/")),
            "https://portal.qwen.ai"
        );
        assert_eq!(normalized_resource_base(None), "https://portal.qwen.ai");
        assert_eq!(
            chat_api_base(Some("example.com/")),
            "https://example.com/v1"
        );
    }

    #[test]
    fn short_ids_strip_known_affixes() {
        assert_eq!(short_account_id("qwen_creds_ab12cd34.json"), "ab12cd34");
        assert_eq!(short_account_id("./oauth_creds_ff00.json"), "ff00");
        assert_eq!(short_account_id("custom"), "custom");
    }

    #[test]
    fn new_keys_are_canonical() {
        let key = new_creds_key();
        assert!(key.starts_with(CREDS_KEY_PREFIX));
        assert!(key.ends_with(".json"));
        assert_eq!(key.len(), CREDS_KEY_PREFIX.len() + 8 + ".json".len());
    }
}
