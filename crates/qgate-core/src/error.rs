/// Outcome classification for one account attempt. The dispatch rotation
/// aggregates these into the gateway response; the audit trail records
/// `error:<reason>` rows keyed off [`AccountFailure::audit_reason`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum AccountFailure {
    #[error("Missing Credentials")]
    MissingCredentials,
    /// Terminal for this account until an admin re-auths; never retried.
    #[error("Unauthorized (Please Login)")]
    AuthExpired,
    #[error("Rate limited")]
    RateLimited,
    /// Upstream 429 whose body names free-tier exhaustion.
    #[error("Quota exceeded (Qwen free tier)")]
    QuotaExceeded,
    #[error("Upstream Error: {status}")]
    Upstream { status: u16, detail: String },
    #[error("Upstream Timeout ({0}s)")]
    Timeout(u64),
    #[error("Transport error: {0}")]
    Transport(String),
    /// Another instance held the refresh lock and never published a rotated
    /// token within the wait window.
    #[error("Timeout or failure waiting for token update")]
    RefreshLockTimeout,
    /// 2xx search response with a non-zero functional status.
    #[error("invalid_payload: {0}")]
    InvalidPayload(String),
}

impl AccountFailure {
    /// `error:<reason>` suffix recorded in the minute audit.
    pub fn audit_reason(&self) -> String {
        match self {
            AccountFailure::AuthExpired => "auth_expired".to_string(),
            AccountFailure::RateLimited => "upstream_429".to_string(),
            AccountFailure::QuotaExceeded => "upstream_quota_exceeded".to_string(),
            AccountFailure::Upstream { status, .. } => format!("upstream_{status}"),
            AccountFailure::Timeout(_) => "upstream_timeout".to_string(),
            AccountFailure::InvalidPayload(_) => "invalid_payload".to_string(),
            AccountFailure::MissingCredentials
            | AccountFailure::Transport(_)
            | AccountFailure::RefreshLockTimeout => "runtime_error".to_string(),
        }
    }

    pub fn is_auth_expired(&self) -> bool {
        matches!(self, AccountFailure::AuthExpired)
    }
}
