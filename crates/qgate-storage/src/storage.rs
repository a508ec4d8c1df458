use std::collections::HashMap;

use async_trait::async_trait;

use qgate_common::GatewayConfig;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("db error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("serde json error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// One row of the durable account registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderRecord {
    pub id: String,
    pub alias: Option<String>,
    pub updated_at: i64,
}

#[derive(Debug, Clone)]
pub struct GatewayConfigRow {
    pub config: GatewayConfig,
    pub updated_at: i64,
}

/// One audit row as read back for the admin surface.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct AuditRow {
    pub minute_bucket: String,
    pub provider_id: String,
    pub kind: String,
    pub outcome: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageDelta {
    pub date: String,
    pub provider_id: String,
    pub kind: String,
    pub delta: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditDelta {
    pub minute_bucket: String,
    pub provider_id: String,
    pub kind: String,
    pub outcome: String,
    pub delta: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalDelta {
    pub key: String,
    pub delta: i64,
}

/// One flush of buffered counters, applied as a single transaction of
/// `INSERT .. ON CONFLICT .. DO UPDATE SET count = count + excluded.count`
/// statements. Deltas are pre-summed by key; zero deltas are never emitted.
#[derive(Debug, Clone, Default)]
pub struct CounterBatch {
    pub usage: Vec<UsageDelta>,
    pub audit: Vec<AuditDelta>,
    pub global: Vec<GlobalDelta>,
}

impl CounterBatch {
    pub fn is_empty(&self) -> bool {
        self.usage.is_empty() && self.audit.is_empty() && self.global.is_empty()
    }
}

/// Aggregated per-provider outcome counts used by the alert scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderOutcomeSums {
    pub provider_id: String,
    pub auth_expired: i64,
    pub success: i64,
}

/// Storage is used for:
/// - bootstrap (schema sync, config row)
/// - counter flushes (write-only, batched)
/// - snapshot reads (usage/audit aggregates, registry)
///
/// Hot-path admission reads go through the quota manager's short-TTL cache,
/// not directly through this trait.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Idempotent schema materialization. Runs once at cold start.
    async fn sync(&self) -> StorageResult<()>;

    async fn load_gateway_config(&self) -> StorageResult<Option<GatewayConfigRow>>;
    async fn upsert_gateway_config(&self, config: &GatewayConfig) -> StorageResult<()>;

    async fn apply_counter_batch(&self, batch: &CounterBatch) -> StorageResult<()>;

    /// Daily used count per kind for one account.
    async fn usage_by_kind(
        &self,
        date: &str,
        provider_id: &str,
    ) -> StorageResult<HashMap<String, i64>>;

    /// Daily used counts for many accounts in one grouped query, keyed by
    /// `(provider_id, kind)`. Unknown ids are simply absent.
    async fn usage_by_kind_batch(
        &self,
        date: &str,
        provider_ids: &[String],
    ) -> StorageResult<HashMap<(String, String), i64>>;

    /// Attempts recorded in one minute bucket per kind for one account,
    /// summed across outcomes. Authoritative RPM across instances.
    async fn minute_attempts(
        &self,
        minute_bucket: &str,
        provider_id: &str,
    ) -> StorageResult<HashMap<String, i64>>;

    async fn minute_attempts_batch(
        &self,
        minute_bucket: &str,
        provider_ids: &[String],
    ) -> StorageResult<HashMap<(String, String), i64>>;

    /// Most recent audit rows, `minute_bucket` descending. When
    /// `include_success` is false, `outcome='success'` rows are filtered.
    async fn recent_audit(&self, limit: u64, include_success: bool)
        -> StorageResult<Vec<AuditRow>>;

    // Registry
    async fn provider_records(&self) -> StorageResult<Vec<ProviderRecord>>;
    async fn upsert_provider_record(&self, id: &str, alias: Option<&str>) -> StorageResult<()>;
    async fn delete_provider_record(&self, id: &str) -> StorageResult<()>;
    /// Distinct provider ids ever seen in `usage_stats`; registry self-heal.
    async fn usage_provider_ids(&self) -> StorageResult<Vec<String>>;

    // Global counters
    async fn global_counters(&self) -> StorageResult<HashMap<String, i64>>;
    async fn set_global_counter_if_absent(&self, key: &str, value: i64) -> StorageResult<()>;

    // Alert scans
    async fn chat_outcomes_since(
        &self,
        since_minute: &str,
    ) -> StorageResult<Vec<ProviderOutcomeSums>>;
    async fn chat_attempts_on(&self, date: &str) -> StorageResult<i64>;
}
