use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use crate::storage::{ProviderRecord, Storage, StorageResult};

/// Strip the legacy `./` prefix; registry rows and pool ids are always
/// canonical.
pub fn canonical_id(id: &str) -> &str {
    id.strip_prefix("./").unwrap_or(id)
}

/// Durable table of known account ids and aliases, backed by the relational
/// store. The registry is the source of truth for aliases; the copy inside a
/// credential blob is a cache.
#[derive(Clone)]
pub struct ProviderRegistry {
    storage: Arc<dyn Storage>,
}

impl ProviderRegistry {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Load all records, self-healing from historical usage rows when the
    /// table is empty (fresh deploy against a populated audit store).
    pub async fn load(&self) -> StorageResult<Vec<ProviderRecord>> {
        let records = self.storage.provider_records().await?;
        if !records.is_empty() {
            return Ok(records);
        }

        let historical = self.storage.usage_provider_ids().await?;
        if historical.is_empty() {
            return Ok(records);
        }

        info!(
            event = "registry_self_heal",
            recovered = historical.len()
        );
        for id in &historical {
            self.storage
                .upsert_provider_record(canonical_id(id), None)
                .await?;
        }
        self.storage.provider_records().await
    }

    pub async fn enroll(&self, id: &str, alias: Option<&str>) -> StorageResult<()> {
        self.storage
            .upsert_provider_record(canonical_id(id), alias)
            .await
    }

    pub async fn rename(&self, id: &str, alias: &str) -> StorageResult<()> {
        self.storage
            .upsert_provider_record(canonical_id(id), Some(alias))
            .await
    }

    pub async fn remove(&self, id: &str) -> StorageResult<()> {
        self.storage.delete_provider_record(canonical_id(id)).await
    }

    pub async fn alias_map(&self) -> StorageResult<HashMap<String, String>> {
        let records = self.storage.provider_records().await?;
        Ok(records
            .into_iter()
            .filter_map(|r| r.alias.map(|alias| (r.id, alias)))
            .collect())
    }
}
