use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use sea_orm::{
    ActiveModelTrait, ActiveValue, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
};
use serde_json::Value as JsonValue;
use tracing::warn;
use uuid::Uuid;

use crate::entities;

pub type BlobResult<T> = Result<T, BlobError>;

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("db error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("serde json error: {0}")]
    Serde(#[from] serde_json::Error),
}

fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Abstract key-value blob store with advisory TTL, prefix listing, and a
/// best-effort distributed lock.
///
/// The lock is CAS-like, never blocking: generate a fresh token, write it
/// under `lock:<name>`, read back, and only claim acquisition when the
/// read-back matches. Correctness under lock failure degrades to "possibly
/// duplicate refresh", never to stale credentials.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, key: &str) -> BlobResult<Option<JsonValue>>;
    async fn set(&self, key: &str, value: &JsonValue, ttl: Option<Duration>) -> BlobResult<()>;
    async fn delete(&self, key: &str) -> BlobResult<()>;
    /// Key names only. The underlying store may rate-limit this.
    async fn list_prefix(&self, prefix: &str) -> BlobResult<Vec<String>>;

    async fn acquire_lock(&self, name: &str, ttl: Duration) -> BlobResult<Option<String>> {
        let key = format!("lock:{name}");
        if self.get(&key).await?.is_some() {
            return Ok(None);
        }
        let token = Uuid::new_v4().to_string();
        self.set(&key, &JsonValue::String(token.clone()), Some(ttl))
            .await?;
        let current = self.get(&key).await?;
        match current {
            Some(JsonValue::String(value)) if value == token => Ok(Some(token)),
            _ => Ok(None),
        }
    }

    async fn release_lock(&self, name: &str, token: &str) -> BlobResult<()> {
        let key = format!("lock:{name}");
        match self.get(&key).await? {
            Some(JsonValue::String(value)) if value == token => self.delete(&key).await,
            _ => Ok(()),
        }
    }
}

/// In-memory store used by tests and as the degraded mode when no relational
/// store is reachable.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    entries: Mutex<HashMap<String, (JsonValue, Option<i64>)>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, key: &str) -> BlobResult<Option<JsonValue>> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((_, Some(expires_at))) = entries.get(key) {
            if *expires_at <= now_unix_ms() {
                entries.remove(key);
                return Ok(None);
            }
        }
        Ok(entries.get(key).map(|(value, _)| value.clone()))
    }

    async fn set(&self, key: &str, value: &JsonValue, ttl: Option<Duration>) -> BlobResult<()> {
        let expires_at = ttl.map(|t| now_unix_ms() + t.as_millis() as i64);
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), (value.clone(), expires_at));
        Ok(())
    }

    async fn delete(&self, key: &str) -> BlobResult<()> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> BlobResult<Vec<String>> {
        let now = now_unix_ms();
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(key, (_, expires_at))| {
                key.starts_with(prefix) && expires_at.map(|at| at > now).unwrap_or(true)
            })
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// Relational-store-backed blob store (`kv_store` table). TTL expiry is lazy:
/// expired rows read as absent and are deleted opportunistically.
#[derive(Clone)]
pub struct SqlBlobStore {
    db: DatabaseConnection,
}

impl SqlBlobStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl BlobStore for SqlBlobStore {
    async fn get(&self, key: &str) -> BlobResult<Option<JsonValue>> {
        let row = entities::KvStore::find_by_id(key.to_string())
            .one(&self.db)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        if let Some(expires_at) = row.expires_at {
            if expires_at <= now_unix_ms() {
                if let Err(err) = entities::KvStore::delete_by_id(key.to_string())
                    .exec(&self.db)
                    .await
                {
                    warn!(event = "kv_expire_sweep_failed", key = %key, error = %err);
                }
                return Ok(None);
            }
        }
        Ok(Some(serde_json::from_str(&row.value)?))
    }

    async fn set(&self, key: &str, value: &JsonValue, ttl: Option<Duration>) -> BlobResult<()> {
        use entities::kv_store::ActiveModel as KvActive;

        let serialized = serde_json::to_string(value)?;
        let expires_at = ttl.map(|t| now_unix_ms() + t.as_millis() as i64);

        let existing = entities::KvStore::find_by_id(key.to_string())
            .one(&self.db)
            .await?;
        match existing {
            Some(model) => {
                let mut active: KvActive = model.into();
                active.value = ActiveValue::Set(serialized);
                active.expires_at = ActiveValue::Set(expires_at);
                active.update(&self.db).await?;
            }
            None => {
                let active = KvActive {
                    key: ActiveValue::Set(key.to_string()),
                    value: ActiveValue::Set(serialized),
                    expires_at: ActiveValue::Set(expires_at),
                };
                entities::KvStore::insert(active).exec(&self.db).await?;
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> BlobResult<()> {
        entities::KvStore::delete_by_id(key.to_string())
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> BlobResult<Vec<String>> {
        use entities::kv_store::Column;
        let now = now_unix_ms();
        let rows = entities::KvStore::find()
            .filter(Column::Key.starts_with(prefix))
            .all(&self.db)
            .await?;
        let mut keys: Vec<String> = rows
            .into_iter()
            .filter(|row| row.expires_at.map(|at| at > now).unwrap_or(true))
            .map(|row| row.key)
            .collect();
        keys.sort();
        Ok(keys)
    }
}
