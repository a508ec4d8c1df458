use std::collections::HashMap;

use sea_orm::sea_query::Index;
use sea_orm::{
    ActiveModelTrait, ActiveValue, ColumnTrait, ConnectionTrait, Database, DatabaseBackend,
    DatabaseConnection, EntityTrait, FromQueryResult, QueryFilter, QueryOrder, QuerySelect,
    Statement, TransactionTrait,
};
use time::OffsetDateTime;

use qgate_common::GatewayConfig;

use crate::entities;
use crate::storage::{
    AuditRow, CounterBatch, GatewayConfigRow, ProviderOutcomeSums, ProviderRecord, Storage,
    StorageResult,
};

const UPSERT_USAGE: &str = "INSERT INTO usage_stats (date, provider_id, kind, count) \
     VALUES (?, ?, ?, ?) \
     ON CONFLICT(date, provider_id, kind) DO UPDATE SET count = count + excluded.count";

const UPSERT_AUDIT: &str =
    "INSERT INTO request_audit_minute (minute_bucket, provider_id, kind, outcome, count) \
     VALUES (?, ?, ?, ?, ?) \
     ON CONFLICT(minute_bucket, provider_id, kind, outcome) \
     DO UPDATE SET count = count + excluded.count";

const UPSERT_GLOBAL: &str = "INSERT INTO global_monitor (key, value) VALUES (?, ?) \
     ON CONFLICT(key) DO UPDATE SET value = value + excluded.value";

#[derive(Debug, FromQueryResult)]
struct OutcomeSumRow {
    provider_id: String,
    auth_expired: Option<i64>,
    success: Option<i64>,
}

#[derive(Debug, FromQueryResult)]
struct CountTotalRow {
    total: Option<i64>,
}

#[derive(Clone)]
pub struct SeaOrmStorage {
    db: DatabaseConnection,
}

impl SeaOrmStorage {
    pub async fn connect(dsn: &str) -> StorageResult<Self> {
        let db = Database::connect(dsn).await?;
        if db.get_database_backend() == DatabaseBackend::Sqlite {
            db.execute_unprepared("PRAGMA foreign_keys = ON").await?;
        }
        Ok(Self { db })
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    fn backend(&self) -> DatabaseBackend {
        self.db.get_database_backend()
    }

    async fn ensure_indexes(&self) -> StorageResult<()> {
        use entities::request_audit_minute::Column as AuditColumn;
        use entities::usage_stats::Column as UsageColumn;

        let statements = vec![
            Index::create()
                .name("idx_usage_stats_partition")
                .table(entities::usage_stats::Entity)
                .col(UsageColumn::Date)
                .col(UsageColumn::ProviderId)
                .col(UsageColumn::Kind)
                .unique()
                .if_not_exists()
                .to_owned(),
            Index::create()
                .name("idx_request_audit_minute_bucket")
                .table(entities::request_audit_minute::Entity)
                .col(AuditColumn::MinuteBucket)
                .col(AuditColumn::Kind)
                .if_not_exists()
                .to_owned(),
        ];

        for statement in statements {
            self.db.execute(self.backend().build(&statement)).await?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Storage for SeaOrmStorage {
    async fn sync(&self) -> StorageResult<()> {
        let backend = self.backend();
        let schema = sea_orm::Schema::new(backend);

        let mut tables = vec![
            schema.create_table_from_entity(entities::GatewayConfig),
            schema.create_table_from_entity(entities::Providers),
            schema.create_table_from_entity(entities::UsageStats),
            schema.create_table_from_entity(entities::RequestAuditMinute),
            schema.create_table_from_entity(entities::GlobalMonitor),
            schema.create_table_from_entity(entities::KvStore),
        ];
        for table in &mut tables {
            table.if_not_exists();
            self.db.execute(backend.build(&*table)).await?;
        }

        self.ensure_indexes().await?;
        Ok(())
    }

    async fn load_gateway_config(&self) -> StorageResult<Option<GatewayConfigRow>> {
        let row = entities::GatewayConfig::find_by_id(1_i64)
            .one(&self.db)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let config: GatewayConfig = serde_json::from_value(row.config)?;
        Ok(Some(GatewayConfigRow {
            config,
            updated_at: row.updated_at,
        }))
    }

    async fn upsert_gateway_config(&self, config: &GatewayConfig) -> StorageResult<()> {
        use entities::gateway_config::ActiveModel as ConfigActive;

        let now = OffsetDateTime::now_utc().unix_timestamp();
        let config_json = serde_json::to_value(config)?;

        let existing = entities::GatewayConfig::find_by_id(1_i64)
            .one(&self.db)
            .await?;
        match existing {
            Some(model) => {
                let mut active: ConfigActive = model.into();
                active.config = ActiveValue::Set(config_json);
                active.updated_at = ActiveValue::Set(now);
                active.update(&self.db).await?;
            }
            None => {
                let active = ConfigActive {
                    id: ActiveValue::Set(1),
                    config: ActiveValue::Set(config_json),
                    updated_at: ActiveValue::Set(now),
                };
                entities::GatewayConfig::insert(active).exec(&self.db).await?;
            }
        }
        Ok(())
    }

    async fn apply_counter_batch(&self, batch: &CounterBatch) -> StorageResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let backend = self.backend();
        let txn = self.db.begin().await?;
        for row in &batch.usage {
            txn.execute(Statement::from_sql_and_values(
                backend,
                UPSERT_USAGE,
                [
                    row.date.clone().into(),
                    row.provider_id.clone().into(),
                    row.kind.clone().into(),
                    row.delta.into(),
                ],
            ))
            .await?;
        }
        for row in &batch.audit {
            txn.execute(Statement::from_sql_and_values(
                backend,
                UPSERT_AUDIT,
                [
                    row.minute_bucket.clone().into(),
                    row.provider_id.clone().into(),
                    row.kind.clone().into(),
                    row.outcome.clone().into(),
                    row.delta.into(),
                ],
            ))
            .await?;
        }
        for row in &batch.global {
            txn.execute(Statement::from_sql_and_values(
                backend,
                UPSERT_GLOBAL,
                [row.key.clone().into(), row.delta.into()],
            ))
            .await?;
        }
        txn.commit().await?;
        Ok(())
    }

    async fn usage_by_kind(
        &self,
        date: &str,
        provider_id: &str,
    ) -> StorageResult<HashMap<String, i64>> {
        use entities::usage_stats::Column;
        let rows = entities::UsageStats::find()
            .filter(Column::Date.eq(date))
            .filter(Column::ProviderId.eq(provider_id))
            .all(&self.db)
            .await?;
        Ok(rows.into_iter().map(|m| (m.kind, m.count)).collect())
    }

    async fn usage_by_kind_batch(
        &self,
        date: &str,
        provider_ids: &[String],
    ) -> StorageResult<HashMap<(String, String), i64>> {
        use entities::usage_stats::Column;
        if provider_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = entities::UsageStats::find()
            .filter(Column::Date.eq(date))
            .filter(Column::ProviderId.is_in(provider_ids.iter().cloned()))
            .all(&self.db)
            .await?;
        Ok(rows
            .into_iter()
            .map(|m| ((m.provider_id, m.kind), m.count))
            .collect())
    }

    async fn minute_attempts(
        &self,
        minute_bucket: &str,
        provider_id: &str,
    ) -> StorageResult<HashMap<String, i64>> {
        use entities::request_audit_minute::Column;
        let rows = entities::RequestAuditMinute::find()
            .filter(Column::MinuteBucket.eq(minute_bucket))
            .filter(Column::ProviderId.eq(provider_id))
            .all(&self.db)
            .await?;
        let mut sums = HashMap::new();
        for row in rows {
            *sums.entry(row.kind).or_insert(0) += row.count;
        }
        Ok(sums)
    }

    async fn minute_attempts_batch(
        &self,
        minute_bucket: &str,
        provider_ids: &[String],
    ) -> StorageResult<HashMap<(String, String), i64>> {
        use entities::request_audit_minute::Column;
        if provider_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = entities::RequestAuditMinute::find()
            .filter(Column::MinuteBucket.eq(minute_bucket))
            .filter(Column::ProviderId.is_in(provider_ids.iter().cloned()))
            .all(&self.db)
            .await?;
        let mut sums = HashMap::new();
        for row in rows {
            *sums.entry((row.provider_id, row.kind)).or_insert(0) += row.count;
        }
        Ok(sums)
    }

    async fn recent_audit(
        &self,
        limit: u64,
        include_success: bool,
    ) -> StorageResult<Vec<AuditRow>> {
        use entities::request_audit_minute::Column;
        let mut query = entities::RequestAuditMinute::find();
        if !include_success {
            query = query.filter(Column::Outcome.ne("success"));
        }
        let rows = query
            .order_by_desc(Column::MinuteBucket)
            .limit(limit)
            .all(&self.db)
            .await?;
        Ok(rows
            .into_iter()
            .map(|m| AuditRow {
                minute_bucket: m.minute_bucket,
                provider_id: m.provider_id,
                kind: m.kind,
                outcome: m.outcome,
                count: m.count,
            })
            .collect())
    }

    async fn provider_records(&self) -> StorageResult<Vec<ProviderRecord>> {
        use entities::providers::Column;
        let rows = entities::Providers::find()
            .order_by_asc(Column::Id)
            .all(&self.db)
            .await?;
        Ok(rows
            .into_iter()
            .map(|m| ProviderRecord {
                id: m.id,
                alias: m.alias,
                updated_at: m.updated_at,
            })
            .collect())
    }

    async fn upsert_provider_record(&self, id: &str, alias: Option<&str>) -> StorageResult<()> {
        use entities::providers::ActiveModel as ProviderActive;

        let now = OffsetDateTime::now_utc().unix_timestamp();
        let existing = entities::Providers::find_by_id(id.to_string())
            .one(&self.db)
            .await?;
        match existing {
            Some(model) => {
                let mut active: ProviderActive = model.into();
                if alias.is_some() {
                    active.alias = ActiveValue::Set(alias.map(|a| a.to_string()));
                }
                active.updated_at = ActiveValue::Set(now);
                active.update(&self.db).await?;
            }
            None => {
                let active = ProviderActive {
                    id: ActiveValue::Set(id.to_string()),
                    alias: ActiveValue::Set(alias.map(|a| a.to_string())),
                    updated_at: ActiveValue::Set(now),
                };
                entities::Providers::insert(active).exec(&self.db).await?;
            }
        }
        Ok(())
    }

    async fn delete_provider_record(&self, id: &str) -> StorageResult<()> {
        entities::Providers::delete_by_id(id.to_string())
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn usage_provider_ids(&self) -> StorageResult<Vec<String>> {
        #[derive(Debug, FromQueryResult)]
        struct ProviderIdRow {
            provider_id: String,
        }

        let rows = ProviderIdRow::find_by_statement(Statement::from_string(
            self.backend(),
            "SELECT DISTINCT provider_id FROM usage_stats ORDER BY provider_id".to_string(),
        ))
        .all(&self.db)
        .await?;
        Ok(rows.into_iter().map(|r| r.provider_id).collect())
    }

    async fn global_counters(&self) -> StorageResult<HashMap<String, i64>> {
        let rows = entities::GlobalMonitor::find().all(&self.db).await?;
        Ok(rows.into_iter().map(|m| (m.key, m.value)).collect())
    }

    async fn set_global_counter_if_absent(&self, key: &str, value: i64) -> StorageResult<()> {
        self.db
            .execute(Statement::from_sql_and_values(
                self.backend(),
                "INSERT INTO global_monitor (key, value) VALUES (?, ?) \
                 ON CONFLICT(key) DO NOTHING",
                [key.into(), value.into()],
            ))
            .await?;
        Ok(())
    }

    async fn chat_outcomes_since(
        &self,
        since_minute: &str,
    ) -> StorageResult<Vec<ProviderOutcomeSums>> {
        let rows = OutcomeSumRow::find_by_statement(Statement::from_sql_and_values(
            self.backend(),
            "SELECT provider_id, \
                    SUM(CASE WHEN outcome = 'error:auth_expired' THEN count ELSE 0 END) AS auth_expired, \
                    SUM(CASE WHEN outcome = 'success' THEN count ELSE 0 END) AS success \
             FROM request_audit_minute \
             WHERE kind = 'chat' AND minute_bucket >= ? \
             GROUP BY provider_id",
            [since_minute.into()],
        ))
        .all(&self.db)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| ProviderOutcomeSums {
                provider_id: r.provider_id,
                auth_expired: r.auth_expired.unwrap_or(0),
                success: r.success.unwrap_or(0),
            })
            .collect())
    }

    async fn chat_attempts_on(&self, date: &str) -> StorageResult<i64> {
        let row = CountTotalRow::find_by_statement(Statement::from_sql_and_values(
            self.backend(),
            "SELECT COALESCE(SUM(count), 0) AS total FROM request_audit_minute \
             WHERE kind = 'chat' AND minute_bucket LIKE ?",
            [format!("{date}%").into()],
        ))
        .one(&self.db)
        .await?;
        Ok(row.and_then(|r| r.total).unwrap_or(0))
    }
}

impl std::fmt::Debug for SeaOrmStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeaOrmStorage").finish_non_exhaustive()
    }
}
