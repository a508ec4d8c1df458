use sea_orm::entity::prelude::*;

/// Minute-bucketed attempt audit. The minute partition doubles as the RPM
/// source of truth across instances, so rows are only ever incremented.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "request_audit_minute")]
pub struct Model {
    /// Beijing-time `YYYY-MM-DDTHH:MM`.
    #[sea_orm(primary_key, auto_increment = false)]
    pub minute_bucket: String,
    #[sea_orm(primary_key, auto_increment = false)]
    pub provider_id: String,
    #[sea_orm(primary_key, auto_increment = false)]
    pub kind: String,
    /// `success`, `limited:daily`, `limited:rpm`, or `error:<reason>`.
    #[sea_orm(primary_key, auto_increment = false)]
    pub outcome: String,
    pub count: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
