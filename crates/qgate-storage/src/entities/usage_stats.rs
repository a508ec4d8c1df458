use sea_orm::entity::prelude::*;

/// Per-account daily accepted-request counters, one row per
/// `(date, provider_id, kind)` partition.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "usage_stats")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Beijing-time `YYYY-MM-DD`.
    pub date: String,
    pub provider_id: String,
    /// `chat` or `search`.
    pub kind: String,
    pub count: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
