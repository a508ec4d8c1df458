pub mod gateway_config;
pub mod global_monitor;
pub mod kv_store;
pub mod providers;
pub mod request_audit_minute;
pub mod usage_stats;

pub use gateway_config::Entity as GatewayConfig;
pub use global_monitor::Entity as GlobalMonitor;
pub use kv_store::Entity as KvStore;
pub use providers::Entity as Providers;
pub use request_audit_minute::Entity as RequestAuditMinute;
pub use usage_stats::Entity as UsageStats;
