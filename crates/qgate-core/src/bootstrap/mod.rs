use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use arc_swap::ArcSwap;
use clap::Parser;

use qgate_common::{GatewayConfig, GatewayConfigPatch};
use qgate_storage::{
    BlobStore, ProviderRegistry, SeaOrmStorage, SqlBlobStore, Storage,
};

use crate::alert::{AlertEngine, AlertOptions};
use crate::clock;
use crate::deferred::DeferredTasks;
use crate::dispatch::Dispatcher;
use crate::pool::{PoolOptions, ProviderPool, ScanMode};
use crate::quota::QuotaManager;
use crate::upstream_client::{ReqwestUpstreamClient, UpstreamClient};

#[derive(Debug, Clone, Parser)]
#[command(
    name = "qgate",
    version,
    about = "OAuth-fronted Qwen gateway: one caller key, a pool of upstream accounts"
)]
pub struct CliArgs {
    /// Database DSN (required to bootstrap the rest of config).
    #[arg(long, env = "QGATE_DSN", default_value = "sqlite://qgate.db?mode=rwc")]
    pub dsn: String,

    /// Bind host.
    #[arg(long, env = "QGATE_HOST")]
    pub host: Option<String>,

    /// Bind port.
    #[arg(long, env = "QGATE_PORT")]
    pub port: Option<u16>,

    /// Shared bearer expected on /v1/*.
    #[arg(long, env = "QGATE_API_KEY")]
    pub api_key: Option<String>,

    /// Key expected in X-Admin-Key on /admin/*.
    #[arg(long, env = "QGATE_ADMIN_KEY")]
    pub admin_key: Option<String>,

    /// OAuth client id for the device-code flow.
    #[arg(long, env = "QGATE_OAUTH_CLIENT_ID")]
    pub oauth_client_id: Option<String>,

    /// Alert webhook destination (DingTalk/Feishu detected from the URL).
    #[arg(long, env = "QGATE_ALERT_WEBHOOK_URL")]
    pub alert_webhook_url: Option<String>,
}

pub struct Bootstrap {
    pub storage: Arc<SeaOrmStorage>,
    pub config: Arc<ArcSwap<GatewayConfig>>,
    pub blob: Arc<dyn BlobStore>,
    pub client: Arc<dyn UpstreamClient>,
    pub quota: Arc<QuotaManager>,
    pub pool: Arc<ProviderPool>,
    pub dispatcher: Arc<Dispatcher>,
    pub deferred: DeferredTasks,
    pub alert: Option<Arc<AlertEngine>>,
}

pub async fn bootstrap_from_env() -> anyhow::Result<Bootstrap> {
    let args = CliArgs::parse();
    bootstrap(args).await
}

/// Process wiring in dependency order: stores, registry, quota, pool,
/// dispatcher. The two process singletons (quota manager and monitor
/// counters) are constructed exactly once here and injected; nothing in the
/// core keeps module-level state.
pub async fn bootstrap(args: CliArgs) -> anyhow::Result<Bootstrap> {
    // 1) connect the relational store from the CLI/ENV DSN (required).
    let storage = Arc::new(
        SeaOrmStorage::connect(&args.dsn)
            .await
            .context("connect storage")?,
    );
    storage.sync().await.context("schema sync")?;

    // 2) merge config once: CLI > ENV > DB. clap already applies CLI > ENV
    // per field; the result is overlaid on the persisted row.
    let db_config = storage
        .load_gateway_config()
        .await
        .context("load gateway_config")?;
    let mut merged = db_config
        .map(|row| GatewayConfigPatch::from(row.config))
        .unwrap_or_default();

    let mut api_key_override = args.api_key.clone();
    if api_key_override.is_none() && merged.api_key.is_none() {
        let generated = generate_key();
        eprintln!("generated api key: {generated}");
        api_key_override = Some(generated);
    }
    let mut admin_key_override = args.admin_key.clone();
    if admin_key_override.is_none() && merged.admin_key.is_none() {
        let generated = generate_key();
        eprintln!("generated admin key: {generated}");
        admin_key_override = Some(generated);
    }

    let cli_patch = GatewayConfigPatch {
        host: args.host.clone(),
        port: args.port,
        api_key: api_key_override,
        admin_key: admin_key_override,
        dsn: Some(args.dsn.clone()),
        oauth_client_id: args.oauth_client_id.clone(),
        alert_webhook_url: args.alert_webhook_url.clone(),
        ..Default::default()
    };
    merged.overlay(cli_patch);
    let config: GatewayConfig = merged
        .into_config()
        .context("finalize merged gateway config")?;

    // 3) persist the merged config back so the next instance starts from it.
    storage
        .upsert_gateway_config(&config)
        .await
        .context("persist gateway_config")?;

    storage
        .set_global_counter_if_absent("uptime_start", clock::now_unix_ms() / 1000)
        .await
        .context("seed uptime_start")?;

    // 4) shared infrastructure, then the pool on top of it.
    let blob: Arc<dyn BlobStore> = Arc::new(SqlBlobStore::new(storage.connection().clone()));
    let registry = ProviderRegistry::new(storage.clone());
    let quota = QuotaManager::new(
        Some(storage.clone() as Arc<dyn Storage>),
        config.quota,
        config.audit_success_logs,
    );
    let deferred = DeferredTasks::spawn();
    let client: Arc<dyn UpstreamClient> =
        Arc::new(ReqwestUpstreamClient::new().context("build upstream client")?);

    let pool = Arc::new(ProviderPool::new(
        PoolOptions {
            scan_interval: Duration::from_secs(config.scan_interval_seconds()),
            static_ids: config.auth_files.clone(),
            oauth_client_id: config.oauth_client_id.clone(),
        },
        registry,
        blob.clone(),
        client.clone(),
        quota.clone(),
        deferred.clone(),
    ));
    // A light scan escalates to a full KV scan on its own when both the
    // registry and the static seed list are empty (cold bootstrap).
    pool.refresh(ScanMode::Light).await;

    let dispatcher = Arc::new(Dispatcher::new(pool.clone()));

    let alert = config.alert_webhook_url.as_ref().map(|url| {
        Arc::new(AlertEngine::new(
            storage.clone() as Arc<dyn Storage>,
            blob.clone(),
            client.clone(),
            AlertOptions {
                webhook_url: url.clone(),
                quota_threshold_percent: config.alert_quota_threshold,
                per_account_daily_limit: config.per_account_daily_limit,
            },
        ))
    });

    Ok(Bootstrap {
        storage,
        config: Arc::new(ArcSwap::from_pointee(config)),
        blob,
        client,
        quota,
        pool,
        dispatcher,
        deferred,
        alert,
    })
}

fn generate_key() -> String {
    // Random enough for a bootstrap key; printed once, stored in config.
    uuid::Uuid::new_v4().to_string()
}
