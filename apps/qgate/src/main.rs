use std::time::Duration;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use qgate_core::ScanMode;
use qgate_router::{AdminState, GatewayState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let boot = qgate_core::bootstrap::bootstrap_from_env().await?;
    let global = boot.config.load().clone();

    // Scheduled alert scan: the engine itself never schedules anything.
    if let Some(alert) = boot.alert.clone() {
        let interval = Duration::from_secs(global.alert_interval_minutes.max(1) * 60);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                alert.tick().await;
            }
        });
    }

    // Opt-in periodic full KV scan; admin-triggered rescans are the default
    // way to run one.
    if global.provider_full_kv_scan_minutes > 0 {
        let pool = boot.pool.clone();
        let interval = Duration::from_secs(global.provider_full_kv_scan_minutes * 60);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                pool.refresh(ScanMode::Full).await;
            }
        });
    }

    let gateway_state = GatewayState {
        config: boot.config.clone(),
        dispatcher: boot.dispatcher.clone(),
    };
    let admin_state = AdminState::new(
        boot.config.clone(),
        boot.storage.clone(),
        boot.blob.clone(),
        boot.client.clone(),
        boot.quota.clone(),
        boot.pool.clone(),
    );

    let app = axum::Router::new()
        .merge(qgate_router::gateway_router(gateway_state))
        .nest("/admin", qgate_router::admin_router(admin_state));

    let bind = format!("{}:{}", global.host, global.port);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    let providers = boot.pool.len().await;
    info!(event = "listening", bind = %bind, providers = providers);
    axum::serve(listener, app).await?;
    Ok(())
}
