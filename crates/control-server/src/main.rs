mod auth;
mod config;
mod dto;
mod error;
mod routes;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use control_core::registry::RegisterGateway;
use control_core::{ControlConfig, GatewayClient, ReaperConfig, Registry, SchedulerConfig};
use control_db::pool;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::auth::RateLimiter;
use crate::config::ServerConfig;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let db_config = control_db::config::DbConfig::from_env();
    let server_config = ServerConfig::from_env();
    let control_config = ControlConfig::from_env();

    pool::ensure_database_exists(&db_config).await?;
    let db_pool = pool::create_pool(&db_config).await?;
    pool::run_migrations(&db_pool, pool::default_migrations_path()).await?;

    let registry = Arc::new(Registry::new());
    for (index, host) in control_config.gateway_urls.iter().enumerate() {
        registry.register_gateway(RegisterGateway {
            gateway_id: format!("gateway-{index}"),
            host: host.clone(),
            capabilities: vec![],
            status: Some("online".to_owned()),
            metadata: None,
        });
    }

    let gateway_client = Arc::new(GatewayClient::new());
    let cancel = CancellationToken::new();

    let scheduler_handle = tokio::spawn(control_core::run_scheduler(
        db_pool.clone(),
        registry.clone(),
        gateway_client.clone(),
        SchedulerConfig {
            poll_interval: control_config.scheduler_poll_interval,
            ..SchedulerConfig::default()
        },
        cancel.clone(),
    ));

    let reaper_handle = tokio::spawn(control_core::run_reaper(
        db_pool.clone(),
        registry.clone(),
        gateway_client.clone(),
        ReaperConfig {
            ttl_seconds: control_config.task_lock_ttl_seconds(),
            poll_interval: control_config.reaper_poll_interval,
        },
        cancel.clone(),
    ));

    let app_state = AppState {
        pool: db_pool.clone(),
        registry,
        gateway_client,
        config: Arc::new(server_config.clone()),
        rate_limiter: Arc::new(RateLimiter::new()),
    };
    let app = routes::build_router(app_state);

    let listener = TcpListener::bind(&server_config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", server_config.bind_addr))?;
    tracing::info!(addr = %server_config.bind_addr, "control-server listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server error")?;

    cancel.cancel();
    let _ = tokio::join!(scheduler_handle, reaper_handle);
    db_pool.close().await;

    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl-C handler");
    tracing::info!("shutdown signal received");
}
