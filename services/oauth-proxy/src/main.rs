//! Account-rotation OAuth proxy.
//!
//! Wires together the credentials store, account pool, background refresh
//! scheduler, hot-reload file watcher, request dispatcher, and the thin
//! HTTP surface (proxy route, admin control surface, health, metrics).

mod admin;
mod config;
mod error;
mod metrics;
mod proxy;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use anthropic_auth::CredentialsStore;
use anthropic_pool::{Pool, PoolConfig, RefreshSchedulerConfig, SelfWriteMarker};
use dispatcher::DispatcherConfig;

use crate::admin::AdminState;
use crate::config::Config;
use crate::proxy::ProxyState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting anthropic-oauth-proxy");

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.listen_addr,
        admin_listen_addr = %config.admin_listen_addr,
        accounts_path = %config.accounts_path.display(),
        rotation_enabled = config.rotation_enabled,
        hot_reload = config.hot_reload,
        "configuration loaded"
    );

    let store = Arc::new(CredentialsStore::new(config.accounts_path.clone()));
    let accounts = store
        .load()
        .await
        .context("failed to load credentials document")?;

    let pool_config = PoolConfig {
        minimum_cooldown: Duration::from_secs(config.minimum_cooldown_seconds),
        rotation_enabled: config.rotation_enabled,
    };
    let pool = Arc::new(Pool::new(accounts, pool_config));

    let http_client = reqwest::Client::new();
    let marker = Arc::new(SelfWriteMarker::new());

    let refresh_config = RefreshSchedulerConfig {
        interval: Duration::from_secs(60),
        proactive_threshold: config.refresh_buffer(),
        token_endpoint: config.token_endpoint_url.clone(),
        oauth_client_id: config.oauth_client_id.clone(),
    };
    let _refresh_handle = anthropic_pool::spawn_refresh_scheduler(
        pool.clone(),
        store.clone(),
        marker.clone(),
        http_client.clone(),
        refresh_config,
    );

    let _watcher = if config.hot_reload {
        Some(
            anthropic_pool::spawn_watcher(pool.clone(), store.clone(), marker.clone())
                .context("failed to start credentials file watcher")?,
        )
    } else {
        None
    };

    let metrics_handle = metrics::install_recorder();

    let dispatcher_config = Arc::new(DispatcherConfig {
        max_attempts: config.max_attempts,
        total_timeout: config.upstream_total_timeout(),
    });

    let proxy_state = ProxyState {
        pool: pool.clone(),
        client: http_client,
        upstream_base: "https://api.anthropic.com".to_string(),
        dispatcher_config,
        started_at: Instant::now(),
    };

    let proxy_app = Router::new()
        .route("/health", get(proxy::health_handler))
        .fallback(proxy::proxy_handler)
        .with_state(proxy_state);

    let admin_app = admin::build_admin_router(AdminState::new(pool.clone(), metrics_handle));

    let proxy_listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.listen_addr))?;
    let admin_listener = TcpListener::bind(config.admin_listen_addr)
        .await
        .with_context(|| format!("failed to bind admin listener to {}", config.admin_listen_addr))?;

    info!(addr = %config.listen_addr, "proxy listening");
    info!(addr = %config.admin_listen_addr, "admin control surface listening");

    let proxy_server = axum::serve(proxy_listener, proxy_app).with_graceful_shutdown(shutdown_signal());
    let admin_server = axum::serve(admin_listener, admin_app).with_graceful_shutdown(shutdown_signal());

    tokio::try_join!(
        async { proxy_server.await.context("proxy server error") },
        async { admin_server.await.context("admin server error") },
    )?;

    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
