//! ServerBond Agent - 单机多站点部署代理
//!
//! 把 `{repo, domain, framework}` 构建请求变成运行在共享基础设施
//! （traefik / mysql / redis）之上的容器化站点。

pub mod api;
pub mod config;
pub mod domain;
pub mod error;
pub mod infra;
pub mod middleware;
pub mod services;
pub mod state;

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::env::constants::VERSION;
use crate::config::EnvConfig;
use crate::state::{get_shutdown_token, trigger_shutdown, AppState};

/// 后台清理间隔
const CLEANUP_INTERVAL: Duration = Duration::from_secs(600);

/// 命令行覆盖项
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// 覆盖 `SB_AGENT_PORT`
    pub port_override: Option<u16>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("serverbond_agent=info,tower_http=info"));
    // 测试或嵌入场景下可能已经初始化过
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// 初始化并运行 agent，直到收到 Ctrl-C
pub async fn init_and_run_agent_with_config(runtime: RuntimeConfig) -> anyhow::Result<()> {
    init_tracing();

    let mut config = EnvConfig::from_env();
    if let Some(port) = runtime.port_override {
        config.port = port;
    }
    let port = config.port;

    info!(version = VERSION, port = port, "Starting ServerBond Agent");

    let state = Arc::new(
        AppState::new(config)
            .await
            .context("failed to initialise agent state")?,
    );

    let shutdown = get_shutdown_token();
    state.base.clone().start_refresh_loop(shutdown.child_token());
    start_cleanup_loop(state.clone(), shutdown.child_token());

    let app = api::router(state.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(addr = %addr, "HTTP API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    // 正在执行的构建已经收到取消信号，等它们回滚完成
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while state.running_builds.count() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    if state.running_builds.count() > 0 {
        warn!(remaining = state.running_builds.count(), "Exiting with builds still rolling back");
    }

    info!("ServerBond Agent stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
    trigger_shutdown();
}

/// 定期清理过期任务、日志通道和空闲锁
fn start_cleanup_loop(state: Arc<AppState>, shutdown: tokio_util::sync::CancellationToken) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => state.cleanup().await,
            }
        }
    });
}
