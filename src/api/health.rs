//! 健康检查和 agent 信息 API
//!
//! 包含 /health, /agent/info 端点

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::env::constants::{AGENT_NAME, VERSION};
use crate::config::FrameworkDescriptor;
use crate::domain::ServiceStatus;
use crate::middleware::RequireToken;
use crate::state::AppState;

/// 健康检查响应
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    timestamp: String,
    uptime_secs: i64,
    sites: usize,
    active_builds: usize,
    /// 最近一次刷新得到的基础系统总体状态
    base_system: ServiceStatus,
}

#[derive(Debug, Serialize)]
struct PathsInfo {
    sites_dir: PathBuf,
    data_dir: PathBuf,
    shared_dir: PathBuf,
}

/// agent 信息响应
#[derive(Debug, Serialize)]
struct AgentInfo {
    name: &'static str,
    version: &'static str,
    started_at: String,
    paths: PathsInfo,
    network: String,
    frameworks: Vec<FrameworkDescriptor>,
    php_versions: Vec<String>,
}

/// 创建健康检查路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health_check))
        .route("/agent/info", get(agent_info))
}

/// 进程存活检查（不反映单个站点的状态）
///
/// GET /health
/// 无需认证
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let base = state.base.status().await;

    Json(HealthResponse {
        status: "ok",
        service: "serverbond-agent",
        version: VERSION,
        timestamp: Utc::now().to_rfc3339(),
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
        sites: state.registry.list().await.len(),
        active_builds: state.running_builds.count(),
        base_system: base.overall(),
    })
}

/// GET /agent/info
/// 需要认证
async fn agent_info(_auth: RequireToken, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let paths = &state.config.paths;
    let mut frameworks: Vec<FrameworkDescriptor> =
        state.catalog.all().into_iter().cloned().collect();
    frameworks.sort_by_key(|d| d.framework.as_str());

    Json(AgentInfo {
        name: AGENT_NAME,
        version: VERSION,
        started_at: state.started_at.to_rfc3339(),
        paths: PathsInfo {
            sites_dir: paths.sites_dir.clone(),
            data_dir: paths.data_dir.clone(),
            shared_dir: paths.shared_dir.clone(),
        },
        network: state.base.network().to_string(),
        frameworks,
        php_versions: state
            .catalog
            .php_versions()
            .into_iter()
            .map(String::from)
            .collect(),
    })
}
