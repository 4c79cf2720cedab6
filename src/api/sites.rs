//! 站点 API
//!
//! 包含 /sites/* 端点，全部委托给 `LifecycleController`

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::domain::{SiteView, SiteState};
use crate::error::{ApiError, ApiResult};
use crate::middleware::RequireToken;
use crate::services::lifecycle::{RemovalReport, SiteStatus};
use crate::state::AppState;

const DEFAULT_LOG_TAIL: usize = 200;
const MAX_LOG_TAIL: usize = 5000;

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub tail: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct SiteListResponse {
    pub sites: Vec<SiteView>,
    pub total: usize,
}

/// 生命周期操作响应
#[derive(Debug, Serialize)]
pub struct SiteActionResponse {
    pub name: String,
    pub action: &'static str,
    pub state: SiteState,
}

#[derive(Debug, Serialize)]
pub struct LogsResponse {
    pub name: String,
    pub tail: usize,
    pub logs: String,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub name: String,
    pub cancelled: Vec<String>,
}

/// 创建站点路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/sites", get(list_sites))
        .route("/sites/:name", get(get_site).delete(remove_site))
        .route("/sites/:name/status", get(site_status))
        .route("/sites/:name/start", post(start_site))
        .route("/sites/:name/stop", post(stop_site))
        .route("/sites/:name/restart", post(restart_site))
        .route("/sites/:name/cancel", post(cancel_build))
        .route("/sites/:name/logs", get(site_logs))
}

/// GET /sites
async fn list_sites(_auth: RequireToken, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let sites = state.lifecycle().list().await;
    let total = sites.len();
    Json(SiteListResponse { sites, total })
}

/// GET /sites/:name（不含密钥）
async fn get_site(
    _auth: RequireToken,
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<SiteView>> {
    Ok(Json(state.lifecycle().view(&name).await?))
}

/// GET /sites/:name/status
async fn site_status(
    _auth: RequireToken,
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<SiteStatus>> {
    Ok(Json(state.lifecycle().status(&name).await?))
}

/// POST /sites/:name/start
async fn start_site(
    _auth: RequireToken,
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<SiteActionResponse>> {
    let site = state.lifecycle().start(&name).await?;
    Ok(Json(SiteActionResponse {
        name: site.name,
        action: "start",
        state: site.state,
    }))
}

/// POST /sites/:name/stop
async fn stop_site(
    _auth: RequireToken,
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<SiteActionResponse>> {
    let site = state.lifecycle().stop(&name).await?;
    Ok(Json(SiteActionResponse {
        name: site.name,
        action: "stop",
        state: site.state,
    }))
}

/// POST /sites/:name/restart
async fn restart_site(
    _auth: RequireToken,
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<SiteActionResponse>> {
    let site = state.lifecycle().restart(&name).await?;
    Ok(Json(SiteActionResponse {
        name: site.name,
        action: "restart",
        state: site.state,
    }))
}

/// 取消站点正在进行的构建（构建自行回滚）
///
/// POST /sites/:name/cancel
async fn cancel_build(
    _auth: RequireToken,
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<CancelResponse>> {
    let cancelled = state.running_builds.cancel_site(&name);
    if cancelled.is_empty() {
        return Err(ApiError::not_found(format!("Running build for site '{}'", name)));
    }
    info!(site = %name, tasks = ?cancelled, "Build cancellation requested");
    Ok(Json(CancelResponse { name, cancelled }))
}

/// GET /sites/:name/logs?tail=N
async fn site_logs(
    _auth: RequireToken,
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Json<LogsResponse>> {
    let tail = query.tail.unwrap_or(DEFAULT_LOG_TAIL).clamp(1, MAX_LOG_TAIL);
    let logs = state.lifecycle().logs(&name, tail).await?;
    Ok(Json(LogsResponse { name, tail, logs }))
}

/// 删除站点；租户库保留并在响应中列出
///
/// DELETE /sites/:name
async fn remove_site(
    _auth: RequireToken,
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<RemovalReport>> {
    Ok(Json(state.lifecycle().remove(&name).await?))
}
