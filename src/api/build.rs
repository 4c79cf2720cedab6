//! 构建 API
//!
//! 包含 /build, /builds/* 端点

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::{convert::Infallible, sync::Arc};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::domain::{BuildRequest, BuildTask, SiteView};
use crate::error::{ApiError, ApiResult};
use crate::middleware::RequireToken;
use crate::services::build;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct BuildQuery {
    /// 等待构建结束再返回
    #[serde(default)]
    pub wait: bool,
}

/// 受理响应（202）
#[derive(Debug, Serialize)]
pub struct BuildAccepted {
    pub task_id: String,
    pub site: String,
    pub status: &'static str,
    pub status_url: String,
    pub stream_url: String,
}

/// 完成响应（wait=true，200）
#[derive(Debug, Serialize)]
pub struct BuildCompleted {
    pub task_id: String,
    pub site: SiteView,
    pub task: BuildTask,
}

/// 任务历史查询参数
#[derive(Debug, Deserialize)]
pub struct TaskHistoryQuery {
    /// 返回数量限制，默认 20
    #[serde(default = "default_limit")]
    pub limit: usize,
    pub site: Option<String>,
    /// 状态过滤 (running, success, failed, cancelled)
    pub status: Option<String>,
}

fn default_limit() -> usize {
    20
}

#[derive(Debug, Serialize)]
pub struct TaskHistoryResponse {
    pub tasks: Vec<BuildTask>,
    pub total: usize,
}

/// 创建构建路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/build", post(submit_build))
        .route("/builds", get(recent_builds))
        .route("/builds/:task_id", get(get_build))
        .route("/builds/:task_id/cancel", post(cancel_build))
        .route("/builds/:task_id/logs/stream", get(stream_logs))
}

/// 提交构建
///
/// POST /build[?wait=true]
/// 需要认证
///
/// 默认立即返回 202 和任务 ID；`wait=true` 时等待终态，
/// 客户端在等待期间断开会取消构建（仍然执行回滚）
async fn submit_build(
    _auth: RequireToken,
    State(state): State<Arc<AppState>>,
    Query(query): Query<BuildQuery>,
    body: Result<Json<BuildRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(request) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let submitted = build::submit(&state, request).await?;

    if !query.wait {
        let accepted = BuildAccepted {
            status_url: format!("/builds/{}", submitted.task_id),
            stream_url: format!("/builds/{}/logs/stream", submitted.task_id),
            task_id: submitted.task_id,
            site: submitted.site,
            status: "accepted",
        };
        return Ok((StatusCode::ACCEPTED, Json(accepted)).into_response());
    }

    // handler 被丢弃（连接断开）时取消构建
    let guard = submitted.cancel.clone().drop_guard();
    let outcome = submitted
        .handle
        .await
        .map_err(|e| ApiError::internal(format!("build task panicked: {}", e)))?;
    guard.disarm();

    let site = outcome.result?;
    info!(task_id = %outcome.task.id, site = %site.name, "Build completed (waited)");
    Ok(Json(BuildCompleted {
        task_id: outcome.task.id.clone(),
        site: SiteView::new(&site, None),
        task: outcome.task,
    })
    .into_response())
}

/// GET /builds
/// 需要认证
async fn recent_builds(
    _auth: RequireToken,
    State(state): State<Arc<AppState>>,
    Query(query): Query<TaskHistoryQuery>,
) -> impl IntoResponse {
    let tasks = state
        .task_store
        .recent(query.limit, query.site.as_deref(), query.status.as_deref())
        .await;
    let total = tasks.len();
    Json(TaskHistoryResponse { tasks, total })
}

/// 查询任务（活跃任务和历史记录）
///
/// GET /builds/:task_id
/// 需要认证
async fn get_build(
    _auth: RequireToken,
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<BuildTask>> {
    let task = state
        .task_store
        .get_any(&task_id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("Build '{}'", task_id)))?;
    Ok(Json(task))
}

/// 取消单个构建，回滚完成后任务状态变为 cancelled
///
/// POST /builds/:task_id/cancel
async fn cancel_build(
    _auth: RequireToken,
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> ApiResult<(StatusCode, Json<BuildTask>)> {
    if !state.running_builds.cancel_task(&task_id) {
        return Err(ApiError::not_found(format!("Running build '{}'", task_id)));
    }
    info!(task_id = %task_id, "Build cancellation requested");
    let task = state
        .task_store
        .get_any(&task_id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("Build '{}'", task_id)))?;
    Ok((StatusCode::ACCEPTED, Json(task)))
}

/// 流式日志
///
/// GET /builds/:task_id/logs/stream
/// 需要认证
async fn stream_logs(
    _auth: RequireToken,
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let mut rx = state.log_hub.subscribe(&task_id).await.ok_or_else(|| {
        ApiError::not_found(format!("Build '{}' not found or already finished", task_id))
    })?;

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(line) => {
                    let json = serde_json::to_string(&line).unwrap_or_default();
                    yield Ok(Event::default().data(json));
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(task_id = %task_id, lagged = n, "Log subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    if let Some(task) = state.task_store.get_any(&task_id).await {
                        yield Ok(Event::default().event("complete").data(
                            serde_json::json!({
                                "status": task.status.as_str(),
                                "phase": task.phase,
                                "error": task.error,
                            }).to_string()
                        ));
                    }
                    break;
                }
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("keepalive"),
    ))
}
