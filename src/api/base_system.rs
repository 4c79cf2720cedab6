//! 基础系统 API
//!
//! 包含 /base-system/* 端点

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;

use crate::domain::{BaseSystemState, SharedService};
use crate::error::{ApiError, ApiResult};
use crate::infra::ServiceAction;
use crate::middleware::RequireToken;
use crate::state::{get_shutdown_token, AppState};

/// 创建基础系统路由
///
/// `/base-system/:name` 中的 `name` 是动作；`/base-system/:name/:action` 中是服务名
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/base-system/status", get(status))
        .route("/base-system/:name", post(control_all))
        .route("/base-system/:name/:action", post(control_service))
}

/// 刷新并返回各共享服务状态
///
/// GET /base-system/status
async fn status(
    _auth: RequireToken,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<BaseSystemState>> {
    Ok(Json(state.base.refresh().await?))
}

/// POST /base-system/start|stop|restart
async fn control_all(
    _auth: RequireToken,
    State(state): State<Arc<AppState>>,
    Path(action): Path<String>,
) -> ApiResult<Json<BaseSystemState>> {
    run(&state, None, &action).await.map(Json)
}

/// POST /base-system/:service/start|stop|restart
async fn control_service(
    _auth: RequireToken,
    State(state): State<Arc<AppState>>,
    Path((service, action)): Path<(String, String)>,
) -> ApiResult<Json<BaseSystemState>> {
    let service = SharedService::parse(&service)
        .ok_or_else(|| ApiError::not_found(format!("Shared service '{}'", service)))?;
    run(&state, Some(service), &action).await.map(Json)
}

async fn run(
    state: &AppState,
    service: Option<SharedService>,
    action: &str,
) -> ApiResult<BaseSystemState> {
    let action = ServiceAction::parse(action).ok_or_else(|| {
        ApiError::bad_request(format!(
            "unknown action '{}', expected start, stop or restart",
            action
        ))
    })?;

    let result = match action {
        ServiceAction::Start => {
            let cancel = get_shutdown_token().child_token();
            state.base.start(service, &cancel).await
        }
        ServiceAction::Stop => state.base.stop(service).await,
        ServiceAction::Restart => state.base.restart(service).await,
    };
    Ok(result?)
}
