//! 统一错误处理
//!
//! - `OrchestratorError`: 构建流水线 / 站点注册表 / 基础系统的领域错误，每个变体都有稳定的 `kind()`
//! - `ApiError`: 实现 `IntoResponse`，把领域错误映射为 HTTP 状态码和结构化错误体

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::infra::runtime::RuntimeError;
use crate::services::templates::TemplateError;

/// 领域错误
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// 请求无效，未产生任何副作用
    #[error("{0}")]
    Validation(String),

    /// 站点锁等待超时，调用方可重试
    #[error("site '{site}' is busy: lock not acquired within {waited_secs}s")]
    BuildBusy { site: String, waited_secs: u64 },

    #[error("failed to fetch '{repo}' after {attempts} attempt(s): {reason}")]
    Fetch {
        repo: String,
        attempts: u32,
        reason: String,
    },

    #[error(transparent)]
    Template(#[from] TemplateError),

    /// 同名资源已存在且参数不兼容
    #[error("resource '{name}' already exists with incompatible parameters: {reason}")]
    ResourceConflict { name: String, reason: String },

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("site '{site}' did not become healthy within {timeout_secs}s")]
    HealthTimeout { site: String, timeout_secs: u64 },

    #[error("cannot {operation} site '{site}' while it is {state}")]
    InvalidState {
        site: String,
        state: String,
        operation: &'static str,
    },

    /// 共享基础设施不可用（区别于请求本身无效）
    #[error("base system unavailable: {0}")]
    BaseSystemUnavailable(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("build cancelled: {0}")]
    Cancelled(String),

    #[error("registry error: {0}")]
    Registry(String),

    #[error("secret store error: {0}")]
    Secret(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestratorError {
    /// 稳定的错误类别标识（API 响应中的 `error` 字段）
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::Validation(_) => "validation_error",
            OrchestratorError::BuildBusy { .. } => "build_busy",
            OrchestratorError::Fetch { .. } => "fetch_error",
            OrchestratorError::Template(_) => "template_error",
            OrchestratorError::ResourceConflict { .. } => "resource_conflict",
            OrchestratorError::Runtime(_) => "runtime_error",
            OrchestratorError::HealthTimeout { .. } => "health_timeout",
            OrchestratorError::InvalidState { .. } => "invalid_state",
            OrchestratorError::BaseSystemUnavailable(_) => "base_system_unavailable",
            OrchestratorError::NotFound(_) => "not_found",
            OrchestratorError::Cancelled(_) => "cancelled",
            OrchestratorError::Registry(_)
            | OrchestratorError::Secret(_)
            | OrchestratorError::Io(_) => "internal_error",
        }
    }

    /// 调用方是否可以原样重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::BuildBusy { .. } | OrchestratorError::BaseSystemUnavailable(_)
        )
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound(resource.into())
    }
}

/// 领域操作结果
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// API 错误响应结构
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// 统一 API 错误类型
#[derive(Debug)]
pub enum ApiError {
    /// 401 - 未授权（token 无效或缺失）
    Unauthorized,
    /// 404 - 资源未找到
    NotFound(String),
    /// 400 - 请求无效
    BadRequest(String),
    /// 领域错误，按 kind 映射状态码
    Orchestrator(OrchestratorError),
    /// 500 - 内部错误
    Internal(String),
}

impl ApiError {
    pub fn unauthorized() -> Self {
        Self::Unauthorized
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound(resource.into())
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        ApiError::Orchestrator(err)
    }
}

/// 领域错误类别对应的 HTTP 状态码
pub fn status_for(err: &OrchestratorError) -> StatusCode {
    match err {
        OrchestratorError::Validation(_) => StatusCode::BAD_REQUEST,
        OrchestratorError::BuildBusy { .. }
        | OrchestratorError::ResourceConflict { .. }
        | OrchestratorError::InvalidState { .. }
        | OrchestratorError::Cancelled(_) => StatusCode::CONFLICT,
        OrchestratorError::Fetch { .. } | OrchestratorError::Runtime(_) => StatusCode::BAD_GATEWAY,
        OrchestratorError::HealthTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        OrchestratorError::BaseSystemUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
        OrchestratorError::Template(_)
        | OrchestratorError::Registry(_)
        | OrchestratorError::Secret(_)
        | OrchestratorError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "Invalid or missing bearer token".to_string(),
            ),
            ApiError::NotFound(resource) => (
                StatusCode::NOT_FOUND,
                "not_found",
                format!("{} not found", resource),
            ),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
            ApiError::Orchestrator(err) => (status_for(&err), err.kind(), err.to_string()),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
        };

        let body = ErrorResponse::new(error_type, message);
        (status, Json(body)).into_response()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Unauthorized => write!(f, "Unauthorized"),
            ApiError::NotFound(r) => write!(f, "Not found: {}", r),
            ApiError::BadRequest(m) => write!(f, "Bad request: {}", m),
            ApiError::Orchestrator(e) => write!(f, "{}: {}", e.kind(), e),
            ApiError::Internal(m) => write!(f, "Internal error: {}", m),
        }
    }
}

impl std::error::Error for ApiError {}

/// 便捷类型别名
pub type ApiResult<T> = Result<T, ApiError>;
