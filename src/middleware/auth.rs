//! Bearer token 认证
//!
//! 提供 `RequireToken` extractor，替代每个 handler 中重复的 token 校验逻辑

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use std::sync::Arc;

use crate::error::ApiError;
use crate::state::AppState;

/// Bearer token 认证 Extractor
///
/// 接受 `Authorization: Bearer <token>`，兼容 `x-api-key: <token>`
///
/// # Example
///
/// ```ignore
/// async fn protected_handler(
///     _auth: RequireToken,
///     State(state): State<Arc<AppState>>,
/// ) -> impl IntoResponse {
///     // handler 逻辑...
/// }
/// ```
#[derive(Debug, Clone)]
pub struct RequireToken;

#[async_trait]
impl FromRequestParts<Arc<AppState>> for RequireToken {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        if state.verify_token(&parts.headers) {
            Ok(RequireToken)
        } else {
            tracing::warn!(path = %parts.uri.path(), "Rejected request with missing or invalid token");
            Err(ApiError::unauthorized())
        }
    }
}
