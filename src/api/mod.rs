//! API 模块
//!
//! HTTP handlers 和路由组装

pub mod base_system;
pub mod build;
pub mod health;
pub mod sites;
pub mod system;

use axum::Router;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::state::AppState;

/// 构建完整的 API 路由
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health & agent info
        .merge(health::router())
        // Builds
        .merge(build::router())
        // Site lifecycle
        .merge(sites::router())
        // Shared services
        .merge(base_system::router())
        // Host status
        .merge(system::router())
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
