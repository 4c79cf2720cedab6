//! 主机状态 API
//!
//! 包含 /status 端点：主机负载、容器引擎、基础系统和各站点容器状态

use axum::{extract::State, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use sysinfo::{CpuRefreshKind, Disks, MemoryRefreshKind, RefreshKind, System};
use tracing::debug;

use crate::domain::{BaseSystemState, DiskInfo, EngineStatus, HostHealth, HostStats, LoadAverage};
use crate::error::ApiResult;
use crate::middleware::RequireToken;
use crate::services::lifecycle::SiteStatus;
use crate::state::AppState;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// 主机状态响应
#[derive(Debug, Serialize)]
struct SystemStatusResponse {
    status: HostHealth,
    timestamp: String,
    uptime_secs: i64,
    host: HostStats,
    engine: EngineStatus,
    base_system: BaseSystemState,
    sites: Vec<SiteStatus>,
}

/// 创建主机状态路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/status", get(system_status))
}

/// 获取主机和站点的整体状态
///
/// GET /status
/// 需要认证
async fn system_status(
    _auth: RequireToken,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<SystemStatusResponse>> {
    let host = collect_host_stats().await;

    let engine = match state.runtime.engine_version().await {
        Ok(version) => EngineStatus {
            reachable: true,
            version: Some(version),
            error: None,
        },
        Err(e) => EngineStatus {
            reachable: false,
            version: None,
            error: Some(e.to_string()),
        },
    };

    // 引擎不可达时 refresh 会失败，退回最近一次快照
    let base_system = match state.base.refresh().await {
        Ok(base) => base,
        Err(e) => {
            debug!(error = %e, "Base system refresh failed, using last snapshot");
            state.base.status().await
        }
    };

    let sites = state.lifecycle().statuses().await;
    let status = HostHealth::assess(&engine, base_system.overall(), &host);

    Ok(Json(SystemStatusResponse {
        status,
        timestamp: Utc::now().to_rfc3339(),
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
        host,
        engine,
        base_system,
        sites,
    }))
}

/// 采样主机负载
async fn collect_host_stats() -> HostStats {
    let mut sys = System::new_with_specifics(
        RefreshKind::new()
            .with_cpu(CpuRefreshKind::everything())
            .with_memory(MemoryRefreshKind::everything()),
    );

    // 两次采样之间需要间隔，CPU 使用率才有意义
    sys.refresh_cpu_all();
    tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;
    sys.refresh_cpu_all();

    let disks = Disks::new_with_refreshed_list();
    let disks: Vec<DiskInfo> = disks
        .iter()
        .map(|disk| {
            let total = disk.total_space() as f64 / GIB;
            let available = disk.available_space() as f64 / GIB;
            let used = total - available;
            DiskInfo {
                name: disk.name().to_string_lossy().to_string(),
                mount_point: disk.mount_point().to_string_lossy().to_string(),
                total_gb: total,
                used_gb: used,
                available_gb: available,
                usage_percent: if total > 0.0 { (used / total) * 100.0 } else { 0.0 },
            }
        })
        .collect();

    let cpu_usage = if sys.cpus().is_empty() {
        0.0
    } else {
        sys.cpus().iter().map(|c| c.cpu_usage() as f64).sum::<f64>() / sys.cpus().len() as f64
    };
    let memory_total = sys.total_memory() as f64 / GIB;
    let memory_used = sys.used_memory() as f64 / GIB;
    let load = System::load_average();

    HostStats {
        timestamp: Utc::now(),
        cpu_count: sys.cpus().len(),
        cpu_usage_percent: cpu_usage,
        memory_used_gb: memory_used,
        memory_total_gb: memory_total,
        memory_usage_percent: if memory_total > 0.0 {
            (memory_used / memory_total) * 100.0
        } else {
            0.0
        },
        disks,
        load_average: LoadAverage::new(load.one, load.five, load.fifteen),
    }
}
