//! 主机状态领域模型

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::ServiceStatus;

/// 资源使用率超过该值时视为降级
pub const DEGRADED_USAGE_PERCENT: f64 = 90.0;

/// 磁盘信息
#[derive(Clone, Debug, Serialize)]
pub struct DiskInfo {
    pub name: String,
    pub mount_point: String,
    pub total_gb: f64,
    pub used_gb: f64,
    pub available_gb: f64,
    pub usage_percent: f64,
}

/// 系统负载平均值 (1, 5, 15 分钟)
#[derive(Clone, Debug, Default, Serialize)]
pub struct LoadAverage {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

impl LoadAverage {
    pub fn new(one: f64, five: f64, fifteen: f64) -> Self {
        Self { one, five, fifteen }
    }
}

/// 主机负载快照
#[derive(Clone, Debug, Serialize)]
pub struct HostStats {
    pub timestamp: DateTime<Utc>,
    pub cpu_count: usize,
    pub cpu_usage_percent: f64,
    pub memory_used_gb: f64,
    pub memory_total_gb: f64,
    pub memory_usage_percent: f64,
    pub disks: Vec<DiskInfo>,
    pub load_average: LoadAverage,
}

impl HostStats {
    /// 根分区使用率（找不到根分区时为 0）
    pub fn root_disk_usage(&self) -> f64 {
        self.disks
            .iter()
            .find(|d| d.mount_point == "/")
            .map_or(0.0, |d| d.usage_percent)
    }

    /// CPU、内存或根分区任一超过阈值
    pub fn is_under_pressure(&self) -> bool {
        self.cpu_usage_percent > DEGRADED_USAGE_PERCENT
            || self.memory_usage_percent > DEGRADED_USAGE_PERCENT
            || self.root_disk_usage() > DEGRADED_USAGE_PERCENT
    }
}

/// 容器引擎可达性
#[derive(Clone, Debug, Serialize)]
pub struct EngineStatus {
    pub reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 主机总体健康度
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HostHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HostHealth {
    /// 引擎不可达为 unhealthy；基础系统未全部运行或资源吃紧为 degraded
    pub fn assess(engine: &EngineStatus, base: ServiceStatus, host: &HostStats) -> Self {
        if !engine.reachable {
            HostHealth::Unhealthy
        } else if base != ServiceStatus::Running || host.is_under_pressure() {
            HostHealth::Degraded
        } else {
            HostHealth::Healthy
        }
    }
}
