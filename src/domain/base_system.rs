//! 基础系统（共享反向代理 / 数据库 / 缓存）领域模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::infra::runtime::{ContainerHealth, ContainerState, ContainerStatus};

/// 共享服务
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SharedService {
    Proxy,
    Database,
    Cache,
}

impl SharedService {
    pub const ALL: [SharedService; 3] = [
        SharedService::Proxy,
        SharedService::Database,
        SharedService::Cache,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SharedService::Proxy => "proxy",
            SharedService::Database => "database",
            SharedService::Cache => "cache",
        }
    }

    /// compose 文件中的服务名
    pub fn compose_service(&self) -> &'static str {
        match self {
            SharedService::Proxy => "traefik",
            SharedService::Database => "mysql",
            SharedService::Cache => "redis",
        }
    }

    /// 同时接受角色名和 compose 服务名
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "proxy" | "traefik" => Some(SharedService::Proxy),
            "database" | "mysql" => Some(SharedService::Database),
            "cache" | "redis" => Some(SharedService::Cache),
            _ => None,
        }
    }
}

impl std::fmt::Display for SharedService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 共享服务状态
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Absent,
    Starting,
    Running,
    Degraded,
    Stopped,
}

impl ServiceStatus {
    pub fn from_container(state: &ContainerState) -> Self {
        match state.status {
            ContainerStatus::NotFound => ServiceStatus::Absent,
            ContainerStatus::Running => match state.health {
                Some(ContainerHealth::Starting) => ServiceStatus::Starting,
                Some(ContainerHealth::Unhealthy) => ServiceStatus::Degraded,
                _ => ServiceStatus::Running,
            },
            ContainerStatus::Created | ContainerStatus::Restarting => ServiceStatus::Starting,
            ContainerStatus::Exited | ContainerStatus::Dead | ContainerStatus::Paused => {
                ServiceStatus::Stopped
            }
            ContainerStatus::Unknown => ServiceStatus::Degraded,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Absent => "absent",
            ServiceStatus::Starting => "starting",
            ServiceStatus::Running => "running",
            ServiceStatus::Degraded => "degraded",
            ServiceStatus::Stopped => "stopped",
        }
    }
}

/// 单个共享服务的快照
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ServiceState {
    pub container: String,
    pub status: ServiceStatus,
}

/// 基础系统状态（单例，由协调器持有）
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BaseSystemState {
    pub network: String,
    pub services: BTreeMap<SharedService, ServiceState>,
    /// 共享数据库 root 密码在密钥库中的名字
    pub credentials_ref: String,
    pub last_health_check: Option<DateTime<Utc>>,
}

impl BaseSystemState {
    pub fn new(network: &str, containers: [(SharedService, &str); 3], credentials_ref: &str) -> Self {
        Self {
            network: network.to_string(),
            services: containers
                .into_iter()
                .map(|(svc, container)| {
                    (
                        svc,
                        ServiceState {
                            container: container.to_string(),
                            status: ServiceStatus::Absent,
                        },
                    )
                })
                .collect(),
            credentials_ref: credentials_ref.to_string(),
            last_health_check: None,
        }
    }

    pub fn status_of(&self, service: SharedService) -> ServiceStatus {
        self.services
            .get(&service)
            .map(|s| s.status)
            .unwrap_or(ServiceStatus::Absent)
    }

    /// 所有共享服务都在运行
    pub fn is_running(&self) -> bool {
        self.services
            .values()
            .all(|s| s.status == ServiceStatus::Running)
    }

    /// 汇总状态：全部运行为 running，全部缺失为 absent，全部停止为 stopped
    pub fn overall(&self) -> ServiceStatus {
        let all = |status: ServiceStatus| self.services.values().all(|s| s.status == status);
        if all(ServiceStatus::Running) {
            ServiceStatus::Running
        } else if all(ServiceStatus::Absent) {
            ServiceStatus::Absent
        } else if all(ServiceStatus::Stopped) {
            ServiceStatus::Stopped
        } else if self
            .services
            .values()
            .any(|s| s.status == ServiceStatus::Starting)
        {
            ServiceStatus::Starting
        } else {
            ServiceStatus::Degraded
        }
    }
}

/// 租户资源类型
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TenantResourceKind {
    MysqlDatabase,
}

/// 租户资源申请
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TenantResourceSpec {
    pub kind: TenantResourceKind,
    /// 资源名（数据库名）
    pub name: String,
    pub user: String,
    pub password: String,
    /// 申请方站点
    pub owner: String,
}

/// 已分配的租户资源句柄
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TenantHandle {
    pub kind: TenantResourceKind,
    pub name: String,
    pub user: String,
    /// 容器网络内可达的主机名
    pub host: String,
    pub port: u16,
}

/// 租户资源台账条目
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TenantRecord {
    pub handle: TenantHandle,
    pub owner: String,
    pub password: String,
    pub charset: String,
    pub collation: String,
    pub created_at: DateTime<Utc>,
}

impl TenantRecord {
    /// 同名资源的已有记录与新申请不兼容的原因
    pub fn incompatibility(&self, spec: &TenantResourceSpec) -> Option<String> {
        if self.handle.kind != spec.kind {
            return Some(format!("exists as {:?}", self.handle.kind));
        }
        if self.owner != spec.owner {
            return Some(format!("owned by site '{}'", self.owner));
        }
        if self.handle.user != spec.user {
            return Some(format!("bound to user '{}'", self.handle.user));
        }
        if self.password != spec.password {
            return Some("provisioned with different credentials".to_string());
        }
        None
    }
}
