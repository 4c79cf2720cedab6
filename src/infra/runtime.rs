//! 容器运行时接口
//!
//! 构建流水线、生命周期控制器和基础系统协调器只通过 `ContainerRuntime` 操作容器引擎，
//! 生产实现见 `infra::docker`，测试使用内存替身。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::env::constants::COMPOSE_FILE;

/// 容器运行时错误
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    #[error("{operation} failed for '{target}': {message}")]
    CommandFailed {
        operation: &'static str,
        target: String,
        message: String,
        transient: bool,
    },

    #[error("{operation} timed out for '{target}'")]
    Timeout {
        operation: &'static str,
        target: String,
    },

    #[error("container engine unavailable: {0}")]
    Unavailable(String),

    #[error("'{0}' not found")]
    NotFound(String),

    #[error("runtime operation cancelled")]
    Cancelled,
}

impl RuntimeError {
    /// 瞬时错误可以重试
    pub fn is_transient(&self) -> bool {
        match self {
            RuntimeError::CommandFailed { transient, .. } => *transient,
            RuntimeError::Timeout { .. } | RuntimeError::Unavailable(_) => true,
            RuntimeError::NotFound(_) | RuntimeError::Cancelled => false,
        }
    }
}

/// 一个站点（或基础系统）的 compose 栈
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackSpec {
    /// compose 项目名，决定容器命名空间
    pub project: String,
    /// compose 文件所在目录
    pub dir: PathBuf,
}

impl StackSpec {
    pub fn new(project: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            project: project.into(),
            dir: dir.into(),
        }
    }

    pub fn compose_file(&self) -> PathBuf {
        self.dir.join(COMPOSE_FILE)
    }
}

/// 容器运行状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Created,
    Running,
    Restarting,
    Paused,
    Exited,
    Dead,
    NotFound,
    Unknown,
}

impl ContainerStatus {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "created" => ContainerStatus::Created,
            "running" => ContainerStatus::Running,
            "restarting" => ContainerStatus::Restarting,
            "paused" => ContainerStatus::Paused,
            "exited" => ContainerStatus::Exited,
            "dead" => ContainerStatus::Dead,
            _ => ContainerStatus::Unknown,
        }
    }
}

/// 容器健康检查状态（仅当镜像/compose 定义了 healthcheck）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerHealth {
    Starting,
    Healthy,
    Unhealthy,
}

impl ContainerHealth {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "starting" => Some(ContainerHealth::Starting),
            "healthy" => Some(ContainerHealth::Healthy),
            "unhealthy" => Some(ContainerHealth::Unhealthy),
            _ => None,
        }
    }
}

/// 单个容器的状态快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerState {
    pub name: String,
    pub status: ContainerStatus,
    pub health: Option<ContainerHealth>,
}

impl ContainerState {
    pub fn not_found(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: ContainerStatus::NotFound,
            health: None,
        }
    }

    /// 运行中且（如有 healthcheck）已健康
    pub fn is_ready(&self) -> bool {
        self.status == ContainerStatus::Running
            && !matches!(
                self.health,
                Some(ContainerHealth::Starting) | Some(ContainerHealth::Unhealthy)
            )
    }
}

/// 栈健康结论
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackVerdict {
    /// 所有容器运行且健康
    Healthy,
    /// 仍在启动，继续轮询
    Pending,
    /// 有容器退出或不健康
    Failed(String),
    /// 栈内没有任何容器
    Missing,
}

/// 栈内所有容器的状态
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StackHealth {
    pub containers: Vec<ContainerState>,
}

impl StackHealth {
    pub fn verdict(&self) -> StackVerdict {
        if self.containers.is_empty() {
            return StackVerdict::Missing;
        }
        if let Some(bad) = self.containers.iter().find(|c| {
            matches!(c.status, ContainerStatus::Exited | ContainerStatus::Dead)
                || c.health == Some(ContainerHealth::Unhealthy)
        }) {
            return StackVerdict::Failed(format!("container '{}' is {:?}", bad.name, bad.status));
        }
        if self.containers.iter().all(ContainerState::is_ready) {
            StackVerdict::Healthy
        } else {
            StackVerdict::Pending
        }
    }
}

/// 针对栈内服务的控制动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceAction {
    Start,
    Stop,
    Restart,
}

impl ServiceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceAction::Start => "start",
            ServiceAction::Stop => "stop",
            ServiceAction::Restart => "restart",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "start" => Some(ServiceAction::Start),
            "stop" => Some(ServiceAction::Stop),
            "restart" => Some(ServiceAction::Restart),
            _ => None,
        }
    }
}

/// 容器内命令执行结果
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub output: String,
}

/// 容器运行时适配器
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// 检查网络是否存在
    async fn network_exists(&self, name: &str) -> Result<bool, RuntimeError>;

    /// 创建网络
    async fn create_network(&self, name: &str) -> Result<(), RuntimeError>;

    /// 构建镜像并启动栈（后台运行）
    async fn up(&self, stack: &StackSpec, cancel: &CancellationToken) -> Result<(), RuntimeError>;

    /// 停止并移除栈
    async fn down(&self, stack: &StackSpec, remove_volumes: bool) -> Result<(), RuntimeError>;

    /// 启停栈内的某个服务（`service` 为 None 时作用于整个栈）
    async fn control(
        &self,
        stack: &StackSpec,
        service: Option<&str>,
        action: ServiceAction,
    ) -> Result<(), RuntimeError>;

    /// 查询栈内容器状态
    async fn stack_health(&self, stack: &StackSpec) -> Result<StackHealth, RuntimeError>;

    /// 查询单个容器状态，不存在时返回 `ContainerStatus::NotFound`
    async fn inspect(&self, container: &str) -> Result<ContainerState, RuntimeError>;

    /// 确保栈内容器都接入共享网络（幂等）
    async fn attach_network(&self, stack: &StackSpec, network: &str) -> Result<(), RuntimeError>;

    /// 在容器内执行命令
    async fn exec(
        &self,
        container: &str,
        command: &[String],
        input: Option<&str>,
    ) -> Result<ExecOutput, RuntimeError>;

    /// 获取栈日志
    async fn logs(&self, stack: &StackSpec, tail: usize) -> Result<String, RuntimeError>;

    /// 容器引擎版本，同时用作可达性检查
    async fn engine_version(&self) -> Result<String, RuntimeError>;
}
