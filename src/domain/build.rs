//! 构建任务相关领域模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 构建流水线阶段
///
/// `Received → Validating → Locked → Fetching → Rendering → Provisioning →
/// Starting → RoutingAttached → HealthChecking → Active`，任意非终态都可以进入 `Failed`
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BuildPhase {
    Received,
    Validating,
    Locked,
    Fetching,
    Rendering,
    Provisioning,
    Starting,
    RoutingAttached,
    HealthChecking,
    Active,
    Failed,
}

impl BuildPhase {
    /// 按执行顺序排列的中间阶段（会出现在任务的 stages 列表中）
    pub const STAGES: [BuildPhase; 8] = [
        BuildPhase::Validating,
        BuildPhase::Locked,
        BuildPhase::Fetching,
        BuildPhase::Rendering,
        BuildPhase::Provisioning,
        BuildPhase::Starting,
        BuildPhase::RoutingAttached,
        BuildPhase::HealthChecking,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildPhase::Received => "received",
            BuildPhase::Validating => "validating",
            BuildPhase::Locked => "locked",
            BuildPhase::Fetching => "fetching",
            BuildPhase::Rendering => "rendering",
            BuildPhase::Provisioning => "provisioning",
            BuildPhase::Starting => "starting",
            BuildPhase::RoutingAttached => "routing_attached",
            BuildPhase::HealthChecking => "health_checking",
            BuildPhase::Active => "active",
            BuildPhase::Failed => "failed",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            BuildPhase::Received => "Received",
            BuildPhase::Validating => "Validate Request",
            BuildPhase::Locked => "Acquire Site Lock",
            BuildPhase::Fetching => "Fetch Source",
            BuildPhase::Rendering => "Render Templates",
            BuildPhase::Provisioning => "Provision Resources",
            BuildPhase::Starting => "Start Stack",
            BuildPhase::RoutingAttached => "Attach Routing",
            BuildPhase::HealthChecking => "Health Check",
            BuildPhase::Active => "Active",
            BuildPhase::Failed => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BuildPhase::Active | BuildPhase::Failed)
    }
}

impl std::fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 构建任务状态
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Running,
    Success,
    Failed,
    Cancelled,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Running => "running",
            BuildStatus::Success => "success",
            BuildStatus::Failed => "failed",
            BuildStatus::Cancelled => "cancelled",
        }
    }

    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BuildStatus::Running)
    }
}

/// 阶段状态
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

/// 构建阶段信息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildStage {
    pub phase: BuildPhase,
    /// 显示名称 (e.g., "Fetch Source")
    pub display_name: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// 持续时间（毫秒）
    pub duration_ms: Option<i64>,
    pub status: StageStatus,
    /// 附加信息
    pub message: Option<String>,
}

impl BuildStage {
    pub fn new(phase: BuildPhase) -> Self {
        Self {
            phase,
            display_name: phase.display_name().to_string(),
            started_at: None,
            finished_at: None,
            duration_ms: None,
            status: StageStatus::Pending,
            message: None,
        }
    }

    pub fn start(&mut self) {
        self.started_at = Some(Utc::now());
        self.status = StageStatus::Running;
    }

    pub fn finish(&mut self, success: bool, message: Option<String>) {
        let now = Utc::now();
        self.finished_at = Some(now);
        self.status = if success {
            StageStatus::Success
        } else {
            StageStatus::Failed
        };
        self.message = message;
        if let Some(started) = self.started_at {
            self.duration_ms = Some((now - started).num_milliseconds());
        }
    }

    pub fn skip(&mut self, reason: Option<String>) {
        self.status = StageStatus::Skipped;
        self.message = reason;
    }
}

/// 任务失败信息（稳定的错误类型 + 可读消息）
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TaskError {
    pub kind: String,
    pub message: String,
}

/// 构建任务
#[derive(Clone, Debug, Serialize)]
pub struct BuildTask {
    pub id: String,
    pub site: String,
    pub domain: String,
    pub framework: String,
    pub status: BuildStatus,
    /// 当前所处阶段
    pub phase: BuildPhase,
    /// 是否为已有站点的重建
    pub rebuild: bool,
    /// 本次构建的栈代号
    pub generation: Option<u64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<TaskError>,
    pub stages: Vec<BuildStage>,
}

impl BuildTask {
    pub fn new(id: String, site: String, domain: String, framework: String) -> Self {
        Self {
            id,
            site,
            domain,
            framework,
            status: BuildStatus::Running,
            phase: BuildPhase::Received,
            rebuild: false,
            generation: None,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
            stages: BuildPhase::STAGES.iter().map(|p| BuildStage::new(*p)).collect(),
        }
    }

    pub fn stage_mut(&mut self, phase: BuildPhase) -> Option<&mut BuildStage> {
        self.stages.iter_mut().find(|s| s.phase == phase)
    }

    /// 进入下一个阶段：结束当前运行中的阶段并启动新阶段
    pub fn advance(&mut self, phase: BuildPhase) {
        debug_assert!(phase >= self.phase, "phase transitions are monotonic");
        if let Some(prev) = self.stage_mut(self.phase) {
            if prev.status == StageStatus::Running {
                prev.finish(true, None);
            }
        }
        self.phase = phase;
        if let Some(stage) = self.stage_mut(phase) {
            stage.start();
        }
    }

    pub fn succeed(&mut self) {
        if let Some(prev) = self.stage_mut(self.phase) {
            if prev.status == StageStatus::Running {
                prev.finish(true, None);
            }
        }
        self.phase = BuildPhase::Active;
        self.status = BuildStatus::Success;
        self.finished_at = Some(Utc::now());
    }

    /// 标记失败，当前阶段记录失败原因，后续阶段标记为跳过
    pub fn fail(&mut self, error: TaskError, cancelled: bool) {
        let current = self.phase;
        let message = error.message.clone();
        for stage in &mut self.stages {
            if stage.phase == current && stage.status == StageStatus::Running {
                stage.finish(false, Some(message.clone()));
            } else if stage.status == StageStatus::Pending {
                stage.skip(None);
            }
        }
        self.phase = BuildPhase::Failed;
        self.status = if cancelled {
            BuildStatus::Cancelled
        } else {
            BuildStatus::Failed
        };
        self.error = Some(error);
        self.finished_at = Some(Utc::now());
    }
}

/// 日志行
#[derive(Clone, Debug, Serialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub stream: String, // stdout | stderr
    pub content: String,
}

impl LogLine {
    pub fn new(stream: &str, content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stream: stream.to_string(),
            content: content.into(),
        }
    }

    pub fn stdout(content: impl Into<String>) -> Self {
        Self::new("stdout", content)
    }

    pub fn stderr(content: impl Into<String>) -> Self {
        Self::new("stderr", content)
    }
}
