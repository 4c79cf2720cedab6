//! 构建上下文
//!
//! 单次构建执行期间的任务快照、日志通道和取消令牌

use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::domain::{BuildPhase, BuildTask, LogLine, SiteDescriptor, TaskError};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::state::AppState;

/// 构建执行上下文
pub struct BuildContext {
    pub state: Arc<AppState>,
    /// 本地任务快照，每次阶段变化后同步到 TaskStore
    pub task: BuildTask,
    pub cancel: CancellationToken,
    log_tx: broadcast::Sender<LogLine>,
}

impl BuildContext {
    pub fn new(
        state: Arc<AppState>,
        task: BuildTask,
        log_tx: broadcast::Sender<LogLine>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            state,
            task,
            cancel,
            log_tx,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task.id
    }

    pub fn site(&self) -> &str {
        &self.task.site
    }

    /// 发送 stdout 日志
    pub fn log(&self, content: impl Into<String>) {
        let _ = self.log_tx.send(LogLine::stdout(content));
    }

    /// 发送 stderr 日志
    pub fn log_error(&self, content: impl Into<String>) {
        let _ = self.log_tx.send(LogLine::stderr(content));
    }

    /// 进入下一阶段；已取消时直接返回 `Cancelled`
    pub async fn advance(&mut self, phase: BuildPhase) -> OrchestratorResult<()> {
        if self.cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled(format!(
                "cancelled before {}",
                phase.as_str()
            )));
        }
        self.task.advance(phase);
        self.state.task_store.update(&self.task).await;

        info!(task_id = %self.task.id, site = %self.task.site, phase = %phase, "Build phase");
        self.log(format!("==> {}", phase.display_name()));
        Ok(())
    }

    pub async fn set_generation(&mut self, generation: u64, rebuild: bool) {
        self.task.generation = Some(generation);
        self.task.rebuild = rebuild;
        self.state.task_store.update(&self.task).await;
    }

    /// 结束构建：写入终态、移入历史、关闭日志通道
    pub async fn finish(mut self, result: &OrchestratorResult<SiteDescriptor>) -> BuildTask {
        match result {
            Ok(site) => {
                self.task.succeed();
                info!(
                    task_id = %self.task.id,
                    site = %site.name,
                    generation = site.generation,
                    "Build succeeded"
                );
                self.log(format!(
                    "Site {} is active at {} (generation {})",
                    site.name, site.domain, site.generation
                ));
            }
            Err(e) => {
                let cancelled = matches!(e, OrchestratorError::Cancelled(_));
                self.task.fail(
                    TaskError {
                        kind: e.kind().to_string(),
                        message: e.to_string(),
                    },
                    cancelled,
                );
                warn!(
                    task_id = %self.task.id,
                    site = %self.task.site,
                    kind = e.kind(),
                    error = %e,
                    "Build failed"
                );
                self.log_error(format!("Build failed: {}", e));
            }
        }

        let state = self.state.clone();
        let task = self.task.clone();
        state.task_store.finish(task.clone()).await;
        state.running_builds.unregister(&task.id);
        state.log_hub.finish(&task.id).await;
        // self（含最后一个发送者）在这里释放，订阅方收到 Closed
        task
    }
}
