//! 命令执行器
//!
//! 提供统一的外部命令执行接口，支持：
//! - 超时控制（超时后杀掉子进程）
//! - 取消支持
//! - 通过 stdin 传入数据（如 SQL）

use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 命令执行器
pub struct CommandRunner;

/// 命令执行错误
#[derive(Debug)]
pub enum CommandError {
    /// 命令启动失败
    SpawnFailed(std::io::Error),
    /// 命令超时
    Timeout(Duration),
    /// 命令被取消
    Cancelled,
    /// 等待命令完成失败
    WaitFailed(std::io::Error),
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::SpawnFailed(e) => write!(f, "Failed to spawn command: {}", e),
            CommandError::Timeout(d) => write!(f, "Command timed out after {:?}", d),
            CommandError::Cancelled => write!(f, "Command was cancelled"),
            CommandError::WaitFailed(e) => write!(f, "Failed to wait for command: {}", e),
        }
    }
}

impl std::error::Error for CommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CommandError::SpawnFailed(e) | CommandError::WaitFailed(e) => Some(e),
            _ => None,
        }
    }
}

/// 把 stdout/stderr 合并成一段可读文本
pub fn combined_output(output: &Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    match (stdout.trim().is_empty(), stderr.trim().is_empty()) {
        (false, false) => format!("{}\n{}", stdout.trim_end(), stderr.trim_end()),
        (false, true) => stdout.trim_end().to_string(),
        (true, false) => stderr.trim_end().to_string(),
        (true, true) => String::new(),
    }
}

impl CommandRunner {
    /// 执行命令并收集输出
    ///
    /// # Arguments
    /// * `program` - 要执行的程序
    /// * `args` - 命令行参数
    /// * `work_dir` - 工作目录（None 表示继承当前目录）
    /// * `timeout` - 超时时间
    /// * `cancel` - 取消令牌
    pub async fn run(
        program: &str,
        args: &[String],
        work_dir: Option<&Path>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Output, CommandError> {
        Self::run_with_input(program, args, work_dir, None, timeout, cancel).await
    }

    /// 执行命令，可选地向 stdin 写入数据
    pub async fn run_with_input(
        program: &str,
        args: &[String],
        work_dir: Option<&Path>,
        input: Option<&str>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Output, CommandError> {
        debug!(program = program, args = ?args, "Running command");

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = work_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(CommandError::SpawnFailed)?;

        if let (Some(data), Some(mut stdin)) = (input, child.stdin.take()) {
            stdin
                .write_all(data.as_bytes())
                .await
                .map_err(CommandError::WaitFailed)?;
            // 关闭 stdin，让子进程读到 EOF
            drop(stdin);
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                warn!(program = program, "Command cancelled, killing process");
                Err(CommandError::Cancelled)
            }
            _ = tokio::time::sleep(timeout) => {
                warn!(program = program, "Command timed out after {:?}", timeout);
                Err(CommandError::Timeout(timeout))
            }
            output = child.wait_with_output() => {
                output.map_err(CommandError::WaitFailed)
            }
        }
    }
}
