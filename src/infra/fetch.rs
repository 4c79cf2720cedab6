//! 源码拉取
//!
//! `SourceFetcher` 把仓库内容取到隔离的工作目录；生产实现为 `git clone --depth 1`

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::command::{combined_output, CommandError, CommandRunner};

/// 拉取失败
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct FetchFailure {
    pub message: String,
    /// 网络 / 认证类失败，可重试
    pub transient: bool,
}

impl FetchFailure {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }
}

/// 源码拉取器
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// 把 `repo`（可选分支）拉取到 `dest`，`dest` 由调用方保证不存在或为空
    async fn fetch(
        &self,
        repo: &str,
        branch: Option<&str>,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), FetchFailure>;
}

/// git 输出中代表网络 / 认证问题的片段
const TRANSIENT_GIT_MARKERS: &[&str] = &[
    "could not resolve host",
    "connection timed out",
    "connection refused",
    "connection reset",
    "early eof",
    "rpc failed",
    "the remote end hung up",
    "authentication failed",
    "could not read username",
    "operation timed out",
];

/// 基于 git CLI 的拉取器
pub struct GitFetcher {
    timeout: Duration,
}

impl GitFetcher {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for GitFetcher {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

#[async_trait]
impl SourceFetcher for GitFetcher {
    async fn fetch(
        &self,
        repo: &str,
        branch: Option<&str>,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), FetchFailure> {
        // 上一次失败的尝试可能留下半个目录
        if dest.exists() {
            tokio::fs::remove_dir_all(dest)
                .await
                .map_err(|e| FetchFailure::permanent(format!("cannot clean {}: {}", dest.display(), e)))?;
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| FetchFailure::permanent(e.to_string()))?;
        }

        let mut args = vec![
            "clone".to_string(),
            "--depth".to_string(),
            "1".to_string(),
        ];
        if let Some(branch) = branch {
            args.extend(["--branch".to_string(), branch.to_string()]);
        }
        args.extend([repo.to_string(), dest.to_string_lossy().to_string()]);

        info!(repo = %repo, branch = ?branch, dest = %dest.display(), "Cloning repository");

        let output = CommandRunner::run("git", &args, None, self.timeout, cancel)
            .await
            .map_err(|e| match e {
                CommandError::Timeout(_) => FetchFailure::transient(e.to_string()),
                other => FetchFailure::permanent(other.to_string()),
            })?;

        if output.status.success() {
            return Ok(());
        }

        let message = combined_output(&output);
        let lower = message.to_ascii_lowercase();
        if TRANSIENT_GIT_MARKERS.iter().any(|m| lower.contains(m)) {
            Err(FetchFailure::transient(message))
        } else {
            Err(FetchFailure::permanent(message))
        }
    }
}
