//! 站点级互斥
//!
//! 同一站点的构建 / 启停 / 删除串行执行，不同站点互不阻塞。
//! 等锁有上限，超时返回 `BuildBusy`。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{OrchestratorError, OrchestratorResult};

/// 持有期间独占站点
pub struct SiteGuard {
    site: String,
    _guard: OwnedMutexGuard<()>,
}

impl SiteGuard {
    pub fn site(&self) -> &str {
        &self.site
    }
}

impl Drop for SiteGuard {
    fn drop(&mut self) {
        debug!(site = %self.site, "Site lock released");
    }
}

/// 站点锁表
#[derive(Default)]
pub struct SiteLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SiteLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, site: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(site.to_string()).or_default().clone()
    }

    /// 在 `timeout` 内获取站点锁
    pub async fn acquire(
        &self,
        site: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<SiteGuard> {
        let lock = self.lock_for(site);
        tokio::select! {
            _ = cancel.cancelled() => {
                Err(OrchestratorError::Cancelled(format!("waiting for lock on '{}'", site)))
            }
            result = tokio::time::timeout(timeout, lock.lock_owned()) => match result {
                Ok(guard) => {
                    debug!(site = %site, "Site lock acquired");
                    Ok(SiteGuard {
                        site: site.to_string(),
                        _guard: guard,
                    })
                }
                Err(_) => Err(OrchestratorError::BuildBusy {
                    site: site.to_string(),
                    waited_secs: timeout.as_secs(),
                }),
            }
        }
    }

    /// 立即判断站点是否被占用
    #[cfg(test)]
    pub fn is_locked(&self, site: &str) -> bool {
        let locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.get(site).map_or(false, |l| l.try_lock().is_err())
    }

    /// 丢弃无人持有也无人等待的锁
    pub fn prune(&self) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

struct RunningBuild {
    site: String,
    cancel: CancellationToken,
}

/// 正在执行的构建（task_id -> 站点 + 取消令牌）
#[derive(Default)]
pub struct RunningBuilds {
    builds: Mutex<HashMap<String, RunningBuild>>,
}

impl RunningBuilds {
    pub fn new() -> Self {
        Self::default()
    }

    fn builds(&self) -> std::sync::MutexGuard<'_, HashMap<String, RunningBuild>> {
        self.builds.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, task_id: &str, site: &str, cancel: CancellationToken) {
        self.builds().insert(
            task_id.to_string(),
            RunningBuild {
                site: site.to_string(),
                cancel,
            },
        );
    }

    pub fn unregister(&self, task_id: &str) {
        self.builds().remove(task_id);
    }

    pub fn is_building(&self, site: &str) -> bool {
        self.builds().values().any(|b| b.site == site)
    }

    /// 取消某站点的全部构建，返回被取消的 task_id
    pub fn cancel_site(&self, site: &str) -> Vec<String> {
        self.builds()
            .iter()
            .filter(|(_, b)| b.site == site)
            .map(|(id, b)| {
                b.cancel.cancel();
                id.clone()
            })
            .collect()
    }

    pub fn cancel_task(&self, task_id: &str) -> bool {
        match self.builds().get(task_id) {
            Some(build) => {
                build.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn count(&self) -> usize {
        self.builds().len()
    }
}
