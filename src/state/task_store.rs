//! 构建任务存储
//!
//! 管理活跃任务和历史记录，自动清理过期任务

use chrono::{Duration, Utc};
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;

use crate::config::env::constants::{MAX_ACTIVE_TASKS, MAX_TASK_HISTORY};
use crate::domain::build::BuildTask;

/// 任务存储
///
/// 管理活跃任务和历史记录，提供清理策略
pub struct TaskStore {
    /// 活跃任务
    tasks: RwLock<HashMap<String, BuildTask>>,
    /// 历史记录（最新的在前）
    history: RwLock<VecDeque<BuildTask>>,
    max_active: usize,
    max_history: usize,
    /// 历史保留时间
    retention: Duration,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::with_config(MAX_ACTIVE_TASKS, MAX_TASK_HISTORY, 24)
    }

    /// 使用自定义配置创建
    pub fn with_config(max_active: usize, max_history: usize, retention_hours: i64) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            history: RwLock::new(VecDeque::new()),
            max_active,
            max_history,
            retention: Duration::hours(retention_hours),
        }
    }

    pub async fn create(&self, task: BuildTask) -> String {
        let task_id = task.id.clone();
        self.tasks.write().await.insert(task_id.clone(), task);
        task_id
    }

    /// 获取活跃任务
    pub async fn get(&self, task_id: &str) -> Option<BuildTask> {
        self.tasks.read().await.get(task_id).cloned()
    }

    /// 获取任务（优先活跃任务，然后查历史记录）
    pub async fn get_any(&self, task_id: &str) -> Option<BuildTask> {
        if let Some(task) = self.get(task_id).await {
            return Some(task);
        }
        let history = self.history.read().await;
        history.iter().find(|t| t.id == task_id).cloned()
    }

    /// 替换活跃任务的快照
    pub async fn update(&self, task: &BuildTask) {
        let mut tasks = self.tasks.write().await;
        if let Some(slot) = tasks.get_mut(&task.id) {
            *slot = task.clone();
        }
    }

    /// 完成任务并移到历史记录
    pub async fn finish(&self, task: BuildTask) {
        self.tasks.write().await.remove(&task.id);
        self.add_to_history(task).await;
    }

    pub async fn add_to_history(&self, task: BuildTask) {
        let mut history = self.history.write().await;
        history.push_front(task);
        while history.len() > self.max_history {
            history.pop_back();
        }
    }

    /// 最近的任务：先列运行中的，再列历史
    pub async fn recent(
        &self,
        limit: usize,
        site: Option<&str>,
        status: Option<&str>,
    ) -> Vec<BuildTask> {
        let mut running: Vec<BuildTask> = self.tasks.read().await.values().cloned().collect();
        running.sort_by(|a, b| b.started_at.cmp(&a.started_at));

        let history = self.history.read().await;
        running
            .into_iter()
            .chain(history.iter().cloned())
            .filter(|task| {
                let site_match = site.map_or(true, |s| task.site == s);
                let status_match = status.map_or(true, |s| task.status.as_str() == s);
                site_match && status_match
            })
            .take(limit)
            .collect()
    }

    /// 某站点正在运行的任务
    pub async fn active_for_site(&self, site: &str) -> Vec<BuildTask> {
        self.tasks
            .read()
            .await
            .values()
            .filter(|t| t.site == site)
            .cloned()
            .collect()
    }

    pub async fn history_count(&self) -> usize {
        self.history.read().await.len()
    }

    /// 移除超过保留时间的历史任务
    pub async fn cleanup_stale(&self) {
        let cutoff = Utc::now() - self.retention;
        let mut history = self.history.write().await;
        history.retain(|task| task.finished_at.map_or(true, |t| t > cutoff));
    }

    pub async fn active_count(&self) -> usize {
        self.tasks.read().await.len()
    }

    /// 检查是否达到活跃任务上限
    pub async fn is_at_capacity(&self) -> bool {
        self.active_count().await >= self.max_active
    }
}

impl Default for TaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::build::{BuildStatus, TaskError};

    fn task(id: &str, site: &str) -> BuildTask {
        BuildTask::new(
            id.to_string(),
            site.to_string(),
            format!("{}.example.com", site),
            "static".to_string(),
        )
    }

    #[tokio::test]
    async fn test_task_lifecycle() {
        let store = TaskStore::new();
        store.create(task("task-1", "demo")).await;

        let mut t = store.get("task-1").await.unwrap();
        assert_eq!(t.site, "demo");
        assert_eq!(store.active_for_site("demo").await.len(), 1);

        t.succeed();
        store.finish(t).await;

        assert!(store.get("task-1").await.is_none());
        let found = store.get_any("task-1").await.unwrap();
        assert_eq!(found.status, BuildStatus::Success);
        assert!(store.active_for_site("demo").await.is_empty());
    }

    #[tokio::test]
    async fn test_recent_filters() {
        let store = TaskStore::new();
        store.create(task("running", "demo")).await;

        let mut failed = task("failed", "shop");
        failed.fail(
            TaskError {
                kind: "fetch_error".into(),
                message: "boom".into(),
            },
            false,
        );
        store.add_to_history(failed).await;

        assert_eq!(store.recent(10, None, None).await.len(), 2);
        let shop = store.recent(10, Some("shop"), None).await;
        assert_eq!(shop.len(), 1);
        assert_eq!(shop[0].id, "failed");
        assert_eq!(store.recent(10, None, Some("running")).await[0].id, "running");
    }

    #[tokio::test]
    async fn test_history_limit() {
        let store = TaskStore::with_config(10, 5, 24);
        for i in 0..10 {
            let mut t = task(&format!("task-{}", i), "demo");
            t.succeed();
            store.add_to_history(t).await;
        }
        assert_eq!(store.history_count().await, 5);
    }

    #[tokio::test]
    async fn test_capacity() {
        let store = TaskStore::with_config(1, 5, 24);
        assert!(!store.is_at_capacity().await);
        store.create(task("a", "demo")).await;
        assert!(store.is_at_capacity().await);
    }
}
