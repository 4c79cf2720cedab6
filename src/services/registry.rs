//! 站点注册表
//!
//! 站点名 -> `SiteDescriptor` 的持久化映射，是站点状态的唯一事实来源。
//! 注册表本身不做站点级加锁：调用方（构建流水线 / 生命周期控制器）负责持有站点锁；
//! 这里只保证每次写入都是“先落盘、再替换内存快照”，读操作只在替换瞬间短暂等待。

use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use super::persistence;
use crate::domain::{SiteDescriptor, SiteState};
use crate::error::{OrchestratorError, OrchestratorResult};

type SiteMap = BTreeMap<String, SiteDescriptor>;

/// 站点注册表
pub struct SiteRegistry {
    path: PathBuf,
    sites: RwLock<SiteMap>,
    /// 串行化落盘
    persist_lock: Mutex<()>,
}

impl SiteRegistry {
    /// 打开注册表文件（不存在则为空）
    pub async fn open(path: impl Into<PathBuf>) -> OrchestratorResult<Self> {
        let path = path.into();
        let sites: SiteMap = persistence::load(&path)
            .await
            .map_err(|e| OrchestratorError::Registry(format!("cannot load {}: {}", path.display(), e)))?
            .unwrap_or_default();

        info!(path = %path.display(), sites = sites.len(), "Site registry opened");
        Ok(Self {
            path,
            sites: RwLock::new(sites),
            persist_lock: Mutex::new(()),
        })
    }

    pub async fn get(&self, name: &str) -> Option<SiteDescriptor> {
        self.sites.read().await.get(name).cloned()
    }

    /// 按站点名排序
    pub async fn list(&self) -> Vec<SiteDescriptor> {
        self.sites.read().await.values().cloned().collect()
    }

    /// 写入描述（调用方必须持有该站点的锁）
    pub async fn put(&self, descriptor: SiteDescriptor) -> OrchestratorResult<()> {
        let name = descriptor.name.clone();
        self.mutate(|sites| {
            sites.insert(name, descriptor);
            Ok(())
        })
        .await
    }

    /// 仅当当前状态等于 `expected`（None 表示不存在）时才写入 `new`（None 表示删除）
    pub async fn compare_and_swap(
        &self,
        name: &str,
        expected: Option<SiteState>,
        new: Option<SiteDescriptor>,
    ) -> OrchestratorResult<()> {
        self.mutate(|sites| {
            let actual = sites.get(name).map(|s| s.state);
            if actual != expected {
                return Err(OrchestratorError::InvalidState {
                    site: name.to_string(),
                    state: actual.map_or("absent", |s| s.as_str()).to_string(),
                    operation: "update",
                });
            }
            match new {
                Some(descriptor) => {
                    sites.insert(name.to_string(), descriptor);
                }
                None => {
                    sites.remove(name);
                }
            }
            Ok(())
        })
        .await
    }

    /// 删除站点，返回被删除的描述
    pub async fn remove(&self, name: &str) -> OrchestratorResult<Option<SiteDescriptor>> {
        let mut removed = None;
        self.mutate(|sites| {
            removed = sites.remove(name);
            Ok(())
        })
        .await?;
        Ok(removed)
    }

    /// 在副本上修改、落盘成功后再替换内存快照
    async fn mutate<F>(&self, f: F) -> OrchestratorResult<()>
    where
        F: FnOnce(&mut SiteMap) -> OrchestratorResult<()>,
    {
        let _persist = self.persist_lock.lock().await;

        let mut next = self.sites.read().await.clone();
        f(&mut next)?;

        persistence::save(&self.path, &next)
            .await
            .map_err(|e| OrchestratorError::Registry(format!("cannot save {}: {}", self.path.display(), e)))?;

        debug!(sites = next.len(), "Registry persisted");
        *self.sites.write().await = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Framework;
    use crate::domain::{SiteParams, SiteSecrets};
    use crate::infra::runtime::StackSpec;
    use chrono::Utc;

    fn descriptor(name: &str, state: SiteState) -> SiteDescriptor {
        let now = Utc::now();
        SiteDescriptor {
            name: name.to_string(),
            domain: format!("{}.example.com", name),
            framework: Framework::Static,
            repo: "https://example.com/app.git".to_string(),
            params: SiteParams::default(),
            state,
            created_at: now,
            last_build_at: now,
            updated_at: now,
            generation: 1,
            stack: StackSpec::new(format!("{}-g1", name), format!("/tmp/{}", name)),
            database: None,
            secrets: SiteSecrets {
                app_key: "key".to_string(),
                db_password: None,
            },
        }
    }

    #[tokio::test]
    async fn test_put_get_list_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");

        let registry = SiteRegistry::open(&path).await.unwrap();
        registry.put(descriptor("shop", SiteState::Active)).await.unwrap();
        registry.put(descriptor("demo", SiteState::Active)).await.unwrap();

        let names: Vec<_> = registry.list().await.into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["demo", "shop"]);

        let reopened = SiteRegistry::open(&path).await.unwrap();
        assert_eq!(reopened.get("demo").await, registry.get("demo").await);
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SiteRegistry::open(dir.path().join("registry.json")).await.unwrap();

        // 期望不存在
        registry
            .compare_and_swap("demo", None, Some(descriptor("demo", SiteState::Active)))
            .await
            .unwrap();

        // 状态不符，拒绝写入
        let err = registry
            .compare_and_swap("demo", Some(SiteState::Stopped), Some(descriptor("demo", SiteState::Active)))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidState { ref state, .. } if state == "active"));

        let current = registry.get("demo").await.unwrap();
        registry
            .compare_and_swap("demo", Some(SiteState::Active), Some(current.with_state(SiteState::Stopped)))
            .await
            .unwrap();
        assert_eq!(registry.get("demo").await.unwrap().state, SiteState::Stopped);

        registry
            .compare_and_swap("demo", Some(SiteState::Stopped), None)
            .await
            .unwrap();
        assert!(registry.get("demo").await.is_none());
    }

    #[tokio::test]
    async fn test_failed_persist_keeps_memory_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        // 目标路径是一个目录，rename 会失败
        let path = dir.path().join("registry.json");
        std::fs::create_dir_all(path.join("blocker")).unwrap();

        let registry = SiteRegistry {
            path: path.clone(),
            sites: RwLock::new(SiteMap::new()),
            persist_lock: Mutex::new(()),
        };
        let err = registry.put(descriptor("demo", SiteState::Active)).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Registry(_)));
        assert!(registry.get("demo").await.is_none());
    }

    #[tokio::test]
    async fn test_remove() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SiteRegistry::open(dir.path().join("registry.json")).await.unwrap();
        registry.put(descriptor("demo", SiteState::Active)).await.unwrap();

        let removed = registry.remove("demo").await.unwrap();
        assert_eq!(removed.map(|s| s.name), Some("demo".to_string()));
        assert!(registry.remove("demo").await.unwrap().is_none());
    }
}
