//! 站点生命周期控制
//!
//! 对已构建的站点执行 start / stop / restart / remove。每个操作在站点锁内
//! 完成，构建进行中的站点直接拒绝（`InvalidState`），不排队。

use serde::Serialize;
use tracing::info;

use super::build::remove_dir_if_exists;
use crate::domain::{BuildPhase, SiteDescriptor, SiteState, SiteView, TenantHandle};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::infra::runtime::{ContainerState, ServiceAction, StackVerdict};
use crate::state::{get_shutdown_token, AppState, SiteGuard};

/// 站点状态（含容器健康）
#[derive(Debug, Clone, Serialize)]
pub struct SiteStatus {
    #[serde(flatten)]
    pub site: SiteView,
    /// healthy / pending / failed / missing / unknown
    pub health: String,
    pub containers: Vec<ContainerState>,
}

/// 删除结果
#[derive(Debug, Clone, Serialize)]
pub struct RemovalReport {
    pub name: String,
    pub domain: String,
    /// 保留未删除的租户资源，需要运维手动清理
    pub retained: Vec<TenantHandle>,
}

pub struct LifecycleController<'a> {
    state: &'a AppState,
}

impl<'a> LifecycleController<'a> {
    pub fn new(state: &'a AppState) -> Self {
        Self { state }
    }

    /// 当前正在构建的阶段
    pub async fn building_phase(&self, name: &str) -> Option<BuildPhase> {
        self.state
            .task_store
            .active_for_site(name)
            .await
            .into_iter()
            .map(|t| t.phase)
            .max()
    }

    pub async fn view(&self, name: &str) -> OrchestratorResult<SiteView> {
        let site = self.get(name).await?;
        Ok(SiteView::new(&site, self.building_phase(name).await))
    }

    pub async fn list(&self) -> Vec<SiteView> {
        let mut views = Vec::new();
        for site in self.state.registry.list().await {
            let building = self.building_phase(&site.name).await;
            views.push(SiteView::new(&site, building));
        }
        views
    }

    /// 查询状态，不取锁
    pub async fn status(&self, name: &str) -> OrchestratorResult<SiteStatus> {
        let site = self.get(name).await?;
        Ok(self.inspect(site).await)
    }

    /// 全部站点的容器状态
    pub async fn statuses(&self) -> Vec<SiteStatus> {
        let mut statuses = Vec::new();
        for site in self.state.registry.list().await {
            statuses.push(self.inspect(site).await);
        }
        statuses
    }

    async fn inspect(&self, site: SiteDescriptor) -> SiteStatus {
        let name = site.name.as_str();
        let building = self.building_phase(name).await;

        let (health, containers) = match self.state.runtime.stack_health(&site.stack).await {
            Ok(health) => {
                let verdict = match health.verdict() {
                    StackVerdict::Healthy => "healthy",
                    StackVerdict::Pending => "pending",
                    StackVerdict::Failed(_) => "failed",
                    StackVerdict::Missing => "missing",
                };
                (verdict.to_string(), health.containers)
            }
            Err(e) => {
                tracing::debug!(site = %name, error = %e, "Stack health unavailable");
                ("unknown".to_string(), Vec::new())
            }
        };

        SiteStatus {
            site: SiteView::new(&site, building),
            health,
            containers,
        }
    }

    /// 启动已停止的站点（不重新构建）
    pub async fn start(&self, name: &str) -> OrchestratorResult<SiteDescriptor> {
        let _guard = self.lock(name, "start").await?;
        let site = self.get(name).await?;

        self.state
            .runtime
            .control(&site.stack, None, ServiceAction::Start)
            .await?;
        self.state
            .runtime
            .attach_network(&site.stack, self.state.base.network())
            .await?;
        self.commit(&site, SiteState::Active).await
    }

    pub async fn stop(&self, name: &str) -> OrchestratorResult<SiteDescriptor> {
        let _guard = self.lock(name, "stop").await?;
        let site = self.get(name).await?;
        if site.state == SiteState::Stopped {
            return Ok(site);
        }

        self.state
            .runtime
            .control(&site.stack, None, ServiceAction::Stop)
            .await?;
        self.commit(&site, SiteState::Stopped).await
    }

    pub async fn restart(&self, name: &str) -> OrchestratorResult<SiteDescriptor> {
        let _guard = self.lock(name, "restart").await?;
        let site = self.get(name).await?;
        if site.state != SiteState::Active {
            return Err(OrchestratorError::InvalidState {
                site: name.to_string(),
                state: site.state.to_string(),
                operation: "restart",
            });
        }

        self.state
            .runtime
            .control(&site.stack, None, ServiceAction::Restart)
            .await?;
        self.commit(&site, SiteState::Active).await
    }

    /// 删除站点：下线栈、删除工作目录、移出注册表；租户库保留
    pub async fn remove(&self, name: &str) -> OrchestratorResult<RemovalReport> {
        let _guard = self.lock(name, "remove").await?;
        let site = self.get(name).await?;

        self.state.runtime.down(&site.stack, true).await?;
        remove_dir_if_exists(&self.state.config.paths.site_dir(name)).await?;
        self.state
            .registry
            .compare_and_swap(name, Some(site.state), None)
            .await?;

        let retained: Vec<TenantHandle> = site.database.iter().cloned().collect();
        info!(
            site = %name,
            retained = retained.len(),
            "Site removed"
        );
        Ok(RemovalReport {
            name: site.name,
            domain: site.domain,
            retained,
        })
    }

    pub async fn logs(&self, name: &str, tail: usize) -> OrchestratorResult<String> {
        let site = self.get(name).await?;
        Ok(self.state.runtime.logs(&site.stack, tail).await?)
    }

    async fn get(&self, name: &str) -> OrchestratorResult<SiteDescriptor> {
        self.state
            .registry
            .get(name)
            .await
            .ok_or_else(|| OrchestratorError::not_found(format!("site '{}'", name)))
    }

    /// 构建中的站点直接拒绝；否则在超时内取站点锁
    async fn lock(&self, name: &str, operation: &'static str) -> OrchestratorResult<SiteGuard> {
        if self.state.running_builds.is_building(name) {
            return Err(OrchestratorError::InvalidState {
                site: name.to_string(),
                state: "building".to_string(),
                operation,
            });
        }
        self.state
            .site_locks
            .acquire(
                name,
                self.state.config.build.lock_timeout,
                &get_shutdown_token(),
            )
            .await
    }

    async fn commit(
        &self,
        previous: &SiteDescriptor,
        state: SiteState,
    ) -> OrchestratorResult<SiteDescriptor> {
        let next = previous.with_state(state);
        self.state
            .registry
            .compare_and_swap(&previous.name, Some(previous.state), Some(next.clone()))
            .await?;
        info!(site = %next.name, from = %previous.state, to = %state, "Site state changed");
        Ok(next)
    }
}
