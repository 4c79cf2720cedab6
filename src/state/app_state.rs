//! 应用状态

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// 全局 shutdown token，用于优雅关闭所有后台任务
static GLOBAL_SHUTDOWN: std::sync::OnceLock<CancellationToken> = std::sync::OnceLock::new();

/// 获取全局 shutdown token
pub fn get_shutdown_token() -> CancellationToken {
    GLOBAL_SHUTDOWN
        .get_or_init(CancellationToken::new)
        .clone()
}

/// 触发全局 shutdown
pub fn trigger_shutdown() {
    if let Some(token) = GLOBAL_SHUTDOWN.get() {
        token.cancel();
    }
}

use crate::config::{EnvConfig, FrameworkCatalog};
use crate::error::OrchestratorResult;
use crate::infra::{
    ContainerRuntime, DockerCli, GitFetcher, HealthProbe, HttpProbe, NoopProbe, SourceFetcher,
};
use crate::services::base_system::BaseSystemCoordinator;
use crate::services::lifecycle::LifecycleController;
use crate::services::registry::SiteRegistry;
use crate::services::secrets::{SecretStore, AGENT_TOKEN};
use crate::services::templates::TemplateEngine;

use super::log_hub::LogHub;
use super::site_locks::{RunningBuilds, SiteLocks};
use super::task_store::TaskStore;

/// 外部协作者（生产为 docker / git / HTTP，测试为内存替身）
pub struct Collaborators {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub fetcher: Arc<dyn SourceFetcher>,
    pub probe: Arc<dyn HealthProbe>,
}

impl Collaborators {
    /// 按配置创建生产实现
    pub fn from_config(config: &EnvConfig) -> Self {
        let probe: Arc<dyn HealthProbe> = match &config.build.health_probe_url {
            Some(url) => Arc::new(HttpProbe::new(url.clone())),
            None => Arc::new(NoopProbe),
        };
        Self {
            runtime: Arc::new(DockerCli::new(config.build.compose_timeout)),
            fetcher: Arc::new(GitFetcher::default()),
            probe,
        }
    }
}

/// 应用状态
pub struct AppState {
    // ========== 核心配置 ==========
    /// API bearer token
    pub api_token: String,
    /// 环境配置
    pub config: EnvConfig,
    /// 服务启动时间
    pub started_at: DateTime<Utc>,
    /// 框架目录（只读）
    pub catalog: Arc<FrameworkCatalog>,
    pub templates: TemplateEngine,

    // ========== 持久化状态 ==========
    pub registry: SiteRegistry,
    pub secrets: Arc<SecretStore>,
    pub base: Arc<BaseSystemCoordinator>,

    // ========== 外部协作者 ==========
    pub runtime: Arc<dyn ContainerRuntime>,
    pub fetcher: Arc<dyn SourceFetcher>,
    pub probe: Arc<dyn HealthProbe>,

    // ========== 任务管理 ==========
    /// 任务存储
    pub task_store: TaskStore,
    /// 日志中心
    pub log_hub: LogHub,
    /// 站点锁
    pub site_locks: SiteLocks,
    /// 正在执行的构建
    pub running_builds: RunningBuilds,
}

impl AppState {
    /// 使用生产协作者创建
    pub async fn new(config: EnvConfig) -> OrchestratorResult<Self> {
        let collaborators = Collaborators::from_config(&config);
        Self::with_collaborators(config, collaborators).await
    }

    pub async fn with_collaborators(
        config: EnvConfig,
        collaborators: Collaborators,
    ) -> OrchestratorResult<Self> {
        let catalog = Arc::new(FrameworkCatalog::builtin());
        let templates = TemplateEngine::new(catalog.clone());
        let secrets = Arc::new(SecretStore::new(config.paths.secrets_dir()));

        let api_token = match &config.agent_token {
            Some(token) => token.clone(),
            None => secrets.get_or_create(AGENT_TOKEN).await?,
        };

        let registry = SiteRegistry::open(config.paths.registry_file()).await?;
        let base = BaseSystemCoordinator::open(
            config.base.clone(),
            &config.paths,
            collaborators.runtime.clone(),
            secrets.clone(),
            templates.clone(),
            config.build.runtime_retry.clone(),
        )
        .await?;

        info!(
            port = config.port,
            sites_dir = %config.paths.sites_dir.display(),
            data_dir = %config.paths.data_dir.display(),
            network = %config.base.network,
            token_from_env = config.agent_token.is_some(),
            "Loaded configuration"
        );

        Ok(Self {
            api_token,
            started_at: Utc::now(),
            catalog,
            templates,
            registry,
            secrets,
            base: Arc::new(base),
            runtime: collaborators.runtime,
            fetcher: collaborators.fetcher,
            probe: collaborators.probe,
            task_store: TaskStore::new(),
            log_hub: LogHub::new(),
            site_locks: SiteLocks::new(),
            running_builds: RunningBuilds::new(),
            config,
        })
    }

    /// 验证 bearer token（也接受 `x-api-key`）
    pub fn verify_token(&self, headers: &axum::http::HeaderMap) -> bool {
        let bearer = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        let api_key = headers.get("x-api-key").and_then(|v| v.to_str().ok());

        bearer
            .or(api_key)
            .map_or(false, |token| token.trim() == self.api_token)
    }

    /// 站点生命周期操作
    pub fn lifecycle(&self) -> LifecycleController<'_> {
        LifecycleController::new(self)
    }

    /// 清理过期任务和空闲锁
    pub async fn cleanup(&self) {
        self.task_store.cleanup_stale().await;
        self.log_hub.cleanup_expired(24).await;
        self.site_locks.prune();
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::{BaseSystemConfig, BuildConfig, PathsConfig};
    use crate::infra::testing::{FakeFetcher, FakeProbe, FakeRuntime};
    use crate::infra::RetryPolicy;
    use std::time::Duration;

    pub const TEST_TOKEN: &str = "test-token";

    pub struct TestHarness {
        pub dir: tempfile::TempDir,
        pub state: Arc<AppState>,
        pub runtime: Arc<FakeRuntime>,
        pub fetcher: Arc<FakeFetcher>,
        pub probe: Arc<FakeProbe>,
    }

    impl TestHarness {
        pub fn site_dir(&self, site: &str) -> std::path::PathBuf {
            self.state.config.paths.site_dir(site)
        }
    }

    pub fn test_config(root: &std::path::Path) -> EnvConfig {
        EnvConfig {
            agent_token: Some(TEST_TOKEN.to_string()),
            port: 0,
            paths: PathsConfig::under(root),
            base: BaseSystemConfig {
                ready_timeout: Duration::from_secs(1),
                ..BaseSystemConfig::default()
            },
            build: BuildConfig {
                lock_timeout: Duration::from_secs(2),
                health_timeout: Duration::from_millis(300),
                health_interval: Duration::from_millis(10),
                health_probe_url: None,
                fetch_retry: RetryPolicy::new(3, Duration::from_millis(1)),
                runtime_retry: RetryPolicy::new(2, Duration::from_millis(1)),
                compose_timeout: Duration::from_secs(5),
            },
        }
    }

    pub async fn harness() -> TestHarness {
        harness_with(|_| {}).await
    }

    pub async fn harness_with(adjust: impl FnOnce(&mut EnvConfig)) -> TestHarness {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        adjust(&mut config);

        let runtime = Arc::new(FakeRuntime::with_base_system(&config.base));
        let fetcher = Arc::new(FakeFetcher::new());
        let probe = Arc::new(FakeProbe::new());
        let state = AppState::with_collaborators(
            config,
            Collaborators {
                runtime: runtime.clone(),
                fetcher: fetcher.clone(),
                probe: probe.clone(),
            },
        )
        .await
        .unwrap();

        TestHarness {
            dir,
            state: Arc::new(state),
            runtime,
            fetcher,
            probe,
        }
    }
}
