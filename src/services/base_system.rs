//! 基础系统协调器
//!
//! 共享的反向代理、数据库和缓存作为一个 compose 栈统一管理：
//! - `ensure_running`: 幂等拉起（全局互斥，并发调用只会真正执行一次）
//! - `start / stop / restart`: 针对整个栈或单个服务
//! - `provision_tenant_resource`: 在共享数据库里为站点分配库和用户（幂等，带台账）

use chrono::Utc;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::persistence;
use super::secrets::{SecretStore, MYSQL_ROOT_PASSWORD};
use super::templates::{write_files, BaseContext, TemplateEngine};
use crate::config::{BaseSystemConfig, PathsConfig};
use crate::domain::site::{is_valid_db_password, is_valid_identifier};
use crate::domain::{
    BaseSystemState, ServiceStatus, SharedService, TenantHandle, TenantRecord,
    TenantResourceKind, TenantResourceSpec,
};
use crate::infra::{retry, ContainerRuntime, RetryPolicy, RuntimeError, ServiceAction, StackSpec};
use crate::error::{OrchestratorError, OrchestratorResult};

/// MySQL 端口（共享网络内）
pub const MYSQL_PORT: u16 = 3306;
/// MySQL 标识符长度上限
const MYSQL_IDENT_MAX: usize = 32;
/// 等待服务就绪的轮询间隔
const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);

type TenantLedger = BTreeMap<String, TenantRecord>;

/// 基础系统协调器（单例）
pub struct BaseSystemCoordinator {
    config: BaseSystemConfig,
    stack: StackSpec,
    tenants_file: PathBuf,
    runtime: Arc<dyn ContainerRuntime>,
    secrets: Arc<SecretStore>,
    templates: TemplateEngine,
    retry: RetryPolicy,
    state: RwLock<BaseSystemState>,
    /// 网络创建和栈拉起的全局互斥
    bring_up: Mutex<()>,
    /// 租户台账（数据库名 -> 记录），同时串行化 SQL 执行
    tenants: Mutex<TenantLedger>,
}

impl BaseSystemCoordinator {
    /// 加载租户台账并创建协调器
    pub async fn open(
        config: BaseSystemConfig,
        paths: &PathsConfig,
        runtime: Arc<dyn ContainerRuntime>,
        secrets: Arc<SecretStore>,
        templates: TemplateEngine,
        retry: RetryPolicy,
    ) -> OrchestratorResult<Self> {
        let tenants_file = paths.tenants_file();
        let tenants: TenantLedger = persistence::load(&tenants_file)
            .await
            .map_err(|e| {
                OrchestratorError::Registry(format!(
                    "cannot load {}: {}",
                    tenants_file.display(),
                    e
                ))
            })?
            .unwrap_or_default();

        let state = BaseSystemState::new(
            &config.network,
            [
                (SharedService::Proxy, config.proxy_container.as_str()),
                (SharedService::Database, config.mysql_container.as_str()),
                (SharedService::Cache, config.redis_container.as_str()),
            ],
            MYSQL_ROOT_PASSWORD,
        );

        info!(
            project = %config.project,
            network = %config.network,
            tenants = tenants.len(),
            "Base system coordinator ready"
        );

        Ok(Self {
            stack: StackSpec::new(config.project.clone(), paths.shared_dir.clone()),
            config,
            tenants_file,
            runtime,
            secrets,
            templates,
            retry,
            state: RwLock::new(state),
            bring_up: Mutex::new(()),
            tenants: Mutex::new(tenants),
        })
    }

    /// 共享网络名
    pub fn network(&self) -> &str {
        &self.config.network
    }

    /// 最近一次刷新的状态快照（不访问容器引擎）
    pub async fn status(&self) -> BaseSystemState {
        self.state.read().await.clone()
    }

    /// 查询每个共享容器的实际状态并更新快照
    pub async fn refresh(&self) -> OrchestratorResult<BaseSystemState> {
        let containers: Vec<(SharedService, String)> = {
            let state = self.state.read().await;
            state
                .services
                .iter()
                .map(|(svc, s)| (*svc, s.container.clone()))
                .collect()
        };

        let mut observed = Vec::with_capacity(containers.len());
        for (service, container) in containers {
            let inspected = self.runtime.inspect(&container).await.map_err(|e| {
                OrchestratorError::BaseSystemUnavailable(format!(
                    "cannot inspect {} ({}): {}",
                    service, container, e
                ))
            })?;
            observed.push((service, ServiceStatus::from_container(&inspected)));
        }

        let mut state = self.state.write().await;
        for (service, status) in observed {
            if let Some(entry) = state.services.get_mut(&service) {
                if entry.status != status {
                    debug!(
                        service = %service,
                        from = entry.status.as_str(),
                        to = status.as_str(),
                        "Shared service status changed"
                    );
                }
                entry.status = status;
            }
        }
        state.last_health_check = Some(Utc::now());
        Ok(state.clone())
    }

    /// 刷新后检查指定服务都在运行
    pub async fn require_running(&self, services: &[SharedService]) -> OrchestratorResult<()> {
        let state = self.refresh().await?;
        let down: Vec<String> = services
            .iter()
            .filter(|svc| state.status_of(**svc) != ServiceStatus::Running)
            .map(|svc| format!("{} is {}", svc, state.status_of(*svc).as_str()))
            .collect();
        if down.is_empty() {
            Ok(())
        } else {
            Err(OrchestratorError::BaseSystemUnavailable(down.join(", ")))
        }
    }

    /// 幂等拉起全部共享服务
    pub async fn ensure_running(
        &self,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<BaseSystemState> {
        let _guard = self.bring_up.lock().await;

        let current = self.refresh().await?;
        if current.is_running() {
            return Ok(current);
        }

        info!(project = %self.stack.project, "Bringing up base system");
        self.ensure_network().await?;

        let root_password = self.secrets.get_or_create(MYSQL_ROOT_PASSWORD).await?;
        let files = self.templates.render_base(&BaseContext {
            project: self.config.project.clone(),
            network: self.config.network.clone(),
            proxy_container: self.config.proxy_container.clone(),
            mysql_container: self.config.mysql_container.clone(),
            redis_container: self.config.redis_container.clone(),
            traefik_email: self.config.traefik_email.clone(),
            mysql_root_password: root_password,
            mysql_charset: self.config.mysql_charset.clone(),
            mysql_collation: self.config.mysql_collation.clone(),
        })?;
        write_files(&self.stack.dir, &files).await?;

        let runtime = &self.runtime;
        let stack = &self.stack;
        retry(
            &self.retry,
            "base system up",
            cancel,
            RuntimeError::is_transient,
            move |_| runtime.up(stack, cancel),
        )
        .await
        .map_err(|failure| {
            if failure.cancelled || matches!(failure.error, RuntimeError::Cancelled) {
                OrchestratorError::Cancelled("base system bring-up".to_string())
            } else {
                OrchestratorError::BaseSystemUnavailable(format!(
                    "bring-up failed after {} attempt(s): {}",
                    failure.attempts, failure.error
                ))
            }
        })?;

        let state = self.wait_ready(cancel).await?;
        info!(project = %self.stack.project, "Base system running");
        Ok(state)
    }

    async fn ensure_network(&self) -> OrchestratorResult<()> {
        let network = &self.config.network;
        if !self.runtime.network_exists(network).await? {
            info!(network = %network, "Creating shared network");
            self.runtime.create_network(network).await?;
        }
        Ok(())
    }

    async fn wait_ready(&self, cancel: &CancellationToken) -> OrchestratorResult<BaseSystemState> {
        let deadline = tokio::time::Instant::now() + self.config.ready_timeout;
        loop {
            let state = self.refresh().await?;
            if state.is_running() {
                return Ok(state);
            }
            if tokio::time::Instant::now() >= deadline {
                let pending: Vec<String> = state
                    .services
                    .iter()
                    .filter(|(_, s)| s.status != ServiceStatus::Running)
                    .map(|(svc, s)| format!("{} is {}", svc, s.status.as_str()))
                    .collect();
                return Err(OrchestratorError::BaseSystemUnavailable(format!(
                    "not ready within {}s: {}",
                    self.config.ready_timeout.as_secs(),
                    pending.join(", ")
                )));
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(OrchestratorError::Cancelled("waiting for base system".to_string()));
                }
                _ = tokio::time::sleep(READY_POLL_INTERVAL) => {}
            }
        }
    }

    /// 启动整个栈（等同 ensure_running）或单个服务
    pub async fn start(
        &self,
        service: Option<SharedService>,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<BaseSystemState> {
        match service {
            None => self.ensure_running(cancel).await,
            Some(svc) => self.control(Some(svc), ServiceAction::Start).await,
        }
    }

    pub async fn stop(&self, service: Option<SharedService>) -> OrchestratorResult<BaseSystemState> {
        self.control(service, ServiceAction::Stop).await
    }

    pub async fn restart(
        &self,
        service: Option<SharedService>,
    ) -> OrchestratorResult<BaseSystemState> {
        self.control(service, ServiceAction::Restart).await
    }

    async fn control(
        &self,
        service: Option<SharedService>,
        action: ServiceAction,
    ) -> OrchestratorResult<BaseSystemState> {
        let _guard = self.bring_up.lock().await;
        info!(
            service = service.map_or("all", |s| s.as_str()),
            action = action.as_str(),
            "Base system control"
        );

        self.runtime
            .control(&self.stack, service.map(|s| s.compose_service()), action)
            .await
            .map_err(|e| match e {
                RuntimeError::NotFound(_) => OrchestratorError::BaseSystemUnavailable(format!(
                    "base system stack '{}' has not been brought up",
                    self.stack.project
                )),
                other => OrchestratorError::Runtime(other),
            })?;
        self.refresh().await
    }

    /// 分配租户资源；同名且兼容时直接返回已有句柄
    ///
    /// 返回 `(handle, created)`，`created` 表示本次调用真正创建了资源
    pub async fn provision_tenant_resource(
        &self,
        spec: &TenantResourceSpec,
    ) -> OrchestratorResult<(TenantHandle, bool)> {
        let mut tenants = self.tenants.lock().await;

        if let Some(existing) = tenants.get(&spec.name) {
            return match existing.incompatibility(spec) {
                None => {
                    debug!(database = %spec.name, owner = %spec.owner, "Tenant resource already provisioned");
                    Ok((existing.handle.clone(), false))
                }
                Some(reason) => Err(OrchestratorError::ResourceConflict {
                    name: spec.name.clone(),
                    reason,
                }),
            };
        }

        match spec.kind {
            TenantResourceKind::MysqlDatabase => {
                Self::check_mysql_spec(spec)?;
                self.require_running(&[SharedService::Database]).await?;

                let sql = format!(
                    "CREATE DATABASE IF NOT EXISTS `{db}` CHARACTER SET {charset} COLLATE {collation};\n\
                     CREATE USER IF NOT EXISTS '{user}'@'%' IDENTIFIED BY '{pass}';\n\
                     GRANT ALL PRIVILEGES ON `{db}`.* TO '{user}'@'%';\n\
                     FLUSH PRIVILEGES;\n",
                    db = spec.name,
                    user = spec.user,
                    pass = spec.password,
                    charset = self.config.mysql_charset,
                    collation = self.config.mysql_collation,
                );
                self.run_mysql(&spec.name, &sql).await?;
            }
        }

        let record = TenantRecord {
            handle: TenantHandle {
                kind: spec.kind,
                name: spec.name.clone(),
                user: spec.user.clone(),
                host: self.config.mysql_container.clone(),
                port: MYSQL_PORT,
            },
            owner: spec.owner.clone(),
            password: spec.password.clone(),
            charset: self.config.mysql_charset.clone(),
            collation: self.config.mysql_collation.clone(),
            created_at: Utc::now(),
        };

        let mut next = tenants.clone();
        next.insert(spec.name.clone(), record.clone());
        self.save_ledger(&next).await?;
        *tenants = next;

        info!(database = %spec.name, owner = %spec.owner, "Tenant database provisioned");
        Ok((record.handle, true))
    }

    /// 删除租户资源（构建回滚时清理本次新建的库）
    pub async fn release_tenant_resource(&self, name: &str) -> OrchestratorResult<()> {
        let mut tenants = self.tenants.lock().await;
        let Some(record) = tenants.get(name).cloned() else {
            return Ok(());
        };

        match record.handle.kind {
            TenantResourceKind::MysqlDatabase => {
                let sql = format!(
                    "DROP DATABASE IF EXISTS `{db}`;\nDROP USER IF EXISTS '{user}'@'%';\nFLUSH PRIVILEGES;\n",
                    db = record.handle.name,
                    user = record.handle.user,
                );
                self.run_mysql(name, &sql).await?;
            }
        }

        let mut next = tenants.clone();
        next.remove(name);
        self.save_ledger(&next).await?;
        *tenants = next;

        info!(database = %name, "Tenant database released");
        Ok(())
    }

    /// 台账中的全部租户资源
    pub async fn tenants(&self) -> Vec<TenantHandle> {
        self.tenants
            .lock()
            .await
            .values()
            .map(|r| r.handle.clone())
            .collect()
    }

    fn check_mysql_spec(spec: &TenantResourceSpec) -> OrchestratorResult<()> {
        if !is_valid_identifier(&spec.name, 64) {
            return Err(OrchestratorError::validation(format!(
                "invalid database name '{}'",
                spec.name
            )));
        }
        if !is_valid_identifier(&spec.user, MYSQL_IDENT_MAX) {
            return Err(OrchestratorError::validation(format!(
                "invalid database user '{}'",
                spec.user
            )));
        }
        if !is_valid_db_password(&spec.password) {
            return Err(OrchestratorError::validation("invalid database password"));
        }
        Ok(())
    }

    /// 在共享 MySQL 容器里执行 SQL（root 密码取自容器环境变量，不出现在命令行）
    async fn run_mysql(&self, target: &str, sql: &str) -> OrchestratorResult<()> {
        let command = vec![
            "sh".to_string(),
            "-c".to_string(),
            "exec mysql -uroot -p\"$MYSQL_ROOT_PASSWORD\"".to_string(),
        ];
        let output = self
            .runtime
            .exec(&self.config.mysql_container, &command, Some(sql))
            .await?;
        if output.exit_code != 0 {
            return Err(OrchestratorError::Runtime(RuntimeError::CommandFailed {
                operation: "mysql",
                target: target.to_string(),
                message: output.output.trim().to_string(),
                transient: false,
            }));
        }
        Ok(())
    }

    async fn save_ledger(&self, ledger: &TenantLedger) -> OrchestratorResult<()> {
        persistence::save(&self.tenants_file, ledger)
            .await
            .map_err(|e| {
                OrchestratorError::Registry(format!(
                    "cannot save {}: {}",
                    self.tenants_file.display(),
                    e
                ))
            })
    }

    /// 启动后台健康刷新任务
    pub fn start_refresh_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let interval = self.config.refresh_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match self.refresh().await {
                    Ok(state) if !state.is_running() => {
                        warn!(status = state.overall().as_str(), "Base system is not fully running");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Base system health refresh failed"),
                }
            }
            debug!("Base system refresh loop stopped");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FrameworkCatalog;
    use crate::infra::testing::FakeRuntime;

    struct Fixture {
        _dir: tempfile::TempDir,
        paths: PathsConfig,
        runtime: Arc<FakeRuntime>,
        coordinator: Arc<BaseSystemCoordinator>,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let paths = PathsConfig::under(dir.path());
        let config = BaseSystemConfig {
            ready_timeout: Duration::from_secs(2),
            ..BaseSystemConfig::default()
        };
        let runtime = Arc::new(FakeRuntime::with_base_system(&config));
        let coordinator = BaseSystemCoordinator::open(
            config,
            &paths,
            runtime.clone(),
            Arc::new(SecretStore::new(paths.secrets_dir())),
            TemplateEngine::new(Arc::new(FrameworkCatalog::builtin())),
            RetryPolicy::new(2, Duration::from_millis(1)),
        )
        .await
        .unwrap();
        Fixture {
            _dir: dir,
            paths,
            runtime,
            coordinator: Arc::new(coordinator),
        }
    }

    fn mysql_spec(name: &str, owner: &str) -> TenantResourceSpec {
        TenantResourceSpec {
            kind: TenantResourceKind::MysqlDatabase,
            name: name.to_string(),
            user: format!("{}_user", owner),
            password: "S3cretPassw0rd".to_string(),
            owner: owner.to_string(),
        }
    }

    #[tokio::test]
    async fn test_ensure_running_brings_up_once() {
        let f = fixture().await;
        let cancel = CancellationToken::new();

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let c = f.coordinator.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { c.ensure_running(&cancel).await.unwrap() })
            })
            .collect();
        for h in handles {
            assert!(h.await.unwrap().is_running());
        }

        assert_eq!(f.runtime.count("up shared-services"), 1);
        assert_eq!(f.runtime.count("create_network shared_net"), 1);

        // 渲染出的 compose 和 .env 已落盘，root 密码只生成一次
        assert!(f.paths.shared_dir.join("docker-compose.yml").exists());
        let env = std::fs::read_to_string(f.paths.shared_dir.join(".env")).unwrap();
        let password = std::fs::read_to_string(f.paths.secrets_dir().join(MYSQL_ROOT_PASSWORD)).unwrap();
        assert!(env.contains(password.trim()));

        // 再次调用不会重复拉起
        f.coordinator.ensure_running(&cancel).await.unwrap();
        assert_eq!(f.runtime.count("up shared-services"), 1);
    }

    #[tokio::test]
    async fn test_crashed_service_is_detected_and_recovered() {
        let f = fixture().await;
        let cancel = CancellationToken::new();
        f.coordinator.ensure_running(&cancel).await.unwrap();

        f.runtime.crash_container("shared_mysql");
        let state = f.coordinator.refresh().await.unwrap();
        assert_eq!(state.status_of(SharedService::Database), ServiceStatus::Stopped);
        assert_eq!(state.overall(), ServiceStatus::Degraded);

        let state = f.coordinator.ensure_running(&cancel).await.unwrap();
        assert!(state.is_running());
        assert_eq!(f.runtime.count("up shared-services"), 2);
    }

    #[tokio::test]
    async fn test_bring_up_failure_is_base_system_unavailable() {
        let f = fixture().await;
        f.runtime.fail_up_for(
            "shared-services",
            RuntimeError::CommandFailed {
                operation: "compose up",
                target: "shared-services".into(),
                message: "port 443 already allocated".into(),
                transient: false,
            },
        );
        let err = f
            .coordinator
            .ensure_running(&CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "base_system_unavailable");
    }

    #[tokio::test]
    async fn test_cancelled_bring_up_is_cancelled() {
        let f = fixture().await;
        f.runtime.set_up_delay(Duration::from_secs(10));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = f.coordinator.ensure_running(&cancel).await.unwrap_err();
        assert_eq!(err.kind(), "cancelled");
        assert_eq!(f.runtime.count("up shared-services"), 1);
    }

    #[tokio::test]
    async fn test_service_control_and_status() {
        let f = fixture().await;
        let cancel = CancellationToken::new();

        // 未拉起时控制单个服务报基础系统不可用
        let err = f.coordinator.stop(Some(SharedService::Cache)).await.unwrap_err();
        assert_eq!(err.kind(), "base_system_unavailable");

        f.coordinator.ensure_running(&cancel).await.unwrap();
        let state = f.coordinator.stop(Some(SharedService::Cache)).await.unwrap();
        assert_eq!(state.status_of(SharedService::Cache), ServiceStatus::Stopped);
        assert_eq!(state.status_of(SharedService::Database), ServiceStatus::Running);
        assert_eq!(state.overall(), ServiceStatus::Degraded);
        assert!(f.runtime.calls().contains(&"stop shared-services/redis".to_string()));

        let err = f
            .coordinator
            .require_running(&[SharedService::Cache])
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        let state = f.coordinator.start(Some(SharedService::Cache), &cancel).await.unwrap();
        assert!(state.is_running());

        let state = f.coordinator.stop(None).await.unwrap();
        assert_eq!(state.overall(), ServiceStatus::Stopped);
        let state = f.coordinator.restart(None).await.unwrap();
        assert!(state.is_running());
        assert!(f.coordinator.status().await.last_health_check.is_some());
    }

    #[tokio::test]
    async fn test_provision_is_idempotent() {
        let f = fixture().await;
        f.coordinator.ensure_running(&CancellationToken::new()).await.unwrap();

        let spec = mysql_spec("demo_db", "demo");
        let (first, created) = f.coordinator.provision_tenant_resource(&spec).await.unwrap();
        assert!(created);
        assert_eq!(first.host, "shared_mysql");
        assert_eq!(first.port, 3306);

        let (second, created) = f.coordinator.provision_tenant_resource(&spec).await.unwrap();
        assert!(!created);
        assert_eq!(first, second);

        // 只执行过一次 SQL，且密码不出现在命令行
        let inputs = f.runtime.exec_inputs();
        assert_eq!(inputs.len(), 1);
        assert!(inputs[0].1.contains("CREATE DATABASE IF NOT EXISTS `demo_db`"));
        assert!(inputs[0].1.contains("utf8mb4_unicode_ci"));
        assert!(!f.runtime.calls().iter().any(|c| c.contains("S3cretPassw0rd")));
    }

    #[tokio::test]
    async fn test_provision_conflict() {
        let f = fixture().await;
        f.coordinator.ensure_running(&CancellationToken::new()).await.unwrap();
        f.coordinator
            .provision_tenant_resource(&mysql_spec("demo_db", "demo"))
            .await
            .unwrap();

        let err = f
            .coordinator
            .provision_tenant_resource(&mysql_spec("demo_db", "shop"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ResourceConflict { .. }));
    }

    #[tokio::test]
    async fn test_provision_requires_database() {
        let f = fixture().await;
        let err = f
            .coordinator
            .provision_tenant_resource(&mysql_spec("demo_db", "demo"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "base_system_unavailable");
        assert!(f.coordinator.tenants().await.is_empty());
    }

    #[tokio::test]
    async fn test_ledger_survives_reopen_and_release() {
        let f = fixture().await;
        f.coordinator.ensure_running(&CancellationToken::new()).await.unwrap();
        f.coordinator
            .provision_tenant_resource(&mysql_spec("demo_db", "demo"))
            .await
            .unwrap();

        let reopened = BaseSystemCoordinator::open(
            BaseSystemConfig::default(),
            &f.paths,
            f.runtime.clone(),
            Arc::new(SecretStore::new(f.paths.secrets_dir())),
            TemplateEngine::new(Arc::new(FrameworkCatalog::builtin())),
            RetryPolicy::none(),
        )
        .await
        .unwrap();
        assert_eq!(reopened.tenants().await.len(), 1);

        reopened.release_tenant_resource("demo_db").await.unwrap();
        assert!(reopened.tenants().await.is_empty());
        let last = f.runtime.exec_inputs().pop().unwrap();
        assert!(last.1.contains("DROP DATABASE IF EXISTS `demo_db`"));
    }
}
