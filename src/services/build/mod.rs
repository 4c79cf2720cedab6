//! 构建流水线
//!
//! `submit` 同步校验请求、登记任务并派生后台执行；执行过程按
//! `Validating → Locked → Fetching → Rendering → Provisioning → Starting →
//! RoutingAttached → HealthChecking → Active` 推进。
//!
//! 新栈使用带代号的 compose 项目名（`{site}-g{generation}`），健康后才写注册表，
//! 写入成功后再下线旧栈。任何失败（包括取消）都走同一条回滚路径：
//! 下线本次新栈、释放本次新建的租户库、删除本次的发布目录。

mod context;

pub use context::BuildContext;

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::base_system::MYSQL_PORT;
use super::secrets::generate_secret;
use super::templates::{
    write_files, DbContext, LaravelContext, NodeContext, SiteContext, StaticContext,
    TemplateContext,
};
use crate::config::env::constants::{DEFAULT_NODE_VERSION, DEFAULT_PHP_VERSION};
use crate::config::frameworks::TemplateFamily;
use crate::config::{BuildParam, Framework, FrameworkCatalog, FrameworkDescriptor};
use crate::domain::site::{
    derive_site_name, is_valid_branch, is_valid_db_password, is_valid_domain, is_valid_identifier,
    is_valid_repo_url,
};
use crate::domain::{
    BuildPhase, BuildRequest, BuildTask, SharedService, SiteDescriptor, SiteParams, SiteSecrets,
    SiteState, TenantHandle, TenantResourceKind, TenantResourceSpec,
};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::infra::probe::ProbeOutcome;
use crate::infra::runtime::StackVerdict;
use crate::infra::{retry, FetchFailure, RuntimeError, StackSpec};
use crate::state::{get_shutdown_token, AppState};

/// 源码在发布目录中的子目录
const SOURCE_DIR: &str = "app";
/// 生成的 APP_KEY 长度
const APP_KEY_LENGTH: usize = 32;
/// 生成的数据库密码长度
const DB_PASSWORD_LENGTH: usize = 24;
/// MySQL 库名、用户名长度上限
const DB_NAME_MAX: usize = 64;
const DB_USER_MAX: usize = 32;

/// 校验通过的构建计划
#[derive(Clone, Debug)]
pub struct BuildPlan {
    pub site: String,
    pub domain: String,
    pub repo: String,
    pub framework: Framework,
    pub descriptor: FrameworkDescriptor,
    pub params: SiteParams,
    pub db_name: Option<String>,
    pub db_user: Option<String>,
    pub db_pass: Option<String>,
}

/// 已受理的构建
pub struct SubmittedBuild {
    pub task_id: String,
    pub site: String,
    pub cancel: CancellationToken,
    pub handle: JoinHandle<BuildOutcome>,
}

/// 构建结束时的任务快照和结果
pub struct BuildOutcome {
    pub task: BuildTask,
    pub result: OrchestratorResult<SiteDescriptor>,
}

fn is_valid_runtime_version(version: &str) -> bool {
    !version.is_empty()
        && version.len() <= 16
        && version.starts_with(|c: char| c.is_ascii_digit())
        && version.chars().all(|c| c.is_ascii_digit() || c == '.')
}

/// 校验请求并生成构建计划（纯函数，不产生副作用）
pub fn validate(catalog: &FrameworkCatalog, request: &BuildRequest) -> OrchestratorResult<BuildPlan> {
    let framework = Framework::parse(&request.framework).ok_or_else(|| {
        OrchestratorError::validation(format!("unsupported framework '{}'", request.framework))
    })?;
    let descriptor = catalog.get(framework).cloned().ok_or_else(|| {
        OrchestratorError::validation(format!("framework '{}' is not available", framework))
    })?;

    let domain = request.domain.trim().to_ascii_lowercase();
    if !is_valid_domain(&domain) {
        return Err(OrchestratorError::validation(format!(
            "invalid domain '{}'",
            request.domain
        )));
    }
    let repo = request.repo.trim().to_string();
    if !is_valid_repo_url(&repo) {
        return Err(OrchestratorError::validation(format!(
            "invalid repository URL '{}'",
            request.repo
        )));
    }

    let provided = [
        (BuildParam::Branch, request.branch.is_some()),
        (BuildParam::PhpVersion, request.php_version.is_some()),
        (BuildParam::NodeVersion, request.node_version.is_some()),
        (BuildParam::DbName, request.db_name.is_some()),
        (BuildParam::DbUser, request.db_user.is_some()),
        (BuildParam::DbPass, request.db_pass.is_some()),
    ];
    for (param, present) in provided {
        if present && !descriptor.allows(param) {
            return Err(OrchestratorError::validation(format!(
                "parameter '{}' is not supported by framework '{}'",
                param.as_str(),
                framework
            )));
        }
        if !present && descriptor.required_params.contains(&param) {
            return Err(OrchestratorError::validation(format!(
                "framework '{}' requires parameter '{}'",
                framework,
                param.as_str()
            )));
        }
    }

    if let Some(branch) = &request.branch {
        if !is_valid_branch(branch) {
            return Err(OrchestratorError::validation(format!("invalid branch '{}'", branch)));
        }
    }
    if let Some(version) = &request.php_version {
        if catalog.php_runtime(version).is_none() {
            return Err(OrchestratorError::validation(format!(
                "unsupported php_version '{}', expected one of {}",
                version,
                catalog.php_versions().join(", ")
            )));
        }
    }
    if let Some(version) = &request.node_version {
        if !is_valid_runtime_version(version) {
            return Err(OrchestratorError::validation(format!(
                "invalid node_version '{}'",
                version
            )));
        }
    }
    if let Some(name) = &request.db_name {
        if !is_valid_identifier(name, DB_NAME_MAX) {
            return Err(OrchestratorError::validation(format!("invalid db_name '{}'", name)));
        }
    }
    if let Some(user) = &request.db_user {
        if !is_valid_identifier(user, DB_USER_MAX) {
            return Err(OrchestratorError::validation(format!("invalid db_user '{}'", user)));
        }
    }
    if let Some(pass) = &request.db_pass {
        if !is_valid_db_password(pass) {
            return Err(OrchestratorError::validation(
                "db_pass must be 8-128 printable characters without quotes or backslashes",
            ));
        }
    }

    Ok(BuildPlan {
        site: derive_site_name(&domain),
        domain,
        repo,
        framework,
        descriptor,
        params: SiteParams {
            branch: request.branch.clone(),
            php_version: request.php_version.clone(),
            node_version: request.node_version.clone(),
        },
        db_name: request.db_name.clone(),
        db_user: request.db_user.clone(),
        db_pass: request.db_pass.clone(),
    })
}

/// 受理构建请求：校验失败直接返回错误，不创建任务
pub async fn submit(state: &Arc<AppState>, request: BuildRequest) -> OrchestratorResult<SubmittedBuild> {
    let plan = validate(&state.catalog, &request)?;
    check_site_conflict(state, &plan).await?;

    if state.task_store.is_at_capacity().await {
        return Err(OrchestratorError::BuildBusy {
            site: plan.site.clone(),
            waited_secs: 0,
        });
    }

    let task_id = Uuid::new_v4().to_string();
    let mut task = BuildTask::new(
        task_id.clone(),
        plan.site.clone(),
        plan.domain.clone(),
        plan.framework.to_string(),
    );
    task.rebuild = state.registry.get(&plan.site).await.is_some();
    state.task_store.create(task.clone()).await;
    let log_tx = state.log_hub.create(&task_id).await;

    let cancel = get_shutdown_token().child_token();
    state
        .running_builds
        .register(&task_id, &plan.site, cancel.clone());

    info!(
        task_id = %task_id,
        site = %plan.site,
        domain = %plan.domain,
        framework = %plan.framework,
        rebuild = task.rebuild,
        "Build accepted"
    );

    let site = plan.site.clone();
    let ctx = BuildContext::new(state.clone(), task, log_tx, cancel.clone());
    let handle = tokio::spawn(run(ctx, plan));

    Ok(SubmittedBuild {
        task_id,
        site,
        cancel,
        handle,
    })
}

async fn run(mut ctx: BuildContext, plan: BuildPlan) -> BuildOutcome {
    let result = execute(&mut ctx, &plan).await;
    let task = ctx.finish(&result).await;
    BuildOutcome { task, result }
}

/// 站点名已被其他域名占用
async fn check_site_conflict(state: &AppState, plan: &BuildPlan) -> OrchestratorResult<()> {
    match state.registry.get(&plan.site).await {
        Some(existing) if !existing.domain.eq_ignore_ascii_case(&plan.domain) => {
            Err(OrchestratorError::validation(format!(
                "site name '{}' is already used by domain '{}'",
                plan.site, existing.domain
            )))
        }
        _ => Ok(()),
    }
}

/// 重建不能改动已分配的租户库
fn check_rebuild(plan: &BuildPlan, previous: &SiteDescriptor) -> OrchestratorResult<()> {
    if let Some(db) = &previous.database {
        if plan.db_name.as_ref().is_some_and(|n| *n != db.name) {
            return Err(OrchestratorError::validation(format!(
                "site '{}' already uses database '{}'",
                plan.site, db.name
            )));
        }
        if plan.db_user.as_ref().is_some_and(|u| *u != db.user) {
            return Err(OrchestratorError::validation(format!(
                "site '{}' already uses database user '{}'",
                plan.site, db.user
            )));
        }
    }
    if let (Some(requested), Some(stored)) = (&plan.db_pass, &previous.secrets.db_password) {
        if requested != stored {
            return Err(OrchestratorError::validation(
                "db_pass differs from the stored credentials; secrets are not rotated by rebuilds",
            ));
        }
    }
    Ok(())
}

/// 本次构建创建的、失败时需要清理的资源
struct Attempt {
    release_dir: PathBuf,
    /// 失败时删除的目录：首次构建为整个站点目录，重建为本次发布目录
    cleanup_dir: PathBuf,
    stack: Option<StackSpec>,
    /// 本次新建的租户库
    tenant: Option<String>,
}

async fn execute(ctx: &mut BuildContext, plan: &BuildPlan) -> OrchestratorResult<SiteDescriptor> {
    let state = ctx.state.clone();

    ctx.advance(BuildPhase::Validating).await?;
    check_site_conflict(&state, plan).await?;
    ctx.log(format!(
        "    {} -> {} ({})",
        plan.repo, plan.domain, plan.framework
    ));

    ctx.advance(BuildPhase::Locked).await?;
    let _guard = state
        .site_locks
        .acquire(&plan.site, state.config.build.lock_timeout, &ctx.cancel)
        .await?;
    // 等锁期间其他构建可能已经提交
    check_site_conflict(&state, plan).await?;
    let previous = state.registry.get(&plan.site).await;
    if let Some(prev) = &previous {
        check_rebuild(plan, prev)?;
    }

    let generation = previous.as_ref().map_or(1, |p| p.generation + 1);
    ctx.set_generation(generation, previous.is_some()).await;
    ctx.log(format!("    generation {}", generation));

    let site_dir = state.config.paths.site_dir(&plan.site);
    let release_dir = site_dir.join("releases").join(format!("g{}", generation));
    let mut attempt = Attempt {
        cleanup_dir: if previous.is_some() {
            release_dir.clone()
        } else {
            site_dir
        },
        release_dir,
        stack: None,
        tenant: None,
    };

    match build_release(ctx, plan, previous.as_ref(), generation, &mut attempt).await {
        Ok(site) => {
            if let Some(prev) = &previous {
                retire(ctx, prev).await;
            }
            Ok(site)
        }
        Err(e) => {
            rollback(ctx, &attempt).await;
            Err(e)
        }
    }
}

async fn build_release(
    ctx: &mut BuildContext,
    plan: &BuildPlan,
    previous: Option<&SiteDescriptor>,
    generation: u64,
    attempt: &mut Attempt,
) -> OrchestratorResult<SiteDescriptor> {
    let state = ctx.state.clone();

    ctx.advance(BuildPhase::Fetching).await?;
    remove_dir_if_exists(&attempt.release_dir).await?;
    fetch_source(ctx, plan, &attempt.release_dir.join(SOURCE_DIR)).await?;

    ctx.advance(BuildPhase::Rendering).await?;
    let secrets = site_secrets(plan, previous);
    let tenant = tenant_spec(plan, previous, &secrets);
    let project = format!("{}-g{}", plan.site, generation);
    let context = template_context(&state, plan, &project, generation, &secrets, tenant.as_ref())?;
    let files = state.templates.render(plan.framework, &context)?;
    write_files(&attempt.release_dir, &files).await?;
    ctx.log(format!(
        "    rendered {}",
        files.keys().cloned().collect::<Vec<_>>().join(", ")
    ));

    ctx.advance(BuildPhase::Provisioning).await?;
    state.base.ensure_running(&ctx.cancel).await?;
    let database = match &tenant {
        Some(spec) => Some(provision(ctx, spec, attempt).await?),
        None => {
            ctx.log("    no tenant resources required");
            // 换成不需要数据库的框架时，已分配的库仍归这个站点
            previous.and_then(|p| p.database.clone())
        }
    };

    ctx.advance(BuildPhase::Starting).await?;
    let stack = StackSpec::new(project, attempt.release_dir.clone());
    attempt.stack = Some(stack.clone());
    start_stack(ctx, &stack).await?;

    ctx.advance(BuildPhase::RoutingAttached).await?;
    state.base.require_running(&SharedService::ALL).await?;
    state
        .runtime
        .attach_network(&stack, state.base.network())
        .await?;

    ctx.advance(BuildPhase::HealthChecking).await?;
    wait_healthy(ctx, plan, &stack).await?;

    let now = Utc::now();
    let descriptor = SiteDescriptor {
        name: plan.site.clone(),
        domain: plan.domain.clone(),
        framework: plan.framework,
        repo: plan.repo.clone(),
        params: plan.params.clone(),
        state: SiteState::Active,
        created_at: previous.map_or(now, |p| p.created_at),
        last_build_at: now,
        updated_at: now,
        generation,
        stack,
        database,
        secrets,
    };
    state
        .registry
        .compare_and_swap(
            &plan.site,
            previous.map(|p| p.state),
            Some(descriptor.clone()),
        )
        .await?;
    Ok(descriptor)
}

async fn fetch_source(ctx: &BuildContext, plan: &BuildPlan, dest: &Path) -> OrchestratorResult<()> {
    let fetcher = &ctx.state.fetcher;
    let cancel = &ctx.cancel;
    let repo = plan.repo.as_str();
    let branch = plan.params.branch.as_deref();
    ctx.log(format!(
        "    fetching {}{}",
        repo,
        branch.map(|b| format!(" ({})", b)).unwrap_or_default()
    ));

    retry(
        &ctx.state.config.build.fetch_retry,
        "fetch source",
        cancel,
        |e: &FetchFailure| e.transient,
        move |attempt| {
            if attempt > 1 {
                ctx.log(format!("    retrying fetch (attempt {})", attempt));
            }
            fetcher.fetch(repo, branch, dest, cancel)
        },
    )
    .await
    .map_err(|failure| {
        if failure.cancelled || cancel.is_cancelled() {
            OrchestratorError::Cancelled("during source fetch".to_string())
        } else {
            OrchestratorError::Fetch {
                repo: plan.repo.clone(),
                attempts: failure.attempts,
                reason: failure.error.message,
            }
        }
    })
}

/// 重建沿用已有密钥，首次构建生成
fn site_secrets(plan: &BuildPlan, previous: Option<&SiteDescriptor>) -> SiteSecrets {
    let mut secrets = previous.map(|p| p.secrets.clone()).unwrap_or_else(|| SiteSecrets {
        app_key: generate_secret(APP_KEY_LENGTH),
        db_password: None,
    });
    if plan.descriptor.needs_database && secrets.db_password.is_none() {
        secrets.db_password = Some(
            plan.db_pass
                .clone()
                .unwrap_or_else(|| generate_secret(DB_PASSWORD_LENGTH)),
        );
    }
    secrets
}

/// 站点名派生的默认库名和用户名，截断到 MySQL 标识符上限（64 / 32）
fn default_db_identifiers(site: &str) -> (String, String) {
    let ident = site.replace('-', "_");
    (
        format!("{}_db", &ident[..ident.len().min(DB_NAME_MAX - 3)]),
        format!("{}_user", &ident[..ident.len().min(DB_USER_MAX - 5)]),
    )
}

fn tenant_spec(
    plan: &BuildPlan,
    previous: Option<&SiteDescriptor>,
    secrets: &SiteSecrets,
) -> Option<TenantResourceSpec> {
    if !plan.descriptor.needs_database {
        return None;
    }
    let existing = previous.and_then(|p| p.database.as_ref());
    let (default_name, default_user) = default_db_identifiers(&plan.site);

    let name = plan
        .db_name
        .clone()
        .or_else(|| existing.map(|h| h.name.clone()))
        .unwrap_or(default_name);
    let user = plan
        .db_user
        .clone()
        .or_else(|| existing.map(|h| h.user.clone()))
        .unwrap_or(default_user);

    Some(TenantResourceSpec {
        kind: TenantResourceKind::MysqlDatabase,
        name,
        user,
        password: secrets.db_password.clone().unwrap_or_default(),
        owner: plan.site.clone(),
    })
}

fn template_context(
    state: &AppState,
    plan: &BuildPlan,
    project: &str,
    generation: u64,
    secrets: &SiteSecrets,
    tenant: Option<&TenantResourceSpec>,
) -> OrchestratorResult<TemplateContext> {
    let descriptor = &plan.descriptor;
    let site = SiteContext {
        app_name: plan.site.clone(),
        project: project.to_string(),
        domain: plan.domain.clone(),
        network: state.base.network().to_string(),
        app_port: descriptor.app_port,
        memory_mb: descriptor.limits.memory_mb,
        cpus: descriptor.limits.cpus.to_string(),
        generation,
    };
    let node_version = plan
        .params
        .node_version
        .clone()
        .unwrap_or_else(|| DEFAULT_NODE_VERSION.to_string());

    Ok(match plan.framework.family() {
        TemplateFamily::Static => TemplateContext::Static(StaticContext { site }),
        TemplateFamily::Node => TemplateContext::Node(NodeContext { site, node_version }),
        TemplateFamily::Laravel => {
            let version = plan
                .params
                .php_version
                .as_deref()
                .unwrap_or(DEFAULT_PHP_VERSION);
            let php = state.catalog.php_runtime(version).ok_or_else(|| {
                OrchestratorError::validation(format!("unsupported php_version '{}'", version))
            })?;
            let tenant = tenant.ok_or_else(|| {
                OrchestratorError::validation(format!(
                    "framework '{}' requires a tenant database",
                    plan.framework
                ))
            })?;
            TemplateContext::Laravel(LaravelContext {
                site,
                php_version: php.version.clone(),
                php_image: php.image.clone(),
                php_extensions: php.extensions.clone(),
                node_version,
                app_key: secrets.app_key.clone(),
                db: DbContext {
                    host: state.config.base.mysql_container.clone(),
                    port: MYSQL_PORT,
                    name: tenant.name.clone(),
                    user: tenant.user.clone(),
                    password: tenant.password.clone(),
                },
                redis_host: state.config.base.redis_container.clone(),
            })
        }
    })
}

async fn provision(
    ctx: &BuildContext,
    spec: &TenantResourceSpec,
    attempt: &mut Attempt,
) -> OrchestratorResult<TenantHandle> {
    let (handle, created) = ctx.state.base.provision_tenant_resource(spec).await?;
    if created {
        attempt.tenant = Some(spec.name.clone());
        ctx.log(format!("    created database {} for {}", handle.name, handle.user));
    } else {
        ctx.log(format!("    reusing database {}", handle.name));
    }
    Ok(handle)
}

async fn start_stack(ctx: &BuildContext, stack: &StackSpec) -> OrchestratorResult<()> {
    let runtime = &ctx.state.runtime;
    let cancel = &ctx.cancel;
    ctx.log(format!("    starting stack {}", stack.project));

    retry(
        &ctx.state.config.build.runtime_retry,
        "compose up",
        cancel,
        RuntimeError::is_transient,
        move |attempt| {
            if attempt > 1 {
                ctx.log(format!("    retrying stack start (attempt {})", attempt));
            }
            runtime.up(stack, cancel)
        },
    )
    .await
    .map_err(|failure| {
        if failure.cancelled || matches!(failure.error, RuntimeError::Cancelled) {
            OrchestratorError::Cancelled("during stack start".to_string())
        } else {
            OrchestratorError::Runtime(failure.error)
        }
    })
}

/// 轮询容器健康和 HTTP 探测，直到都就绪或超时
async fn wait_healthy(ctx: &BuildContext, plan: &BuildPlan, stack: &StackSpec) -> OrchestratorResult<()> {
    let build = &ctx.state.config.build;
    let deadline = tokio::time::Instant::now() + build.health_timeout;
    let mut last_signal = String::from("no health signal yet");

    loop {
        match ctx.state.runtime.stack_health(stack).await {
            Ok(health) => match health.verdict() {
                StackVerdict::Healthy => match ctx.state.probe.probe(&plan.domain).await {
                    ProbeOutcome::Ready => {
                        ctx.log(format!("    {} is healthy", stack.project));
                        return Ok(());
                    }
                    ProbeOutcome::NotReady(reason) => last_signal = reason,
                },
                StackVerdict::Failed(reason) => {
                    return Err(OrchestratorError::Runtime(RuntimeError::CommandFailed {
                        operation: "health check",
                        target: stack.project.clone(),
                        message: reason,
                        transient: false,
                    }));
                }
                StackVerdict::Pending => last_signal = "containers are still starting".to_string(),
                StackVerdict::Missing => last_signal = "no containers found".to_string(),
            },
            Err(e) => last_signal = e.to_string(),
        }

        if tokio::time::Instant::now() >= deadline {
            ctx.log_error(format!("    last health signal: {}", last_signal));
            return Err(OrchestratorError::HealthTimeout {
                site: plan.site.clone(),
                timeout_secs: build.health_timeout.as_secs(),
            });
        }

        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                return Err(OrchestratorError::Cancelled("during health check".to_string()));
            }
            _ = tokio::time::sleep(build.health_interval) => {}
        }
    }
}

/// 新栈提交后下线旧栈（失败只记录）
async fn retire(ctx: &BuildContext, previous: &SiteDescriptor) {
    ctx.log(format!("    retiring {}", previous.stack.project));
    if let Err(e) = ctx.state.runtime.down(&previous.stack, true).await {
        warn!(site = %previous.name, stack = %previous.stack.project, error = %e, "Failed to stop previous stack");
        ctx.log_error(format!("    failed to stop {}: {}", previous.stack.project, e));
    }
    if let Err(e) = remove_dir_if_exists(&previous.stack.dir).await {
        warn!(site = %previous.name, dir = %previous.stack.dir.display(), error = %e, "Failed to remove previous release");
    }
}

/// 回滚本次构建创建的资源；清理失败只记录，不覆盖原始错误
async fn rollback(ctx: &BuildContext, attempt: &Attempt) {
    ctx.log_error("Rolling back");
    let site = ctx.site().to_string();

    if let Some(stack) = &attempt.stack {
        if let Err(e) = ctx.state.runtime.down(stack, true).await {
            warn!(site = %site, stack = %stack.project, error = %e, "Rollback: failed to remove stack");
            ctx.log_error(format!("    failed to remove {}: {}", stack.project, e));
        }
    }
    if let Some(name) = &attempt.tenant {
        if let Err(e) = ctx.state.base.release_tenant_resource(name).await {
            warn!(site = %site, database = %name, error = %e, "Rollback: failed to release database");
            ctx.log_error(format!("    failed to release database {}: {}", name, e));
        }
    }
    if let Err(e) = remove_dir_if_exists(&attempt.cleanup_dir).await {
        warn!(site = %site, dir = %attempt.cleanup_dir.display(), error = %e, "Rollback: failed to remove directory");
    }
    info!(task_id = %ctx.task_id(), site = %site, "Rollback finished");
}

pub(crate) async fn remove_dir_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BuildStatus, StageStatus};
    use crate::state::app_state::test_support::{harness, harness_with, TestHarness};
    use std::time::Duration;

    fn request(domain: &str, framework: &str) -> BuildRequest {
        BuildRequest {
            repo: "https://example.com/app.git".to_string(),
            domain: domain.to_string(),
            framework: framework.to_string(),
            ..BuildRequest::default()
        }
    }

    async fn build(h: &TestHarness, req: BuildRequest) -> BuildOutcome {
        submit(&h.state, req).await.unwrap().handle.await.unwrap()
    }

    #[test]
    fn test_validate_rejects_bad_requests() {
        let catalog = FrameworkCatalog::builtin();
        let kind = |req: BuildRequest| validate(&catalog, &req).unwrap_err().kind();

        assert_eq!(kind(request("not a domain", "static")), "validation_error");
        assert_eq!(kind(request("demo.example.com", "rails")), "validation_error");

        let mut req = request("demo.example.com", "static");
        req.php_version = Some("8.3".into());
        let err = validate(&catalog, &req).unwrap_err();
        assert!(err.to_string().contains("php_version"));

        let mut req = request("shop.example.com", "laravel");
        req.php_version = Some("5.6".into());
        assert_eq!(kind(req), "validation_error");

        let mut req = request("shop.example.com", "laravel");
        req.db_name = Some("shop-db".into());
        assert_eq!(kind(req), "validation_error");

        let mut req = request("demo.example.com", "static");
        req.repo = "file:///etc".into();
        assert_eq!(kind(req), "validation_error");
    }

    #[test]
    fn test_validate_normalizes() {
        let catalog = FrameworkCatalog::builtin();
        let mut req = request(" Demo.Example.com ", "nextjs");
        req.node_version = Some("22".into());
        let plan = validate(&catalog, &req).unwrap();
        assert_eq!(plan.site, "demo");
        assert_eq!(plan.domain, "demo.example.com");
        assert_eq!(plan.params.node_version.as_deref(), Some("22"));
    }

    #[tokio::test]
    async fn test_first_build_becomes_active() {
        let h = harness().await;
        let outcome = build(&h, request("demo.example.com", "static")).await;

        let site = outcome.result.unwrap();
        assert_eq!(site.state, SiteState::Active);
        assert_eq!(site.generation, 1);
        assert_eq!(site.stack.project, "demo-g1");
        assert!(site.database.is_none());

        assert_eq!(outcome.task.status, BuildStatus::Success);
        assert_eq!(outcome.task.phase, BuildPhase::Active);
        assert!(outcome
            .task
            .stages
            .iter()
            .all(|s| s.status == StageStatus::Success));

        assert_eq!(h.state.registry.get("demo").await, Some(site));
        assert!(h.runtime.running_stacks().contains(&"demo-g1".to_string()));
        assert_eq!(h.runtime.count("attach demo-g1 shared_net"), 1);

        let release = h.site_dir("demo").join("releases/g1");
        assert!(release.join("docker-compose.yml").exists());
        assert!(release.join("app/index.html").exists());

        // 任务进入历史，日志通道关闭
        assert_eq!(h.state.task_store.active_count().await, 0);
        assert!(h.state.log_hub.is_finished(&outcome.task.id).await);
        assert_eq!(h.state.running_builds.count(), 0);
    }

    #[tokio::test]
    async fn test_rebuild_keeps_secrets_and_database() {
        let h = harness().await;
        let first = build(&h, request("shop.example.com", "laravel"))
            .await
            .result
            .unwrap();
        let db = first.database.clone().unwrap();
        assert_eq!(db.name, "shop_db");
        assert_eq!(db.user, "shop_user");

        let second = build(&h, request("shop.example.com", "laravel"))
            .await
            .result
            .unwrap();
        assert_eq!(second.generation, 2);
        assert_eq!(second.stack.project, "shop-g2");
        assert_eq!(second.secrets, first.secrets);
        assert_eq!(second.database, first.database);
        assert_eq!(second.created_at, first.created_at);

        // 只建过一次库；旧栈在新栈健康后才被移除
        assert_eq!(h.runtime.exec_inputs().len(), 1);
        let calls = h.runtime.calls();
        let attach_new = calls.iter().position(|c| c == "attach shop-g2 shared_net").unwrap();
        let down_old = calls.iter().position(|c| c == "down shop-g1 volumes=true").unwrap();
        assert!(attach_new < down_old);
        assert!(!h.runtime.running_stacks().contains(&"shop-g1".to_string()));
        assert!(!h.site_dir("shop").join("releases/g1").exists());

        let env = std::fs::read_to_string(h.site_dir("shop").join("releases/g2/.env")).unwrap();
        assert!(env.contains(first.secrets.db_password.as_deref().unwrap()));
    }

    #[tokio::test]
    async fn test_rebuild_health_timeout_keeps_previous_stack() {
        let h = harness().await;
        let first = build(&h, request("demo.example.com", "static"))
            .await
            .result
            .unwrap();

        h.runtime.set_unhealthy("demo-g2");
        let outcome = build(&h, request("demo.example.com", "static")).await;
        assert!(matches!(
            outcome.result,
            Err(OrchestratorError::HealthTimeout { .. })
        ));
        assert_eq!(outcome.task.status, BuildStatus::Failed);
        assert_eq!(outcome.task.error.unwrap().kind, "health_timeout");

        assert_eq!(h.state.registry.get("demo").await, Some(first));
        assert_eq!(h.runtime.existing_stacks().iter().filter(|s| s.starts_with("demo")).count(), 1);
        assert!(h.runtime.running_stacks().contains(&"demo-g1".to_string()));
        assert_eq!(h.runtime.count("down demo-g2 volumes=true"), 1);
        assert!(h.site_dir("demo").join("releases/g1").exists());
        assert!(!h.site_dir("demo").join("releases/g2").exists());
    }

    #[tokio::test]
    async fn test_probe_must_pass_before_active() {
        let h = harness().await;
        h.probe.set_ready(false);
        let outcome = build(&h, request("demo.example.com", "static")).await;
        assert_eq!(outcome.result.unwrap_err().kind(), "health_timeout");
        assert!(h.probe.probe_count() > 0);
        assert!(h.state.registry.get("demo").await.is_none());
        assert!(!h.site_dir("demo").exists());
    }

    #[tokio::test]
    async fn test_concurrent_builds_are_serialized() {
        let h = harness().await;
        h.fetcher.set_delay(Duration::from_millis(50));

        let first = submit(&h.state, request("demo.example.com", "static")).await.unwrap();
        let second = submit(&h.state, request("demo.example.com", "static")).await.unwrap();

        let a = first.handle.await.unwrap().result.unwrap();
        let b = second.handle.await.unwrap().result.unwrap();
        let mut generations = vec![a.generation, b.generation];
        generations.sort();
        assert_eq!(generations, vec![1, 2]);

        let current = h.state.registry.get("demo").await.unwrap();
        assert_eq!(current.generation, 2);
        assert_eq!(current.secrets, a.secrets);
        assert_eq!(
            h.runtime
                .running_stacks()
                .into_iter()
                .filter(|s| s.starts_with("demo"))
                .collect::<Vec<_>>(),
            vec!["demo-g2".to_string()]
        );
    }

    #[tokio::test]
    async fn test_lock_timeout_is_build_busy() {
        let h = harness_with(|c| c.build.lock_timeout = Duration::from_millis(30)).await;
        h.fetcher.set_delay(Duration::from_millis(300));

        let first = submit(&h.state, request("demo.example.com", "static")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = submit(&h.state, request("demo.example.com", "static")).await.unwrap();

        let busy = second.handle.await.unwrap();
        assert_eq!(busy.result.unwrap_err().kind(), "build_busy");
        // 等锁失败不做任何清理，第一个构建不受影响
        let done = first.handle.await.unwrap().result.unwrap();
        assert_eq!(done.generation, 1);
        assert_eq!(h.state.registry.get("demo").await, Some(done));
    }

    #[tokio::test]
    async fn test_validation_has_no_side_effects() {
        let h = harness().await;
        let err = submit(&h.state, request("bad_domain", "static")).await.err().unwrap();
        assert_eq!(err.kind(), "validation_error");

        assert_eq!(h.fetcher.fetch_count(), 0);
        assert!(h.runtime.calls().is_empty());
        assert_eq!(h.state.task_store.active_count().await, 0);
        assert_eq!(h.state.task_store.history_count().await, 0);
    }

    #[tokio::test]
    async fn test_domain_conflict_on_same_site_name() {
        let h = harness().await;
        build(&h, request("demo.example.com", "static")).await.result.unwrap();

        let err = submit(&h.state, request("demo.other.org", "static")).await.err().unwrap();
        assert_eq!(err.kind(), "validation_error");
        assert!(err.to_string().contains("demo.example.com"));
    }

    #[tokio::test]
    async fn test_fetch_retries_transient_failures() {
        let h = harness().await;
        h.fetcher.fail_transient(2);
        build(&h, request("demo.example.com", "static")).await.result.unwrap();
        assert_eq!(h.fetcher.fetch_count(), 3);
    }

    #[tokio::test]
    async fn test_permanent_fetch_failure_leaves_site_absent() {
        let h = harness().await;
        h.fetcher.fail_permanently();
        let outcome = build(&h, request("demo.example.com", "static")).await;

        match outcome.result {
            Err(OrchestratorError::Fetch { attempts, .. }) => assert_eq!(attempts, 1),
            other => panic!("unexpected result: {:?}", other.map(|s| s.name)),
        }
        let fetching = outcome
            .task
            .stages
            .iter()
            .find(|s| s.phase == BuildPhase::Fetching)
            .unwrap();
        assert_eq!(fetching.status, StageStatus::Failed);
        assert!(h.state.registry.get("demo").await.is_none());
        assert!(!h.site_dir("demo").exists());
        assert_eq!(h.runtime.count("up demo"), 0);
    }

    #[tokio::test]
    async fn test_start_failure_rolls_back_tenant_database() {
        let h = harness().await;
        h.runtime.fail_up_for(
            "shop-g1",
            RuntimeError::CommandFailed {
                operation: "compose up",
                target: "shop-g1".into(),
                message: "build failed".into(),
                transient: false,
            },
        );

        let outcome = build(&h, request("shop.example.com", "laravel")).await;
        assert_eq!(outcome.result.unwrap_err().kind(), "runtime_error");

        assert!(h.state.base.tenants().await.is_empty());
        assert!(h
            .runtime
            .exec_inputs()
            .last()
            .unwrap()
            .1
            .contains("DROP DATABASE IF EXISTS `shop_db`"));
        assert_eq!(h.runtime.count("down shop-g1 volumes=true"), 1);
        assert!(!h.runtime.existing_stacks().contains(&"shop-g1".to_string()));
        assert!(h.state.registry.get("shop").await.is_none());
    }

    #[tokio::test]
    async fn test_transient_runtime_errors_are_retried() {
        let h = harness().await;
        h.runtime.fail_up_transient(1);
        build(&h, request("demo.example.com", "static")).await.result.unwrap();
        // 第一次 up 拉起基础系统时失败并重试，随后站点栈一次成功
        assert_eq!(h.runtime.count("up shared-services"), 2);
        assert_eq!(h.runtime.count("up demo-g1"), 1);
    }

    #[tokio::test]
    async fn test_cancel_runs_rollback() {
        let h = harness().await;
        h.state.base.ensure_running(&CancellationToken::new()).await.unwrap();
        h.runtime.set_up_delay(Duration::from_secs(10));

        let submitted = submit(&h.state, request("demo.example.com", "static")).await.unwrap();
        // 等到进入 Starting 阶段
        for _ in 0..200 {
            let task = h.state.task_store.get(&submitted.task_id).await;
            if task.map_or(false, |t| t.phase == BuildPhase::Starting) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(h.state.running_builds.cancel_site("demo"), vec![submitted.task_id.clone()]);

        let outcome = submitted.handle.await.unwrap();
        assert_eq!(outcome.task.status, BuildStatus::Cancelled);
        assert_eq!(outcome.result.unwrap_err().kind(), "cancelled");
        assert_eq!(h.runtime.count("down demo-g1 volumes=true"), 1);
        assert!(h.state.registry.get("demo").await.is_none());
        assert!(!h.site_dir("demo").exists());
    }

    #[tokio::test]
    async fn test_routing_requires_whole_base_system() {
        let h = harness().await;
        h.state.base.ensure_running(&CancellationToken::new()).await.unwrap();
        h.runtime.set_up_delay(Duration::from_millis(200));

        let submitted = submit(&h.state, request("demo.example.com", "static")).await.unwrap();
        for _ in 0..200 {
            let task = h.state.task_store.get(&submitted.task_id).await;
            if task.map_or(false, |t| t.phase == BuildPhase::Starting) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // 站点栈启动期间 redis 退出
        h.runtime.crash_container(&h.state.config.base.redis_container);

        let outcome = submitted.handle.await.unwrap();
        let err = outcome.result.unwrap_err();
        assert_eq!(err.kind(), "base_system_unavailable");
        assert!(err.to_string().contains("cache"));
        assert_eq!(h.runtime.count("attach demo-g1"), 0);
        assert_eq!(h.runtime.count("down demo-g1 volumes=true"), 1);
        assert!(h.state.registry.get("demo").await.is_none());
    }

    #[tokio::test]
    async fn test_base_system_failure_is_distinct() {
        let h = harness().await;
        h.runtime.fail_up_for(
            "shared-services",
            RuntimeError::CommandFailed {
                operation: "compose up",
                target: "shared-services".into(),
                message: "port 80 already allocated".into(),
                transient: false,
            },
        );
        let outcome = build(&h, request("demo.example.com", "static")).await;
        let err = outcome.result.unwrap_err();
        assert_eq!(err.kind(), "base_system_unavailable");
        assert!(err.is_retryable());
        assert_eq!(h.runtime.count("up demo"), 0);
    }

    #[tokio::test]
    async fn test_longest_label_gets_bounded_database_identifiers() {
        let h = harness().await;
        let label = "a".repeat(63);
        let req = request(&format!("{}.example.com", label), "laravel");
        let plan = validate(&h.state.catalog, &req).unwrap();
        assert_eq!(plan.site, label);

        let site = build(&h, req).await.result.unwrap();
        let db = site.database.unwrap();
        assert_eq!(db.name, format!("{}_db", "a".repeat(61)));
        assert_eq!(db.name.len(), 64);
        assert_eq!(db.user, format!("{}_user", "a".repeat(27)));
        assert_eq!(h.fetcher.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_framework_switch_keeps_tenant_database() {
        let h = harness().await;
        let first = build(&h, request("shop.example.com", "laravel"))
            .await
            .result
            .unwrap();

        let second = build(&h, request("shop.example.com", "static"))
            .await
            .result
            .unwrap();
        assert_eq!(second.framework, Framework::Static);
        assert_eq!(second.database, first.database);
        assert_eq!(second.secrets, first.secrets);

        // 切回需要数据库的框架时复用同一个库
        let third = build(&h, request("shop.example.com", "laravel"))
            .await
            .result
            .unwrap();
        assert_eq!(third.database, first.database);
        assert_eq!(h.state.base.tenants().await.len(), 1);
    }

    #[tokio::test]
    async fn test_rebuild_cannot_change_database_password() {
        let h = harness().await;
        let mut req = request("shop.example.com", "laravel");
        req.db_pass = Some("FirstPassw0rd".into());
        build(&h, req.clone()).await.result.unwrap();

        req.db_pass = Some("OtherPassw0rd".into());
        let outcome = build(&h, req).await;
        assert_eq!(outcome.result.unwrap_err().kind(), "validation_error");
        assert_eq!(h.state.registry.get("shop").await.unwrap().generation, 1);
        assert_eq!(h.fetcher.fetch_count(), 1);
    }
}
