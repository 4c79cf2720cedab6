//! 模板引擎
//!
//! `render(framework, context)` 是纯函数：同样的框架和上下文总是得到逐字节相同的输出，
//! 重建的幂等性依赖这一点。上下文按框架分族强类型化，缺字段在渲染前就报错。

use askama::Template;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::config::frameworks::TemplateFamily;
use crate::config::{Framework, FrameworkCatalog};

/// 渲染结果：输出文件名 -> 内容
pub type RenderedFiles = BTreeMap<String, String>;

/// 模板错误
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("missing required context field '{field}' for {framework}")]
    MissingField { framework: String, field: &'static str },

    #[error("template '{file}' does not exist for {framework}")]
    MissingTemplate { framework: String, file: String },

    #[error("{framework} expects a {expected:?} context")]
    ContextMismatch {
        framework: Framework,
        expected: TemplateFamily,
    },

    #[error("failed to render '{file}': {source}")]
    Render {
        file: String,
        #[source]
        source: askama::Error,
    },
}

/// 所有站点模板共用的字段
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SiteContext {
    /// 站点名
    pub app_name: String,
    /// compose 项目名（带代号）
    pub project: String,
    pub domain: String,
    /// 共享网络
    pub network: String,
    pub app_port: u16,
    pub memory_mb: u32,
    /// compose 的 cpus 限制，保持字符串以免浮点格式差异
    pub cpus: String,
    pub generation: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StaticContext {
    pub site: SiteContext,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct NodeContext {
    pub site: SiteContext,
    pub node_version: String,
}

/// 租户数据库连接参数
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DbContext {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LaravelContext {
    pub site: SiteContext,
    pub php_version: String,
    pub php_image: String,
    pub php_extensions: Vec<String>,
    /// 前端资源构建用的 node 版本（仅 inertia）
    pub node_version: String,
    pub app_key: String,
    pub db: DbContext,
    pub redis_host: String,
}

/// 站点模板上下文
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "family", content = "context", rename_all = "snake_case")]
pub enum TemplateContext {
    Static(StaticContext),
    Node(NodeContext),
    Laravel(LaravelContext),
}

impl TemplateContext {
    pub fn family(&self) -> TemplateFamily {
        match self {
            TemplateContext::Static(_) => TemplateFamily::Static,
            TemplateContext::Node(_) => TemplateFamily::Node,
            TemplateContext::Laravel(_) => TemplateFamily::Laravel,
        }
    }

    pub fn site(&self) -> &SiteContext {
        match self {
            TemplateContext::Static(c) => &c.site,
            TemplateContext::Node(c) => &c.site,
            TemplateContext::Laravel(c) => &c.site,
        }
    }

    /// 渲染前检查必填字段
    fn validate(&self, framework: Framework) -> Result<(), TemplateError> {
        let missing = |field: &'static str| TemplateError::MissingField {
            framework: framework.to_string(),
            field,
        };

        let site = self.site();
        let required = [
            ("app_name", &site.app_name),
            ("project", &site.project),
            ("domain", &site.domain),
            ("network", &site.network),
            ("cpus", &site.cpus),
        ];
        if let Some((field, _)) = required.iter().find(|(_, v)| v.trim().is_empty()) {
            return Err(missing(*field));
        }
        if site.app_port == 0 {
            return Err(missing("app_port"));
        }

        match self {
            TemplateContext::Static(_) => Ok(()),
            TemplateContext::Node(c) => {
                if c.node_version.is_empty() {
                    return Err(missing("node_version"));
                }
                Ok(())
            }
            TemplateContext::Laravel(c) => {
                let required = [
                    ("php_version", &c.php_version),
                    ("php_image", &c.php_image),
                    ("node_version", &c.node_version),
                    ("app_key", &c.app_key),
                    ("db.host", &c.db.host),
                    ("db.name", &c.db.name),
                    ("db.user", &c.db.user),
                    ("db.password", &c.db.password),
                    ("redis_host", &c.redis_host),
                ];
                match required.iter().find(|(_, v)| v.is_empty()) {
                    Some((field, _)) => Err(missing(*field)),
                    None => Ok(()),
                }
            }
        }
    }
}

/// 共享基础设施 compose 上下文
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BaseContext {
    pub project: String,
    pub network: String,
    pub proxy_container: String,
    pub mysql_container: String,
    pub redis_container: String,
    pub traefik_email: String,
    pub mysql_root_password: String,
    pub mysql_charset: String,
    pub mysql_collation: String,
}

// ---- askama 模板 ----

#[derive(Template)]
#[template(path = "static/docker-compose.yml", escape = "none")]
struct StaticCompose<'a> {
    site: &'a SiteContext,
}

#[derive(Template)]
#[template(path = "static/nginx.conf", escape = "none")]
struct StaticNginx<'a> {
    site: &'a SiteContext,
}

#[derive(Template)]
#[template(path = "node/docker-compose.yml", escape = "none")]
struct NodeCompose<'a> {
    site: &'a SiteContext,
}

#[derive(Template)]
#[template(path = "node/Dockerfile", escape = "none")]
struct NodeDockerfile<'a> {
    site: &'a SiteContext,
    node_version: &'a str,
    build_command: &'a str,
    start_command: &'a str,
}

#[derive(Template)]
#[template(path = "node/env", escape = "none")]
struct NodeEnv<'a> {
    site: &'a SiteContext,
}

#[derive(Template)]
#[template(path = "laravel/docker-compose.yml", escape = "none")]
struct LaravelCompose<'a> {
    site: &'a SiteContext,
}

#[derive(Template)]
#[template(path = "laravel/Dockerfile", escape = "none")]
struct LaravelDockerfile<'a> {
    inertia: bool,
    node_version: &'a str,
    php_image: &'a str,
    php_extensions: &'a [String],
    source_stage: &'a str,
}

#[derive(Template)]
#[template(path = "laravel/nginx.conf", escape = "none")]
struct LaravelNginx<'a> {
    site: &'a SiteContext,
}

#[derive(Template)]
#[template(path = "laravel/supervisord.conf", escape = "none")]
struct LaravelSupervisord<'a> {
    site: &'a SiteContext,
}

#[derive(Template)]
#[template(path = "laravel/env", escape = "none")]
struct LaravelEnv<'a> {
    site: &'a SiteContext,
    app_key: &'a str,
    db: &'a DbContext,
    redis_host: &'a str,
}

#[derive(Template)]
#[template(path = "base/docker-compose.yml", escape = "none")]
struct BaseCompose<'a> {
    project: &'a str,
    network: &'a str,
    proxy_container: &'a str,
    mysql_container: &'a str,
    redis_container: &'a str,
    traefik_email: &'a str,
    mysql_charset: &'a str,
    mysql_collation: &'a str,
}

#[derive(Template)]
#[template(path = "base/env", escape = "none")]
struct BaseEnv<'a> {
    mysql_root_password: &'a str,
}

/// node 系框架的构建 / 启动命令
fn node_commands(framework: Framework) -> (&'static str, &'static str) {
    match framework {
        Framework::Nuxt => ("npm run build", r#"["node", ".output/server/index.mjs"]"#),
        Framework::Nextjs => ("npm run build", r#"["npm", "run", "start"]"#),
        _ => ("npm run build --if-present", r#"["npm", "start"]"#),
    }
}

fn finish(file: &str, rendered: askama::Result<String>) -> Result<String, TemplateError> {
    let mut out = rendered.map_err(|source| TemplateError::Render {
        file: file.to_string(),
        source,
    })?;
    if !out.ends_with('\n') {
        out.push('\n');
    }
    Ok(out)
}

/// 模板引擎
#[derive(Clone)]
pub struct TemplateEngine {
    catalog: Arc<FrameworkCatalog>,
}

impl TemplateEngine {
    pub fn new(catalog: Arc<FrameworkCatalog>) -> Self {
        Self { catalog }
    }

    /// 渲染框架需要的全部文件
    pub fn render(
        &self,
        framework: Framework,
        ctx: &TemplateContext,
    ) -> Result<RenderedFiles, TemplateError> {
        let descriptor = self
            .catalog
            .get(framework)
            .ok_or_else(|| TemplateError::MissingTemplate {
                framework: framework.to_string(),
                file: "*".to_string(),
            })?;

        let expected = framework.family();
        if ctx.family() != expected {
            return Err(TemplateError::ContextMismatch {
                framework,
                expected,
            });
        }
        ctx.validate(framework)?;

        descriptor
            .template_files
            .iter()
            .map(|file| {
                let content = Self::render_file(framework, file, ctx).ok_or_else(|| {
                    TemplateError::MissingTemplate {
                        framework: framework.to_string(),
                        file: file.to_string(),
                    }
                })??;
                Ok::<_, TemplateError>((file.to_string(), content))
            })
            .collect()
    }

    fn render_file(
        framework: Framework,
        file: &str,
        ctx: &TemplateContext,
    ) -> Option<Result<String, TemplateError>> {
        let rendered = match (ctx, file) {
            (TemplateContext::Static(c), "docker-compose.yml") => {
                StaticCompose { site: &c.site }.render()
            }
            (TemplateContext::Static(c), "nginx.conf") => StaticNginx { site: &c.site }.render(),

            (TemplateContext::Node(c), "docker-compose.yml") => {
                NodeCompose { site: &c.site }.render()
            }
            (TemplateContext::Node(c), "Dockerfile") => {
                let (build_command, start_command) = node_commands(framework);
                NodeDockerfile {
                    site: &c.site,
                    node_version: &c.node_version,
                    build_command,
                    start_command,
                }
                .render()
            }
            (TemplateContext::Node(c), ".env") => NodeEnv { site: &c.site }.render(),

            (TemplateContext::Laravel(c), "docker-compose.yml") => {
                LaravelCompose { site: &c.site }.render()
            }
            (TemplateContext::Laravel(c), "Dockerfile") => {
                let inertia = framework == Framework::LaravelInertia;
                LaravelDockerfile {
                    inertia,
                    node_version: &c.node_version,
                    php_image: &c.php_image,
                    php_extensions: &c.php_extensions,
                    source_stage: if inertia { "assets" } else { "vendor" },
                }
                .render()
            }
            (TemplateContext::Laravel(c), "nginx.conf") => LaravelNginx { site: &c.site }.render(),
            (TemplateContext::Laravel(c), "supervisord.conf") => {
                LaravelSupervisord { site: &c.site }.render()
            }
            (TemplateContext::Laravel(c), ".env") => LaravelEnv {
                site: &c.site,
                app_key: &c.app_key,
                db: &c.db,
                redis_host: &c.redis_host,
            }
            .render(),

            _ => return None,
        };
        Some(finish(file, rendered))
    }

    /// 渲染共享基础设施的 compose 文件和 .env
    pub fn render_base(&self, ctx: &BaseContext) -> Result<RenderedFiles, TemplateError> {
        if ctx.mysql_root_password.is_empty() {
            return Err(TemplateError::MissingField {
                framework: "base-system".to_string(),
                field: "mysql_root_password",
            });
        }

        let compose = BaseCompose {
            project: &ctx.project,
            network: &ctx.network,
            proxy_container: &ctx.proxy_container,
            mysql_container: &ctx.mysql_container,
            redis_container: &ctx.redis_container,
            traefik_email: &ctx.traefik_email,
            mysql_charset: &ctx.mysql_charset,
            mysql_collation: &ctx.mysql_collation,
        }
        .render();
        let env = BaseEnv {
            mysql_root_password: &ctx.mysql_root_password,
        }
        .render();

        let mut files = RenderedFiles::new();
        files.insert("docker-compose.yml".to_string(), finish("docker-compose.yml", compose)?);
        files.insert(".env".to_string(), finish(".env", env)?);
        Ok(files)
    }
}

/// 把渲染结果写入目录；`.env` 之类含密钥的文件只对属主可读
pub async fn write_files(dir: &Path, files: &RenderedFiles) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    for (name, content) in files {
        let path = dir.join(name);
        tokio::fs::write(&path, content).await?;
        #[cfg(unix)]
        {
            if name.starts_with(".env") {
                use std::os::unix::fs::PermissionsExt;
                tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await?;
            }
        }
    }
    Ok(())
}
