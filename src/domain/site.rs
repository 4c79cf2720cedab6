//! 站点相关领域模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::base_system::TenantHandle;
use super::build::BuildPhase;
use crate::config::Framework;
use crate::infra::runtime::StackSpec;

/// 构建请求
///
/// 未知字段直接拒绝，防止请求之间的配置漂移
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BuildRequest {
    pub repo: String,
    pub domain: String,
    pub framework: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub php_version: Option<String>,
    #[serde(default)]
    pub node_version: Option<String>,
    #[serde(default)]
    pub db_name: Option<String>,
    #[serde(default)]
    pub db_user: Option<String>,
    #[serde(default)]
    pub db_pass: Option<String>,
}

/// 站点生命周期状态（注册表中只保存已提交的状态）
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SiteState {
    Active,
    Stopped,
}

impl SiteState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SiteState::Active => "active",
            SiteState::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for SiteState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 站点级密钥，首次构建时生成，此后每次重建原样复用
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SiteSecrets {
    pub app_key: String,
    #[serde(default)]
    pub db_password: Option<String>,
}

/// 框架相关的运行时参数
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SiteParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub php_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_version: Option<String>,
}

/// 站点描述（注册表持久化实体）
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SiteDescriptor {
    pub name: String,
    pub domain: String,
    pub framework: Framework,
    pub repo: String,
    #[serde(default)]
    pub params: SiteParams,
    pub state: SiteState,
    pub created_at: DateTime<Utc>,
    pub last_build_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// 栈代号，每次成功构建递增
    pub generation: u64,
    /// 当前对外服务的栈
    pub stack: StackSpec,
    /// 分配的租户数据库
    #[serde(default)]
    pub database: Option<TenantHandle>,
    pub secrets: SiteSecrets,
}

impl SiteDescriptor {
    pub fn with_state(&self, state: SiteState) -> Self {
        let mut next = self.clone();
        next.state = state;
        next.updated_at = Utc::now();
        next
    }
}

/// 对外展示的站点信息（不含密钥）
#[derive(Clone, Debug, Serialize)]
pub struct SiteView {
    pub name: String,
    pub domain: String,
    pub framework: Framework,
    pub repo: String,
    pub params: SiteParams,
    pub state: SiteState,
    pub created_at: DateTime<Utc>,
    pub last_build_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub generation: u64,
    pub stack: String,
    pub database: Option<TenantHandle>,
    /// 正在进行的构建所处阶段
    #[serde(skip_serializing_if = "Option::is_none")]
    pub building: Option<BuildPhase>,
}

impl SiteView {
    pub fn new(site: &SiteDescriptor, building: Option<BuildPhase>) -> Self {
        Self {
            name: site.name.clone(),
            domain: site.domain.clone(),
            framework: site.framework,
            repo: site.repo.clone(),
            params: site.params.clone(),
            state: site.state,
            created_at: site.created_at,
            last_build_at: site.last_build_at,
            updated_at: site.updated_at,
            generation: site.generation,
            stack: site.stack.project.clone(),
            database: site.database.clone(),
            building,
        }
    }
}

/// 由域名推导站点名：第一个 DNS label，小写
pub fn derive_site_name(domain: &str) -> String {
    domain
        .split('.')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase()
}

/// 域名校验：总长 ≤ 253，每个 label 1-63 个字母数字或连字符，首尾不能是连字符
pub fn is_valid_domain(domain: &str) -> bool {
    if domain.is_empty() || domain.len() > 253 {
        return false;
    }
    domain.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            && !label.starts_with('-')
            && !label.ends_with('-')
    })
}

/// 仓库地址校验：http(s)/git/ssh URL 或 scp 风格的 `git@host:path`
pub fn is_valid_repo_url(repo: &str) -> bool {
    if repo.is_empty() || repo.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return false;
    }
    if let Some((scheme, rest)) = repo.split_once("://") {
        let host = rest.split(['/', ':']).next().unwrap_or_default();
        let host = host.rsplit('@').next().unwrap_or_default();
        return matches!(scheme, "http" | "https" | "git" | "ssh")
            && !host.is_empty()
            && rest.len() > host.len();
    }
    // scp-like: user@host:path
    let Some((user_host, path)) = repo.split_once(':') else {
        return false;
    };
    match user_host.split_once('@') {
        Some((user, host)) => {
            !user.is_empty() && !host.is_empty() && !host.contains('/') && !path.is_empty()
        }
        None => false,
    }
}

/// 数据库名 / 用户名：字母数字和下划线
pub fn is_valid_identifier(value: &str, max_len: usize) -> bool {
    !value.is_empty()
        && value.len() <= max_len
        && value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// 分支名：不能以 `-` 开头，不能含空白或 git 保留字符
pub fn is_valid_branch(branch: &str) -> bool {
    !branch.is_empty()
        && branch.len() <= 255
        && !branch.starts_with('-')
        && !branch.contains("..")
        && branch
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
}

/// 数据库密码：会进入 SQL 字符串，禁止引号、反斜杠和空白
pub fn is_valid_db_password(password: &str) -> bool {
    password.len() >= 8
        && password.len() <= 128
        && password
            .chars()
            .all(|c| c.is_ascii_graphic() && !matches!(c, '\'' | '"' | '\\' | '`'))
}
