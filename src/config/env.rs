//! 环境变量配置加载

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::infra::retry::RetryPolicy;

/// 环境配置
#[derive(Clone, Debug)]
pub struct EnvConfig {
    /// API bearer token（未设置时由 SecretStore 生成）
    pub agent_token: Option<String>,
    /// 服务监听端口
    pub port: u16,
    /// 路径配置
    pub paths: PathsConfig,
    /// 共享基础设施配置
    pub base: BaseSystemConfig,
    /// 构建流水线配置
    pub build: BuildConfig,
}

/// 路径配置
#[derive(Clone, Debug)]
pub struct PathsConfig {
    /// 站点根目录，每个站点一个子目录
    pub sites_dir: PathBuf,
    /// 注册表、密钥等持久化数据目录
    pub data_dir: PathBuf,
    /// 共享服务 compose 文件目录
    pub shared_dir: PathBuf,
}

impl PathsConfig {
    /// 以同一个根目录派生全部路径（测试和单机部署都用得到）
    pub fn under(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            sites_dir: root.join("sites"),
            data_dir: root.join("data"),
            shared_dir: root.join("shared"),
        }
    }

    pub fn registry_file(&self) -> PathBuf {
        self.data_dir.join("registry.json")
    }

    pub fn tenants_file(&self) -> PathBuf {
        self.data_dir.join("tenants.json")
    }

    pub fn secrets_dir(&self) -> PathBuf {
        self.data_dir.join("secrets")
    }

    pub fn site_dir(&self, site: &str) -> PathBuf {
        self.sites_dir.join(site)
    }
}

/// 基础系统（反向代理、共享数据库、共享缓存）配置
#[derive(Clone, Debug)]
pub struct BaseSystemConfig {
    /// compose 项目名
    pub project: String,
    /// 共享网络名
    pub network: String,
    pub proxy_container: String,
    pub mysql_container: String,
    pub redis_container: String,
    /// ACME 证书邮箱
    pub traefik_email: String,
    pub mysql_charset: String,
    pub mysql_collation: String,
    /// 后台健康刷新间隔
    pub refresh_interval: Duration,
    /// ensure_running 等待服务就绪的超时
    pub ready_timeout: Duration,
}

/// 构建流水线配置
#[derive(Clone, Debug)]
pub struct BuildConfig {
    /// 站点锁等待上限
    pub lock_timeout: Duration,
    /// 健康检查总超时
    pub health_timeout: Duration,
    /// 健康检查轮询间隔
    pub health_interval: Duration,
    /// 经由反向代理的 HTTP 探测地址（如 http://127.0.0.1），未设置则只看容器健康
    pub health_probe_url: Option<String>,
    /// 拉取源码的重试策略
    pub fetch_retry: RetryPolicy,
    /// 容器运行时瞬时错误的重试策略
    pub runtime_retry: RetryPolicy,
    /// 单次 compose 命令超时
    pub compose_timeout: Duration,
}

impl EnvConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Self {
        let agent_token = env::var("SB_AGENT_TOKEN").ok().filter(|s| !s.is_empty());
        let port = parse_env("SB_AGENT_PORT", 8000);

        let paths = PathsConfig {
            sites_dir: env_path("SB_BASE_DIR", "/opt/sites"),
            data_dir: env_path("SB_DATA_DIR", "/opt/serverbond-agent/data"),
            shared_dir: env_path("SB_SHARED_DIR", "/opt/shared-services"),
        };

        Self {
            agent_token,
            port,
            paths,
            base: BaseSystemConfig::from_env(),
            build: BuildConfig::from_env(),
        }
    }
}

impl BaseSystemConfig {
    pub fn from_env() -> Self {
        Self {
            project: env::var("SB_BASE_PROJECT").unwrap_or_else(|_| "shared-services".to_string()),
            network: env::var("SB_NETWORK").unwrap_or_else(|_| "shared_net".to_string()),
            proxy_container: env::var("SB_PROXY_CONTAINER").unwrap_or_else(|_| "traefik".to_string()),
            mysql_container: env::var("SB_MYSQL_CONTAINER")
                .unwrap_or_else(|_| "shared_mysql".to_string()),
            redis_container: env::var("SB_REDIS_CONTAINER")
                .unwrap_or_else(|_| "shared_redis".to_string()),
            traefik_email: env::var("SB_TRAEFIK_EMAIL")
                .unwrap_or_else(|_| "admin@example.com".to_string()),
            mysql_charset: "utf8mb4".to_string(),
            mysql_collation: "utf8mb4_unicode_ci".to_string(),
            refresh_interval: Duration::from_secs(parse_env("SB_BASE_REFRESH_SECS", 30)),
            ready_timeout: Duration::from_secs(parse_env("SB_BASE_READY_TIMEOUT_SECS", 90)),
        }
    }
}

impl Default for BaseSystemConfig {
    fn default() -> Self {
        Self {
            project: "shared-services".to_string(),
            network: "shared_net".to_string(),
            proxy_container: "traefik".to_string(),
            mysql_container: "shared_mysql".to_string(),
            redis_container: "shared_redis".to_string(),
            traefik_email: "admin@example.com".to_string(),
            mysql_charset: "utf8mb4".to_string(),
            mysql_collation: "utf8mb4_unicode_ci".to_string(),
            refresh_interval: Duration::from_secs(30),
            ready_timeout: Duration::from_secs(90),
        }
    }
}

impl BuildConfig {
    pub fn from_env() -> Self {
        let fetch_attempts = parse_env("SB_FETCH_RETRIES", 3u32);
        let runtime_attempts = parse_env("SB_RUNTIME_RETRIES", 2u32);

        Self {
            lock_timeout: Duration::from_secs(parse_env("SB_LOCK_TIMEOUT_SECS", 30)),
            health_timeout: Duration::from_secs(parse_env("SB_HEALTH_TIMEOUT_SECS", 120)),
            health_interval: Duration::from_millis(parse_env("SB_HEALTH_INTERVAL_MS", 2000)),
            health_probe_url: env::var("SB_HEALTH_PROBE_URL").ok().filter(|s| !s.is_empty()),
            fetch_retry: RetryPolicy::new(fetch_attempts.max(1), Duration::from_secs(2)),
            runtime_retry: RetryPolicy::new(runtime_attempts.max(1), Duration::from_secs(3)),
            compose_timeout: Duration::from_secs(parse_env("SB_COMPOSE_TIMEOUT_SECS", 600)),
        }
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(30),
            health_timeout: Duration::from_secs(120),
            health_interval: Duration::from_secs(2),
            health_probe_url: None,
            fetch_retry: RetryPolicy::new(3, Duration::from_secs(2)),
            runtime_retry: RetryPolicy::new(2, Duration::from_secs(3)),
            compose_timeout: Duration::from_secs(600),
        }
    }
}

/// 解析数值型环境变量，无效值回退到默认值
fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_path(key: &str, default: &str) -> PathBuf {
    env::var(key)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}

/// 常量
pub mod constants {
    /// 构建任务历史最大保存数量
    pub const MAX_TASK_HISTORY: usize = 100;

    /// 最大活跃构建任务数
    pub const MAX_ACTIVE_TASKS: usize = 50;

    /// 默认 PHP 版本
    pub const DEFAULT_PHP_VERSION: &str = "8.3";

    /// 默认 Node 版本
    pub const DEFAULT_NODE_VERSION: &str = "20";

    /// compose 文件名
    pub const COMPOSE_FILE: &str = "docker-compose.yml";

    /// 代理名称
    pub const AGENT_NAME: &str = "ServerBond Agent";

    /// 版本号
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}
