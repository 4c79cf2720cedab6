//! 框架目录
//!
//! 启动时构建一次，运行期只读。每个框架声明模板文件集、允许/必需的构建参数、
//! 应用端口、默认资源限制以及是否需要租户数据库。

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use super::env::constants::DEFAULT_PHP_VERSION;

/// 支持的应用框架
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Framework {
    Static,
    Nextjs,
    Nuxt,
    Nodeapi,
    Laravel,
    LaravelInertia,
}

/// 模板族：同族框架共享一组模板文件
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TemplateFamily {
    Static,
    Node,
    Laravel,
}

impl Framework {
    pub const ALL: [Framework; 6] = [
        Framework::Static,
        Framework::Nextjs,
        Framework::Nuxt,
        Framework::Nodeapi,
        Framework::Laravel,
        Framework::LaravelInertia,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Framework::Static => "static",
            Framework::Nextjs => "nextjs",
            Framework::Nuxt => "nuxt",
            Framework::Nodeapi => "nodeapi",
            Framework::Laravel => "laravel",
            Framework::LaravelInertia => "laravel-inertia",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.as_str() == value)
    }

    pub fn family(&self) -> TemplateFamily {
        match self {
            Framework::Static => TemplateFamily::Static,
            Framework::Nextjs | Framework::Nuxt | Framework::Nodeapi => TemplateFamily::Node,
            Framework::Laravel | Framework::LaravelInertia => TemplateFamily::Laravel,
        }
    }
}

impl std::fmt::Display for Framework {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 框架相关的构建参数
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildParam {
    Branch,
    PhpVersion,
    NodeVersion,
    DbName,
    DbUser,
    DbPass,
}

impl BuildParam {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildParam::Branch => "branch",
            BuildParam::PhpVersion => "php_version",
            BuildParam::NodeVersion => "node_version",
            BuildParam::DbName => "db_name",
            BuildParam::DbUser => "db_user",
            BuildParam::DbPass => "db_pass",
        }
    }
}

/// 默认资源限制
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResourceLimits {
    pub memory_mb: u32,
    pub cpus: f32,
}

/// 框架目录项
#[derive(Clone, Debug, Serialize)]
pub struct FrameworkDescriptor {
    pub framework: Framework,
    pub display_name: &'static str,
    /// 需要渲染的模板文件（输出文件名）
    pub template_files: Vec<&'static str>,
    /// 必须由请求提供的参数
    pub required_params: Vec<BuildParam>,
    /// 请求可以提供的参数（包含 required_params）
    pub allowed_params: Vec<BuildParam>,
    /// 容器内应用端口
    pub app_port: u16,
    /// 是否需要在共享数据库中分配租户库
    pub needs_database: bool,
    pub limits: ResourceLimits,
}

impl FrameworkDescriptor {
    pub fn allows(&self, param: BuildParam) -> bool {
        self.allowed_params.contains(&param) || self.required_params.contains(&param)
    }
}

/// PHP 版本对应的镜像和扩展
#[derive(Clone, Debug, Serialize)]
pub struct PhpRuntime {
    pub version: String,
    pub image: String,
    pub extensions: Vec<String>,
}

/// 框架目录
#[derive(Clone, Debug)]
pub struct FrameworkCatalog {
    frameworks: HashMap<Framework, FrameworkDescriptor>,
    php_versions: BTreeMap<String, PhpRuntime>,
}

impl FrameworkCatalog {
    /// 内置目录
    pub fn builtin() -> Self {
        let node_params = vec![BuildParam::Branch, BuildParam::NodeVersion];
        let laravel_params = vec![
            BuildParam::Branch,
            BuildParam::PhpVersion,
            BuildParam::DbName,
            BuildParam::DbUser,
            BuildParam::DbPass,
        ];

        let descriptors = vec![
            FrameworkDescriptor {
                framework: Framework::Static,
                display_name: "Static site",
                template_files: vec!["docker-compose.yml", "nginx.conf"],
                required_params: vec![],
                allowed_params: vec![BuildParam::Branch],
                app_port: 80,
                needs_database: false,
                limits: ResourceLimits { memory_mb: 128, cpus: 0.25 },
            },
            FrameworkDescriptor {
                framework: Framework::Nextjs,
                display_name: "Next.js",
                template_files: vec!["docker-compose.yml", "Dockerfile", ".env"],
                required_params: vec![],
                allowed_params: node_params.clone(),
                app_port: 3000,
                needs_database: false,
                limits: ResourceLimits { memory_mb: 512, cpus: 1.0 },
            },
            FrameworkDescriptor {
                framework: Framework::Nuxt,
                display_name: "Nuxt",
                template_files: vec!["docker-compose.yml", "Dockerfile", ".env"],
                required_params: vec![],
                allowed_params: node_params.clone(),
                app_port: 3000,
                needs_database: false,
                limits: ResourceLimits { memory_mb: 512, cpus: 1.0 },
            },
            FrameworkDescriptor {
                framework: Framework::Nodeapi,
                display_name: "Node.js API",
                template_files: vec!["docker-compose.yml", "Dockerfile", ".env"],
                required_params: vec![],
                allowed_params: node_params,
                app_port: 3000,
                needs_database: false,
                limits: ResourceLimits { memory_mb: 256, cpus: 0.5 },
            },
            FrameworkDescriptor {
                framework: Framework::Laravel,
                display_name: "Laravel",
                template_files: vec![
                    "docker-compose.yml",
                    "Dockerfile",
                    "nginx.conf",
                    "supervisord.conf",
                    ".env",
                ],
                required_params: vec![],
                allowed_params: laravel_params.clone(),
                app_port: 80,
                needs_database: true,
                limits: ResourceLimits { memory_mb: 512, cpus: 1.0 },
            },
            FrameworkDescriptor {
                framework: Framework::LaravelInertia,
                display_name: "Laravel + Inertia",
                template_files: vec![
                    "docker-compose.yml",
                    "Dockerfile",
                    "nginx.conf",
                    "supervisord.conf",
                    ".env",
                ],
                required_params: vec![],
                allowed_params: laravel_params,
                app_port: 80,
                needs_database: true,
                limits: ResourceLimits { memory_mb: 768, cpus: 1.0 },
            },
        ];

        let extensions = ["pdo_mysql", "mbstring", "bcmath", "gd", "zip", "opcache", "redis"];
        let php_versions = ["8.0", "8.1", "8.2", "8.3", "8.4"]
            .into_iter()
            .map(|v| {
                (
                    v.to_string(),
                    PhpRuntime {
                        version: v.to_string(),
                        image: format!("php:{}-fpm-alpine", v),
                        extensions: extensions.iter().map(|e| e.to_string()).collect(),
                    },
                )
            })
            .collect();

        Self {
            frameworks: descriptors.into_iter().map(|d| (d.framework, d)).collect(),
            php_versions,
        }
    }

    /// 覆盖或追加一个框架描述
    pub fn with_descriptor(mut self, descriptor: FrameworkDescriptor) -> Self {
        self.frameworks.insert(descriptor.framework, descriptor);
        self
    }

    pub fn get(&self, framework: Framework) -> Option<&FrameworkDescriptor> {
        self.frameworks.get(&framework)
    }

    /// 按 Framework::ALL 顺序返回
    pub fn all(&self) -> Vec<&FrameworkDescriptor> {
        Framework::ALL
            .iter()
            .filter_map(|f| self.frameworks.get(f))
            .collect()
    }

    pub fn php_runtime(&self, version: &str) -> Option<&PhpRuntime> {
        self.php_versions.get(version)
    }

    pub fn default_php_runtime(&self) -> Option<&PhpRuntime> {
        self.php_versions.get(DEFAULT_PHP_VERSION)
    }

    pub fn php_versions(&self) -> Vec<&str> {
        self.php_versions.keys().map(String::as_str).collect()
    }
}

impl Default for FrameworkCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}
