//! 配置模块
//!
//! 环境变量解析与框架目录

pub mod env;
pub mod frameworks;

pub use env::{BaseSystemConfig, BuildConfig, EnvConfig, PathsConfig};
pub use frameworks::{BuildParam, Framework, FrameworkCatalog, FrameworkDescriptor};
