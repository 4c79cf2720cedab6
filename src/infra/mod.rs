//! 基础设施模块
//!
//! 封装外部依赖（容器引擎、git、HTTP 探测、命令执行、重试）

pub mod command;
pub mod docker;
pub mod fetch;
pub mod probe;
pub mod retry;
pub mod runtime;

#[cfg(test)]
pub(crate) mod testing;

pub use command::CommandRunner;
pub use docker::DockerCli;
pub use fetch::{FetchFailure, GitFetcher, SourceFetcher};
pub use probe::{HealthProbe, HttpProbe, NoopProbe, ProbeOutcome};
pub use retry::{retry, RetryFailure, RetryPolicy};
pub use runtime::{ContainerRuntime, RuntimeError, ServiceAction, StackSpec};
