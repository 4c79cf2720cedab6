//! 领域模型模块
//!
//! 纯数据结构，不依赖 axum

pub mod base_system;
pub mod build;
pub mod site;
pub mod system;

// Re-exports for convenience
pub use base_system::{
    BaseSystemState, ServiceStatus, SharedService, TenantHandle, TenantRecord, TenantResourceKind,
    TenantResourceSpec,
};
pub use build::{BuildPhase, BuildStage, BuildStatus, BuildTask, LogLine, StageStatus, TaskError};
pub use site::{BuildRequest, SiteDescriptor, SiteParams, SiteSecrets, SiteState, SiteView};
pub use system::{DiskInfo, EngineStatus, HostHealth, HostStats, LoadAverage};
