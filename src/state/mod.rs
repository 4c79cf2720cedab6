//! 运行时状态模块
//!
//! 管理应用状态、任务存储、日志通道和站点锁

pub mod app_state;
pub mod log_hub;
pub mod site_locks;
pub mod task_store;

pub use app_state::{get_shutdown_token, trigger_shutdown, AppState, Collaborators};
pub use log_hub::LogHub;
pub use site_locks::{RunningBuilds, SiteGuard, SiteLocks};
pub use task_store::TaskStore;
