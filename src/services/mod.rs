//! 服务层模块
//!
//! 包含核心业务逻辑

pub mod base_system;
pub mod build;
pub mod lifecycle;
pub mod persistence;
pub mod registry;
pub mod secrets;
pub mod templates;
