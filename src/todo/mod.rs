//! TODO 层：数据模型与生命周期管理

pub mod manager;
pub mod types;

pub use manager::{TodoLimits, TodoManager};
pub use types::{Todo, TodoStatus, ToolCallRecord};
