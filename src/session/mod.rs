//! 会话与上下文管理：多轮执行可续接

pub mod manager;
pub mod types;

pub use manager::{SessionConfig, SessionHandle, SessionManager};
pub use types::{ExecutionLogEntry, Session, SessionId, SessionSnapshot, SessionUpdate};
