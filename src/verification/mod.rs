//! 校验闸门：自动审批启发式、挂起 / 超时 / 结算、历史与统计

pub mod gate;
pub mod heuristics;
pub mod history;

pub use gate::{
    GateConfig, VerificationGate, VerificationHandle, VerificationOptions, VerificationRequest,
    VerificationStatus,
};
pub use heuristics::should_auto_approve;
pub use history::{HistoryQuery, VerificationHistory, VerificationStatistics};
