//! 核心编排层：错误分类与重试、恢复计划、编排器构建与主入口

pub mod builder;
pub mod classifier;
pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod retry;

pub use builder::{create_transport_from_config, local_capabilities, OrchestratorBuilder};
pub use classifier::ErrorClassifier;
pub use error::{ErrorCategory, ErrorEnvelope, ErrorRecord, Severity};
pub use orchestrator::{ExecuteRequest, ExecuteResponse, ExecutionResult, Orchestrator};
pub use recovery::{RecoveryEngine, RecoveryPlan};
pub use retry::{
    calculate_delay, BackoffStrategy, ErrorHandler, ErrorLogLimits, ErrorStatistics,
    IntoErrorRecord, RetryPolicy,
};
