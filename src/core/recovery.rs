//! 错误恢复引擎
//!
//! 根据 ErrorRecord 的类别给出恢复计划：可自动执行的动作（退避重试、校验路径等）
//! 与需要人工介入的动作（修复权限、补全参数等），并附上错误自带的建议。

use serde::Serialize;

use crate::core::{ErrorCategory, ErrorRecord};

/// 恢复计划
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryPlan {
    pub category: Option<ErrorCategory>,
    /// 系统可自动尝试的动作
    pub automatic: Vec<String>,
    /// 需要人工介入的动作
    pub manual: Vec<String>,
    /// 错误自身携带的建议
    pub suggestions: Vec<String>,
}

impl RecoveryPlan {
    pub fn requires_human(&self) -> bool {
        self.automatic.is_empty() && !self.manual.is_empty()
    }
}

/// 语义化恢复：把错误类别映射为自动 / 人工两类动作
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn plan(&self, err: &ErrorRecord) -> RecoveryPlan {
        let (automatic, manual): (&[&str], &[&str]) = match err.category {
            ErrorCategory::Network => (
                &["Retry with exponential backoff"],
                &["Check network connectivity and proxy settings"],
            ),
            ErrorCategory::Timeout => (
                &["Retry with a longer timeout"],
                &["Split the task into smaller steps"],
            ),
            ErrorCategory::FileSystem => (
                &["Verify the path exists", "Create missing parent directories"],
                &["Check available disk space"],
            ),
            ErrorCategory::Permission => (
                &[],
                &[
                    "Check permissions and disk space",
                    "Move the target inside the workspace root",
                ],
            ),
            ErrorCategory::Validation => (
                &[],
                &["Fix the invalid or missing parameters"],
            ),
            ErrorCategory::Parsing => (
                &["Ask the model to return a well-formed JSON object"],
                &[],
            ),
            ErrorCategory::Host => (
                &["Retry the host capability once it is available"],
                &["Check that the host integration is enabled"],
            ),
            ErrorCategory::System => (
                &[],
                &["Inspect the logs and report the failure"],
            ),
        };
        // 不可重试的错误不应给出「重试」类自动动作
        let automatic = if err.retryable {
            automatic.iter().map(|s| s.to_string()).collect()
        } else {
            Vec::new()
        };
        RecoveryPlan {
            category: Some(err.category),
            automatic,
            manual: manual.iter().map(|s| s.to_string()).collect(),
            suggestions: err.suggestions.clone(),
        }
    }
}
