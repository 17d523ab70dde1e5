//! TODO 数据模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// TODO 状态：pending → in_progress → {done | failed}；done / failed → pending 只能经由 reset_for_retry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl TodoStatus {
    /// 普通状态迁移（不含重试重置）
    pub fn can_transition_to(self, next: TodoStatus) -> bool {
        matches!(
            (self, next),
            (TodoStatus::Pending, TodoStatus::InProgress)
                | (TodoStatus::InProgress, TodoStatus::Done)
                | (TodoStatus::InProgress, TodoStatus::Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TodoStatus::Done | TodoStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TodoStatus::Pending => "pending",
            TodoStatus::InProgress => "in_progress",
            TodoStatus::Done => "done",
            TodoStatus::Failed => "failed",
        }
    }
}

/// 挂在 TODO 上的一次工具调用记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRecord {
    pub tool_name: String,
    pub params: serde_json::Value,
    pub success: bool,
    /// 成功时为结果摘要，失败时为错误信息
    pub summary: String,
    pub at: DateTime<Utc>,
}

/// 单个工作单元
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Todo {
    pub id: String,
    pub description: String,
    pub expected_result: String,
    pub status: TodoStatus,
    pub result: Option<String>,
    pub tool_calls: Vec<ToolCallRecord>,
    #[serde(default)]
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Todo {
    pub(crate) fn new(id: String, description: String, expected_result: String) -> Self {
        Self {
            id,
            description,
            expected_result,
            status: TodoStatus::Pending,
            result: None,
            tool_calls: Vec::new(),
            retry_count: 0,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// 最近一次成功工具调用的摘要（校验阶段缺省的结果文本）
    pub fn latest_tool_summary(&self) -> Option<&str> {
        self.tool_calls
            .iter()
            .rev()
            .find(|c| c.success)
            .map(|c| c.summary.as_str())
    }
}
