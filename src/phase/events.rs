//! 编排过程事件：用于流式展示阶段变化、TODO 更新、工具调用与校验

use serde::Serialize;

use crate::phase::Phase;
use crate::todo::TodoStatus;

/// 单轮过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PhaseEvent {
    TurnStarted { session_id: String, turn: u32 },
    /// 模型回复（预览）
    ModelReply { preview: String, stage: String },
    PhaseChanged { from: Phase, to: Phase },
    TodoUpdated { id: String, status: TodoStatus },
    ToolCall {
        tool: String,
        args: serde_json::Value,
    },
    /// 工具返回（摘要）
    ToolResult {
        tool: String,
        success: bool,
        summary: String,
    },
    VerificationOpened { id: String, todo_id: String },
    VerificationResolved {
        id: String,
        todo_id: String,
        approved: bool,
        timed_out: bool,
    },
    Error { code: String, text: String },
}
