//! 阶段状态机：响应结构、防御式解析、prompt 拼装、阶段处理器与过程事件

pub mod events;
pub mod handlers;
pub mod parser;
pub mod prompt;
pub mod types;

pub use events::PhaseEvent;
pub use handlers::{dispatch, HandlerContext, PhaseOutcome, VerificationVerdict};
pub use parser::{parse_reply, parse_text, ParseStage, ParsedResponse};
pub use prompt::PromptBuilder;
pub use types::{
    response_schema_json, ModelResponse, Phase, PlannedTodo, TodoUpdate, ToolCallRequest,
    VerificationDirective, RESPONSE_TYPE,
};
