//! 阶段与模型响应结构

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::ErrorRecord;
use crate::todo::TodoStatus;

/// 响应类型标记
pub const RESPONSE_TYPE: &str = "agent_response";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Planning,
    Execution,
    Verification,
    Complete,
}

impl Phase {
    pub const ALL: [Phase; 4] = [
        Phase::Planning,
        Phase::Execution,
        Phase::Verification,
        Phase::Complete,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Planning => "planning",
            Phase::Execution => "execution",
            Phase::Verification => "verification",
            Phase::Complete => "complete",
        }
    }

    /// 大小写不敏感
    pub fn parse(raw: &str) -> Result<Phase, ErrorRecord> {
        let lower = raw.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == lower)
            .ok_or_else(|| {
                ErrorRecord::validation(format!(
                    "Invalid phase '{raw}'; expected one of planning, execution, verification, complete"
                ))
                .with_code("INVALID_PHASE")
                .non_retryable()
            })
    }

    /// 允许的阶段迁移（自环总是允许）
    pub fn can_transition_to(self, next: Phase) -> bool {
        use Phase::*;
        match (self, next) {
            (a, b) if a == b => true,
            (Planning, Execution | Complete) => true,
            (Execution, Verification | Complete | Planning) => true,
            (Verification, Execution | Complete | Planning) => true,
            (Complete, Planning) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 规划阶段给出的 TODO
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlannedTodo {
    #[serde(default)]
    pub id: Option<String>,
    pub description: String,
    pub expected_result: String,
}

/// 执行阶段的 TODO 状态更新
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TodoUpdate {
    pub id: String,
    pub status: TodoStatus,
    #[serde(default)]
    pub result: Option<String>,
}

/// 工具调用请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRequest {
    pub name: String,
    #[serde(default)]
    pub params: Value,
}

/// 校验阶段指令；approved 缺省时交给校验闸门
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VerificationDirective {
    #[serde(default)]
    pub todo_id: Option<String>,
    #[serde(default)]
    pub approved: Option<bool>,
    #[serde(default)]
    pub feedback: Option<String>,
    /// 被拒绝时是否允许重置重试（默认允许）
    #[serde(default = "default_retry")]
    pub retry: bool,
    #[serde(default)]
    pub result: Option<String>,
}

fn default_retry() -> bool {
    true
}

impl Default for VerificationDirective {
    fn default() -> Self {
        Self {
            todo_id: None,
            approved: None,
            feedback: None,
            retry: default_retry(),
            result: None,
        }
    }
}

/// 模型每轮返回的结构化响应。phase 保持原始字符串，由 validate 给出 VALIDATION 错误。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModelResponse {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub phase: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub todos: Vec<PlannedTodo>,
    #[serde(default)]
    pub todo_updates: Vec<TodoUpdate>,
    #[serde(default)]
    pub tool_call: Option<ToolCallRequest>,
    #[serde(default)]
    pub verification: Option<VerificationDirective>,
    #[serde(default)]
    pub complete: bool,
}

impl ModelResponse {
    /// 解析彻底失败时的兜底响应
    pub fn fallback(raw: &str) -> Self {
        Self {
            kind: RESPONSE_TYPE.to_string(),
            phase: Phase::Execution.as_str().to_string(),
            message: raw.trim().to_string(),
            ..Default::default()
        }
    }

    /// 校验类型标记与阶段
    pub fn validate(&self) -> Result<Phase, ErrorRecord> {
        if self.kind != RESPONSE_TYPE {
            return Err(ErrorRecord::validation(format!(
                "Response type must be '{RESPONSE_TYPE}', got '{}'",
                self.kind
            ))
            .with_code("INVALID_RESPONSE_TYPE")
            .non_retryable());
        }
        Phase::parse(&self.phase)
    }
}

/// 模型响应的 JSON Schema（拼入 system prompt）
pub fn response_schema_json() -> String {
    let schema = schemars::schema_for!(ModelResponse);
    serde_json::to_string_pretty(&schema).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_transitions() {
        assert!(Phase::Planning.can_transition_to(Phase::Execution));
        assert!(Phase::Verification.can_transition_to(Phase::Execution));
        assert!(Phase::Complete.can_transition_to(Phase::Planning));
        assert!(!Phase::Planning.can_transition_to(Phase::Verification));
        assert!(!Phase::Complete.can_transition_to(Phase::Execution));
    }

    #[test]
    fn test_validate() {
        let ok: ModelResponse = serde_json::from_str(
            r#"{"type":"agent_response","phase":"Planning","message":"hi"}"#,
        )
        .unwrap();
        assert_eq!(ok.validate().unwrap(), Phase::Planning);

        let bad_phase = ModelResponse {
            phase: "dreaming".into(),
            ..ModelResponse::fallback("x")
        };
        assert_eq!(bad_phase.validate().unwrap_err().code, "INVALID_PHASE");

        let bad_type = ModelResponse {
            kind: "chat".into(),
            ..ModelResponse::fallback("x")
        };
        assert_eq!(bad_type.validate().unwrap_err().code, "INVALID_RESPONSE_TYPE");
    }

    #[test]
    fn test_camel_case_fields() {
        let r: ModelResponse = serde_json::from_str(
            r#"{"type":"agent_response","phase":"execution",
                "todoUpdates":[{"id":"todo_1","status":"done","result":"ok"}],
                "toolCall":{"name":"read_file","params":{"path":"a"}},
                "verification":{"todoId":"todo_1"}}"#,
        )
        .unwrap();
        assert_eq!(r.todo_updates[0].status, TodoStatus::Done);
        assert_eq!(r.tool_call.unwrap().params["path"], "a");
        let v = r.verification.unwrap();
        assert!(v.retry);
        assert_eq!(v.approved, None);
    }

    #[test]
    fn test_schema_mentions_fields() {
        let schema = response_schema_json();
        assert!(schema.contains("todoUpdates"));
        assert!(schema.contains("toolCall"));
    }
}
