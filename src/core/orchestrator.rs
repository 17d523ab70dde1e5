//! 编排器主入口
//!
//! execute 的一轮：取得 / 创建会话 → 构建上下文 prompt → 调用模型（网络 / 超时错误重试，每次带超时）
//! → 防御式解析 → 校验类型与阶段 → 按阶段分发 → 返回 ExecuteResponse。
//! 分发之上的失败（会话、模型传输、非法阶段）是致命的，execute 返回 Err；
//! 阶段处理器的失败被记录到会话日志，并作为 execution_result 的 Failure 返回。

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

use crate::core::{ErrorHandler, ErrorRecord, RecoveryEngine, RecoveryPlan, RetryPolicy};
use crate::llm::{ModelReply, ModelRequest, ModelTransport};
use crate::observability::Metrics;
use crate::phase::{
    dispatch, parse_reply, HandlerContext, Phase, PhaseEvent, PhaseOutcome, PromptBuilder,
    ToolCallRequest, VerificationVerdict,
};
use crate::session::{SessionManager, SessionSnapshot};
use crate::todo::Todo;
use crate::tools::{ToolGateway, ToolOutcome};
use crate::verification::{VerificationGate, VerificationRequest};

/// 调用方请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub model_id: String,
    pub prompt: String,
    pub request_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// 本轮阶段处理的结果
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionResult {
    Success {
        summary: String,
        tool: Option<ToolOutcome>,
    },
    Failure {
        error: ErrorRecord,
        tool: Option<ToolOutcome>,
    },
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionResult::Success { .. })
    }

    pub fn error(&self) -> Option<&ErrorRecord> {
        match self {
            ExecutionResult::Failure { error, .. } => Some(error),
            ExecutionResult::Success { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResponse {
    pub text: String,
    pub phase: Phase,
    pub todos: Vec<Todo>,
    pub tool_call: Option<ToolCallRequest>,
    pub verification: Option<VerificationVerdict>,
    pub complete: bool,
    pub session_id: String,
    pub execution_result: ExecutionResult,
}

/// 编排器组件（由 OrchestratorBuilder 组装）
pub struct Orchestrator {
    pub(crate) sessions: Arc<SessionManager>,
    pub(crate) gateway: Arc<ToolGateway>,
    pub(crate) gate: VerificationGate,
    pub(crate) transport: Arc<dyn ModelTransport>,
    pub(crate) prompts: PromptBuilder,
    pub(crate) errors: Arc<ErrorHandler>,
    pub(crate) recovery: RecoveryEngine,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) model_retry: RetryPolicy,
    pub(crate) model_timeout: Duration,
    pub(crate) events: Option<UnboundedSender<PhaseEvent>>,
}

fn session_not_found(id: &str) -> ErrorRecord {
    ErrorRecord::validation(format!("Session '{id}' not found"))
        .with_code("SESSION_NOT_FOUND")
        .with_context("session_id", id)
        .with_suggestion("Start a new session by omitting the session id")
        .non_retryable()
}

fn preview(s: &str, max_chars: usize) -> String {
    if s.chars().count() > max_chars {
        format!("{}...", s.chars().take(max_chars).collect::<String>())
    } else {
        s.to_string()
    }
}

impl Orchestrator {
    fn emit(&self, event: PhaseEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// 执行一轮
    pub async fn execute(&self, request: ExecuteRequest) -> Result<ExecuteResponse, ErrorRecord> {
        let result = self.run_turn(request).await;
        self.metrics.record_turn(result.is_err());
        result.map_err(|err| {
            let plan = self.recovery.plan(&err);
            tracing::error!(
                code = %err.code,
                category = %err.category,
                error = %err.message,
                automatic = ?plan.automatic,
                manual = ?plan.manual,
                "turn failed"
            );
            // 没有具体建议时附上恢复计划中的人工动作
            let err = if err.suggestions.is_empty() {
                err.with_suggestions(plan.manual)
            } else {
                err
            };
            self.errors.record(&err);
            self.emit(PhaseEvent::Error {
                code: err.code.clone(),
                text: err.message.clone(),
            });
            err
        })
    }

    async fn run_turn(&self, request: ExecuteRequest) -> Result<ExecuteResponse, ErrorRecord> {
        if request.model_id.trim().is_empty() {
            return Err(ErrorRecord::validation("Model id must not be empty")
                .with_code("MODEL_ID_MISSING")
                .non_retryable());
        }
        if request.request_id.trim().is_empty() {
            return Err(ErrorRecord::validation("Request id must not be empty")
                .with_code("REQUEST_ID_MISSING")
                .non_retryable());
        }
        let (session_id, created) = match request.session_id.as_deref() {
            Some(id) if !id.trim().is_empty() => (id.to_string(), false),
            _ => (
                self.sessions
                    .create_session(&request.prompt, &request.model_id, &request.request_id)
                    .await?,
                true,
            ),
        };
        let handle = self
            .sessions
            .get_session(&session_id)
            .await
            .ok_or_else(|| session_not_found(&session_id))?;
        let mut session = handle.lock().await;
        session.turn += 1;
        if session.model_id != request.model_id {
            session.model_id = request.model_id.clone();
        }
        session.touch();
        tracing::info!(session = %session.id, turn = session.turn, request = %request.request_id, "turn started");
        self.emit(PhaseEvent::TurnStarted {
            session_id: session.id.clone(),
            turn: session.turn,
        });

        // 新会话的任务已写在上下文里
        let user_input = if created { "" } else { request.prompt.as_str() };
        let context = session.context_prompt(self.sessions.config().context_log_entries);
        let model_request =
            self.prompts
                .build_request(&session.model_id, &session.id, &context, user_input);

        let reply = match self.call_model(model_request).await {
            Ok(reply) => reply,
            Err(err) => {
                session.log(false, format!("Model call failed: {}", err.message));
                return Err(err.with_context("session_id", session.id.as_str()));
            }
        };
        let parsed = parse_reply(&reply);
        self.emit(PhaseEvent::ModelReply {
            preview: preview(&parsed.response.message, 200),
            stage: format!("{:?}", parsed.stage).to_lowercase(),
        });

        let phase = match parsed.response.validate() {
            Ok(phase) => phase,
            Err(err) => {
                session.log(false, format!("Invalid model response: {}", err.message));
                return Err(err.with_context("session_id", session.id.as_str()));
            }
        };

        let ctx = HandlerContext {
            gateway: &self.gateway,
            gate: &self.gate,
            events: self.events.as_ref(),
        };
        let (execution_result, verification) =
            match dispatch(&ctx, &mut session, phase, &parsed.response).await {
                Ok(outcome) => {
                    let PhaseOutcome {
                        summary,
                        tool,
                        mut verifications,
                    } = outcome;
                    let failure = tool.as_ref().and_then(|t| t.error()).cloned();
                    let result = match failure {
                        Some(error) => ExecutionResult::Failure { error, tool },
                        None => ExecutionResult::Success { summary, tool },
                    };
                    (result, verifications.pop())
                }
                Err(err) => {
                    self.errors.record(&err);
                    tracing::warn!(session = %session.id, phase = %phase, code = %err.code, error = %err.message, "phase handler failed");
                    session.log(false, format!("{phase} failed: {}", err.message));
                    self.emit(PhaseEvent::Error {
                        code: err.code.clone(),
                        text: err.message.clone(),
                    });
                    (ExecutionResult::Failure { error: err, tool: None }, None)
                }
            };

        let complete = session.phase == Phase::Complete || parsed.response.complete;
        let text = if parsed.response.message.trim().is_empty() {
            match &execution_result {
                ExecutionResult::Success { summary, .. } => summary.clone(),
                ExecutionResult::Failure { error, .. } => error.message.clone(),
            }
        } else {
            parsed.response.message.clone()
        };
        session.touch();
        Ok(ExecuteResponse {
            text,
            phase: session.phase,
            todos: session.todos.export(),
            tool_call: parsed.response.tool_call.clone(),
            verification,
            complete,
            session_id: session.id.clone(),
            execution_result,
        })
    }

    async fn call_model(&self, request: ModelRequest) -> Result<ModelReply, ErrorRecord> {
        let timeout = self.model_timeout;
        let result = self
            .errors
            .execute_with_retry(&self.model_retry, |attempt| {
                let transport = Arc::clone(&self.transport);
                let request = request.clone();
                async move {
                    tracing::debug!(attempt, model = %request.model_id, "model request");
                    match tokio::time::timeout(timeout, transport.send(request)).await {
                        Ok(reply) => reply,
                        Err(_) => Err(ErrorRecord::timeout(format!(
                            "Model request timed out after {}ms",
                            timeout.as_millis()
                        ))
                        .with_code("MODEL_TIMEOUT")),
                    }
                }
            })
            .await;
        self.metrics.record_model_call(result.is_ok());
        result
    }

    /// 停止会话：挂起的校验按拒绝结算，然后移除会话；返回被取消的校验数
    pub async fn stop_session(&self, session_id: &str) -> Result<usize, ErrorRecord> {
        let cancelled = self.gate.cancel_session(session_id);
        let removed = self.sessions.remove_session(session_id).await;
        if !removed && cancelled == 0 {
            return Err(session_not_found(session_id));
        }
        tracing::info!(session = %session_id, cancelled, "session stopped");
        Ok(cancelled)
    }

    pub fn resolve_verification(
        &self,
        verification_id: &str,
        approved: bool,
        feedback: Option<String>,
    ) -> Result<VerificationRequest, ErrorRecord> {
        self.gate.resolve(verification_id, approved, feedback)
    }

    pub async fn snapshot(&self, session_id: &str) -> Option<SessionSnapshot> {
        self.sessions.snapshot(session_id).await
    }

    /// 给调用方的恢复计划
    pub fn recovery_plan(&self, err: &ErrorRecord) -> RecoveryPlan {
        self.recovery.plan(err)
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn gate(&self) -> &VerificationGate {
        &self.gate
    }

    pub fn errors(&self) -> &Arc<ErrorHandler> {
        &self.errors
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn transport(&self) -> &Arc<dyn ModelTransport> {
        &self.transport
    }
}
