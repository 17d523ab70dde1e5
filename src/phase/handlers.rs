//! 阶段处理器
//!
//! dispatch 先检查阶段迁移是否合法，再按阶段处理：
//! - planning：没有任何 TODO 开始时整体替换，否则合并（新 id 创建，已有 id 不动）
//! - execution：应用 todoUpdates（done 需经过校验闸门），再对当前 TODO 执行工具调用
//! - verification：显式决定直接生效，否则向闸门发起请求并等待结果
//! - complete：结束会话
//!
//! 处理器返回的 Err 都是非致命的，由编排器记录并作为本轮的失败结果返回。

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use crate::core::ErrorRecord;
use crate::phase::{ModelResponse, Phase, PhaseEvent, PlannedTodo, VerificationDirective};
use crate::session::Session;
use crate::todo::{TodoManager, TodoStatus, ToolCallRecord};
use crate::tools::{ToolContext, ToolGateway, ToolOutcome};
use crate::verification::VerificationGate;

/// 处理器依赖
pub struct HandlerContext<'a> {
    pub gateway: &'a ToolGateway,
    pub gate: &'a VerificationGate,
    pub events: Option<&'a UnboundedSender<PhaseEvent>>,
}

impl HandlerContext<'_> {
    fn emit(&self, event: PhaseEvent) {
        if let Some(tx) = self.events {
            let _ = tx.send(event);
        }
    }
}

/// 一次 TODO 校验的结论
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationVerdict {
    pub todo_id: String,
    /// 闸门请求 id；模型显式决定时为空
    pub request_id: Option<String>,
    pub approved: bool,
    pub auto_approved: bool,
    pub timed_out: bool,
    pub feedback: Option<String>,
    /// 被拒绝后是否已重置为 pending 等待重试
    pub retried: bool,
}

/// 处理结果
#[derive(Debug, Clone, Default)]
pub struct PhaseOutcome {
    pub summary: String,
    pub tool: Option<ToolOutcome>,
    pub verifications: Vec<VerificationVerdict>,
}

fn todo_not_found(id: &str) -> ErrorRecord {
    ErrorRecord::validation(format!("TODO '{id}' not found"))
        .with_code("TODO_NOT_FOUND")
        .with_context("todo_id", id)
}

pub async fn dispatch(
    ctx: &HandlerContext<'_>,
    session: &mut Session,
    phase: Phase,
    response: &ModelResponse,
) -> Result<PhaseOutcome, ErrorRecord> {
    let from = session.phase;
    if !from.can_transition_to(phase) {
        return Err(ErrorRecord::validation(format!(
            "Illegal phase transition {from} -> {phase}"
        ))
        .with_code("PHASE_TRANSITION")
        .with_context("from", from.as_str())
        .with_context("to", phase.as_str())
        .non_retryable());
    }
    // 处理器按目标阶段运行；失败时恢复原阶段，迁移事件只在成功后发出
    session.phase = phase;
    let result = match phase {
        Phase::Planning => handle_planning(ctx, session, &response.todos),
        Phase::Execution => handle_execution(ctx, session, response).await,
        Phase::Verification => {
            let directive = response.verification.clone().unwrap_or_default();
            handle_verification(ctx, session, &directive, &response.message).await
        }
        Phase::Complete => Ok(handle_complete(session, &response.message)),
    };
    if result.is_err() {
        session.phase = from;
        return result;
    }
    if from != phase {
        tracing::info!(session = %session.id, from = %from, to = %phase, "phase changed");
        ctx.emit(PhaseEvent::PhaseChanged { from, to: phase });
    }
    // 校验被拒并重置时会从 verification 回到 execution
    if session.phase != phase {
        tracing::info!(session = %session.id, from = %phase, to = %session.phase, "phase changed");
        ctx.emit(PhaseEvent::PhaseChanged {
            from: phase,
            to: session.phase,
        });
    }
    result
}

fn handle_planning(
    ctx: &HandlerContext<'_>,
    session: &mut Session,
    planned: &[PlannedTodo],
) -> Result<PhaseOutcome, ErrorRecord> {
    if planned.is_empty() {
        return Ok(PhaseOutcome {
            summary: "No TODOs proposed".to_string(),
            ..Default::default()
        });
    }
    let replace = session.todos.is_untouched();
    // 先在副本上应用，全部成功后再提交
    let mut next = if replace {
        TodoManager::new(session.todos.limits())
    } else {
        session.todos.clone()
    };
    let mut created = Vec::new();
    for t in planned {
        if !replace {
            if let Some(id) = t.id.as_deref() {
                if next.get(id.trim()).is_some() {
                    continue;
                }
            }
        }
        created.push(next.create(&t.description, &t.expected_result, t.id.as_deref())?.id);
    }
    session.todos = next;
    for id in &created {
        ctx.emit(PhaseEvent::TodoUpdated {
            id: id.clone(),
            status: TodoStatus::Pending,
        });
    }
    let summary = if replace {
        format!("Planned {} TODOs", created.len())
    } else {
        format!("Merged plan: {} new TODOs", created.len())
    };
    session.log(true, summary.clone());
    Ok(PhaseOutcome {
        summary,
        ..Default::default()
    })
}

async fn handle_execution(
    ctx: &HandlerContext<'_>,
    session: &mut Session,
    response: &ModelResponse,
) -> Result<PhaseOutcome, ErrorRecord> {
    let mut outcome = PhaseOutcome::default();
    let mut notes = Vec::new();

    for update in &response.todo_updates {
        let id = update.id.trim();
        match update.status {
            TodoStatus::Done => {
                let text = completion_text(session, id, update.result.as_deref(), &response.message)?;
                let verdict = verify_through_gate(ctx, session, id, &text, true).await?;
                notes.push(verdict_note(&verdict));
                outcome.verifications.push(verdict);
            }
            TodoStatus::Failed => {
                let reason = update.result.as_deref().unwrap_or("marked failed by model");
                session.todos.mark_failed(id, reason)?;
                ctx.emit(PhaseEvent::TodoUpdated {
                    id: id.to_string(),
                    status: TodoStatus::Failed,
                });
                notes.push(format!("{id} failed"));
            }
            TodoStatus::InProgress => {
                session.todos.mark_in_progress(id)?;
                ctx.emit(PhaseEvent::TodoUpdated {
                    id: id.to_string(),
                    status: TodoStatus::InProgress,
                });
                notes.push(format!("{id} started"));
            }
            TodoStatus::Pending => {
                return Err(ErrorRecord::validation(format!(
                    "TODO '{id}' cannot be moved back to pending by an update"
                ))
                .with_code("TODO_TRANSITION")
                .with_suggestion("Reject the TODO in the verification phase to retry it"));
            }
        }
    }

    if let Some(call) = &response.tool_call {
        let todo_id = match session.todos.current() {
            Some(t) => Some(t.id.clone()),
            None => session.todos.next_pending().map(|t| t.id.clone()),
        };
        if let Some(id) = &todo_id {
            if session.todos.get(id).map(|t| t.status) == Some(TodoStatus::Pending) {
                session.todos.mark_in_progress(id)?;
                ctx.emit(PhaseEvent::TodoUpdated {
                    id: id.clone(),
                    status: TodoStatus::InProgress,
                });
            }
        }
        ctx.emit(PhaseEvent::ToolCall {
            tool: call.name.clone(),
            args: call.params.clone(),
        });
        let tool_ctx = ToolContext {
            session_id: session.id.clone(),
            todo_id: todo_id.clone(),
        };
        let result = ctx.gateway.execute_tool(&call.name, &call.params, &tool_ctx).await;
        let summary = result.summary();
        ctx.emit(PhaseEvent::ToolResult {
            tool: call.name.clone(),
            success: result.success(),
            summary: summary.clone(),
        });
        if let Some(id) = &todo_id {
            session.todos.attach_tool_call(
                id,
                ToolCallRecord {
                    tool_name: call.name.clone(),
                    params: call.params.clone(),
                    success: result.success(),
                    summary: summary.clone(),
                    at: result.timestamp,
                },
            )?;
        }
        session.log(result.success(), summary.clone());
        notes.push(summary);
        outcome.tool = Some(result);
    }

    outcome.summary = if notes.is_empty() {
        "No action taken".to_string()
    } else {
        notes.join("; ")
    };
    Ok(outcome)
}

/// 完成文本：显式结果 → 最近一次成功工具摘要 → 模型消息
fn completion_text(
    session: &Session,
    id: &str,
    explicit: Option<&str>,
    message: &str,
) -> Result<String, ErrorRecord> {
    let todo = session.todos.get(id).ok_or_else(|| todo_not_found(id))?;
    let text = explicit
        .map(str::to_string)
        .or_else(|| todo.result.clone())
        .or_else(|| todo.latest_tool_summary().map(str::to_string))
        .unwrap_or_else(|| message.to_string());
    Ok(text)
}

async fn handle_verification(
    ctx: &HandlerContext<'_>,
    session: &mut Session,
    directive: &VerificationDirective,
    message: &str,
) -> Result<PhaseOutcome, ErrorRecord> {
    let id = match directive.todo_id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => session
            .todos
            .current()
            .or_else(|| session.todos.next_pending())
            .map(|t| t.id.clone())
            .ok_or_else(|| {
                ErrorRecord::validation("No TODO available to verify")
                    .with_code("VERIFICATION_NO_TODO")
                    .with_suggestion("Reference a TODO id in verification.todoId")
            })?,
    };
    let text = completion_text(session, &id, directive.result.as_deref(), message)?;

    let verdict = match directive.approved {
        Some(approved) => {
            let mut verdict = VerificationVerdict {
                todo_id: id.clone(),
                request_id: None,
                approved,
                auto_approved: false,
                timed_out: false,
                feedback: directive.feedback.clone(),
                retried: false,
            };
            verdict.retried =
                apply_verdict(session, &id, approved, directive.retry, &text, directive.feedback.as_deref())?;
            ctx.emit(PhaseEvent::VerificationResolved {
                id: String::new(),
                todo_id: id.clone(),
                approved,
                timed_out: false,
            });
            verdict
        }
        None => verify_through_gate(ctx, session, &id, &text, directive.retry).await?,
    };
    Ok(PhaseOutcome {
        summary: verdict_note(&verdict),
        tool: None,
        verifications: vec![verdict],
    })
}

/// 发起闸门请求并等待结算，然后应用结论
async fn verify_through_gate(
    ctx: &HandlerContext<'_>,
    session: &mut Session,
    todo_id: &str,
    result_text: &str,
    retry: bool,
) -> Result<VerificationVerdict, ErrorRecord> {
    if session.todos.get(todo_id).is_none() {
        return Err(todo_not_found(todo_id));
    }
    let options = ctx.gate.default_options(Some(session.id.clone()));
    let handle = ctx.gate.request(todo_id, result_text, options)?;
    if handle.request().is_pending() {
        ctx.emit(PhaseEvent::VerificationOpened {
            id: handle.id().to_string(),
            todo_id: todo_id.to_string(),
        });
    }
    let resolved = handle.outcome().await;
    // 超时按通过处理（TODO 记为 done），不走拒绝后的重置流程
    let approved = resolved.is_approved();
    ctx.emit(PhaseEvent::VerificationResolved {
        id: resolved.id.clone(),
        todo_id: todo_id.to_string(),
        approved,
        timed_out: resolved.timed_out,
    });
    let retried = apply_verdict(
        session,
        todo_id,
        approved,
        retry,
        result_text,
        resolved.feedback.as_deref(),
    )?;
    Ok(VerificationVerdict {
        todo_id: todo_id.to_string(),
        request_id: Some(resolved.id),
        approved,
        auto_approved: resolved.auto_approved,
        timed_out: resolved.timed_out,
        feedback: resolved.feedback,
        retried,
    })
}

/// 通过 → done；拒绝 → failed，允许重试且仍有次数时重置为 pending 并回到 execution。
/// 返回是否已重置。
fn apply_verdict(
    session: &mut Session,
    todo_id: &str,
    approved: bool,
    retry: bool,
    result_text: &str,
    feedback: Option<&str>,
) -> Result<bool, ErrorRecord> {
    if approved {
        session.todos.mark_complete(todo_id, result_text)?;
        session.log(true, format!("{todo_id} verified: {result_text}"));
        return Ok(false);
    }
    let reason = feedback.unwrap_or("verification rejected");
    session.todos.mark_failed(todo_id, reason)?;
    if retry && session.todos.retries_left(todo_id) > 0 {
        session.todos.reset_for_retry(todo_id)?;
        if session.phase == Phase::Verification {
            session.phase = Phase::Execution;
        }
        session.log(false, format!("{todo_id} rejected ({reason}), reset for retry"));
        return Ok(true);
    }
    session.log(false, format!("{todo_id} rejected ({reason})"));
    Ok(false)
}

fn verdict_note(v: &VerificationVerdict) -> String {
    match (v.approved, v.timed_out, v.retried) {
        (true, true, _) => format!("{} approved after verification timeout", v.todo_id),
        (true, false, _) if v.auto_approved => format!("{} auto-approved", v.todo_id),
        (true, false, _) => format!("{} approved", v.todo_id),
        (false, _, true) => format!("{} rejected, queued for retry", v.todo_id),
        (false, _, false) => format!("{} rejected", v.todo_id),
    }
}

fn handle_complete(session: &mut Session, message: &str) -> PhaseOutcome {
    let done = session.todos.list_by_status(TodoStatus::Done).len();
    let failed = session.todos.list_by_status(TodoStatus::Failed).len();
    let summary = format!(
        "Session complete: {done} done, {failed} failed, {} total",
        session.todos.len()
    );
    session.log(
        true,
        if message.trim().is_empty() {
            summary.clone()
        } else {
            format!("{summary}. {}", message.trim())
        },
    );
    tracing::info!(session = %session.id, done, failed, "session complete");
    PhaseOutcome {
        summary,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorHandler;
    use crate::observability::Metrics;
    use crate::phase::{ToolCallRequest, TodoUpdate};
    use crate::todo::TodoLimits;
    use crate::tools::{
        policy::default_blocked_patterns, Capabilities, GatewayConfig, LocalFileAdapter,
        WorkspacePolicy,
    };
    use crate::verification::{GateConfig, VerificationStatus};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        gateway: ToolGateway,
        gate: VerificationGate,
    }

    fn fixture(gate_timeout_ms: u64) -> Fixture {
        let dir = TempDir::new().unwrap();
        let policy = Arc::new(WorkspacePolicy::new(dir.path(), &default_blocked_patterns(), 1 << 20));
        let gateway = ToolGateway::new(
            Capabilities::new().with_file(Arc::new(LocalFileAdapter::new(policy.clone()))),
            policy,
            Arc::new(ErrorHandler::default()),
            Arc::new(Metrics::new()),
            GatewayConfig::default(),
        );
        let gate = VerificationGate::new(GateConfig {
            default_timeout: Duration::from_millis(gate_timeout_ms),
            ..Default::default()
        });
        Fixture {
            _dir: dir,
            gateway,
            gate,
        }
    }

    fn ctx(f: &Fixture) -> HandlerContext<'_> {
        HandlerContext {
            gateway: &f.gateway,
            gate: &f.gate,
            events: None,
        }
    }

    fn session() -> Session {
        Session::new("task", "m", "r", TodoLimits::default())
    }

    fn planned(desc: &str, id: Option<&str>) -> PlannedTodo {
        PlannedTodo {
            id: id.map(String::from),
            description: desc.into(),
            expected_result: "ok".into(),
        }
    }

    fn response(phase: Phase) -> ModelResponse {
        ModelResponse {
            phase: phase.as_str().into(),
            ..ModelResponse::fallback("")
        }
    }

    #[tokio::test]
    async fn test_planning_replaces_then_merges() {
        let f = fixture(1000);
        let mut s = session();
        let mut r = response(Phase::Planning);
        r.todos = vec![planned("a", None), planned("b", None)];
        dispatch(&ctx(&f), &mut s, Phase::Planning, &r).await.unwrap();
        assert_eq!(s.todos.len(), 2);

        // 仍未开始：整体替换
        r.todos = vec![planned("c", Some("c1"))];
        dispatch(&ctx(&f), &mut s, Phase::Planning, &r).await.unwrap();
        assert_eq!(s.todos.len(), 1);

        // 开始后：合并，已有 id 不动
        s.todos.mark_in_progress("c1").unwrap();
        r.todos = vec![planned("changed", Some("c1")), planned("d", None)];
        dispatch(&ctx(&f), &mut s, Phase::Planning, &r).await.unwrap();
        assert_eq!(s.todos.len(), 2);
        assert_eq!(s.todos.get("c1").unwrap().description, "c");
    }

    #[tokio::test]
    async fn test_planning_is_atomic() {
        let f = fixture(1000);
        let mut s = session();
        let mut r = response(Phase::Planning);
        r.todos = vec![planned("a", Some("x")), planned("", None)];
        assert!(dispatch(&ctx(&f), &mut s, Phase::Planning, &r).await.is_err());
        assert!(s.todos.is_empty());
    }

    #[tokio::test]
    async fn test_illegal_transition_keeps_phase() {
        let f = fixture(1000);
        let mut s = session();
        let err = dispatch(&ctx(&f), &mut s, Phase::Verification, &response(Phase::Verification))
            .await
            .unwrap_err();
        assert_eq!(err.code, "PHASE_TRANSITION");
        assert_eq!(s.phase, Phase::Planning);
    }

    #[tokio::test]
    async fn test_handler_error_keeps_phase() {
        let f = fixture(1000);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let ctx = HandlerContext {
            gateway: &f.gateway,
            gate: &f.gate,
            events: Some(&tx),
        };
        let mut s = session();
        let mut r = response(Phase::Execution);
        r.todo_updates = vec![TodoUpdate {
            id: "ghost".into(),
            status: TodoStatus::InProgress,
            result: None,
        }];
        let err = dispatch(&ctx, &mut s, Phase::Execution, &r).await.unwrap_err();
        assert_eq!(err.code, "TODO_NOT_FOUND");
        assert_eq!(s.phase, Phase::Planning);
        assert!(rx.try_recv().is_err(), "no phase event after a failed handler");
    }

    #[tokio::test]
    async fn test_planning_rejects_padded_duplicate_ids() {
        let f = fixture(1000);
        let mut s = session();
        let mut r = response(Phase::Planning);
        r.todos = vec![planned("a", Some("t1")), planned("b", Some(" t1"))];
        let err = dispatch(&ctx(&f), &mut s, Phase::Planning, &r).await.unwrap_err();
        assert_eq!(err.code, "TODO_DUPLICATE_ID");
        assert!(s.todos.is_empty());

        // 合并时带空白的已有 id 同样视为已存在
        r.todos = vec![planned("a", Some("t1"))];
        dispatch(&ctx(&f), &mut s, Phase::Planning, &r).await.unwrap();
        s.todos.mark_in_progress("t1").unwrap();
        r.todos = vec![planned("again", Some(" t1 ")), planned("c", Some("t2"))];
        dispatch(&ctx(&f), &mut s, Phase::Planning, &r).await.unwrap();
        let ids: Vec<&str> = s.todos.list().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["t1", "t2"]);
    }

    #[tokio::test]
    async fn test_execution_runs_tool_and_auto_approves_done() {
        let f = fixture(1000);
        let mut s = session();
        s.todos.create("create file", "file exists", Some("t1")).unwrap();
        s.phase = Phase::Execution;

        let mut r = response(Phase::Execution);
        r.tool_call = Some(ToolCallRequest {
            name: "create_file".into(),
            params: json!({"path": "test.js", "content": "1"}),
        });
        let out = dispatch(&ctx(&f), &mut s, Phase::Execution, &r).await.unwrap();
        assert!(out.tool.unwrap().success());
        let t1 = s.todos.get("t1").unwrap();
        assert_eq!(t1.status, TodoStatus::InProgress);
        assert_eq!(t1.tool_calls.len(), 1);

        let mut r = response(Phase::Execution);
        r.todo_updates = vec![TodoUpdate {
            id: "t1".into(),
            status: TodoStatus::Done,
            result: None,
        }];
        let out = dispatch(&ctx(&f), &mut s, Phase::Execution, &r).await.unwrap();
        assert!(out.verifications[0].auto_approved);
        let t1 = s.todos.get("t1").unwrap();
        assert_eq!(t1.status, TodoStatus::Done);
        assert!(t1.result.as_deref().unwrap().contains("created successfully"));
    }

    #[tokio::test]
    async fn test_explicit_rejection_resets_for_retry() {
        let f = fixture(1000);
        let mut s = session();
        s.todos.create("task", "ok", Some("t1")).unwrap();
        s.todos.mark_in_progress("t1").unwrap();
        s.phase = Phase::Execution;

        let mut r = response(Phase::Verification);
        r.verification = Some(VerificationDirective {
            todo_id: Some("t1".into()),
            approved: Some(false),
            feedback: Some("output is wrong".into()),
            retry: true,
            result: None,
        });
        let out = dispatch(&ctx(&f), &mut s, Phase::Verification, &r).await.unwrap();
        assert!(out.verifications[0].retried);
        let t1 = s.todos.get("t1").unwrap();
        assert_eq!(t1.status, TodoStatus::Pending);
        assert_eq!(t1.retry_count, 1);
        assert_eq!(s.phase, Phase::Execution);
    }

    #[tokio::test]
    async fn test_rejection_without_budget_fails() {
        let f = fixture(1000);
        let mut s = Session::new(
            "task",
            "m",
            "r",
            TodoLimits {
                max_retries: 0,
                ..Default::default()
            },
        );
        s.todos.create("task", "ok", Some("t1")).unwrap();
        s.phase = Phase::Verification;
        let mut r = response(Phase::Verification);
        r.verification = Some(VerificationDirective {
            todo_id: Some("t1".into()),
            approved: Some(false),
            retry: true,
            ..Default::default()
        });
        dispatch(&ctx(&f), &mut s, Phase::Verification, &r).await.unwrap();
        assert_eq!(s.todos.get("t1").unwrap().status, TodoStatus::Failed);
    }

    #[tokio::test]
    async fn test_gate_timeout_approves() {
        let f = fixture(50);
        let mut s = session();
        s.todos.create("task", "ok", Some("t1")).unwrap();
        s.phase = Phase::Verification;
        let mut r = response(Phase::Verification);
        r.verification = Some(VerificationDirective {
            todo_id: Some("t1".into()),
            result: Some("Command failed with error".into()),
            retry: true,
            ..Default::default()
        });
        let out = dispatch(&ctx(&f), &mut s, Phase::Verification, &r).await.unwrap();
        let v = &out.verifications[0];
        assert!(v.approved && v.timed_out);
        assert!(!v.retried);
        let t1 = s.todos.get("t1").unwrap();
        assert_eq!(t1.status, TodoStatus::Done);
        assert_eq!(t1.retry_count, 0);
        let history = f.gate.history(&Default::default());
        assert_eq!(history[0].status, VerificationStatus::Timeout);
    }

    #[tokio::test]
    async fn test_complete_logs_summary() {
        let f = fixture(1000);
        let mut s = session();
        s.phase = Phase::Execution;
        let out = dispatch(&ctx(&f), &mut s, Phase::Complete, &response(Phase::Complete))
            .await
            .unwrap();
        assert!(out.summary.starts_with("Session complete"));
        assert_eq!(s.phase, Phase::Complete);
        assert_eq!(s.execution_log.len(), 1);
    }
}
