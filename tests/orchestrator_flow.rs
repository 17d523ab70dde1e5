//! 编排器端到端测试：脚本化模型 + 临时工作区

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use taskflow::config::AppConfig;
    use taskflow::core::{ErrorCategory, ExecuteRequest, ExecutionResult, OrchestratorBuilder};
    use taskflow::llm::ScriptedTransport;
    use taskflow::phase::{Phase, PhaseEvent};
    use taskflow::todo::TodoStatus;
    use taskflow::Orchestrator;
    use tempfile::TempDir;

    fn config() -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.model.base_delay_ms = 1;
        cfg.retry.base_delay_ms = 1;
        cfg.retry.max_delay_ms = 5;
        cfg
    }

    fn request(prompt: &str, session_id: Option<&str>) -> ExecuteRequest {
        ExecuteRequest {
            model_id: "scripted".into(),
            prompt: prompt.into(),
            request_id: "it".into(),
            session_id: session_id.map(String::from),
        }
    }

    fn orchestrator(dir: &TempDir, replies: &[&str]) -> Orchestrator {
        OrchestratorBuilder::new(config(), dir.path().to_path_buf())
            .with_transport(Arc::new(ScriptedTransport::with_replies(replies.iter().copied())))
            .build()
    }

    #[tokio::test]
    async fn test_plan_execute_verify_complete() {
        let dir = TempDir::new().unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let transport = Arc::new(ScriptedTransport::with_replies([
            r#"{"type":"agent_response","phase":"planning","message":"One step",
                "todos":[{"id":"t1","description":"Create hello.txt","expectedResult":"hello.txt says hello"}]}"#,
            r#"Writing the file now:
```json
{"type":"agent_response","phase":"execution","message":"writing",
 "toolCall":{"name":"write_file","params":{"path":"hello.txt","content":"hello"}}}
```"#,
            r#"{"type":"agent_response","phase":"verification","verification":{"todoId":"t1"}}"#,
            r#"{"type":"agent_response","phase":"complete","message":"All done","complete":true}"#,
        ]));
        let orch = OrchestratorBuilder::new(config(), dir.path().to_path_buf())
            .with_transport(transport.clone())
            .with_events(tx)
            .build();

        let planned = orch.execute(request("Say hello in a file", None)).await.unwrap();
        assert_eq!(planned.phase, Phase::Planning);
        let sid = planned.session_id.clone();

        let executed = orch.execute(request("continue", Some(&sid))).await.unwrap();
        assert_eq!(executed.phase, Phase::Execution);
        assert_eq!(executed.tool_call.as_ref().unwrap().name, "write_file");
        assert!(executed.execution_result.is_success());
        assert_eq!(executed.todos[0].status, TodoStatus::InProgress);
        assert_eq!(std::fs::read_to_string(dir.path().join("hello.txt")).unwrap(), "hello");

        let verified = orch.execute(request("continue", Some(&sid))).await.unwrap();
        let verdict = verified.verification.unwrap();
        assert!(verdict.approved);
        assert!(verdict.auto_approved);
        assert_eq!(verified.todos[0].status, TodoStatus::Done);
        assert!(verified.todos[0].result.as_deref().unwrap().contains("written successfully"));

        let done = orch.execute(request("continue", Some(&sid))).await.unwrap();
        assert!(done.complete);
        assert_eq!(done.phase, Phase::Complete);
        assert_eq!(done.text, "All done");

        // 第二轮起上下文带有 TODO 与用户输入
        let sent = transport.requests();
        assert_eq!(sent.len(), 4);
        assert!(sent[1].prompt.contains("t1: Create hello.txt"));
        assert!(sent[1].prompt.ends_with("User: continue"));

        let mut changes = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let PhaseEvent::PhaseChanged { from, to } = event {
                changes.push((from, to));
            }
        }
        assert_eq!(
            changes,
            vec![
                (Phase::Planning, Phase::Execution),
                (Phase::Execution, Phase::Verification),
                (Phase::Verification, Phase::Complete),
            ]
        );

        let metrics = orch.metrics().snapshot();
        assert_eq!(metrics.turns, 4);
        assert_eq!(metrics.tools["write_file"].calls, 1);
        assert_eq!(orch.gate().statistics().auto_approved, 1);
    }

    #[tokio::test]
    async fn test_rejected_todo_returns_to_execution() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(
            &dir,
            &[
                r#"{"type":"agent_response","phase":"planning",
                    "todos":[{"id":"t1","description":"Write notes","expectedResult":"notes.md exists"}]}"#,
                r#"{"type":"agent_response","phase":"execution",
                    "toolCall":{"name":"write_file","params":{"path":"notes.txt","content":"x"}}}"#,
                r#"{"type":"agent_response","phase":"verification",
                    "verification":{"todoId":"t1","approved":false,"feedback":"wrong file name"}}"#,
            ],
        );
        let sid = orch.execute(request("notes", None)).await.unwrap().session_id;
        orch.execute(request("go", Some(&sid))).await.unwrap();
        let resp = orch.execute(request("check", Some(&sid))).await.unwrap();

        assert_eq!(resp.phase, Phase::Execution);
        let verdict = resp.verification.unwrap();
        assert!(!verdict.approved);
        assert!(verdict.retried);
        let todo = &resp.todos[0];
        assert_eq!(todo.status, TodoStatus::Pending);
        assert_eq!(todo.retry_count, 1);
    }

    #[tokio::test]
    async fn test_path_escape_is_a_turn_failure_not_fatal() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(
            &dir,
            &[r#"{"type":"agent_response","phase":"execution",
                 "toolCall":{"name":"read_file","params":{"path":"../../etc/passwd"}}}"#],
        );
        let resp = orch.execute(request("peek", None)).await.unwrap();
        match resp.execution_result {
            ExecutionResult::Failure { error, tool } => {
                assert_eq!(error.category, ErrorCategory::Permission);
                assert!(!tool.unwrap().success());
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(!resp.complete);
    }

    #[tokio::test]
    async fn test_wrong_response_type_is_fatal() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir, &[r#"{"type":"chat","phase":"planning"}"#]);
        let err = orch.execute(request("anything", None)).await.unwrap_err();
        assert_eq!(err.code, "INVALID_RESPONSE_TYPE");
        assert_eq!(err.category, ErrorCategory::Validation);
        assert_eq!(orch.errors().statistics().total, 1);
    }

    #[tokio::test]
    async fn test_exhausted_script_echoes_completion() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir, &[]);
        let resp = orch.execute(request("nothing scripted", None)).await.unwrap();
        assert!(resp.complete);
        assert!(resp.text.contains("echo: nothing scripted"));
    }
}
