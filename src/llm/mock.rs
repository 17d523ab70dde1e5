//! 脚本化传输（用于测试与无 API Key 的本地运行）
//!
//! 按顺序返回预置回复；队列耗尽后回显一个 complete 响应，便于本地跑通流程。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::core::ErrorRecord;
use crate::llm::{ModelReply, ModelRequest, ModelTransport};

#[derive(Debug, Default)]
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<Result<ModelReply, ErrorRecord>>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let t = Self::new();
        for r in replies {
            t.push_text(r);
        }
        t
    }

    pub fn push_text(&self, text: impl Into<String>) {
        self.push(Ok(ModelReply::Text(text.into())));
    }

    pub fn push(&self, reply: Result<ModelReply, ErrorRecord>) {
        if let Ok(mut q) = self.replies.lock() {
            q.push_back(reply);
        }
    }

    /// 已收到的请求（按顺序）
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().map(|q| q.len()).unwrap_or(0)
    }
}

fn echo(request: &ModelRequest) -> ModelReply {
    let task = request
        .prompt
        .lines()
        .find_map(|l| l.strip_prefix("Task: "))
        .unwrap_or("(no task)");
    ModelReply::Raw(serde_json::json!({
        "type": "agent_response",
        "phase": "complete",
        "message": format!("No model configured; echo: {task}"),
        "complete": true,
    }))
}

#[async_trait]
impl ModelTransport for ScriptedTransport {
    async fn send(&self, request: ModelRequest) -> Result<ModelReply, ErrorRecord> {
        let next = self.replies.lock().ok().and_then(|mut q| q.pop_front());
        let reply = next.unwrap_or_else(|| Ok(echo(&request)));
        if let Ok(mut r) = self.requests.lock() {
            r.push(request);
        }
        reply
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(prompt: &str) -> ModelRequest {
        ModelRequest {
            model_id: "m".into(),
            system: String::new(),
            prompt: prompt.into(),
            mode: crate::llm::AGENT_MODE.into(),
            session_id: None,
        }
    }

    #[tokio::test]
    async fn test_scripted_then_echo() {
        let t = ScriptedTransport::with_replies(["first"]);
        assert_eq!(t.send(req("x")).await.unwrap(), ModelReply::Text("first".into()));
        match t.send(req("Task: ship it\nCurrent phase: planning")).await.unwrap() {
            ModelReply::Raw(v) => {
                assert_eq!(v["phase"], "complete");
                assert!(v["message"].as_str().unwrap().contains("ship it"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(t.requests().len(), 2);
    }
}
