//! 会话数据

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::phase::Phase;
use crate::todo::{Todo, TodoLimits, TodoManager};

/// 会话 ID（`session_<uuid>`）
pub type SessionId = String;

/// 执行日志条目（只追加）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionLogEntry {
    pub timestamp: DateTime<Utc>,
    pub turn: u32,
    pub phase: Phase,
    pub success: bool,
    pub message: String,
}

/// 单个任务会话
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub original_task: String,
    pub model_id: String,
    /// 创建该会话的请求 ID
    pub request_id: String,
    pub phase: Phase,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub todos: TodoManager,
    pub execution_log: Vec<ExecutionLogEntry>,
    pub turn: u32,
    last_active: Instant,
}

/// 可序列化的会话快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub original_task: String,
    pub model_id: String,
    pub request_id: String,
    pub phase: Phase,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub todos: Vec<Todo>,
    pub execution_log: Vec<ExecutionLogEntry>,
    pub turn: u32,
}

/// 会话可更新字段
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    pub phase: Option<Phase>,
    pub model_id: Option<String>,
}

impl Session {
    pub fn new(task: &str, model_id: &str, request_id: &str, limits: TodoLimits) -> Self {
        let now = Utc::now();
        Self {
            id: format!("session_{}", uuid::Uuid::new_v4()),
            original_task: task.trim().to_string(),
            model_id: model_id.to_string(),
            request_id: request_id.to_string(),
            phase: Phase::Planning,
            created_at: now,
            last_activity_at: now,
            todos: TodoManager::new(limits),
            execution_log: Vec::new(),
            turn: 0,
            last_active: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
        self.last_active = Instant::now();
    }

    pub fn is_expired(&self, idle_timeout: Duration) -> bool {
        self.last_active.elapsed() > idle_timeout
    }

    pub fn apply(&mut self, update: SessionUpdate) {
        if let Some(phase) = update.phase {
            self.phase = phase;
        }
        if let Some(model_id) = update.model_id {
            self.model_id = model_id;
        }
        self.touch();
    }

    /// 追加日志（使用当前轮次与阶段）
    pub fn log(&mut self, success: bool, message: impl Into<String>) {
        self.execution_log.push(ExecutionLogEntry {
            timestamp: Utc::now(),
            turn: self.turn,
            phase: self.phase,
            success,
            message: message.into(),
        });
        self.touch();
    }

    /// 构建上下文提示：任务、阶段、TODO 列表、最近 N 条日志
    pub fn context_prompt(&self, recent_entries: usize) -> String {
        let mut out = format!(
            "Task: {}\nCurrent phase: {} (turn {})\n",
            self.original_task, self.phase, self.turn
        );
        if self.todos.is_empty() {
            out.push_str("\nTODOs: none yet\n");
        } else {
            out.push_str("\nTODOs:\n");
            for t in self.todos.list() {
                out.push_str(&format!(
                    "- [{}] {}: {} (expected: {})",
                    t.status.as_str(),
                    t.id,
                    t.description,
                    t.expected_result
                ));
                if let Some(result) = &t.result {
                    out.push_str(&format!(" -> {result}"));
                }
                if t.retry_count > 0 {
                    out.push_str(&format!(" [retries: {}]", t.retry_count));
                }
                out.push('\n');
            }
        }
        let skip = self.execution_log.len().saturating_sub(recent_entries);
        let recent: Vec<&ExecutionLogEntry> = self.execution_log.iter().skip(skip).collect();
        if !recent.is_empty() {
            out.push_str("\nRecent activity:\n");
            for e in recent {
                out.push_str(&format!(
                    "- [turn {}][{}] {}: {}\n",
                    e.turn,
                    e.phase,
                    if e.success { "ok" } else { "failed" },
                    e.message
                ));
            }
        }
        out
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            original_task: self.original_task.clone(),
            model_id: self.model_id.clone(),
            request_id: self.request_id.clone(),
            phase: self.phase,
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
            todos: self.todos.export(),
            execution_log: self.execution_log.clone(),
            turn: self.turn,
        }
    }
}
