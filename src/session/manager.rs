//! 会话管理
//!
//! 会话表是共享可变结构：外层 RwLock 保护插入 / 查找 / 删除，
//! 每个会话再由自己的 Mutex 保护，一轮执行期间持有该会话的锁。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::types::{ExecutionLogEntry, Session, SessionId, SessionSnapshot, SessionUpdate};
use crate::core::ErrorRecord;
use crate::todo::TodoLimits;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_sessions: usize,
    pub idle_timeout: Duration,
    /// 上下文提示中保留的最近日志条数
    pub context_log_entries: usize,
    pub todo_limits: TodoLimits,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 100,
            idle_timeout: Duration::from_secs(3600),
            context_log_entries: 10,
            todo_limits: TodoLimits::default(),
        }
    }
}

pub type SessionHandle = Arc<Mutex<Session>>;

/// 会话管理器
pub struct SessionManager {
    sessions: RwLock<HashMap<SessionId, SessionHandle>>,
    config: SessionConfig,
}

fn not_found(id: &str) -> ErrorRecord {
    ErrorRecord::validation(format!("Session '{id}' not found"))
        .with_code("SESSION_NOT_FOUND")
        .with_context("session_id", id)
        .with_suggestion("Start a new session by omitting the session id")
        .non_retryable()
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// 创建会话，返回会话 ID
    pub async fn create_session(
        &self,
        task: &str,
        model_id: &str,
        request_id: &str,
    ) -> Result<SessionId, ErrorRecord> {
        if task.trim().is_empty() {
            return Err(ErrorRecord::validation("Task must not be empty").with_code("SESSION_INVALID"));
        }
        if model_id.trim().is_empty() {
            return Err(
                ErrorRecord::validation("Model id must not be empty").with_code("SESSION_INVALID")
            );
        }
        if request_id.trim().is_empty() {
            return Err(
                ErrorRecord::validation("Request id must not be empty").with_code("SESSION_INVALID")
            );
        }
        let mut sessions = self.sessions.write().await;
        if sessions.len() >= self.config.max_sessions {
            return Err(ErrorRecord::system(format!(
                "Session limit reached ({})",
                self.config.max_sessions
            ))
            .with_code("SESSION_LIMIT")
            .with_suggestion("Stop idle sessions or wait for them to expire")
            .non_retryable());
        }
        let session = Session::new(task, model_id, request_id, self.config.todo_limits);
        let id = session.id.clone();
        sessions.insert(id.clone(), Arc::new(Mutex::new(session)));
        tracing::info!(session = %id, model = %model_id, "session created");
        Ok(id)
    }

    pub async fn get_session(&self, id: &str) -> Option<SessionHandle> {
        self.sessions.read().await.get(id).cloned()
    }

    async fn require(&self, id: &str) -> Result<SessionHandle, ErrorRecord> {
        self.get_session(id).await.ok_or_else(|| not_found(id))
    }

    pub async fn snapshot(&self, id: &str) -> Option<SessionSnapshot> {
        let handle = self.get_session(id).await?;
        let session = handle.lock().await;
        Some(session.snapshot())
    }

    pub async fn update_session(&self, id: &str, update: SessionUpdate) -> Result<(), ErrorRecord> {
        let handle = self.require(id).await?;
        handle.lock().await.apply(update);
        Ok(())
    }

    pub async fn add_execution_log_entry(
        &self,
        id: &str,
        success: bool,
        message: &str,
    ) -> Result<ExecutionLogEntry, ErrorRecord> {
        let handle = self.require(id).await?;
        let mut session = handle.lock().await;
        session.log(success, message);
        session
            .execution_log
            .last()
            .cloned()
            .ok_or_else(|| ErrorRecord::system("Execution log append failed"))
    }

    pub async fn build_context_prompt(&self, id: &str) -> Result<String, ErrorRecord> {
        let handle = self.require(id).await?;
        let session = handle.lock().await;
        Ok(session.context_prompt(self.config.context_log_entries))
    }

    pub async fn remove_session(&self, id: &str) -> bool {
        let removed = self.sessions.write().await.remove(id).is_some();
        if removed {
            tracing::info!(session = %id, "session removed");
        }
        removed
    }

    /// 清理空闲超时的会话；正在执行（锁被占用）的会话跳过
    pub async fn clear_expired(&self) -> Vec<SessionId> {
        let mut sessions = self.sessions.write().await;
        let expired: Vec<SessionId> = sessions
            .iter()
            .filter(|(_, s)| {
                s.try_lock()
                    .map(|s| s.is_expired(self.config.idle_timeout))
                    .unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            sessions.remove(id);
        }
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "expired sessions cleared");
        }
        expired
    }

    /// 后台定期清理，直到 token 被取消
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.clear_expired().await;
                    }
                }
            }
            tracing::debug!("session sweeper stopped");
        })
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.read().await.keys().cloned().collect()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorCategory;
    use crate::phase::Phase;

    fn manager(max_sessions: usize, idle_ms: u64) -> SessionManager {
        SessionManager::new(SessionConfig {
            max_sessions,
            idle_timeout: Duration::from_millis(idle_ms),
            context_log_entries: 2,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_create_and_limit() {
        let m = manager(1, 60_000);
        let id = m.create_session("build a thing", "gpt-4o", "req-1").await.unwrap();
        assert!(id.starts_with("session_"));
        let err = m.create_session("another", "gpt-4o", "req-2").await.unwrap_err();
        assert_eq!(err.code, "SESSION_LIMIT");
        assert!(!err.retryable);
        for (task, model, request) in [(" ", "m", "r"), ("t", "", "r"), ("t", "m", ""), ("t", "m", "  ")] {
            let err = m.create_session(task, model, request).await.unwrap_err();
            assert_eq!(err.code, "SESSION_INVALID");
            assert_eq!(err.category, ErrorCategory::Validation);
        }
        assert_eq!(m.active_count().await, 1);
    }

    #[tokio::test]
    async fn test_update_and_context_prompt() {
        let m = manager(10, 60_000);
        let id = m.create_session("write hello.txt", "m", "r").await.unwrap();
        {
            let handle = m.get_session(&id).await.unwrap();
            let mut s = handle.lock().await;
            s.todos.create("Create hello.txt", "file exists", None).unwrap();
        }
        m.update_session(
            &id,
            SessionUpdate {
                phase: Some(Phase::Execution),
                model_id: None,
            },
        )
        .await
        .unwrap();
        for i in 0..3 {
            m.add_execution_log_entry(&id, true, &format!("step {i}")).await.unwrap();
        }
        let prompt = m.build_context_prompt(&id).await.unwrap();
        assert!(prompt.contains("Task: write hello.txt"));
        assert!(prompt.contains("Current phase: execution"));
        assert!(prompt.contains("[pending] todo_1: Create hello.txt"));
        // 只保留最近两条
        assert!(!prompt.contains("step 0"));
        assert!(prompt.contains("step 2"));

        let snap = m.snapshot(&id).await.unwrap();
        assert_eq!(snap.execution_log.len(), 3);
        assert_eq!(snap.phase, Phase::Execution);
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let m = manager(10, 60_000);
        let err = m.build_context_prompt("session_missing").await.unwrap_err();
        assert_eq!(err.code, "SESSION_NOT_FOUND");
        assert!(!m.remove_session("session_missing").await);
    }

    #[tokio::test]
    async fn test_clear_expired_skips_busy_sessions() {
        let m = manager(10, 20);
        let idle = m.create_session("idle", "m", "r").await.unwrap();
        let busy = m.create_session("busy", "m", "r").await.unwrap();
        let handle = m.get_session(&busy).await.unwrap();
        let _guard = handle.lock().await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        let evicted = m.clear_expired().await;
        assert_eq!(evicted, vec![idle]);
        assert_eq!(m.active_count().await, 1);
    }

    #[tokio::test]
    async fn test_sweeper_evicts_and_stops() {
        let m = Arc::new(manager(10, 10));
        m.create_session("t", "m", "r").await.unwrap();
        let token = CancellationToken::new();
        let task = m.spawn_sweeper(Duration::from_millis(20), token.clone());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(m.active_count().await, 0);
        token.cancel();
        task.await.unwrap();
    }
}
