//! 校验闸门
//!
//! TODO 完成前的审批点：结果文本命中自动审批启发式时立即通过；否则挂起，
//! 等待 resolve（用户决定）或超时（安全阀，按通过处理）。每个请求只会被结算一次：
//! 结算时从挂起表中移除、取消超时任务、写入历史，并通过 oneshot 通知等待方。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::heuristics::should_auto_approve;
use super::history::{HistoryQuery, VerificationHistory, VerificationStatistics};
use crate::core::ErrorRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Pending,
    Approved,
    Rejected,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationRequest {
    pub id: String,
    pub todo_id: String,
    pub session_id: Option<String>,
    pub result_text: String,
    pub created_at: DateTime<Utc>,
    pub status: VerificationStatus,
    pub feedback: Option<String>,
    pub timeout_ms: u64,
    pub auto_approved: bool,
    pub timed_out: bool,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl VerificationRequest {
    /// 超时视为通过
    pub fn is_approved(&self) -> bool {
        matches!(
            self.status,
            VerificationStatus::Approved | VerificationStatus::Timeout
        )
    }

    pub fn is_pending(&self) -> bool {
        self.status == VerificationStatus::Pending
    }
}

#[derive(Debug, Clone)]
pub struct GateConfig {
    pub default_timeout: Duration,
    pub auto_approval: bool,
    pub max_pending: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            auto_approval: true,
            max_pending: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VerificationOptions {
    pub timeout: Duration,
    pub allow_auto_approval: bool,
    pub session_id: Option<String>,
}

/// 结算方式
enum Resolution {
    Decided {
        approved: bool,
        feedback: Option<String>,
    },
    TimedOut,
}

struct PendingEntry {
    request: VerificationRequest,
    tx: oneshot::Sender<VerificationRequest>,
    cancel: CancellationToken,
}

struct GateInner {
    config: GateConfig,
    pending: Mutex<HashMap<String, PendingEntry>>,
    history: Mutex<VerificationHistory>,
}

/// 可克隆的闸门句柄（内部共享状态）
#[derive(Clone)]
pub struct VerificationGate {
    inner: Arc<GateInner>,
}

/// 一次校验请求的等待句柄
pub struct VerificationHandle {
    request: VerificationRequest,
    rx: oneshot::Receiver<VerificationRequest>,
}

impl VerificationHandle {
    /// 创建时的快照（自动通过时已是结算状态）
    pub fn request(&self) -> &VerificationRequest {
        &self.request
    }

    pub fn id(&self) -> &str {
        &self.request.id
    }

    /// 等待结算结果
    pub async fn outcome(self) -> VerificationRequest {
        let fallback = self.request.clone();
        match self.rx.await {
            Ok(resolved) => resolved,
            Err(_) => VerificationRequest {
                status: VerificationStatus::Rejected,
                feedback: Some("verification gate dropped".to_string()),
                resolved_at: Some(Utc::now()),
                ..fallback
            },
        }
    }
}

impl VerificationGate {
    pub fn new(config: GateConfig) -> Self {
        Self {
            inner: Arc::new(GateInner {
                config,
                pending: Mutex::new(HashMap::new()),
                history: Mutex::new(VerificationHistory::new()),
            }),
        }
    }

    pub fn config(&self) -> &GateConfig {
        &self.inner.config
    }

    /// 按闸门配置生成默认选项
    pub fn default_options(&self, session_id: Option<String>) -> VerificationOptions {
        VerificationOptions {
            timeout: self.inner.config.default_timeout,
            allow_auto_approval: self.inner.config.auto_approval,
            session_id,
        }
    }

    pub fn request(
        &self,
        todo_id: &str,
        result_text: &str,
        options: VerificationOptions,
    ) -> Result<VerificationHandle, ErrorRecord> {
        if todo_id.trim().is_empty() {
            return Err(ErrorRecord::validation("Verification requires a TODO id")
                .with_code("VERIFICATION_INVALID"));
        }
        let mut request = VerificationRequest {
            id: format!("verify_{}", uuid::Uuid::new_v4()),
            todo_id: todo_id.to_string(),
            session_id: options.session_id.clone(),
            result_text: result_text.to_string(),
            created_at: Utc::now(),
            status: VerificationStatus::Pending,
            feedback: None,
            timeout_ms: options.timeout.as_millis() as u64,
            auto_approved: false,
            timed_out: false,
            resolved_at: None,
        };
        let (tx, rx) = oneshot::channel();

        if options.allow_auto_approval && should_auto_approve(result_text) {
            request.status = VerificationStatus::Approved;
            request.auto_approved = true;
            request.feedback = Some("auto-approved".to_string());
            request.resolved_at = Some(Utc::now());
            tracing::info!(todo = %todo_id, id = %request.id, "verification auto-approved");
            self.push_history(request.clone());
            let _ = tx.send(request.clone());
            return Ok(VerificationHandle { request, rx });
        }

        let cancel = CancellationToken::new();
        {
            let mut pending = self.lock_pending()?;
            if pending.len() >= self.inner.config.max_pending {
                return Err(ErrorRecord::validation(format!(
                    "Too many pending verifications (limit {})",
                    self.inner.config.max_pending
                ))
                .with_code("VERIFICATION_LIMIT")
                .with_suggestion("Resolve pending verifications before requesting more")
                .non_retryable());
            }
            pending.insert(
                request.id.clone(),
                PendingEntry {
                    request: request.clone(),
                    tx,
                    cancel: cancel.clone(),
                },
            );
        }
        tracing::info!(
            todo = %todo_id,
            id = %request.id,
            timeout_ms = request.timeout_ms,
            "verification pending"
        );
        self.schedule_timeout(request.id.clone(), options.timeout, cancel);
        Ok(VerificationHandle { request, rx })
    }

    fn schedule_timeout(&self, id: String, timeout: Duration, cancel: CancellationToken) {
        let gate: Weak<GateInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    if let Some(inner) = gate.upgrade() {
                        let gate = VerificationGate { inner };
                        if gate.finish(&id, Resolution::TimedOut).is_some() {
                            tracing::warn!(id = %id, "verification timed out, treated as approved");
                        }
                    }
                }
            }
        });
    }

    /// 用户决定；未知或已结算的 id 返回 VERIFICATION_NOT_FOUND
    pub fn resolve(
        &self,
        id: &str,
        approved: bool,
        feedback: Option<String>,
    ) -> Result<VerificationRequest, ErrorRecord> {
        self.finish(id, Resolution::Decided { approved, feedback })
            .ok_or_else(|| {
                ErrorRecord::validation(format!("No pending verification '{id}'"))
                    .with_code("VERIFICATION_NOT_FOUND")
                    .with_context("verification_id", id)
            })
    }

    /// 把会话内全部挂起请求按拒绝结算，返回结算数量
    pub fn cancel_session(&self, session_id: &str) -> usize {
        let ids: Vec<String> = match self.inner.pending.lock() {
            Ok(pending) => pending
                .values()
                .filter(|e| e.request.session_id.as_deref() == Some(session_id))
                .map(|e| e.request.id.clone())
                .collect(),
            Err(_) => return 0,
        };
        ids.iter()
            .filter(|id| {
                self.finish(
                    id,
                    Resolution::Decided {
                        approved: false,
                        feedback: Some("session terminated".to_string()),
                    },
                )
                .is_some()
            })
            .count()
    }

    /// 结算：只有仍在挂起表中的请求会被处理，保证恰好一次
    fn finish(&self, id: &str, resolution: Resolution) -> Option<VerificationRequest> {
        let entry = self.inner.pending.lock().ok()?.remove(id)?;
        entry.cancel.cancel();
        let mut request = entry.request;
        match resolution {
            Resolution::Decided { approved, feedback } => {
                request.status = if approved {
                    VerificationStatus::Approved
                } else {
                    VerificationStatus::Rejected
                };
                request.feedback = feedback;
            }
            Resolution::TimedOut => {
                request.status = VerificationStatus::Timeout;
                request.timed_out = true;
                request.auto_approved = true;
                request.feedback = Some("timed out, auto-approved".to_string());
            }
        }
        request.resolved_at = Some(Utc::now());
        tracing::info!(
            id = %request.id,
            todo = %request.todo_id,
            status = ?request.status,
            "verification resolved"
        );
        self.push_history(request.clone());
        let _ = entry.tx.send(request.clone());
        Some(request)
    }

    fn lock_pending(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, PendingEntry>>, ErrorRecord> {
        self.inner.pending.lock().map_err(|_| {
            ErrorRecord::system("Verification state poisoned").with_code("VERIFICATION_STATE")
        })
    }

    fn push_history(&self, request: VerificationRequest) {
        if let Ok(mut history) = self.inner.history.lock() {
            history.push(request);
        }
    }

    pub fn pending(&self) -> Vec<VerificationRequest> {
        self.inner
            .pending
            .lock()
            .map(|p| p.values().map(|e| e.request.clone()).collect())
            .unwrap_or_default()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// 挂起中或历史中的请求
    pub fn get(&self, id: &str) -> Option<VerificationRequest> {
        if let Some(e) = self.inner.pending.lock().ok()?.get(id) {
            return Some(e.request.clone());
        }
        self.inner.history.lock().ok()?.find(id).cloned()
    }

    pub fn history(&self, query: &HistoryQuery) -> Vec<VerificationRequest> {
        self.inner
            .history
            .lock()
            .map(|h| h.query(query))
            .unwrap_or_default()
    }

    pub fn statistics(&self) -> VerificationStatistics {
        let pending = self.pending_count();
        self.inner
            .history
            .lock()
            .map(|h| h.statistics(pending))
            .unwrap_or_default()
    }
}
