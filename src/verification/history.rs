//! 校验历史：只追加，支持按 TODO / 状态查询与统计

use serde::Serialize;

use super::gate::{VerificationRequest, VerificationStatus};

/// 查询条件；limit 取最新的若干条
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub todo_id: Option<String>,
    pub status: Option<VerificationStatus>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationStatistics {
    pub total: usize,
    pub approved: usize,
    pub rejected: usize,
    pub timed_out: usize,
    pub auto_approved: usize,
    pub pending: usize,
    /// (approved + timeout) / total
    pub approval_rate: f64,
    pub auto_approval_rate: f64,
    pub mean_resolution_ms: f64,
}

#[derive(Debug, Default)]
pub struct VerificationHistory {
    entries: Vec<VerificationRequest>,
}

impl VerificationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, request: VerificationRequest) {
        self.entries.push(request);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn find(&self, id: &str) -> Option<&VerificationRequest> {
        self.entries.iter().find(|r| r.id == id)
    }

    pub fn query(&self, q: &HistoryQuery) -> Vec<VerificationRequest> {
        let matched: Vec<&VerificationRequest> = self
            .entries
            .iter()
            .filter(|r| q.todo_id.as_deref().map_or(true, |t| r.todo_id == t))
            .filter(|r| q.status.map_or(true, |s| r.status == s))
            .collect();
        let skip = q
            .limit
            .map_or(0, |limit| matched.len().saturating_sub(limit));
        matched.into_iter().skip(skip).cloned().collect()
    }

    pub fn statistics(&self, pending: usize) -> VerificationStatistics {
        let mut stats = VerificationStatistics {
            total: self.entries.len(),
            pending,
            ..Default::default()
        };
        let mut latency_sum = 0i64;
        let mut latency_n = 0i64;
        for r in &self.entries {
            match r.status {
                VerificationStatus::Approved => stats.approved += 1,
                VerificationStatus::Rejected => stats.rejected += 1,
                VerificationStatus::Timeout => stats.timed_out += 1,
                VerificationStatus::Pending => {}
            }
            if r.auto_approved {
                stats.auto_approved += 1;
            }
            if let Some(done) = r.resolved_at {
                latency_sum += (done - r.created_at).num_milliseconds().max(0);
                latency_n += 1;
            }
        }
        if stats.total > 0 {
            let total = stats.total as f64;
            stats.approval_rate = (stats.approved + stats.timed_out) as f64 / total;
            stats.auto_approval_rate = stats.auto_approved as f64 / total;
        }
        if latency_n > 0 {
            stats.mean_resolution_ms = latency_sum as f64 / latency_n as f64;
        }
        stats
    }
}
