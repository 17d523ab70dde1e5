//! 重试引擎与错误日志
//!
//! ErrorHandler 显式构造、按 Arc 注入（无全局单例）：
//! - execute_with_retry：失败后分类、按类别白名单与次数判断是否重试，按退避策略等待
//! - 所有处理过的错误追加到有界日志（超过上限后裁剪到保留量），用于统计

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::core::{ErrorCategory, ErrorClassifier, ErrorRecord, Severity};

/// 退避策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    #[default]
    Exponential,
    Linear,
    Fixed,
}

/// 单次重试策略：最大尝试次数、基础 / 最大延迟、退避策略、可重试类别白名单
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// None 表示只看错误自身的 retryable 标记
    pub retryable_categories: Option<Vec<ErrorCategory>>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            strategy: BackoffStrategy::Exponential,
            retryable_categories: None,
        }
    }
}

impl RetryPolicy {
    /// 只执行一次，不重试（终端 / 交互类工具）
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_delays(mut self, base: Duration, max: Duration) -> Self {
        self.base_delay = base;
        self.max_delay = max;
        self
    }

    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_categories(mut self, categories: &[ErrorCategory]) -> Self {
        self.retryable_categories = Some(categories.to_vec());
        self
    }
}

/// 计算第 attempt 次失败后的等待时长（attempt 从 1 开始），含最多 20% 抖动，总量不超过 max_delay
pub fn calculate_delay(attempt: u32, policy: &RetryPolicy) -> Duration {
    let attempt = attempt.max(1);
    let base = policy.base_delay.as_millis() as u64;
    let max = policy.max_delay.as_millis() as u64;
    let raw = match policy.strategy {
        BackoffStrategy::Exponential => {
            let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
            base.saturating_mul(factor)
        }
        BackoffStrategy::Linear => base.saturating_mul(attempt as u64),
        BackoffStrategy::Fixed => base,
    }
    .min(max);
    let jitter_span = raw / 5;
    let jitter = if jitter_span > 0 {
        rand::thread_rng().gen_range(0..jitter_span)
    } else {
        0
    };
    Duration::from_millis(raw.saturating_add(jitter).min(max))
}

/// 能被转换为 ErrorRecord 的失败类型（execute_with_retry 的操作错误）
pub trait IntoErrorRecord {
    fn into_record(self, classifier: &ErrorClassifier) -> ErrorRecord;
}

impl IntoErrorRecord for ErrorRecord {
    fn into_record(self, _classifier: &ErrorClassifier) -> ErrorRecord {
        self
    }
}

impl IntoErrorRecord for anyhow::Error {
    fn into_record(self, classifier: &ErrorClassifier) -> ErrorRecord {
        classifier.classify(&self)
    }
}

impl IntoErrorRecord for std::io::Error {
    fn into_record(self, classifier: &ErrorClassifier) -> ErrorRecord {
        classifier.classify_io(&self)
    }
}

impl IntoErrorRecord for String {
    fn into_record(self, classifier: &ErrorClassifier) -> ErrorRecord {
        classifier.classify_message(&self, None)
    }
}

/// 错误日志容量
#[derive(Debug, Clone, Copy)]
pub struct ErrorLogLimits {
    pub cap: usize,
    pub trim_to: usize,
}

impl Default for ErrorLogLimits {
    fn default() -> Self {
        Self {
            cap: 1000,
            trim_to: 500,
        }
    }
}

/// 错误统计
#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorStatistics {
    pub total: usize,
    pub retryable: usize,
    pub by_category: BTreeMap<ErrorCategory, usize>,
    pub by_severity: BTreeMap<Severity, usize>,
}

/// 错误处理器：分类、判断可重试、带退避的重试执行、有界错误日志
#[derive(Debug)]
pub struct ErrorHandler {
    classifier: ErrorClassifier,
    limits: ErrorLogLimits,
    log: Mutex<VecDeque<ErrorRecord>>,
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::new(ErrorLogLimits::default())
    }
}

impl ErrorHandler {
    pub fn new(limits: ErrorLogLimits) -> Self {
        let limits = ErrorLogLimits {
            cap: limits.cap.max(1),
            trim_to: limits.trim_to.min(limits.cap.max(1)),
        };
        Self {
            classifier: ErrorClassifier::new(),
            limits,
            log: Mutex::new(VecDeque::new()),
        }
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    /// 分类并记录
    pub fn handle(&self, err: &anyhow::Error) -> ErrorRecord {
        let rec = self.classifier.classify(err);
        self.record(&rec);
        rec
    }

    /// 记录一条已分类的错误；超过上限时只保留最新的 trim_to 条
    pub fn record(&self, rec: &ErrorRecord) {
        let Ok(mut log) = self.log.lock() else {
            return;
        };
        log.push_back(rec.clone());
        if log.len() > self.limits.cap {
            let drop_n = log.len() - self.limits.trim_to;
            log.drain(..drop_n);
        }
    }

    pub fn is_retryable(&self, rec: &ErrorRecord, categories: Option<&[ErrorCategory]>) -> bool {
        if !rec.retryable {
            return false;
        }
        match categories {
            Some(allowed) => allowed.contains(&rec.category),
            None => true,
        }
    }

    /// 带重试执行异步操作。operation 接收当前尝试序号（从 1 开始）。
    pub async fn execute_with_retry<T, E, F, Fut>(
        &self,
        policy: &RetryPolicy,
        mut operation: F,
    ) -> Result<T, ErrorRecord>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: IntoErrorRecord,
    {
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    let rec = e.into_record(&self.classifier);
                    self.record(&rec);
                    let retry = attempt < max_attempts
                        && self.is_retryable(&rec, policy.retryable_categories.as_deref());
                    if !retry {
                        return Err(rec.with_context("attempts", attempt.to_string()));
                    }
                    let delay = calculate_delay(attempt, policy);
                    tracing::warn!(
                        attempt,
                        max_attempts,
                        category = %rec.category,
                        delay_ms = delay.as_millis() as u64,
                        error = %rec.message,
                        "operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    pub fn log_len(&self) -> usize {
        self.log.lock().map(|l| l.len()).unwrap_or(0)
    }

    /// 最近 n 条错误（新的在后）
    pub fn recent(&self, n: usize) -> Vec<ErrorRecord> {
        self.log
            .lock()
            .map(|l| l.iter().skip(l.len().saturating_sub(n)).cloned().collect())
            .unwrap_or_default()
    }

    pub fn statistics(&self) -> ErrorStatistics {
        let Ok(log) = self.log.lock() else {
            return ErrorStatistics::default();
        };
        let mut stats = ErrorStatistics {
            total: log.len(),
            ..Default::default()
        };
        for rec in log.iter() {
            *stats.by_category.entry(rec.category).or_default() += 1;
            *stats.by_severity.entry(rec.severity).or_default() += 1;
            if rec.retryable {
                stats.retryable += 1;
            }
        }
        stats
    }

    pub fn clear(&self) {
        if let Ok(mut log) = self.log.lock() {
            log.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(max_attempts)
            .with_delays(Duration::from_millis(1), Duration::from_millis(5))
    }

    #[test]
    fn test_exponential_delay_ranges() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let d1 = calculate_delay(1, &policy).as_millis();
            let d2 = calculate_delay(2, &policy).as_millis();
            let d3 = calculate_delay(3, &policy).as_millis();
            assert!((1000..1200).contains(&d1), "d1={d1}");
            assert!((2000..2400).contains(&d2), "d2={d2}");
            assert!((4000..4800).contains(&d3), "d3={d3}");
        }
        assert_eq!(calculate_delay(10, &policy), Duration::from_millis(10_000));
        assert_eq!(calculate_delay(64, &policy), Duration::from_millis(10_000));
    }

    #[test]
    fn test_linear_and_fixed_delay() {
        let linear = RetryPolicy::default().with_strategy(BackoffStrategy::Linear);
        let d3 = calculate_delay(3, &linear).as_millis();
        assert!((3000..3600).contains(&d3));
        let fixed = RetryPolicy::default().with_strategy(BackoffStrategy::Fixed);
        let d5 = calculate_delay(5, &fixed).as_millis();
        assert!((1000..1200).contains(&d5));
    }

    #[tokio::test]
    async fn test_validation_runs_once() {
        let handler = ErrorHandler::default();
        let calls = AtomicU32::new(0);
        let result: Result<(), ErrorRecord> = handler
            .execute_with_retry(&fast_policy(5), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ErrorRecord::validation("missing field `path`")) }
            })
            .await;
        let err = result.unwrap_err();
        assert_eq!(err.category, ErrorCategory::Validation);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.context.get("attempts").map(String::as_str), Some("1"));
    }

    #[tokio::test]
    async fn test_network_succeeds_on_third_attempt() {
        let handler = ErrorHandler::default();
        let calls = AtomicU32::new(0);
        let result = handler
            .execute_with_retry(&fast_policy(5), |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err("connect ECONNREFUSED 10.0.0.1:80".to_string())
                    } else {
                        Ok("payload")
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), "payload");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(handler.statistics().by_category[&ErrorCategory::Network], 2);
    }

    #[tokio::test]
    async fn test_category_allow_list_blocks_retry() {
        let handler = ErrorHandler::default();
        let calls = AtomicU32::new(0);
        let policy = fast_policy(4).with_categories(&[ErrorCategory::Timeout]);
        let result: Result<(), ErrorRecord> = handler
            .execute_with_retry(&policy, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("socket hang up".to_string()) }
            })
            .await;
        assert_eq!(result.unwrap_err().category, ErrorCategory::Network);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let handler = ErrorHandler::default();
        let calls = AtomicU32::new(0);
        let result: Result<(), ErrorRecord> = handler
            .execute_with_retry(&fast_policy(3), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("request timed out".to_string()) }
            })
            .await;
        let err = result.unwrap_err();
        assert_eq!(err.category, ErrorCategory::Timeout);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_error_log_is_trimmed() {
        let handler = ErrorHandler::new(ErrorLogLimits { cap: 10, trim_to: 5 });
        for i in 0..11 {
            handler.record(&ErrorRecord::system(format!("e{i}")));
        }
        assert_eq!(handler.log_len(), 5);
        let recent = handler.recent(1);
        assert_eq!(recent[0].message, "e10");
    }

    #[test]
    fn test_is_retryable_respects_record_flag() {
        let handler = ErrorHandler::default();
        let rec = ErrorRecord::permission("outside workspace");
        assert!(!handler.is_retryable(&rec, Some(&[ErrorCategory::Permission])));
        let net = ErrorRecord::new(ErrorCategory::Network, "reset");
        assert!(handler.is_retryable(&net, None));
        assert!(!handler.is_retryable(&net, Some(&[ErrorCategory::Timeout])));
    }
}
