//! 可观测性：日志初始化与注入式运行指标

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 日志：默认 info，可通过 RUST_LOG 覆盖
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct ToolStats {
    pub calls: u64,
    pub failures: u64,
    pub total_ms: u64,
}

/// 运行指标（显式构造并以 Arc 注入，测试各自持有独立实例）
#[derive(Debug, Default)]
pub struct Metrics {
    turns: AtomicU64,
    fatal_turns: AtomicU64,
    model_calls: AtomicU64,
    model_failures: AtomicU64,
    tools: Mutex<BTreeMap<String, ToolStats>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub turns: u64,
    pub fatal_turns: u64,
    pub model_calls: u64,
    pub model_failures: u64,
    pub tools: BTreeMap<String, ToolStats>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_turn(&self, fatal: bool) {
        self.turns.fetch_add(1, Ordering::Relaxed);
        if fatal {
            self.fatal_turns.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_model_call(&self, ok: bool) {
        self.model_calls.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.model_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_tool(&self, tool: &str, ok: bool, elapsed: Duration) {
        if let Ok(mut tools) = self.tools.lock() {
            let stats = tools.entry(tool.to_string()).or_default();
            stats.calls += 1;
            stats.total_ms += elapsed.as_millis() as u64;
            if !ok {
                stats.failures += 1;
            }
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            turns: self.turns.load(Ordering::Relaxed),
            fatal_turns: self.fatal_turns.load(Ordering::Relaxed),
            model_calls: self.model_calls.load(Ordering::Relaxed),
            model_failures: self.model_failures.load(Ordering::Relaxed),
            tools: self.tools.lock().map(|t| t.clone()).unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_are_isolated_per_instance() {
        let a = Metrics::new();
        let b = Metrics::new();
        a.record_tool("read_file", true, Duration::from_millis(5));
        a.record_tool("read_file", false, Duration::from_millis(7));
        a.record_turn(true);
        let snap = a.snapshot();
        assert_eq!(snap.tools["read_file"].calls, 2);
        assert_eq!(snap.tools["read_file"].failures, 1);
        assert_eq!(snap.tools["read_file"].total_ms, 12);
        assert_eq!(snap.fatal_turns, 1);
        assert_eq!(b.snapshot().turns, 0);
    }
}
