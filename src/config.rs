//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `TASKFLOW__*` 覆盖（双下划线表示嵌套，如 `TASKFLOW__MODEL__DEFAULT_MODEL=gpt-4o`）。
//! 各段提供到组件配置的转换（RetryPolicy、WorkspacePolicy、GateConfig 等）。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::core::{BackoffStrategy, ErrorCategory, ErrorLogLimits, RetryPolicy};
use crate::session::SessionConfig;
use crate::todo::TodoLimits;
use crate::tools::{policy::default_blocked_patterns, GatewayConfig, WorkspacePolicy};
use crate::verification::GateConfig;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub model: ModelSection,
    pub session: SessionSection,
    pub todo: TodoSection,
    pub retry: RetrySection,
    pub tools: ToolsSection,
    pub verification: VerificationSection,
}

/// [app] 段：工作区与 system prompt
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 工作区根目录，未设置时用 ./workspace
    pub workspace_root: Option<PathBuf>,
    /// system prompt 文件，未设置时查找 config/prompts/system.txt
    pub system_prompt_path: Option<PathBuf>,
}

impl AppSection {
    pub fn workspace(&self) -> PathBuf {
        self.workspace_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("workspace"))
    }
}

/// [model] 段：模型与传输
#[derive(Debug, Clone, Deserialize)]
pub struct ModelSection {
    #[serde(default = "default_model")]
    pub default_model: String,
    /// openai / scripted
    #[serde(default = "default_provider")]
    pub provider: String,
    pub base_url: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_model_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_model_base_delay_ms")]
    pub base_delay_ms: u64,
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_model_attempts() -> u32 {
    3
}

fn default_model_base_delay_ms() -> u64 {
    1000
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            default_model: default_model(),
            provider: default_provider(),
            base_url: None,
            request_timeout_secs: default_request_timeout_secs(),
            max_attempts: default_model_attempts(),
            base_delay_ms: default_model_base_delay_ms(),
        }
    }
}

impl ModelSection {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    /// 模型调用只在网络 / 超时错误上重试
    pub fn retry_policy(&self, retry: &RetrySection) -> RetryPolicy {
        retry
            .policy()
            .with_max_attempts(self.max_attempts)
            .with_delays(
                Duration::from_millis(self.base_delay_ms),
                Duration::from_millis(retry.max_delay_ms),
            )
            .with_categories(&[ErrorCategory::Network, ErrorCategory::Timeout])
    }
}

/// [session] 段
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_context_log_entries")]
    pub context_log_entries: usize,
}

fn default_max_sessions() -> usize {
    100
}

fn default_idle_timeout_secs() -> u64 {
    3600
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_context_log_entries() -> usize {
    10
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            idle_timeout_secs: default_idle_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            context_log_entries: default_context_log_entries(),
        }
    }
}

impl SessionSection {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn session_config(&self, todo: &TodoSection) -> SessionConfig {
        SessionConfig {
            max_sessions: self.max_sessions.max(1),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            context_log_entries: self.context_log_entries,
            todo_limits: todo.limits(),
        }
    }
}

/// [todo] 段
#[derive(Debug, Clone, Deserialize)]
pub struct TodoSection {
    #[serde(default = "default_max_description_len")]
    pub max_description_len: usize,
    #[serde(default = "default_max_retries_per_todo")]
    pub max_retries_per_todo: u32,
}

fn default_max_description_len() -> usize {
    500
}

fn default_max_retries_per_todo() -> u32 {
    3
}

impl Default for TodoSection {
    fn default() -> Self {
        Self {
            max_description_len: default_max_description_len(),
            max_retries_per_todo: default_max_retries_per_todo(),
        }
    }
}

impl TodoSection {
    pub fn limits(&self) -> TodoLimits {
        TodoLimits {
            max_description_len: self.max_description_len,
            max_retries: self.max_retries_per_todo,
        }
    }
}

/// [retry] 段：退避与错误日志
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    #[serde(default)]
    pub strategy: BackoffStrategy,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_error_log_cap")]
    pub error_log_cap: usize,
    #[serde(default = "default_error_log_trim_to")]
    pub error_log_trim_to: usize,
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_error_log_cap() -> usize {
    1000
}

fn default_error_log_trim_to() -> usize {
    500
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::default(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            error_log_cap: default_error_log_cap(),
            error_log_trim_to: default_error_log_trim_to(),
        }
    }
}

impl RetrySection {
    /// 延迟模板；次数与可重试类别由调用点决定
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_strategy(self.strategy)
            .with_delays(
                Duration::from_millis(self.base_delay_ms),
                Duration::from_millis(self.max_delay_ms),
            )
    }

    pub fn log_limits(&self) -> ErrorLogLimits {
        ErrorLogLimits {
            cap: self.error_log_cap,
            trim_to: self.error_log_trim_to,
        }
    }
}

/// [tools] 段：超时、文件大小上限、阻止路径、命令白名单
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_max_file_size_bytes")]
    pub max_file_size_bytes: u64,
    #[serde(default = "default_search_max_results")]
    pub search_max_results: usize,
    #[serde(default = "default_blocked_patterns")]
    pub blocked_patterns: Vec<String>,
    /// 允许执行的命令名（仅首词）；为空表示不限制
    #[serde(default = "default_allowed_commands")]
    pub allowed_commands: Vec<String>,
    /// 追加的禁止子串
    #[serde(default)]
    pub forbidden_commands: Vec<String>,
}

fn default_tool_timeout_secs() -> u64 {
    30
}

fn default_command_timeout_secs() -> u64 {
    60
}

fn default_max_file_size_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_search_max_results() -> usize {
    200
}

fn default_allowed_commands() -> Vec<String> {
    [
        "ls", "grep", "cat", "head", "tail", "wc", "find", "echo", "mkdir", "git", "cargo",
        "rustc", "node", "npm", "npx", "python", "python3", "pytest",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: default_tool_timeout_secs(),
            command_timeout_secs: default_command_timeout_secs(),
            max_file_size_bytes: default_max_file_size_bytes(),
            search_max_results: default_search_max_results(),
            blocked_patterns: default_blocked_patterns(),
            allowed_commands: default_allowed_commands(),
            forbidden_commands: Vec::new(),
        }
    }
}

impl ToolsSection {
    pub fn workspace_policy(&self, root: &Path) -> Arc<WorkspacePolicy> {
        Arc::new(WorkspacePolicy::new(
            root,
            &self.blocked_patterns,
            self.max_file_size_bytes,
        ))
    }

    pub fn gateway_config(&self, retry: &RetrySection) -> GatewayConfig {
        GatewayConfig {
            call_timeout: Duration::from_secs(self.tool_timeout_secs.max(1)),
            command_timeout: Duration::from_secs(self.command_timeout_secs.max(1)),
            retry: retry.policy(),
            search_max_results: self.search_max_results.max(1),
        }
    }
}

/// [verification] 段
#[derive(Debug, Clone, Deserialize)]
pub struct VerificationSection {
    #[serde(default = "default_verification_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_auto_approval")]
    pub auto_approval: bool,
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

fn default_verification_timeout_ms() -> u64 {
    30_000
}

fn default_auto_approval() -> bool {
    true
}

fn default_max_pending() -> usize {
    10
}

impl Default for VerificationSection {
    fn default() -> Self {
        Self {
            timeout_ms: default_verification_timeout_ms(),
            auto_approval: default_auto_approval(),
            max_pending: default_max_pending(),
        }
    }
}

impl VerificationSection {
    pub fn gate_config(&self) -> GateConfig {
        GateConfig {
            default_timeout: Duration::from_millis(self.timeout_ms),
            auto_approval: self.auto_approval,
            max_pending: self.max_pending.max(1),
        }
    }
}

/// 从 config 目录加载配置，环境变量 TASKFLOW__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 TASKFLOW__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("TASKFLOW")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.todo.max_retries_per_todo, 3);
        assert_eq!(cfg.verification.max_pending, 10);
        assert_eq!(cfg.retry.log_limits().cap, 1000);
        let model = cfg.model.retry_policy(&cfg.retry);
        assert_eq!(model.max_attempts, 3);
        assert_eq!(
            model.retryable_categories.unwrap(),
            vec![ErrorCategory::Network, ErrorCategory::Timeout]
        );
    }

    #[test]
    fn test_explicit_file_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            "[verification]\ntimeout_ms = 250\nauto_approval = false\n\n[retry]\nstrategy = \"linear\"\n\n[todo]\nmax_retries_per_todo = 1\n",
        )
        .unwrap();
        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.verification.gate_config().default_timeout, Duration::from_millis(250));
        assert!(!cfg.verification.auto_approval);
        assert_eq!(cfg.retry.strategy, BackoffStrategy::Linear);
        assert_eq!(cfg.todo.limits().max_retries, 1);
        // 未出现的段使用默认值
        assert_eq!(cfg.session.max_sessions, 100);
    }
}
