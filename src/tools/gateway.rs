//! 工具执行网关
//!
//! execute_tool(name, params, ctx) 永不返回 Err：校验（白名单 → 必填参数 → 路径策略）、
//! 按工具的重试预算执行、每次尝试加超时，结果统一为 ToolOutcome（Success / Failure）。
//! 每次调用输出结构化审计日志（JSON）并写入 Metrics。

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::core::{ErrorHandler, ErrorRecord, RetryPolicy};
use crate::observability::Metrics;
use crate::tools::{
    Capabilities, FileCapability, NotificationLevel, ToolKind, WorkspacePolicy,
};

/// 任何工具上都按路径检查的参数名
const PATH_KEYS: &[&str] = &["path", "cwd"];

/// 调用上下文
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub session_id: String,
    pub todo_id: Option<String>,
}

/// 文件写入方式（决定摘要措辞）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    Created,
    Written,
    Appended,
}

/// 成功结果的类型化载荷
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolPayload {
    FileRead {
        path: String,
        content: String,
        bytes: u64,
    },
    FileWritten {
        path: String,
        bytes: u64,
        mode: WriteMode,
    },
    FileDeleted {
        path: String,
    },
    DirectoryListing {
        path: String,
        entries: Vec<String>,
    },
    SearchResults {
        pattern: String,
        matches: Vec<String>,
    },
    CommandCompleted {
        command: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
    TerminalSent {
        terminal: String,
    },
    Notified {
        response: Option<String>,
    },
    HostCommandResult {
        command: String,
        value: Value,
    },
}

impl ToolPayload {
    /// 一句话摘要：既给模型看，也是校验闸门自动审批的输入
    pub fn summary(&self) -> String {
        match self {
            ToolPayload::FileRead { path, bytes, .. } => {
                format!("File {path} read successfully ({bytes} bytes)")
            }
            ToolPayload::FileWritten { path, bytes, mode } => match mode {
                WriteMode::Created => format!("File {path} created successfully ({bytes} bytes)"),
                WriteMode::Written => format!("File {path} written successfully ({bytes} bytes)"),
                WriteMode::Appended => format!("File {path} updated successfully ({bytes} bytes appended)"),
            },
            ToolPayload::FileDeleted { path } => format!("File {path} deleted successfully"),
            ToolPayload::DirectoryListing { path, entries } => {
                format!("Directory {path} listed successfully: {} entries", entries.len())
            }
            ToolPayload::SearchResults { pattern, matches } => {
                format!("Search completed: {} matches for '{pattern}'", matches.len())
            }
            ToolPayload::CommandCompleted { exit_code, .. } => {
                format!("Command succeeded (exit code {exit_code})")
            }
            ToolPayload::TerminalSent { terminal } => format!("Text sent to terminal '{terminal}'"),
            ToolPayload::Notified { response } => match response {
                Some(r) => format!("Message shown, user chose '{r}'"),
                None => "Message shown to the user".to_string(),
            },
            ToolPayload::HostCommandResult { command, .. } => {
                format!("Host command {command} completed")
            }
        }
    }

    /// 回喂给模型的详细内容（截断）
    pub fn detail(&self, max_chars: usize) -> String {
        let full = match self {
            ToolPayload::FileRead { content, .. } => content.clone(),
            ToolPayload::DirectoryListing { entries, .. } => entries.join("\n"),
            ToolPayload::SearchResults { matches, .. } => matches.join("\n"),
            ToolPayload::CommandCompleted { stdout, stderr, .. } => {
                if stderr.trim().is_empty() {
                    stdout.clone()
                } else {
                    format!("{}\nstderr: {}", stdout.trim(), stderr.trim())
                }
            }
            ToolPayload::HostCommandResult { value, .. } => value.to_string(),
            _ => self.summary(),
        };
        truncate(&full, max_chars)
    }
}

/// 工具结果：成功带载荷，失败带 ErrorRecord
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolResult {
    Success { payload: ToolPayload },
    Failure { error: ErrorRecord },
}

/// 统一结果信封
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolOutcome {
    pub tool_name: String,
    pub timestamp: DateTime<Utc>,
    pub result: ToolResult,
}

impl ToolOutcome {
    pub fn success(&self) -> bool {
        matches!(self.result, ToolResult::Success { .. })
    }

    pub fn error(&self) -> Option<&ErrorRecord> {
        match &self.result {
            ToolResult::Failure { error } => Some(error),
            ToolResult::Success { .. } => None,
        }
    }

    pub fn payload(&self) -> Option<&ToolPayload> {
        match &self.result {
            ToolResult::Success { payload } => Some(payload),
            ToolResult::Failure { .. } => None,
        }
    }

    pub fn summary(&self) -> String {
        match &self.result {
            ToolResult::Success { payload } => payload.summary(),
            ToolResult::Failure { error } => {
                format!("Tool {} failed: {}", self.tool_name, error.message)
            }
        }
    }
}

/// 网关配置
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// 单次尝试超时（命令类工具在命令超时上再加 1 秒余量）
    pub call_timeout: Duration,
    pub command_timeout: Duration,
    /// 重试延迟模板；次数与类别由各工具决定
    pub retry: RetryPolicy,
    pub search_max_results: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            search_max_results: 200,
        }
    }
}

pub struct ToolGateway {
    capabilities: Capabilities,
    policy: Arc<WorkspacePolicy>,
    errors: Arc<ErrorHandler>,
    metrics: Arc<Metrics>,
    config: GatewayConfig,
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() > max_chars {
        format!("{}...", s.chars().take(max_chars).collect::<String>())
    } else {
        s.to_string()
    }
}

fn args_preview(args: &Value) -> String {
    truncate(&args.to_string(), 200)
}

fn str_param<'a>(params: &'a Map<String, Value>, key: &str) -> Result<&'a str, ErrorRecord> {
    params.get(key).and_then(Value::as_str).ok_or_else(|| {
        ErrorRecord::validation(format!("Parameter '{key}' must be a string"))
            .with_code("TOOL_PARAM_INVALID")
            .with_context("param", key)
    })
}

fn opt_str<'a>(params: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}

fn unavailable(capability: &str) -> ErrorRecord {
    ErrorRecord::host(format!("{capability} capability unavailable"))
        .with_code("CAPABILITY_UNAVAILABLE")
        .with_suggestion("Register the capability adapter with the gateway")
        .non_retryable()
}

/// 按底层错误信息附加工具相关建议
fn with_tool_suggestions(rec: ErrorRecord, kind: Option<ToolKind>) -> ErrorRecord {
    let lower = rec.message.to_lowercase();
    let mut extra: Vec<&str> = Vec::new();
    if lower.contains("not found") || lower.contains("no such file") {
        extra.push("Check that the path exists (use list_directory or search_files)");
    }
    if lower.contains("permission") || lower.contains("denied") || lower.contains("outside workspace") {
        extra.push("Check permissions and keep paths inside the workspace root");
    }
    if lower.contains("timed out") || lower.contains("timeout") {
        extra.push("Increase timeoutMs or simplify the operation");
    }
    if lower.contains("already exists") {
        extra.push("Use write_file to overwrite an existing file");
    }
    if lower.contains("exceeds the limit") {
        extra.push("Split the content into smaller files");
    }
    if kind == Some(ToolKind::RunCommand) && lower.contains("exited with") {
        extra.push("Inspect stderr and fix the command before retrying");
    }
    rec.with_suggestions(extra)
}

impl ToolGateway {
    pub fn new(
        capabilities: Capabilities,
        policy: Arc<WorkspacePolicy>,
        errors: Arc<ErrorHandler>,
        metrics: Arc<Metrics>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            capabilities,
            policy,
            errors,
            metrics,
            config,
        }
    }

    pub fn policy(&self) -> &WorkspacePolicy {
        &self.policy
    }

    /// 执行工具；所有失败都被捕获为 ToolResult::Failure
    pub async fn execute_tool(&self, name: &str, params: &Value, ctx: &ToolContext) -> ToolOutcome {
        let start = Instant::now();
        let validated = self.validate(name, params);
        let kind = validated.as_ref().ok().map(|(k, _)| *k);
        let result = match validated {
            Err(rec) => {
                self.errors.record(&rec);
                Err(rec)
            }
            Ok((kind, map)) => {
                let policy = kind.retry_policy(&self.config.retry);
                self.errors
                    .execute_with_retry(&policy, |attempt| self.attempt(kind, &map, attempt))
                    .await
            }
        };

        let elapsed = start.elapsed();
        let (ok, outcome) = match &result {
            Ok(_) => (true, "ok"),
            Err(e) if e.code == "TOOL_TIMEOUT" => (false, "timeout"),
            Err(_) => (false, "error"),
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": name,
            "session": ctx.session_id,
            "todo": ctx.todo_id,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": elapsed.as_millis() as u64,
            "args_preview": args_preview(params),
        });
        tracing::info!(audit = %audit.to_string(), "tool");
        self.metrics.record_tool(name, ok, elapsed);

        let result = match result {
            Ok(payload) => ToolResult::Success { payload },
            Err(rec) => ToolResult::Failure {
                error: with_tool_suggestions(rec.with_context("tool", name), kind),
            },
        };
        ToolOutcome {
            tool_name: name.to_string(),
            timestamp: Utc::now(),
            result,
        }
    }

    /// 校验顺序：名称白名单 → 必填参数 → 路径策略
    fn validate(&self, name: &str, params: &Value) -> Result<(ToolKind, Map<String, Value>), ErrorRecord> {
        let kind = ToolKind::parse(name)?;
        let map = match params {
            Value::Object(m) => m.clone(),
            Value::Null => Map::new(),
            other => {
                return Err(ErrorRecord::validation(format!(
                    "Tool parameters must be an object, got {other}"
                ))
                .with_code("TOOL_PARAM_INVALID"))
            }
        };
        let missing: Vec<&str> = kind
            .required_params()
            .iter()
            .copied()
            .filter(|k| map.get(*k).map_or(true, Value::is_null))
            .collect();
        if !missing.is_empty() {
            return Err(ErrorRecord::validation(format!(
                "Tool '{}' is missing required parameters: {}",
                kind.name(),
                missing.join(", ")
            ))
            .with_code("TOOL_PARAM_MISSING")
            .with_context("tool", kind.name())
            .with_suggestion(kind.description()));
        }
        for key in PATH_KEYS {
            if let Some(path) = map.get(*key).and_then(Value::as_str) {
                self.policy.check_path(path)?;
            }
        }
        Ok((kind, map))
    }

    async fn attempt(
        &self,
        kind: ToolKind,
        params: &Map<String, Value>,
        attempt: u32,
    ) -> anyhow::Result<ToolPayload> {
        let limit = match kind {
            ToolKind::RunCommand => self.command_timeout(params) + Duration::from_secs(1),
            _ => self.config.call_timeout,
        };
        tracing::debug!(tool = kind.name(), attempt, "tool attempt");
        match tokio::time::timeout(limit, self.dispatch(kind, params)).await {
            Ok(r) => r,
            Err(_) => Err(ErrorRecord::timeout(format!(
                "Tool {} timed out after {}ms",
                kind.name(),
                limit.as_millis()
            ))
            .with_code("TOOL_TIMEOUT")
            .into()),
        }
    }

    fn command_timeout(&self, params: &Map<String, Value>) -> Duration {
        params
            .get("timeoutMs")
            .and_then(Value::as_u64)
            .map(Duration::from_millis)
            .map(|d| d.min(self.config.command_timeout))
            .unwrap_or(self.config.command_timeout)
    }

    fn file(&self) -> Result<&dyn FileCapability, ErrorRecord> {
        self.capabilities
            .file
            .as_deref()
            .ok_or_else(|| unavailable("File"))
    }

    async fn dispatch(&self, kind: ToolKind, params: &Map<String, Value>) -> anyhow::Result<ToolPayload> {
        let payload = match kind {
            ToolKind::ReadFile => {
                let path = str_param(params, "path")?;
                let content = self.file()?.read(path).await?;
                ToolPayload::FileRead {
                    path: path.to_string(),
                    bytes: content.len() as u64,
                    content,
                }
            }
            ToolKind::WriteFile | ToolKind::AppendFile | ToolKind::CreateFile => {
                let path = str_param(params, "path")?;
                let content = str_param(params, "content")?;
                let file = self.file()?;
                let (bytes, mode) = match kind {
                    ToolKind::CreateFile => (file.create(path, content).await?, WriteMode::Created),
                    ToolKind::AppendFile => (file.append(path, content).await?, WriteMode::Appended),
                    _ => (file.write(path, content).await?, WriteMode::Written),
                };
                ToolPayload::FileWritten {
                    path: path.to_string(),
                    bytes,
                    mode,
                }
            }
            ToolKind::DeleteFile => {
                let path = str_param(params, "path")?;
                self.file()?.delete(path).await?;
                ToolPayload::FileDeleted {
                    path: path.to_string(),
                }
            }
            ToolKind::ListDirectory => {
                let path = str_param(params, "path")?;
                let entries = self.file()?.list(path).await?;
                ToolPayload::DirectoryListing {
                    path: path.to_string(),
                    entries,
                }
            }
            ToolKind::SearchFiles => {
                let pattern = str_param(params, "pattern")?;
                let max = params
                    .get("maxResults")
                    .and_then(Value::as_u64)
                    .map(|n| n as usize)
                    .unwrap_or(self.config.search_max_results)
                    .min(self.config.search_max_results);
                let matches = self.file()?.search(pattern, max).await?;
                ToolPayload::SearchResults {
                    pattern: pattern.to_string(),
                    matches,
                }
            }
            ToolKind::RunCommand => {
                let command = str_param(params, "command")?;
                let process = self
                    .capabilities
                    .process
                    .as_deref()
                    .ok_or_else(|| unavailable("Process"))?;
                let out = process
                    .run(command, opt_str(params, "cwd"), self.command_timeout(params))
                    .await?;
                if out.exit_code != 0 {
                    let stderr = truncate(out.stderr.trim(), 500);
                    let rec = self
                        .errors
                        .classifier()
                        .classify_message(
                            &format!("Command exited with code {}: {}", out.exit_code, stderr),
                            None,
                        )
                        .with_code("COMMAND_FAILED")
                        .with_context("exit_code", out.exit_code.to_string())
                        .with_context("command", command)
                        .non_retryable();
                    return Err(rec.into());
                }
                ToolPayload::CommandCompleted {
                    command: command.to_string(),
                    exit_code: out.exit_code,
                    stdout: out.stdout,
                    stderr: out.stderr,
                }
            }
            ToolKind::SendToTerminal => {
                let text = str_param(params, "text")?;
                let terminal = opt_str(params, "terminal").unwrap_or("taskflow");
                self.capabilities
                    .terminal
                    .as_deref()
                    .ok_or_else(|| unavailable("Terminal"))?
                    .send_text(terminal, text)
                    .await?;
                ToolPayload::TerminalSent {
                    terminal: terminal.to_string(),
                }
            }
            ToolKind::ShowMessage => {
                let message = str_param(params, "message")?;
                let level = params
                    .get("level")
                    .cloned()
                    .and_then(|v| serde_json::from_value::<NotificationLevel>(v).ok())
                    .unwrap_or_default();
                let choices: Vec<String> = params
                    .get("choices")
                    .and_then(Value::as_array)
                    .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
                    .unwrap_or_default();
                let response = self
                    .capabilities
                    .notification
                    .as_deref()
                    .ok_or_else(|| unavailable("Notification"))?
                    .notify(level, message, &choices)
                    .await?;
                ToolPayload::Notified { response }
            }
            ToolKind::HostCommand => {
                let command = str_param(params, "command")?;
                let args: Vec<Value> = params
                    .get("args")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                let value = self
                    .capabilities
                    .host
                    .as_deref()
                    .ok_or_else(|| unavailable("Host command"))?
                    .invoke(command, &args)
                    .await?;
                ToolPayload::HostCommandResult {
                    command: command.to_string(),
                    value,
                }
            }
        };
        Ok(payload)
    }
}
