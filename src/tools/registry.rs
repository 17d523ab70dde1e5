//! 工具注册表
//!
//! 固定的工具白名单：每个工具有名称、描述（供模型理解）、必填参数列表、
//! 重试预算与可重试类别。终端 / 交互类工具有副作用且不幂等，从不重试。

use serde::{Deserialize, Serialize};

use crate::core::{ErrorCategory, ErrorRecord, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    ReadFile,
    WriteFile,
    AppendFile,
    CreateFile,
    DeleteFile,
    ListDirectory,
    SearchFiles,
    RunCommand,
    SendToTerminal,
    ShowMessage,
    HostCommand,
}

/// 读类工具可在这些类别上重试
const READ_RETRY: &[ErrorCategory] = &[
    ErrorCategory::Network,
    ErrorCategory::Timeout,
    ErrorCategory::FileSystem,
    ErrorCategory::Host,
];
const WRITE_RETRY: &[ErrorCategory] = &[ErrorCategory::Timeout, ErrorCategory::Host];
const HOST_RETRY: &[ErrorCategory] = &[ErrorCategory::Host, ErrorCategory::Timeout];

impl ToolKind {
    pub const ALL: [ToolKind; 11] = [
        ToolKind::ReadFile,
        ToolKind::WriteFile,
        ToolKind::AppendFile,
        ToolKind::CreateFile,
        ToolKind::DeleteFile,
        ToolKind::ListDirectory,
        ToolKind::SearchFiles,
        ToolKind::RunCommand,
        ToolKind::SendToTerminal,
        ToolKind::ShowMessage,
        ToolKind::HostCommand,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ToolKind::ReadFile => "read_file",
            ToolKind::WriteFile => "write_file",
            ToolKind::AppendFile => "append_file",
            ToolKind::CreateFile => "create_file",
            ToolKind::DeleteFile => "delete_file",
            ToolKind::ListDirectory => "list_directory",
            ToolKind::SearchFiles => "search_files",
            ToolKind::RunCommand => "run_command",
            ToolKind::SendToTerminal => "send_to_terminal",
            ToolKind::ShowMessage => "show_message",
            ToolKind::HostCommand => "host_command",
        }
    }

    pub fn names() -> Vec<&'static str> {
        Self::ALL.iter().map(|k| k.name()).collect()
    }

    /// 按名称查找；空名或未知名返回列出全部支持工具的 VALIDATION 错误
    pub fn parse(name: &str) -> Result<ToolKind, ErrorRecord> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ErrorRecord::validation("Tool name must be a non-empty string")
                .with_code("TOOL_NAME_EMPTY")
                .with_suggestion(format!("Supported tools: {}", Self::names().join(", "))));
        }
        Self::ALL.into_iter().find(|k| k.name() == name).ok_or_else(|| {
            ErrorRecord::validation(format!(
                "Unknown tool '{name}'. Supported tools: {}",
                Self::names().join(", ")
            ))
            .with_code("TOOL_UNKNOWN")
            .with_context("tool", name)
            .with_suggestion("Use one of the supported tool names")
        })
    }

    pub fn description(self) -> &'static str {
        match self {
            ToolKind::ReadFile => "Read a text file. Params: {\"path\"}",
            ToolKind::WriteFile => "Overwrite a file, creating it if needed. Params: {\"path\", \"content\"}",
            ToolKind::AppendFile => "Append text to a file. Params: {\"path\", \"content\"}",
            ToolKind::CreateFile => "Create a new file; fails if it exists. Params: {\"path\", \"content\"}",
            ToolKind::DeleteFile => "Delete a file. Params: {\"path\"}",
            ToolKind::ListDirectory => "List a directory. Params: {\"path\"}",
            ToolKind::SearchFiles => "Find files by glob pattern. Params: {\"pattern\", \"maxResults\"?}",
            ToolKind::RunCommand => "Run a shell command and capture output. Params: {\"command\", \"cwd\"?, \"timeoutMs\"?}",
            ToolKind::SendToTerminal => "Send text to an interactive terminal (no output returned). Params: {\"text\", \"terminal\"?}",
            ToolKind::ShowMessage => "Show a message to the user. Params: {\"message\", \"level\"?, \"choices\"?}",
            ToolKind::HostCommand => "Invoke a named host action. Params: {\"command\", \"args\"?}",
        }
    }

    pub fn required_params(self) -> &'static [&'static str] {
        match self {
            ToolKind::ReadFile | ToolKind::DeleteFile | ToolKind::ListDirectory => &["path"],
            ToolKind::WriteFile | ToolKind::AppendFile | ToolKind::CreateFile => {
                &["path", "content"]
            }
            ToolKind::SearchFiles => &["pattern"],
            ToolKind::RunCommand | ToolKind::HostCommand => &["command"],
            ToolKind::SendToTerminal => &["text"],
            ToolKind::ShowMessage => &["message"],
        }
    }

    /// 重试预算（次数 + 可重试类别）；延迟由调用方统一配置
    pub fn retry_policy(self, template: &RetryPolicy) -> RetryPolicy {
        let base = template.clone();
        match self {
            ToolKind::ReadFile | ToolKind::ListDirectory | ToolKind::SearchFiles => {
                base.with_max_attempts(3).with_categories(READ_RETRY)
            }
            ToolKind::WriteFile | ToolKind::CreateFile | ToolKind::DeleteFile => {
                base.with_max_attempts(2).with_categories(WRITE_RETRY)
            }
            ToolKind::HostCommand => base.with_max_attempts(2).with_categories(HOST_RETRY),
            ToolKind::AppendFile
            | ToolKind::RunCommand
            | ToolKind::SendToTerminal
            | ToolKind::ShowMessage => base.with_max_attempts(1).with_categories(&[]),
        }
    }

    pub fn touches_files(self) -> bool {
        matches!(
            self,
            ToolKind::ReadFile
                | ToolKind::WriteFile
                | ToolKind::AppendFile
                | ToolKind::CreateFile
                | ToolKind::DeleteFile
                | ToolKind::ListDirectory
                | ToolKind::SearchFiles
        )
    }
}

/// 工具目录 JSON（拼入 system prompt）
pub fn catalog_json() -> String {
    let tools: Vec<serde_json::Value> = ToolKind::ALL
        .iter()
        .map(|k| {
            serde_json::json!({
                "name": k.name(),
                "description": k.description(),
                "required": k.required_params(),
            })
        })
        .collect();
    serde_json::to_string_pretty(&tools).unwrap_or_else(|_| "[]".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_and_unknown() {
        assert_eq!(ToolKind::parse("read_file").unwrap(), ToolKind::ReadFile);
        let err = ToolKind::parse("rm_everything").unwrap_err();
        assert_eq!(err.category, ErrorCategory::Validation);
        assert!(err.message.contains("search_files"));
        assert_eq!(ToolKind::parse("  ").unwrap_err().code, "TOOL_NAME_EMPTY");
    }

    #[test]
    fn test_interactive_tools_never_retry() {
        let template = RetryPolicy::default();
        for kind in [ToolKind::RunCommand, ToolKind::SendToTerminal, ToolKind::ShowMessage] {
            assert_eq!(kind.retry_policy(&template).max_attempts, 1);
        }
        let read = ToolKind::ReadFile.retry_policy(&template);
        assert_eq!(read.max_attempts, 3);
        assert!(read
            .retryable_categories
            .unwrap()
            .contains(&ErrorCategory::FileSystem));
    }

    #[test]
    fn test_catalog_lists_every_tool() {
        let catalog: Vec<serde_json::Value> = serde_json::from_str(&catalog_json()).unwrap();
        assert_eq!(catalog.len(), ToolKind::ALL.len());
    }
}
