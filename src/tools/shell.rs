//! 本地命令执行适配器：白名单命令，禁止危险操作
//!
//! 仅允许配置中的命令名（首词，如 ls、grep、cargo；白名单为空表示不限制）；
//! 禁止 rm -rf、wget、chmod 777 等子串；工作目录必须在工作区内。
//! 执行通过 sh -c / cmd /C，带超时，超时后进程随句柄一起被杀掉。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::core::ErrorRecord;
use crate::tools::{CommandOutput, ProcessCapability, WorkspacePolicy};

/// 禁止的命令/子串（即使白名单中有同名，也不允许带这些参数）
pub const FORBIDDEN_SUBSTR: &[&str] = &[
    "rm -rf",
    "rm -fr",
    "rm -r",
    "wget ",
    "curl | sh",
    "chmod 777",
    "chmod +s",
    "mkfs",
    "dd if=",
    "> /dev/sd",
    ":(){ :|:& };:", // fork bomb
];

/// 本地进程能力
pub struct LocalProcessAdapter {
    policy: Arc<WorkspacePolicy>,
    allowed_commands: HashSet<String>,
    forbidden: Vec<String>,
}

impl LocalProcessAdapter {
    pub fn new(policy: Arc<WorkspacePolicy>, allowed_commands: Vec<String>) -> Self {
        let allowed_commands = allowed_commands
            .into_iter()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        Self {
            policy,
            allowed_commands,
            forbidden: FORBIDDEN_SUBSTR.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// 追加配置中的禁止子串
    pub fn with_forbidden(mut self, extra: &[String]) -> Self {
        self.forbidden
            .extend(extra.iter().map(|s| s.to_lowercase()).filter(|s| !s.is_empty()));
        self
    }

    /// 解析命令：只取第一个 token 作为命令名
    fn command_name(raw: &str) -> &str {
        raw.split_whitespace().next().unwrap_or("")
    }

    fn is_allowed(&self, raw: &str) -> Result<(), ErrorRecord> {
        let raw_lower = raw.to_lowercase();
        if let Some(forbidden) = self.forbidden.iter().find(|f| raw_lower.contains(f.as_str())) {
            return Err(ErrorRecord::permission(format!(
                "Command contains forbidden pattern '{forbidden}'"
            ))
            .with_code("COMMAND_FORBIDDEN")
            .non_retryable());
        }
        let name = Self::command_name(&raw_lower);
        if name.is_empty() {
            return Err(ErrorRecord::validation("Empty command").with_code("COMMAND_EMPTY"));
        }
        if self.allowed_commands.is_empty() || self.allowed_commands.contains(name) {
            return Ok(());
        }
        Err(ErrorRecord::permission(format!("Command '{name}' not in allowlist"))
            .with_code("COMMAND_NOT_ALLOWED")
            .with_suggestion(format!(
                "Allowed commands: {}",
                {
                    let mut names: Vec<_> = self.allowed_commands.iter().cloned().collect();
                    names.sort();
                    names.join(", ")
                }
            ))
            .non_retryable())
    }
}

#[async_trait]
impl ProcessCapability for LocalProcessAdapter {
    async fn run(
        &self,
        command: &str,
        cwd: Option<&str>,
        timeout: Duration,
    ) -> anyhow::Result<CommandOutput> {
        let command = command.trim();
        self.is_allowed(command)?;
        let workdir = match cwd {
            Some(dir) if !dir.trim().is_empty() => self.policy.check_path(dir)?,
            _ => self.policy.root().to_path_buf(),
        };

        tracing::info!(command = %command, cwd = %workdir.display(), "run command");

        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", command]);
            c
        };
        cmd.current_dir(&workdir).kill_on_drop(true);

        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| {
                ErrorRecord::timeout(format!(
                    "Command timed out after {}ms",
                    timeout.as_millis()
                ))
                .with_code("COMMAND_TIMEOUT")
                .with_context("command", command)
            })??;

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ErrorCategory, ErrorClassifier};
    use tempfile::TempDir;

    fn adapter(dir: &TempDir, allowed: &[&str]) -> LocalProcessAdapter {
        let policy = Arc::new(WorkspacePolicy::new(dir.path(), &[], 1024));
        LocalProcessAdapter::new(policy, allowed.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_forbidden_and_allowlist() {
        let dir = TempDir::new().unwrap();
        let a = adapter(&dir, &["ls", "echo"]);
        assert!(a.is_allowed("ls -la").is_ok());
        assert_eq!(a.is_allowed("rm -rf /").unwrap_err().code, "COMMAND_FORBIDDEN");
        assert_eq!(a.is_allowed("python x.py").unwrap_err().code, "COMMAND_NOT_ALLOWED");
        assert_eq!(a.is_allowed("   ").unwrap_err().category, ErrorCategory::Validation);
    }

    #[test]
    fn test_empty_allowlist_allows_everything_but_forbidden() {
        let dir = TempDir::new().unwrap();
        let a = adapter(&dir, &[]);
        assert!(a.is_allowed("whatever --flag").is_ok());
        assert!(a.is_allowed("chmod 777 file").is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_echo_in_workspace() {
        let dir = TempDir::new().unwrap();
        let a = adapter(&dir, &["echo"]);
        let out = a.run("echo hi", None, Duration::from_secs(5)).await.unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout.trim(), "hi");
    }

    #[tokio::test]
    async fn test_cwd_outside_workspace() {
        let dir = TempDir::new().unwrap();
        let a = adapter(&dir, &[]);
        let err = a.run("ls", Some("../.."), Duration::from_secs(5)).await.unwrap_err();
        let rec = ErrorClassifier::new().classify(&err);
        assert_eq!(rec.category, ErrorCategory::Permission);
        assert!(!rec.retryable);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout() {
        let dir = TempDir::new().unwrap();
        let a = adapter(&dir, &[]);
        let err = a.run("sleep 5", None, Duration::from_millis(50)).await.unwrap_err();
        assert_eq!(ErrorClassifier::new().classify(&err).category, ErrorCategory::Timeout);
    }
}
