//! 能力接口：网关只依赖这些 trait，不做任何 I/O
//!
//! 每类宿主能力一个 trait（文件、进程、交互终端、通知、宿主命令），由外部注入具体实现。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 文件能力：所有路径均为相对工作区根目录的路径（或根目录下的绝对路径）
#[async_trait]
pub trait FileCapability: Send + Sync {
    async fn read(&self, path: &str) -> anyhow::Result<String>;

    /// 覆盖写入，返回写入字节数
    async fn write(&self, path: &str, content: &str) -> anyhow::Result<u64>;

    async fn append(&self, path: &str, content: &str) -> anyhow::Result<u64>;

    /// 新建文件，已存在时报错
    async fn create(&self, path: &str, content: &str) -> anyhow::Result<u64>;

    async fn delete(&self, path: &str) -> anyhow::Result<()>;

    async fn list(&self, path: &str) -> anyhow::Result<Vec<String>>;

    /// 按 glob 模式搜索工作区内文件，返回相对路径
    async fn search(&self, pattern: &str, max_results: usize) -> anyhow::Result<Vec<String>>;
}

/// 命令执行结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// 进程能力：在工作目录下执行命令，带超时
#[async_trait]
pub trait ProcessCapability: Send + Sync {
    async fn run(
        &self,
        command: &str,
        cwd: Option<&str>,
        timeout: Duration,
    ) -> anyhow::Result<CommandOutput>;
}

/// 交互终端：只发送文本，看不到输出
#[async_trait]
pub trait TerminalCapability: Send + Sync {
    async fn send_text(&self, terminal: &str, text: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    #[default]
    Info,
    Warning,
    Error,
}

/// 通知能力：展示信息，可选地返回用户选择
#[async_trait]
pub trait NotificationCapability: Send + Sync {
    async fn notify(
        &self,
        level: NotificationLevel,
        message: &str,
        choices: &[String],
    ) -> anyhow::Result<Option<String>>;
}

/// 宿主命令：按名称调用任意宿主动作
#[async_trait]
pub trait HostCommandCapability: Send + Sync {
    async fn invoke(&self, command: &str, args: &[Value]) -> anyhow::Result<Value>;
}

/// 注入到网关的能力集合；缺失的能力会让对应工具返回 HOST 错误
#[derive(Clone, Default)]
pub struct Capabilities {
    pub file: Option<Arc<dyn FileCapability>>,
    pub process: Option<Arc<dyn ProcessCapability>>,
    pub terminal: Option<Arc<dyn TerminalCapability>>,
    pub notification: Option<Arc<dyn NotificationCapability>>,
    pub host: Option<Arc<dyn HostCommandCapability>>,
}

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, file: Arc<dyn FileCapability>) -> Self {
        self.file = Some(file);
        self
    }

    pub fn with_process(mut self, process: Arc<dyn ProcessCapability>) -> Self {
        self.process = Some(process);
        self
    }

    pub fn with_terminal(mut self, terminal: Arc<dyn TerminalCapability>) -> Self {
        self.terminal = Some(terminal);
        self
    }

    pub fn with_notification(mut self, notification: Arc<dyn NotificationCapability>) -> Self {
        self.notification = Some(notification);
        self
    }

    pub fn with_host(mut self, host: Arc<dyn HostCommandCapability>) -> Self {
        self.host = Some(host);
        self
    }
}
