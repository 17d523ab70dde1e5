//! 其余本地适配器：日志终端与标准输出通知
//!
//! 命令行运行时使用；编辑器宿主会注入自己的实现。

use async_trait::async_trait;

use crate::tools::{NotificationCapability, NotificationLevel, TerminalCapability};

/// 把发往终端的文本写进日志（fire-and-forget，不回读输出）
#[derive(Debug, Default)]
pub struct LogTerminal;

#[async_trait]
impl TerminalCapability for LogTerminal {
    async fn send_text(&self, terminal: &str, text: &str) -> anyhow::Result<()> {
        tracing::info!(terminal = %terminal, text = %text, "terminal input");
        Ok(())
    }
}

/// 打印到标准输出 / 标准错误；不会等待用户选择
#[derive(Debug, Default)]
pub struct StdoutNotifier;

#[async_trait]
impl NotificationCapability for StdoutNotifier {
    async fn notify(
        &self,
        level: NotificationLevel,
        message: &str,
        choices: &[String],
    ) -> anyhow::Result<Option<String>> {
        match level {
            NotificationLevel::Info => println!("[info] {message}"),
            NotificationLevel::Warning => eprintln!("[warning] {message}"),
            NotificationLevel::Error => eprintln!("[error] {message}"),
        }
        if !choices.is_empty() {
            println!("  options: {}", choices.join(" / "));
        }
        Ok(None)
    }
}
