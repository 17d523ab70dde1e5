//! 编排器构建器：统一的组件初始化逻辑
//!
//! CLI 与测试共用同一套装配：工作区策略、本地能力适配器、工具网关、校验闸门、会话管理器。

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;

use crate::config::AppConfig;
use crate::core::{ErrorHandler, Orchestrator, RecoveryEngine};
use crate::llm::{ModelTransport, OpenAiTransport, ScriptedTransport};
use crate::observability::Metrics;
use crate::phase::{PhaseEvent, PromptBuilder};
use crate::session::SessionManager;
use crate::tools::{
    Capabilities, LocalFileAdapter, LocalProcessAdapter, LogTerminal, StdoutNotifier, ToolGateway,
    WorkspacePolicy,
};
use crate::verification::VerificationGate;

/// 按配置选择模型传输：provider = openai 且有 OPENAI_API_KEY 时走 OpenAI，否则脚本化传输
pub fn create_transport_from_config(config: &AppConfig) -> Arc<dyn ModelTransport> {
    let has_key = std::env::var("OPENAI_API_KEY")
        .map(|k| !k.trim().is_empty())
        .unwrap_or(false);
    match config.model.provider.as_str() {
        "openai" if has_key => Arc::new(OpenAiTransport::new(config.model.base_url.as_deref(), None)),
        "openai" => {
            tracing::warn!("OPENAI_API_KEY not set, falling back to the scripted transport");
            Arc::new(ScriptedTransport::new())
        }
        "scripted" => Arc::new(ScriptedTransport::new()),
        other => {
            tracing::warn!(provider = %other, "unknown model provider, using the scripted transport");
            Arc::new(ScriptedTransport::new())
        }
    }
}

/// 默认的本地能力：文件系统、受限进程、日志终端、stdout 通知
pub fn local_capabilities(config: &AppConfig, policy: Arc<WorkspacePolicy>) -> Capabilities {
    let process = LocalProcessAdapter::new(Arc::clone(&policy), config.tools.allowed_commands.clone())
        .with_forbidden(&config.tools.forbidden_commands);
    Capabilities::new()
        .with_file(Arc::new(LocalFileAdapter::new(policy)))
        .with_process(Arc::new(process))
        .with_terminal(Arc::new(LogTerminal))
        .with_notification(Arc::new(StdoutNotifier))
}

pub struct OrchestratorBuilder {
    config: AppConfig,
    workspace: PathBuf,
    transport: Option<Arc<dyn ModelTransport>>,
    capabilities: Option<Capabilities>,
    events: Option<UnboundedSender<PhaseEvent>>,
    metrics: Option<Arc<Metrics>>,
    system_prompt: Option<String>,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig, workspace: PathBuf) -> Self {
        Self {
            config,
            workspace,
            transport: None,
            capabilities: None,
            events: None,
            metrics: None,
            system_prompt: None,
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn ModelTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// 替换宿主能力（默认使用本地适配器）
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    /// 过程事件订阅
    pub fn with_events(mut self, tx: UnboundedSender<PhaseEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn build(self) -> Orchestrator {
        let cfg = &self.config;
        let policy = cfg.tools.workspace_policy(&self.workspace);
        let errors = Arc::new(ErrorHandler::new(cfg.retry.log_limits()));
        let metrics = self.metrics.unwrap_or_default();
        let capabilities = self
            .capabilities
            .unwrap_or_else(|| local_capabilities(cfg, Arc::clone(&policy)));
        let gateway = ToolGateway::new(
            capabilities,
            policy,
            Arc::clone(&errors),
            Arc::clone(&metrics),
            cfg.tools.gateway_config(&cfg.retry),
        );
        let prompts = match self.system_prompt {
            Some(p) => PromptBuilder::new(p),
            None => PromptBuilder::load(cfg.app.system_prompt_path.as_deref()),
        };
        let transport = self
            .transport
            .unwrap_or_else(|| create_transport_from_config(cfg));

        tracing::info!(
            workspace = %self.workspace.display(),
            model = %cfg.model.default_model,
            "orchestrator ready"
        );
        Orchestrator {
            sessions: Arc::new(SessionManager::new(cfg.session.session_config(&cfg.todo))),
            gateway: Arc::new(gateway),
            gate: VerificationGate::new(cfg.verification.gate_config()),
            transport,
            prompts,
            errors,
            recovery: RecoveryEngine::new(),
            metrics,
            model_retry: cfg.model.retry_policy(&cfg.retry),
            model_timeout: cfg.model.request_timeout(),
            events: self.events,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolContext;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_default_build_wires_local_capabilities() {
        let dir = TempDir::new().unwrap();
        let mut cfg = AppConfig::default();
        cfg.model.provider = "scripted".into();
        let orch = OrchestratorBuilder::new(cfg, dir.path().to_path_buf()).build();
        let ctx = ToolContext {
            session_id: "s".into(),
            todo_id: None,
        };
        let out = orch
            .gateway
            .execute_tool(
                "write_file",
                &serde_json::json!({"path": "a.txt", "content": "hi"}),
                &ctx,
            )
            .await;
        assert!(out.success(), "{:?}", out.error());
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "hi");
    }

    #[test]
    fn test_custom_system_prompt() {
        let dir = TempDir::new().unwrap();
        let orch = OrchestratorBuilder::new(AppConfig::default(), dir.path().to_path_buf())
            .with_transport(Arc::new(ScriptedTransport::new()))
            .with_system_prompt("Be brief.")
            .build();
        assert_eq!(orch.prompts.base(), "Be brief.");
    }
}
