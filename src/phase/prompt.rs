//! Prompt 拼装：system prompt（响应格式 + 工具目录）与每轮上下文

use std::path::Path;

use crate::llm::{ModelRequest, AGENT_MODE};
use crate::phase::response_schema_json;
use crate::tools::catalog_json;

const DEFAULT_SYSTEM_PROMPT: &str = "You are an autonomous task executor. Work through the task in phases: \
planning (break the task into TODOs with a description and expected result), execution (call one tool at a \
time and report TODO status updates), verification (confirm a TODO's result matches its expected result) and \
complete (when every TODO is finished). Always answer with a single JSON object of type \"agent_response\".";

pub struct PromptBuilder {
    base: String,
}

impl PromptBuilder {
    pub fn new(base: impl Into<String>) -> Self {
        Self { base: base.into() }
    }

    /// 依次尝试配置路径、config/prompts/system.txt、../config/prompts/system.txt，都没有时用内置文本
    pub fn load(path: Option<&Path>) -> Self {
        let from_config = path.and_then(|p| std::fs::read_to_string(p).ok());
        let base = from_config
            .or_else(|| {
                ["config/prompts/system.txt", "../config/prompts/system.txt"]
                    .into_iter()
                    .find_map(|p| std::fs::read_to_string(p).ok())
            })
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());
        Self::new(base)
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn system_prompt(&self) -> String {
        format!(
            "{}\n\nResponse JSON schema:\n{}\n\nAvailable tools (toolCall = {{\"name\", \"params\"}}):\n{}",
            self.base.trim(),
            response_schema_json(),
            catalog_json()
        )
    }

    /// 拼接本轮上下文与用户输入
    pub fn build_request(
        &self,
        model_id: &str,
        session_id: &str,
        context: &str,
        user_input: &str,
    ) -> ModelRequest {
        let mut prompt = context.trim_end().to_string();
        let input = user_input.trim();
        if !input.is_empty() {
            prompt.push_str("\n\nUser: ");
            prompt.push_str(input);
        }
        ModelRequest {
            model_id: model_id.to_string(),
            system: self.system_prompt(),
            prompt,
            mode: AGENT_MODE.to_string(),
            session_id: Some(session_id.to_string()),
        }
    }
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_SYSTEM_PROMPT)
    }
}
