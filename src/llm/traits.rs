//! 模型传输抽象
//!
//! 编排器只依赖 ModelTransport：发送一次请求，得到文本或已结构化的 JSON。
//! 传输层失败统一为 ErrorRecord，由编排器决定是否重试。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::ErrorRecord;

/// 单次模型请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRequest {
    pub model_id: String,
    /// system prompt（响应格式、工具目录）
    pub system: String,
    /// 本轮上下文提示
    pub prompt: String,
    /// 请求模式，目前只有 "agent"
    pub mode: String,
    pub session_id: Option<String>,
}

pub const AGENT_MODE: &str = "agent";

/// 模型返回：原始文本，或宿主已解析好的 JSON
#[derive(Debug, Clone, PartialEq)]
pub enum ModelReply {
    Text(String),
    Raw(serde_json::Value),
}

#[async_trait]
pub trait ModelTransport: Send + Sync {
    async fn send(&self, request: ModelRequest) -> Result<ModelReply, ErrorRecord>;

    /// 累计 token 使用：(prompt, completion, total)
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
