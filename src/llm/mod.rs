//! 模型层：传输抽象与实现（OpenAI 兼容 / 脚本化）

pub mod mock;
pub mod openai;
pub mod traits;

pub use mock::ScriptedTransport;
pub use openai::{OpenAiTransport, TokenUsage};
pub use traits::{ModelReply, ModelRequest, ModelTransport, AGENT_MODE};
