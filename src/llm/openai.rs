//! OpenAI 兼容传输
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；system + user 两条消息，取首条 content。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::core::{ErrorCategory, ErrorClassifier, ErrorRecord};
use crate::llm::{ModelReply, ModelRequest, ModelTransport};

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens.fetch_add(prompt + completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }
}

pub struct OpenAiTransport {
    client: Client<OpenAIConfig>,
    classifier: ErrorClassifier,
    pub usage: TokenUsage,
}

/// 传输层错误：未命中任何已知模式的按网络错误处理（可重试）
fn transport_error(classifier: &ErrorClassifier, message: String) -> ErrorRecord {
    let rec = classifier.classify_message(&message, None);
    let rec = if rec.category == ErrorCategory::System {
        ErrorRecord::new(ErrorCategory::Network, rec.message)
    } else {
        rec
    };
    rec.with_context("transport", "openai")
}

fn build_error(e: impl std::fmt::Display) -> ErrorRecord {
    ErrorRecord::validation(format!("Invalid model request: {e}")).with_code("MODEL_REQUEST_INVALID")
}

impl OpenAiTransport {
    pub fn new(base_url: Option<&str>, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            classifier: ErrorClassifier::new(),
            usage: TokenUsage::new(),
        }
    }

    fn messages(request: &ModelRequest) -> Result<Vec<ChatCompletionRequestMessage>, ErrorRecord> {
        let mut messages = Vec::with_capacity(2);
        if !request.system.trim().is_empty() {
            messages.push(ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(request.system.clone())
                    .build()
                    .map_err(build_error)?,
            ));
        }
        messages.push(ChatCompletionRequestMessage::User(
            ChatCompletionRequestUserMessageArgs::default()
                .content(request.prompt.clone())
                .build()
                .map_err(build_error)?,
        ));
        Ok(messages)
    }
}

#[async_trait]
impl ModelTransport for OpenAiTransport {
    async fn send(&self, request: ModelRequest) -> Result<ModelReply, ErrorRecord> {
        let body = CreateChatCompletionRequestArgs::default()
            .model(&request.model_id)
            .messages(Self::messages(&request)?)
            .build()
            .map_err(build_error)?;

        let response = self
            .client
            .chat()
            .create(body)
            .await
            .map_err(|e| transport_error(&self.classifier, e.to_string()))?;

        if let Some(usage) = &response.usage {
            self.usage
                .add(usage.prompt_tokens as u64, usage.completion_tokens as u64);
        }

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();
        Ok(ModelReply::Text(content))
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }
}
