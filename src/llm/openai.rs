//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；按任务类型查模型表，
//! 累计 token 使用并按配置价格折算会话成本。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::types::embeddings::{CreateEmbeddingRequestArgs, EmbeddingInput};
use async_openai::Client;
use async_trait::async_trait;

use crate::config::{LlmModelsSection, LlmPricingSection};
use crate::llm::{ChatOptions, ChatResponse, LlmClient, LlmError, Message, Role, TaskType};

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

/// OpenAI 兼容客户端：持有 Client、任务类型模型表与计价，chat 时转 Message 为 API 格式并取首条 content
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    models: LlmModelsSection,
    pricing: LlmPricingSection,
    /// 嵌入模型；None 时 generate_embedding 返回 Ok(None)
    embedding_model: Option<String>,
    /// 累计 token 使用统计
    pub usage: TokenUsage,
}

impl OpenAiClient {
    pub fn new(
        base_url: Option<&str>,
        models: LlmModelsSection,
        pricing: LlmPricingSection,
        embedding_model: Option<String>,
        api_key: &str,
    ) -> Self {
        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            models,
            pricing,
            embedding_model,
            usage: TokenUsage::new(),
        }
    }

    /// 任务类型 -> 模型名
    fn model_for(&self, task_type: TaskType) -> &str {
        match task_type {
            TaskType::Planning => &self.models.planning,
            TaskType::Reasoning => &self.models.reasoning,
            TaskType::Coding => &self.models.coding,
            TaskType::Fast => &self.models.fast,
            TaskType::General => &self.models.general,
        }
    }

    fn cost_of(&self, prompt: u64, completion: u64) -> f64 {
        (prompt as f64 / 1000.0) * self.pricing.prompt_per_1k
            + (completion as f64 / 1000.0) * self.pricing.completion_per_1k
    }

    fn to_openai_messages(
        &self,
        messages: &[Message],
    ) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
        messages
            .iter()
            .map(|m| {
                let msg = match m.role {
                    Role::System => ChatCompletionRequestMessage::System(
                        ChatCompletionRequestSystemMessageArgs::default()
                            .content(m.content.clone())
                            .build()
                            .map_err(|e| LlmError::Request(e.to_string()))?,
                    ),
                    Role::User => ChatCompletionRequestMessage::User(
                        ChatCompletionRequestUserMessageArgs::default()
                            .content(m.content.clone())
                            .build()
                            .map_err(|e| LlmError::Request(e.to_string()))?,
                    ),
                    Role::Assistant => ChatCompletionRequestMessage::Assistant(
                        ChatCompletionRequestAssistantMessageArgs::default()
                            .content(m.content.clone())
                            .build()
                            .map_err(|e| LlmError::Request(e.to_string()))?,
                    ),
                };
                Ok(msg)
            })
            .collect()
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn chat(
        &self,
        messages: &[Message],
        task_type: TaskType,
        options: &ChatOptions,
    ) -> Result<ChatResponse, LlmError> {
        // 工具 schema 走 system prompt 注入（兼容不支持原生 tool calling 的端点）
        let mut messages = messages.to_vec();
        if let Some(ref tools) = options.tools {
            let section = format!("\n\n## Available tools (JSON schema)\n{}", tools);
            match messages.iter_mut().find(|m| m.role == Role::System) {
                Some(system) => system.content.push_str(&section),
                None => messages.insert(0, Message::system(section.trim_start().to_string())),
            }
        }

        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(self.model_for(task_type))
            .messages(self.to_openai_messages(&messages)?);
        if let Some(t) = options.temperature {
            args.temperature(t);
        }
        if let Some(n) = options.max_tokens {
            args.max_tokens(n);
        }
        let request = args.build().map_err(|e| LlmError::Request(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| LlmError::Api(e.to_string()))?;

        let (prompt, completion) = response
            .usage
            .as_ref()
            .map(|u| (u.prompt_tokens as u64, u.completion_tokens as u64))
            .unwrap_or((0, 0));
        self.usage.add(prompt, completion);

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        Ok(ChatResponse {
            content,
            tokens_used: prompt + completion,
            cost: self.cost_of(prompt, completion),
            tool_calls: Vec::new(),
        })
    }

    async fn generate_embedding(&self, text: &str) -> Result<Option<Vec<f32>>, LlmError> {
        let Some(ref model) = self.embedding_model else {
            return Ok(None);
        };
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }
        let request = CreateEmbeddingRequestArgs::default()
            .model(model)
            .input(EmbeddingInput::String(text.to_string()))
            .build()
            .map_err(|e| LlmError::Request(e.to_string()))?;
        let response = self
            .client
            .embeddings()
            .create(request)
            .await
            .map_err(|e| LlmError::Api(e.to_string()))?;
        Ok(response.data.first().map(|e| e.embedding.clone()))
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }
}
