//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Routing / Mock）实现 LlmClient：chat（按任务类型选模型）、generate_embedding（可选能力）。
//! 核心循环只依赖这个 trait，不关心具体厂商。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    Assistant,
    System,
}

/// 单条消息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// 任务类型：决定路由到哪个模型（planning 用强模型，fast 用轻量模型做校验）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Planning,
    Reasoning,
    Coding,
    Fast,
    General,
}

/// chat 调用选项
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// 工具 schema JSON；提供时由客户端注入 system prompt，供模型生成合法 tool call
    pub tools: Option<String>,
}

/// 模型请求的工具调用（从回复 JSON 解析或由原生 tool calling 返回）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmToolCall {
    pub tool: String,
    pub args: serde_json::Value,
}

/// 单次 chat 调用结果：文本、token 与成本统计、可选工具调用
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub content: String,
    pub tokens_used: u64,
    pub cost: f64,
    pub tool_calls: Vec<LlmToolCall>,
}

/// LLM 层错误
#[derive(Error, Debug)]
pub enum LlmError {
    /// 无任何可用后端——启动期致命错误，核心无法绕过
    #[error("No LLM provider available")]
    NoProvider,

    #[error("API error: {0}")]
    Api(String),

    #[error("Request build error: {0}")]
    Request(String),
}

/// LLM 客户端 trait：按任务类型完成对话；嵌入为可选能力（None 不是错误）
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat(
        &self,
        messages: &[Message],
        task_type: TaskType,
        options: &ChatOptions,
    ) -> Result<ChatResponse, LlmError>;

    /// 将文本编码为向量；后端不支持嵌入时返回 Ok(None)
    async fn generate_embedding(&self, _text: &str) -> Result<Option<Vec<f32>>, LlmError> {
        Ok(None)
    }

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
