//! LLM 层：客户端抽象与实现（OpenAI 兼容 / 路由 / Mock）

pub mod mock;
pub mod openai;
pub mod router;
pub mod tracking;
pub mod traits;

pub use mock::MockLlmClient;
pub use openai::{OpenAiClient, TokenUsage};
pub use router::RoutingClient;
pub use tracking::{Spend, TrackedClient};
pub use traits::{
    ChatOptions, ChatResponse, LlmClient, LlmError, LlmToolCall, Message, Role, TaskType,
};
