//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按 FIFO 顺序回放预置回复；脚本耗尽后回显最后一条 User 消息，便于本地跑通整个循环。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{ChatOptions, ChatResponse, LlmClient, LlmError, Message, Role, TaskType};

/// Mock 客户端：回放脚本化回复，并记录每次调用的任务类型
pub struct MockLlmClient {
    scripted: Mutex<VecDeque<ChatResponse>>,
    calls: Mutex<Vec<TaskType>>,
    /// 每次调用计入的固定成本（默认 0，预算测试时设为较大值）
    pub cost_per_call: f64,
    /// generate_embedding 是否返回固定向量（默认 None，即不支持嵌入）
    pub embedding: Option<Vec<f32>>,
}

impl Default for MockLlmClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self {
            scripted: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            cost_per_call: 0.0,
            embedding: None,
        }
    }

    pub fn with_cost_per_call(mut self, cost: f64) -> Self {
        self.cost_per_call = cost;
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// 预置一条纯文本回复
    pub fn push(&self, content: impl Into<String>) {
        self.scripted.lock().unwrap().push_back(ChatResponse {
            content: content.into(),
            tokens_used: 10,
            cost: self.cost_per_call,
            tool_calls: Vec::new(),
        });
    }

    /// 预置一条完整回复（自定义 token/cost/tool_calls）
    pub fn push_response(&self, response: ChatResponse) {
        self.scripted.lock().unwrap().push_back(response);
    }

    /// 已发生调用的任务类型序列（断言路由行为用）
    pub fn call_log(&self) -> Vec<TaskType> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn chat(
        &self,
        messages: &[Message],
        task_type: TaskType,
        _options: &ChatOptions,
    ) -> Result<ChatResponse, LlmError> {
        self.calls.lock().unwrap().push(task_type);

        if let Some(scripted) = self.scripted.lock().unwrap().pop_front() {
            return Ok(scripted);
        }

        let last_user = messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");

        Ok(ChatResponse {
            content: format!("Echo from Mock: {}", last_user),
            tokens_used: 10,
            cost: self.cost_per_call,
            tool_calls: Vec::new(),
        })
    }

    async fn generate_embedding(&self, _text: &str) -> Result<Option<Vec<f32>>, LlmError> {
        Ok(self.embedding.clone())
    }
}
