//! 会话支出统计：包装任意 LlmClient，累计所有调用的 token 与成本

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::llm::{ChatOptions, ChatResponse, LlmClient, LlmError, Message, TaskType};

/// 累计支出快照
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Spend {
    pub tokens: u64,
    pub cost: f64,
}

/// 透明代理：chat 结果原样返回，同时把 tokens_used / cost 计入累计值。
/// 规划、执行、反思共用同一个实例，会话预算才能覆盖全部模型调用。
pub struct TrackedClient {
    inner: Arc<dyn LlmClient>,
    spend: Mutex<Spend>,
}

impl TrackedClient {
    pub fn new(inner: Arc<dyn LlmClient>) -> Self {
        Self {
            inner,
            spend: Mutex::new(Spend::default()),
        }
    }

    pub fn spend(&self) -> Spend {
        *self.spend.lock().unwrap()
    }
}

#[async_trait]
impl LlmClient for TrackedClient {
    async fn chat(
        &self,
        messages: &[Message],
        task_type: TaskType,
        options: &ChatOptions,
    ) -> Result<ChatResponse, LlmError> {
        let response = self.inner.chat(messages, task_type, options).await?;
        let mut spend = self.spend.lock().unwrap();
        spend.tokens += response.tokens_used;
        spend.cost += response.cost;
        Ok(response)
    }

    async fn generate_embedding(&self, text: &str) -> Result<Option<Vec<f32>>, LlmError> {
        self.inner.generate_embedding(text).await
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.inner.token_usage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;

    #[tokio::test]
    async fn test_spend_accumulates_across_calls() {
        let mock = Arc::new(MockLlmClient::new().with_cost_per_call(0.5));
        let tracked = TrackedClient::new(mock);
        for _ in 0..3 {
            tracked
                .chat(&[Message::user("hi")], TaskType::General, &ChatOptions::default())
                .await
                .unwrap();
        }
        let spend = tracked.spend();
        assert_eq!(spend.tokens, 30);
        assert!((spend.cost - 1.5).abs() < 1e-9);
    }
}
