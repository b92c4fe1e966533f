//! 多后端路由
//!
//! 按任务类型查「偏好后端顺序表」，逐个尝试直到成功；策略表在控制循环之外配置，
//! 核心只见 LlmClient。未注册任何后端时构造失败（启动期致命，而非循环内反复失败）。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::llm::{ChatOptions, ChatResponse, LlmClient, LlmError, Message, TaskType};

/// 路由客户端：持有命名后端与任务类型偏好表
pub struct RoutingClient {
    providers: Vec<(String, Arc<dyn LlmClient>)>,
    task_routes: HashMap<TaskType, Vec<String>>,
}

impl RoutingClient {
    /// 至少需要一个后端；providers 的注册顺序即默认回退顺序
    pub fn new(providers: Vec<(String, Arc<dyn LlmClient>)>) -> Result<Self, LlmError> {
        if providers.is_empty() {
            return Err(LlmError::NoProvider);
        }
        Ok(Self {
            providers,
            task_routes: HashMap::new(),
        })
    }

    /// 设置某任务类型的偏好后端顺序（未列出的后端仍作为兜底）
    pub fn with_route(mut self, task_type: TaskType, preferred: Vec<String>) -> Self {
        self.task_routes.insert(task_type, preferred);
        self
    }

    /// 按偏好表展开候选后端：偏好在前，其余按注册顺序兜底
    fn candidates(&self, task_type: TaskType) -> Vec<&(String, Arc<dyn LlmClient>)> {
        let preferred = self.task_routes.get(&task_type);
        let mut out: Vec<&(String, Arc<dyn LlmClient>)> = Vec::new();
        if let Some(names) = preferred {
            for name in names {
                if let Some(p) = self.providers.iter().find(|(n, _)| n == name) {
                    out.push(p);
                }
            }
        }
        for p in &self.providers {
            if !out.iter().any(|(n, _)| n == &p.0) {
                out.push(p);
            }
        }
        out
    }
}

#[async_trait]
impl LlmClient for RoutingClient {
    async fn chat(
        &self,
        messages: &[Message],
        task_type: TaskType,
        options: &ChatOptions,
    ) -> Result<ChatResponse, LlmError> {
        let mut last_err = LlmError::NoProvider;
        for (name, client) in self.candidates(task_type) {
            match client.chat(messages, task_type, options).await {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    tracing::warn!(provider = %name, error = %e, "provider failed, trying next");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn generate_embedding(&self, text: &str) -> Result<Option<Vec<f32>>, LlmError> {
        for (_, client) in &self.providers {
            if let Ok(Some(v)) = client.generate_embedding(text).await {
                return Ok(Some(v));
            }
        }
        Ok(None)
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.providers
            .iter()
            .map(|(_, c)| c.token_usage())
            .fold((0, 0, 0), |acc, (a, b, c)| (acc.0 + a, acc.1 + b, acc.2 + c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;

    #[test]
    fn test_no_provider_is_fatal() {
        assert!(matches!(
            RoutingClient::new(Vec::new()),
            Err(LlmError::NoProvider)
        ));
    }

    #[tokio::test]
    async fn test_route_prefers_named_provider() {
        let fast = Arc::new(MockLlmClient::new());
        fast.push("from fast");
        let smart = Arc::new(MockLlmClient::new());
        smart.push("from smart");

        let router = RoutingClient::new(vec![
            ("smart".to_string(), smart.clone() as Arc<dyn LlmClient>),
            ("fast".to_string(), fast.clone() as Arc<dyn LlmClient>),
        ])
        .unwrap()
        .with_route(TaskType::Fast, vec!["fast".to_string()]);

        let resp = router
            .chat(&[Message::user("hi")], TaskType::Fast, &ChatOptions::default())
            .await
            .unwrap();
        assert_eq!(resp.content, "from fast");

        let resp = router
            .chat(&[Message::user("hi")], TaskType::Planning, &ChatOptions::default())
            .await
            .unwrap();
        assert_eq!(resp.content, "from smart");
    }
}
