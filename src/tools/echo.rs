//! Echo 工具：原样返回输入文本，测试与连通性检查用

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::Tool;

pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Return the given text unchanged. Args: {\"text\": \"message\"}"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "text": { "type": "string" }
            },
            "required": ["text"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        match args.get("text").and_then(|v| v.as_str()) {
            Some(text) => Ok(text.to_string()),
            None => Err("Missing 'text' argument".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_requires_text() {
        let out = EchoTool.execute(serde_json::json!({"text": "ping"})).await;
        assert_eq!(out.unwrap(), "ping");
        assert!(EchoTool.execute(serde_json::json!({})).await.is_err());
    }
}
