//! Shell 工具：经 SecureCommandGate 执行命令
//!
//! 拒绝与失败都以 Err(String) 返回给执行层，由模型依据原因自行调整命令。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::gate::SecureCommandGate;
use crate::tools::Tool;

/// execute_shell 工具：所有命令经闸门校验与资源限制
pub struct ShellTool {
    gate: Arc<SecureCommandGate>,
}

impl ShellTool {
    pub fn new(gate: Arc<SecureCommandGate>) -> Self {
        Self { gate }
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "execute_shell"
    }

    fn description(&self) -> &str {
        "Run a whitelisted shell command under timeout and output limits. Args: {\"command\": \"...\"}"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute (leading token must be in the allowlist)"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let command = args
            .get("command")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim();
        let outcome = self.gate.execute(command).await;
        if outcome.success {
            Ok(outcome.output)
        } else {
            let reason = outcome.error.unwrap_or_else(|| "unknown failure".to_string());
            if outcome.output.is_empty() {
                Err(reason)
            } else {
                Err(format!("{}\npartial output:\n{}", reason, outcome.output))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShellSection;

    #[tokio::test]
    async fn test_shell_tool_roundtrip() {
        let gate = Arc::new(SecureCommandGate::new(&ShellSection::default()));
        let tool = ShellTool::new(gate);
        let out = tool
            .execute(serde_json::json!({"command": "echo test"}))
            .await
            .unwrap();
        assert!(out.contains("test"));
    }
}
