//! Agent 错误类型
//!
//! 边界处（工具、命令网关、模型输出解析）的失败尽量转为结构化结果返回调用方；
//! 只有资源耗尽与配置缺失允许提前结束主循环（见 orchestrator）。

use thiserror::Error;

use crate::llm::LlmError;

/// Agent 运行过程中可能出现的错误（LLM、解析、工具、路径逃逸等）
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("JSON parse error: {0}")]
    JsonParse(String),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Path escape attempt: {0}")]
    PathEscape(String),

    #[error("Config error: {0}")]
    Config(String),
}
