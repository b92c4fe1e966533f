//! Task Executor：用工具增强的 LLM 对话把单个任务推进到完成
//!
//! 两层结构：内层工具循环（模型请求工具 -> 执行 -> Observation 写回对话），
//! 外层完成校验（模型给出自然语言结果后，用轻量模型独立判定验收标准是否全部满足，
//! 仅 COMPLETE 记为成功）。模型自认为完成不算数——独立校验降低假阳性。
//! 每次模型调用后检查会话成本，越线立即中止任务。所有工具调用无论成败都按序记入审计日志。

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, timeout};

use crate::llm::{ChatOptions, LlmClient, LlmToolCall, Message, TaskType};
use crate::react::planner::Task;
use crate::tools::{tool_call_schema_json, ToolRegistry};

/// 单次工具调用记录（审计轨迹）
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallRecord {
    pub tool: String,
    pub arguments: serde_json::Value,
    pub result: Option<String>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// 单次 execute_task 的结果；返回后不可变
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub tokens_used: u64,
    pub cost: f64,
}

impl ExecutionResult {
    fn failure(error: String, tool_calls: Vec<ToolCallRecord>, tokens: u64, cost: f64) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error),
            tool_calls,
            tokens_used: tokens,
            cost,
        }
    }
}

/// 模型回复中的工具调用 JSON：{"tool": "...", "args": {...}}
#[derive(Debug, Deserialize)]
struct ToolCallJson {
    tool: String,
    #[serde(default)]
    args: serde_json::Value,
}

/// 从回复文本中提取工具调用；无有效 JSON 或 tool 为空时视为自然语言回答
fn parse_tool_call(content: &str) -> Option<LlmToolCall> {
    let trimmed = content.trim();
    let json = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim())
    } else {
        let start = trimmed.find('{')?;
        let end = trimmed.rfind('}')?;
        if end <= start {
            return None;
        }
        &trimmed[start..=end]
    };
    let parsed: ToolCallJson = serde_json::from_str(json).ok()?;
    if parsed.tool.is_empty() {
        return None;
    }
    Some(LlmToolCall {
        tool: parsed.tool,
        args: parsed.args,
    })
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

/// 任务执行器：对话循环 + 完成校验；自身无跨调用状态
pub struct TaskExecutor {
    llm: Arc<dyn LlmClient>,
    tools: Arc<ToolRegistry>,
    max_attempts: u32,
    max_session_cost: f64,
    tool_timeout: Duration,
}

impl TaskExecutor {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        tools: Arc<ToolRegistry>,
        max_attempts: u32,
        max_session_cost: f64,
        tool_timeout_secs: u64,
    ) -> Self {
        Self {
            llm,
            tools,
            max_attempts,
            max_session_cost,
            tool_timeout: Duration::from_secs(tool_timeout_secs),
        }
    }

    /// 执行单个任务；session_cost_before 为本会话已花费成本，用于成本上限判断。
    /// 失败不抛异常，一律以 success=false + error 返回。
    pub async fn execute_task(
        &self,
        task: &Task,
        context: &str,
        session_cost_before: f64,
    ) -> ExecutionResult {
        let criteria = if task.acceptance_criteria.is_empty() {
            "- The task described has been carried out".to_string()
        } else {
            task.acceptance_criteria
                .iter()
                .map(|c| format!("- {}", c))
                .collect::<Vec<_>>()
                .join("\n")
        };

        let mut messages = vec![
            Message::system(format!(
                "You are the execution module of an autonomous agent. \
                 To use a tool, reply with ONLY one JSON object: {{\"tool\": \"name\", \"args\": {{...}}}}, \
                 matching this schema:\n{}\n\
                 When the task is fully done, reply with a plain-text result instead.",
                tool_call_schema_json()
            )),
            Message::user(format!(
                "Task: {}\n\nAcceptance criteria:\n{}\n\nContext:\n{}",
                task.description, criteria, context
            )),
        ];

        let options = ChatOptions {
            temperature: Some(0.2),
            tools: Some(self.tools.definitions_json()),
            ..Default::default()
        };

        let mut tool_log: Vec<ToolCallRecord> = Vec::new();
        let mut tokens: u64 = 0;
        let mut cost: f64 = 0.0;
        let mut last_feedback = String::new();

        for attempt in 1..=self.max_attempts {
            let response = match self.llm.chat(&messages, TaskType::Coding, &options).await {
                Ok(r) => r,
                Err(e) => {
                    return ExecutionResult::failure(
                        format!("LLM call failed on attempt {}: {}", attempt, e),
                        tool_log,
                        tokens,
                        cost,
                    );
                }
            };
            tokens += response.tokens_used;
            cost += response.cost;
            if let Some(err) = self.cost_exceeded(session_cost_before + cost) {
                return ExecutionResult::failure(err, tool_log, tokens, cost);
            }

            // 原生 tool calling 优先，否则从回复文本解析 JSON 工具调用
            let tool_calls: Vec<LlmToolCall> = if response.tool_calls.is_empty() {
                parse_tool_call(&response.content).into_iter().collect()
            } else {
                response.tool_calls.clone()
            };

            if !tool_calls.is_empty() {
                messages.push(Message::assistant(response.content.clone()));
                for call in tool_calls {
                    let observation = self.dispatch(&call, &mut tool_log).await;
                    messages.push(Message::user(format!(
                        "Observation from {}: {}",
                        call.tool, observation
                    )));
                }
                continue;
            }

            // 自然语言回答：独立完成校验（快速轻量模型，低温）
            let verdict = match self.verify(task, &criteria, &response.content).await {
                Ok((verdict, vtokens, vcost)) => {
                    tokens += vtokens;
                    cost += vcost;
                    if let Some(err) = self.cost_exceeded(session_cost_before + cost) {
                        return ExecutionResult::failure(err, tool_log, tokens, cost);
                    }
                    verdict
                }
                Err(e) => {
                    return ExecutionResult::failure(
                        format!("Verification call failed: {}", e),
                        tool_log,
                        tokens,
                        cost,
                    );
                }
            };

            if verdict.trim_start().to_uppercase().starts_with("COMPLETE") {
                return ExecutionResult {
                    success: true,
                    output: response.content,
                    error: None,
                    tool_calls: tool_log,
                    tokens_used: tokens,
                    cost,
                };
            }

            last_feedback = verdict.clone();
            messages.push(Message::assistant(response.content));
            messages.push(Message::user(format!(
                "Verification feedback: {}\nThe acceptance criteria are not yet met. Continue working.",
                verdict
            )));
        }

        ExecutionResult::failure(
            format!(
                "Acceptance criteria not met after {} attempts. Last verification feedback: {}",
                self.max_attempts,
                if last_feedback.is_empty() { "(none)" } else { &last_feedback }
            ),
            tool_log,
            tokens,
            cost,
        )
    }

    /// 外部调用方的重试入口：线性退避（1000ms * 次数）。主循环直接用 execute_task，
    /// 因为循环本身已有重规划兜底，不在任务层叠加重试。
    pub async fn execute_with_retry(
        &self,
        task: &Task,
        context: &str,
        session_cost_before: f64,
        max_retries: u32,
    ) -> ExecutionResult {
        let mut last = ExecutionResult::failure("no attempts made".to_string(), Vec::new(), 0, 0.0);
        for attempt in 1..=max_retries.max(1) {
            last = self.execute_task(task, context, session_cost_before).await;
            if last.success {
                return last;
            }
            if attempt < max_retries {
                tracing::warn!(attempt, error = ?last.error, "task attempt failed, backing off");
                sleep(Duration::from_millis(1000 * attempt as u64)).await;
            }
        }
        last
    }

    fn cost_exceeded(&self, spent: f64) -> Option<String> {
        (spent > self.max_session_cost).then(|| {
            format!(
                "Session cost limit exceeded (${:.4} > ${:.4}), aborting task",
                spent, self.max_session_cost
            )
        })
    }

    /// 分发一次工具调用并记录审计日志；失败也写入 Observation 供模型调整
    async fn dispatch(&self, call: &LlmToolCall, tool_log: &mut Vec<ToolCallRecord>) -> String {
        let start = Instant::now();
        let result = timeout(
            self.tool_timeout,
            self.tools.execute(&call.tool, call.args.clone()),
        )
        .await;

        let (outcome, observation, record_result, record_error) = match &result {
            Ok(Ok(out)) => ("ok", out.clone(), Some(out.clone()), None),
            Ok(Err(e)) => ("error", format!("Error: {}", e), None, Some(e.clone())),
            Err(_) => {
                let msg = format!("Error: tool timed out after {}s", self.tool_timeout.as_secs());
                ("timeout", msg.clone(), None, Some(msg))
            }
        };

        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": call.tool,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview(&call.args),
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        tool_log.push(ToolCallRecord {
            tool: call.tool.clone(),
            arguments: call.args.clone(),
            result: record_result,
            error: record_error,
            timestamp: Utc::now(),
        });
        observation
    }

    async fn verify(
        &self,
        task: &Task,
        criteria: &str,
        candidate: &str,
    ) -> Result<(String, u64, f64), crate::llm::LlmError> {
        let messages = vec![Message::user(format!(
            "Task: {}\n\nAcceptance criteria:\n{}\n\nCandidate result:\n{}\n\n\
             Are ALL acceptance criteria fully met? Reply with COMPLETE, or INCOMPLETE followed by what is missing.",
            task.description, criteria, candidate
        ))];
        let options = ChatOptions {
            temperature: Some(0.0),
            ..Default::default()
        };
        let response = self.llm.chat(&messages, TaskType::Fast, &options).await?;
        Ok((response.content, response.tokens_used, response.cost))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShellSection;
    use crate::llm::{ChatResponse, MockLlmClient};
    use crate::tools::{EchoTool, SecureCommandGate, ShellTool, ToolRegistry};

    fn executor_with(mock: Arc<MockLlmClient>, max_attempts: u32, max_cost: f64) -> TaskExecutor {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        TaskExecutor::new(mock, Arc::new(registry), max_attempts, max_cost, 5)
    }

    fn task_with_criteria() -> Task {
        let mut t = Task::new("say hello");
        t.acceptance_criteria = vec!["greeting produced".to_string()];
        t
    }

    #[tokio::test]
    async fn test_tool_call_then_complete() {
        let mock = Arc::new(MockLlmClient::new());
        mock.push(r#"{"tool": "echo", "args": {"text": "hello"}}"#);
        mock.push("hello was echoed");
        mock.push("COMPLETE");
        let executor = executor_with(mock, 5, 10.0);

        let result = executor.execute_task(&task_with_criteria(), "", 0.0).await;
        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(result.tool_calls.len(), 1);
        assert_eq!(result.tool_calls[0].tool, "echo");
        assert_eq!(result.tool_calls[0].result.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_always_incomplete_exhausts_attempts() {
        let mock = Arc::new(MockLlmClient::new());
        for _ in 0..2 {
            mock.push("here is my answer");
            mock.push("INCOMPLETE: missing greeting");
        }
        let executor = executor_with(mock, 2, 10.0);

        let result = executor.execute_task(&task_with_criteria(), "", 0.0).await;
        assert!(!result.success);
        let err = result.error.unwrap();
        assert!(err.contains("2 attempts"), "got: {}", err);
        assert!(err.contains("INCOMPLETE"));
    }

    #[tokio::test]
    async fn test_cost_cap_aborts_mid_task() {
        let mock = Arc::new(MockLlmClient::new());
        mock.push_response(ChatResponse {
            content: "thinking...".to_string(),
            tokens_used: 100,
            cost: 5.0,
            tool_calls: Vec::new(),
        });
        let executor = executor_with(mock, 5, 1.0);

        let result = executor.execute_task(&task_with_criteria(), "", 0.0).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("cost limit"));
    }

    fn shell_executor(mock: Arc<MockLlmClient>, shell: &ShellSection, timeout_secs: u64) -> TaskExecutor {
        let gate = Arc::new(SecureCommandGate::new(shell));
        let mut registry = ToolRegistry::new();
        registry.register(ShellTool::new(gate));
        TaskExecutor::new(mock, Arc::new(registry), 1, 10.0, timeout_secs)
    }

    #[tokio::test]
    async fn test_shell_tool_call_recorded_in_audit_trail() {
        let mock = Arc::new(MockLlmClient::new());
        mock.push(r#"{"tool": "execute_shell", "args": {"command": "echo audit-ok"}}"#);
        mock.push("The command printed audit-ok");
        mock.push("COMPLETE");
        let gate = Arc::new(SecureCommandGate::new(&ShellSection::default()));
        let mut registry = ToolRegistry::new();
        registry.register(ShellTool::new(gate));
        let executor = TaskExecutor::new(mock, Arc::new(registry), 5, 10.0, 10);

        let mut task = Task::new("run `echo audit-ok` in the shell");
        task.acceptance_criteria = vec!["the command output contains audit-ok".to_string()];
        let result = executor.execute_task(&task, "", 0.0).await;
        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(result.tool_calls.len(), 1);
        assert_eq!(result.tool_calls[0].tool, "execute_shell");
        let recorded = result.tool_calls[0].result.as_deref().unwrap_or("");
        assert!(recorded.contains("audit-ok"), "got: {}", recorded);
    }

    #[tokio::test]
    async fn test_shell_rejection_recorded_as_tool_error() {
        let mock = Arc::new(MockLlmClient::new());
        mock.push(r#"{"tool": "execute_shell", "args": {"command": "echo audit-ok"}}"#);
        let shell = ShellSection {
            allowed_commands: vec![],
            ..ShellSection::default()
        };
        let executor = shell_executor(mock, &shell, 10);

        let result = executor.execute_task(&Task::new("run echo"), "", 0.0).await;
        assert!(!result.success);
        assert_eq!(result.tool_calls.len(), 1);
        assert_eq!(result.tool_calls[0].tool, "execute_shell");
        assert!(result.tool_calls[0]
            .error
            .as_deref()
            .unwrap_or("")
            .contains("not in allowlist"));
    }

    #[tokio::test]
    async fn test_gate_timeout_surfaces_before_generic_tool_timeout() {
        let mock = Arc::new(MockLlmClient::new());
        mock.push(r#"{"tool": "execute_shell", "args": {"command": "sleep 3"}}"#);
        let shell = ShellSection {
            allowed_commands: vec!["sleep".into()],
            max_execution_secs: 1,
            ..ShellSection::default()
        };
        // 通用工具超时大于闸门超时，命中的是闸门自带的超时结果
        let executor = shell_executor(mock, &shell, 10);

        let result = executor.execute_task(&Task::new("wait around"), "", 0.0).await;
        assert!(!result.success);
        assert_eq!(result.tool_calls.len(), 1);
        let err = result.tool_calls[0].error.as_deref().unwrap_or("");
        assert!(err.contains("timed out after 1s"), "got: {}", err);
    }

    #[tokio::test]
    async fn test_failed_tool_call_recorded_in_audit_log() {
        let mock = Arc::new(MockLlmClient::new());
        mock.push(r#"{"tool": "does_not_exist", "args": {}}"#);
        mock.push("giving up, answering directly");
        mock.push("COMPLETE");
        let executor = executor_with(mock, 5, 10.0);

        let result = executor.execute_task(&task_with_criteria(), "", 0.0).await;
        assert!(result.success);
        assert_eq!(result.tool_calls.len(), 1);
        assert!(result.tool_calls[0].error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_with_retry_returns_first_success() {
        let mock = Arc::new(MockLlmClient::new());
        // 第一轮：校验 INCOMPLETE 耗尽 1 次尝试；第二轮：COMPLETE
        mock.push("draft answer");
        mock.push("INCOMPLETE: not good enough");
        mock.push("final answer");
        mock.push("COMPLETE");
        let executor = executor_with(mock, 1, 10.0);

        let result = executor
            .execute_with_retry(&task_with_criteria(), "", 0.0, 3)
            .await;
        assert!(result.success);
        assert_eq!(result.output, "final answer");
    }

    #[test]
    fn test_parse_tool_call_variants() {
        assert!(parse_tool_call("plain answer, no json").is_none());
        let call = parse_tool_call("```json\n{\"tool\": \"echo\", \"args\": {\"text\": \"x\"}}\n```").unwrap();
        assert_eq!(call.tool, "echo");
        assert!(parse_tool_call("{\"tool\": \"\", \"args\": {}}").is_none());
    }
}
