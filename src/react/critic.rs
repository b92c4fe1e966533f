//! Progress Critic：计划进度评估与单任务反思
//!
//! 一次轻量 LLM 调用对照目标给出进度分（0-1）与是否继续当前计划；输出不可解析或调用失败时
//! 返回中性默认值（0.5 / 继续）——Critic 自身绝不让主循环停摆。

use std::sync::Arc;

use serde::Deserialize;

use crate::llm::{ChatOptions, LlmClient, Message, TaskType};
use crate::react::executor::ExecutionResult;
use crate::react::planner::Task;

/// 计划进度评估；由 Orchestrator 即时消费，不持久化
#[derive(Debug, Clone)]
pub struct ProgressEvaluation {
    /// 0-1
    pub progress_score: f64,
    pub should_continue: bool,
    pub feedback: String,
}

impl ProgressEvaluation {
    /// 中性默认：评估不可用时既不触发重规划也不打断循环
    fn neutral(reason: &str) -> Self {
        Self {
            progress_score: 0.5,
            should_continue: true,
            feedback: format!("(progress evaluation unavailable: {})", reason),
        }
    }
}

/// 单任务反思：逐条验收标准的达成情况与可沉淀的经验
#[derive(Debug, Clone)]
pub struct Reflection {
    pub quality_score: f64,
    pub criteria_met: Vec<bool>,
    pub should_replan: bool,
    pub issues: Vec<String>,
    pub learnings: String,
}

#[derive(Debug, Deserialize)]
struct ProgressJson {
    #[serde(default = "default_score")]
    progress_score: f64,
    #[serde(default = "default_continue")]
    should_continue: bool,
    #[serde(default)]
    feedback: String,
}

fn default_score() -> f64 {
    0.5
}

fn default_continue() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct ReflectionJson {
    #[serde(default = "default_score")]
    quality_score: f64,
    #[serde(default)]
    criteria_met: Vec<bool>,
    #[serde(default)]
    should_replan: bool,
    #[serde(default)]
    issues: Vec<String>,
    #[serde(default)]
    learnings: String,
}

fn extract_json(output: &str) -> Option<&str> {
    let trimmed = output.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

/// Critic：持有 LLM，evaluate_plan_progress / reflect 均为尽力而为
pub struct Critic {
    llm: Arc<dyn LlmClient>,
}

impl Critic {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// 对照目标评估整体进度；失败时返回中性默认
    pub async fn evaluate_plan_progress(
        &self,
        completed: &[&Task],
        remaining: &[&Task],
        objective: &str,
    ) -> ProgressEvaluation {
        let describe = |tasks: &[&Task]| {
            if tasks.is_empty() {
                "(none)".to_string()
            } else {
                tasks
                    .iter()
                    .map(|t| format!("- {}", t.description))
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        };
        let messages = vec![Message::user(format!(
            "Objective: {}\n\nCompleted tasks:\n{}\n\nRemaining tasks:\n{}\n\n\
             Assess progress toward the objective. Respond with ONLY JSON:\n\
             {{\"progress_score\": 0.0-1.0, \"should_continue\": true|false, \"feedback\": \"...\"}}\n\
             Set should_continue to false if the current plan is unlikely to reach the objective.",
            objective,
            describe(completed),
            describe(remaining)
        ))];
        let options = ChatOptions {
            temperature: Some(0.2),
            ..Default::default()
        };

        let content = match self.llm.chat(&messages, TaskType::Reasoning, &options).await {
            Ok(r) => r.content,
            Err(e) => {
                tracing::warn!(error = %e, "progress evaluation call failed");
                return ProgressEvaluation::neutral("llm call failed");
            }
        };

        match extract_json(&content).and_then(|j| serde_json::from_str::<ProgressJson>(j).ok()) {
            Some(parsed) => ProgressEvaluation {
                progress_score: parsed.progress_score.clamp(0.0, 1.0),
                should_continue: parsed.should_continue,
                feedback: parsed.feedback,
            },
            None => {
                tracing::warn!("progress evaluation output unparseable");
                ProgressEvaluation::neutral("unparseable output")
            }
        }
    }

    /// 反思单次任务执行的质量；失败时返回带标记的占位 Reflection 而非抛错
    pub async fn reflect(
        &self,
        task: &Task,
        result: &ExecutionResult,
        context: &str,
    ) -> Reflection {
        let criteria = task
            .acceptance_criteria
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{}. {}", i + 1, c))
            .collect::<Vec<_>>()
            .join("\n");
        let messages = vec![Message::user(format!(
            "Task: {}\nAcceptance criteria:\n{}\n\nExecution outcome: success={}\nOutput:\n{}\nError: {}\n\nContext:\n{}\n\n\
             Reflect on the execution quality. Respond with ONLY JSON:\n\
             {{\"quality_score\": 0.0-1.0, \"criteria_met\": [true|false per criterion], \
             \"should_replan\": true|false, \"issues\": [\"...\"], \"learnings\": \"...\"}}",
            task.description,
            criteria,
            result.success,
            result.output,
            result.error.as_deref().unwrap_or("(none)"),
            context
        ))];
        let options = ChatOptions {
            temperature: Some(0.2),
            ..Default::default()
        };

        let fallback = || Reflection {
            quality_score: 0.5,
            criteria_met: Vec::new(),
            should_replan: false,
            issues: vec!["failed to generate proper reflection".to_string()],
            learnings: String::new(),
        };

        let content = match self.llm.chat(&messages, TaskType::Reasoning, &options).await {
            Ok(r) => r.content,
            Err(e) => {
                tracing::warn!(error = %e, "reflection call failed");
                return fallback();
            }
        };

        match extract_json(&content).and_then(|j| serde_json::from_str::<ReflectionJson>(j).ok()) {
            Some(parsed) => Reflection {
                quality_score: parsed.quality_score.clamp(0.0, 1.0),
                criteria_met: parsed.criteria_met,
                should_replan: parsed.should_replan,
                issues: parsed.issues,
                learnings: parsed.learnings,
            },
            None => fallback(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;

    #[tokio::test]
    async fn test_progress_evaluation_parsed() {
        let mock = Arc::new(MockLlmClient::new());
        mock.push(r#"{"progress_score": 0.8, "should_continue": true, "feedback": "on track"}"#);
        let critic = Critic::new(mock);
        let eval = critic.evaluate_plan_progress(&[], &[], "obj").await;
        assert!((eval.progress_score - 0.8).abs() < f64::EPSILON);
        assert!(eval.should_continue);
        assert_eq!(eval.feedback, "on track");
    }

    #[tokio::test]
    async fn test_unparseable_progress_returns_neutral_default() {
        let mock = Arc::new(MockLlmClient::new());
        mock.push("I feel like things are going okay?");
        let critic = Critic::new(mock);
        let eval = critic.evaluate_plan_progress(&[], &[], "obj").await;
        assert!((eval.progress_score - 0.5).abs() < f64::EPSILON);
        assert!(eval.should_continue);
    }

    #[tokio::test]
    async fn test_unparseable_reflection_is_flagged_not_thrown() {
        let mock = Arc::new(MockLlmClient::new());
        mock.push("no json here");
        let critic = Critic::new(mock);
        let task = Task::new("t");
        let result = ExecutionResult {
            success: true,
            output: "done".to_string(),
            error: None,
            tool_calls: Vec::new(),
            tokens_used: 0,
            cost: 0.0,
        };
        let reflection = critic.reflect(&task, &result, "").await;
        assert!(reflection
            .issues
            .contains(&"failed to generate proper reflection".to_string()));
        assert!(!reflection.should_replan);
    }

    #[tokio::test]
    async fn test_score_clamped_to_unit_range() {
        let mock = Arc::new(MockLlmClient::new());
        mock.push(r#"{"progress_score": 7.5, "should_continue": false, "feedback": "??"}"#);
        let critic = Critic::new(mock);
        let eval = critic.evaluate_plan_progress(&[], &[], "obj").await;
        assert!((eval.progress_score - 1.0).abs() < f64::EPSILON);
        assert!(!eval.should_continue);
    }
}
