//! Planner：目标分解为任务图，依赖调度与计划修订
//!
//! create_plan 调用 LLM 得到结构化分解（策略 + 任务列表，依赖以列表下标表示，入库转为任务 id）；
//! 输出不可解析时回退为「单任务计划」（任务描述即原目标），规划永不让主循环硬失败。
//! revise_plan 解析失败时返回原计划不动（比退化重规划更安全）。
//! 任务只通过 id 引用彼此（arena 设计），修订整体替换 Plan，不原地修改。

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::AgentError;
use crate::llm::{ChatOptions, LlmClient, Message, TaskType};

/// 任务状态：pending -> in_progress -> {completed | failed}，后两者为终态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// 单个任务：依赖以 id 集合表示，全部 completed 后才可执行
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: Uuid,
    pub description: String,
    pub status: TaskStatus,
    /// 越大越优先
    pub priority: i32,
    pub dependencies: Vec<Uuid>,
    pub acceptance_criteria: Vec<String>,
}

impl Task {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            description: description.into(),
            status: TaskStatus::Pending,
            priority: 0,
            dependencies: Vec::new(),
            acceptance_criteria: Vec::new(),
        }
    }
}

/// 计划：objective 创建后不变；修订产生新 Plan（新 id），旧计划整体弃用
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub id: Uuid,
    pub objective: String,
    pub strategy: String,
    pub estimated_steps: u32,
    pub tasks: Vec<Task>,
}

impl Plan {
    pub fn new(objective: impl Into<String>, strategy: impl Into<String>, tasks: Vec<Task>) -> Self {
        let estimated_steps = tasks.len() as u32;
        Self {
            id: Uuid::new_v4(),
            objective: objective.into(),
            strategy: strategy.into(),
            estimated_steps,
            tasks,
        }
    }

    pub fn task(&self, id: Uuid) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// 全部任务进入终态即计划完成（零任务计划视为空洞完成）
    pub fn is_complete(&self) -> bool {
        self.tasks.iter().all(|t| t.status.is_terminal())
    }

    pub fn completed(&self) -> Vec<&Task> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .collect()
    }

    pub fn failed(&self) -> Vec<&Task> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .collect()
    }

    pub fn remaining(&self) -> Vec<&Task> {
        self.tasks
            .iter()
            .filter(|t| !t.status.is_terminal())
            .collect()
    }
}

/// LLM 返回的计划分解格式（依赖为任务列表下标）
#[derive(Debug, Deserialize)]
struct PlanSpec {
    #[serde(default)]
    strategy: String,
    #[serde(default)]
    tasks: Vec<TaskSpec>,
}

#[derive(Debug, Deserialize)]
struct TaskSpec {
    description: String,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    dependencies: Vec<usize>,
    #[serde(default)]
    acceptance_criteria: Vec<String>,
}

/// 从 LLM 输出中提取 JSON 块（```json ... ``` 或首个 { 到末个 }）
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

fn parse_plan_spec(output: &str) -> Result<PlanSpec, AgentError> {
    let json = extract_json(output)
        .ok_or_else(|| AgentError::JsonParse("no JSON object in planner output".to_string()))?;
    serde_json::from_str(json).map_err(|e| AgentError::JsonParse(format!("{}: {}", e, json)))
}

/// 将下标依赖转为任务 id；越界或自引用的依赖直接丢弃
fn build_tasks(specs: Vec<TaskSpec>) -> Vec<Task> {
    let ids: Vec<Uuid> = specs.iter().map(|_| Uuid::new_v4()).collect();
    specs
        .into_iter()
        .enumerate()
        .map(|(i, spec)| Task {
            id: ids[i],
            description: spec.description,
            status: TaskStatus::Pending,
            priority: spec.priority,
            dependencies: spec
                .dependencies
                .into_iter()
                .filter(|&d| d < ids.len() && d != i)
                .map(|d| ids[d])
                .collect(),
            acceptance_criteria: spec.acceptance_criteria,
        })
        .collect()
}

const PLAN_FORMAT: &str = r#"Respond with ONLY a JSON object:
{"strategy": "overall approach", "tasks": [{"description": "...", "priority": 1, "dependencies": [0], "acceptance_criteria": ["..."]}]}
"dependencies" lists the zero-based indices of tasks that must complete first. Higher "priority" runs earlier among eligible tasks."#;

/// Planner：持有 LLM，负责计划的创建、修订与任务调度查询
pub struct Planner {
    llm: Arc<dyn LlmClient>,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// 目标过于模糊或输出不可解析时的保底计划：唯一任务即原目标
    fn fallback_plan(objective: &str) -> Plan {
        let mut task = Task::new(objective);
        task.priority = 1;
        task.acceptance_criteria = vec!["The stated objective has been addressed".to_string()];
        Plan::new(objective, "Single-task fallback: execute the objective directly", vec![task])
    }

    /// 创建计划；仅 chat 能力本身的失败向外传播，解析失败回退单任务计划
    pub async fn create_plan(&self, objective: &str, context: &str) -> Result<Plan, AgentError> {
        let messages = vec![
            Message::system(
                "You are the planning module of an autonomous agent. \
                 Decompose the objective into a minimal set of concrete, verifiable tasks.",
            ),
            Message::user(format!(
                "Objective: {}\n\nContext:\n{}\n\n{}",
                objective, context, PLAN_FORMAT
            )),
        ];
        let options = ChatOptions {
            temperature: Some(0.3),
            ..Default::default()
        };
        let response = self.llm.chat(&messages, TaskType::Planning, &options).await?;

        match parse_plan_spec(&response.content) {
            Ok(spec) if !spec.tasks.is_empty() => {
                let tasks = build_tasks(spec.tasks);
                tracing::info!(tasks = tasks.len(), "plan created");
                Ok(Plan::new(objective, spec.strategy, tasks))
            }
            Ok(_) => {
                tracing::warn!("planner returned empty task list, using fallback plan");
                Ok(Self::fallback_plan(objective))
            }
            Err(e) => {
                tracing::warn!(error = %e, "planner output unparseable, using fallback plan");
                Ok(Self::fallback_plan(objective))
            }
        }
    }

    /// 修订计划；解析失败时返回原计划不动（比退化重规划更安全）
    pub async fn revise_plan(
        &self,
        current: &Plan,
        feedback: &str,
        context: &str,
    ) -> Result<Plan, AgentError> {
        let current_json =
            serde_json::to_string_pretty(current).unwrap_or_else(|_| current.objective.clone());
        let messages = vec![
            Message::system(
                "You are the planning module of an autonomous agent. \
                 Revise the current plan based on the feedback. Keep completed work, replace what failed.",
            ),
            Message::user(format!(
                "Objective: {}\n\nCurrent plan:\n{}\n\nFeedback:\n{}\n\nContext:\n{}\n\n{}",
                current.objective, current_json, feedback, context, PLAN_FORMAT
            )),
        ];
        let options = ChatOptions {
            temperature: Some(0.3),
            ..Default::default()
        };
        let response = self.llm.chat(&messages, TaskType::Planning, &options).await?;

        match parse_plan_spec(&response.content) {
            Ok(spec) if !spec.tasks.is_empty() => {
                let tasks = build_tasks(spec.tasks);
                tracing::info!(tasks = tasks.len(), "plan revised");
                Ok(Plan::new(current.objective.clone(), spec.strategy, tasks))
            }
            _ => {
                tracing::warn!("revision output unparseable, keeping current plan");
                Ok(current.clone())
            }
        }
    }

    /// 下一个可执行任务：pending 且依赖全部 completed；同候选取 priority 最大者，
    /// 平手按原列表顺序（稳定、可测）。返回 None 表示计划已结束或被依赖卡住
    pub fn next_task<'a>(&self, plan: &'a Plan) -> Option<&'a Task> {
        plan.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending && self.deps_satisfied(plan, t))
            .fold(None, |best: Option<&Task>, t| match best {
                Some(b) if b.priority >= t.priority => Some(b),
                _ => Some(t),
            })
    }

    fn deps_satisfied(&self, plan: &Plan, task: &Task) -> bool {
        task.dependencies.iter().all(|dep| {
            plan.task(*dep)
                .map(|d| d.status == TaskStatus::Completed)
                .unwrap_or(false)
        })
    }

    /// pending 但依赖无法满足的任务（环或依赖已 failed）——区分「计划结束」与「计划卡死」
    pub fn blocked_tasks(&self, plan: &Plan) -> Vec<Uuid> {
        if self.next_task(plan).is_some() {
            return Vec::new();
        }
        plan.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending && !self.deps_satisfied(plan, t))
            .map(|t| t.id)
            .collect()
    }

    pub fn update_task_status(&self, plan: &mut Plan, task_id: Uuid, status: TaskStatus) {
        if let Some(task) = plan.tasks.iter_mut().find(|t| t.id == task_id) {
            task.status = status;
        }
    }

    pub fn is_plan_complete(&self, plan: &Plan) -> bool {
        plan.is_complete()
    }
}
