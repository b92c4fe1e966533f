//! Orchestrator：Think -> Plan -> Act -> Reflect 主循环
//!
//! 每轮迭代最多执行一个任务。迭代内的单点失败（规划调用失败、任务失败、反思不可解析）
//! 写入情景记忆后继续下一轮，循环只因预算耗尽、计划完成或外部 stop 结束；
//! 无论以何种方式结束，恰好发出一条 AgentStopped 事件。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::core::error::AgentError;
use crate::core::events::{AgentEvent, AgentEventKind, EventBus};
use crate::core::state::{AgentPhase, AgentState};
use crate::llm::{
    ChatOptions, LlmClient, LlmError, Message, MockLlmClient, OpenAiClient, RoutingClient, Spend,
    TaskType, TrackedClient,
};
use crate::memory::MemoryStore;
use crate::react::{Critic, Plan, Planner, TaskExecutor, TaskStatus};
use crate::tools::{
    EchoTool, HttpTool, ListDirTool, ReadFileTool, SecureCommandGate, ShellTool, ToolRegistry,
    WebSearchTool, WriteFileTool,
};

/// 一轮 Act 的产物，供 Reflect 阶段使用
struct ActOutcome {
    task_id: Uuid,
    result: crate::react::ExecutionResult,
}

/// 循环结束原因：计划完成进入 completed，其余（预算耗尽 / 外部 stop）回到 idle
enum StopCause {
    PlanCompleted,
    IterationBudget(u32),
    TimeBudget(u64),
    CostBudget { spent: f64, limit: f64 },
    StopRequested,
}

impl StopCause {
    fn reason(&self) -> String {
        match self {
            StopCause::PlanCompleted => "plan completed".to_string(),
            StopCause::IterationBudget(n) => format!("iteration budget exhausted ({})", n),
            StopCause::TimeBudget(secs) => format!("time budget exhausted ({}s)", secs),
            StopCause::CostBudget { spent, limit } => {
                format!("cost budget exhausted (${:.4} > ${:.4})", spent, limit)
            }
            StopCause::StopRequested => "stop requested".to_string(),
        }
    }

    fn final_phase(&self) -> AgentPhase {
        match self {
            StopCause::PlanCompleted => AgentPhase::Completed,
            _ => AgentPhase::Idle,
        }
    }
}

/// Agent 编排器：持有全部组件，对外只暴露指令入口、状态快照与事件订阅
pub struct Orchestrator {
    config: AppConfig,
    planner: Planner,
    executor: TaskExecutor,
    critic: Critic,
    /// 与各组件共享的同一个计费客户端（Think 阶段直接使用）
    llm: Arc<dyn LlmClient>,
    memory: Arc<MemoryStore>,
    events: EventBus,
    state: Mutex<AgentState>,
    running: AtomicBool,
    cancel: Mutex<CancellationToken>,
    /// 全部模型调用（规划、执行、反思、嵌入对话）的累计支出
    spend: Arc<TrackedClient>,
    /// 当前指令开始时的支出基线，会话成本 = 累计 - 基线
    spend_baseline: Mutex<Spend>,
}

impl Orchestrator {
    /// 用现成的 LLM 客户端与工具注册表组装（测试与嵌入场景用）
    pub fn new(config: AppConfig, llm: Arc<dyn LlmClient>, tools: Arc<ToolRegistry>) -> Self {
        let tracked = Arc::new(TrackedClient::new(llm));
        let shared: Arc<dyn LlmClient> = tracked.clone();
        let memory =
            Arc::new(MemoryStore::new(config.memory.clone()).with_embedder(shared.clone()));
        // 通用工具超时须留出余量，保证 Shell 闸门自带的超时结果（含部分输出）先返回
        let tool_timeout_secs = config
            .tools
            .tool_timeout_secs
            .max(config.tools.shell.max_execution_secs + 5);
        let executor = TaskExecutor::new(
            shared.clone(),
            tools,
            config.agent.max_task_attempts,
            config.agent.max_cost_per_session,
            tool_timeout_secs,
        );
        Self {
            planner: Planner::new(shared.clone()),
            executor,
            critic: Critic::new(shared.clone()),
            llm: shared,
            memory,
            events: EventBus::default(),
            state: Mutex::new(AgentState::new()),
            running: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
            spend: tracked,
            spend_baseline: Mutex::new(Spend::default()),
            config,
        }
    }

    /// 从配置组装：选择 LLM 后端并注册默认工具集
    pub fn from_config(config: AppConfig) -> Result<Self, AgentError> {
        let llm = Self::build_llm(&config)?;
        let tools = Arc::new(Self::build_tools(&config));
        Ok(Self::new(config, llm, tools))
    }

    fn build_llm(config: &AppConfig) -> Result<Arc<dyn LlmClient>, AgentError> {
        match config.llm.provider.as_str() {
            "openai" => {
                let api_key = std::env::var("OPENAI_API_KEY")
                    .map_err(|_| AgentError::Llm(LlmError::NoProvider))?;
                let client = OpenAiClient::new(
                    config.llm.base_url.as_deref(),
                    config.llm.models.clone(),
                    config.llm.pricing.clone(),
                    config.llm.embedding_model.clone(),
                    &api_key,
                );
                let router = RoutingClient::new(vec![(
                    "openai".to_string(),
                    Arc::new(client) as Arc<dyn LlmClient>,
                )])?;
                Ok(Arc::new(router))
            }
            // mock 后端必须显式选择，避免静默跑在假模型上
            "mock" => Ok(Arc::new(MockLlmClient::new())),
            other => Err(AgentError::Config(format!("unknown llm provider: {}", other))),
        }
    }

    fn build_tools(config: &AppConfig) -> ToolRegistry {
        let workspace = config
            .tools
            .workspace_root
            .clone()
            .unwrap_or_else(|| std::path::PathBuf::from("./workspace"));
        let _ = std::fs::create_dir_all(&workspace);

        let gate = Arc::new(SecureCommandGate::new(&config.tools.shell));
        let mut registry = ToolRegistry::new();
        registry.register(ShellTool::new(gate));
        registry.register(ReadFileTool::new(&workspace));
        registry.register(WriteFileTool::new(&workspace));
        registry.register(ListDirTool::new(&workspace));
        registry.register(HttpTool::new(&config.tools.http));
        registry.register(WebSearchTool::new(&config.tools.http));
        registry.register(EchoTool);
        registry
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> AgentState {
        self.state.lock().unwrap().clone()
    }

    pub fn memory(&self) -> Arc<MemoryStore> {
        self.memory.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// 请求停止当前指令；幂等，未运行时无效果
    pub fn stop(&self) {
        self.cancel.lock().unwrap().cancel();
    }

    fn set_phase(&self, to: AgentPhase) {
        let from = {
            let mut state = self.state.lock().unwrap();
            let from = state.current_phase;
            state.current_phase = to;
            state.touch();
            from
        };
        if from != to {
            self.events.emit(AgentEventKind::PhaseChanged { from, to });
        }
    }

    /// 把累计支出（减去指令基线）同步进状态，返回当前会话成本
    fn sync_spend(&self) -> f64 {
        let spend = self.spend.spend();
        let baseline = *self.spend_baseline.lock().unwrap();
        let mut state = self.state.lock().unwrap();
        state.total_tokens_used = spend.tokens.saturating_sub(baseline.tokens);
        state.total_cost = spend.cost - baseline.cost;
        state.total_cost
    }

    /// 处理一条指令，阻塞到循环结束；运行中再次调用被拒绝
    pub async fn process_directive(&self, directive: &str) -> Result<(), AgentError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::warn!("directive rejected: another directive is being processed");
            return Err(AgentError::Config(
                "a directive is already being processed".to_string(),
            ));
        }
        let cancel = {
            let mut guard = self.cancel.lock().unwrap();
            *guard = CancellationToken::new();
            guard.clone()
        };
        *self.spend_baseline.lock().unwrap() = self.spend.spend();
        self.state.lock().unwrap().reset_for_directive();
        self.events.emit(AgentEventKind::DirectiveReceived {
            directive: directive.to_string(),
        });
        self.memory
            .add_working(format!("Directive: {}", directive), 0.9, serde_json::json!({"kind": "directive"}));

        let cause = self.run_loop(directive, &cancel).await;

        self.sync_spend();
        self.set_phase(cause.final_phase());
        let reason = cause.reason();
        self.events.emit(AgentEventKind::AgentStopped {
            reason: reason.clone(),
        });
        tracing::info!(reason = %reason, "agent stopped");
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// 主循环；返回结束原因（恰好被调用方发出一次 AgentStopped）
    async fn run_loop(&self, directive: &str, cancel: &CancellationToken) -> StopCause {
        let budget = &self.config.agent;
        let max_elapsed = Duration::from_secs(budget.max_execution_secs);
        // 下一轮是否强制（重）规划；修订反馈跨迭代携带
        let mut force_replan = false;
        let mut replan_feedback = String::new();

        loop {
            if cancel.is_cancelled() {
                return StopCause::StopRequested;
            }

            let cost = self.sync_spend();
            let (iteration, elapsed) = {
                let state = self.state.lock().unwrap();
                (
                    state.iteration_count,
                    (chrono::Utc::now() - state.start_time)
                        .to_std()
                        .unwrap_or_default(),
                )
            };
            if iteration >= budget.max_iterations {
                return StopCause::IterationBudget(budget.max_iterations);
            }
            if elapsed > max_elapsed {
                return StopCause::TimeBudget(budget.max_execution_secs);
            }
            if cost > budget.max_cost_per_session {
                self.events.emit(AgentEventKind::CostLimitReached {
                    spent: cost,
                    limit: budget.max_cost_per_session,
                });
                return StopCause::CostBudget {
                    spent: cost,
                    limit: budget.max_cost_per_session,
                };
            }
            self.state.lock().unwrap().iteration_count += 1;

            // ---- Think ----
            self.set_phase(AgentPhase::Thinking);
            let context = self.think(directive).await;

            // ---- Plan ----
            let needs_planning =
                force_replan || self.state.lock().unwrap().current_plan.is_none();
            if needs_planning {
                self.set_phase(AgentPhase::Planning);
                match self.plan(directive, &context, &replan_feedback).await {
                    Ok(()) => {
                        force_replan = false;
                        replan_feedback.clear();
                    }
                    Err(e) => {
                        self.record_iteration_error(format!("planning failed: {}", e));
                        continue;
                    }
                }
            }

            let plan = match self.state.lock().unwrap().current_plan.clone() {
                Some(plan) => plan,
                None => {
                    self.record_iteration_error("no plan after planning phase".to_string());
                    continue;
                }
            };
            if plan.is_complete() {
                self.events.emit(AgentEventKind::PlanCompleted { plan_id: plan.id });
                self.memory.add_episodic(
                    format!(
                        "Plan for '{}' completed: {} tasks done, {} failed",
                        plan.objective,
                        plan.completed().len(),
                        plan.failed().len()
                    ),
                    0.8,
                    serde_json::json!({"kind": "plan_completed", "plan_id": plan.id}),
                );
                return StopCause::PlanCompleted;
            }

            // ---- Act ----
            let outcome = match self.act(&plan, &context, cancel).await {
                Some(outcome) => outcome,
                None => {
                    // 被依赖卡住（环或依赖已失败）：记录并强制下一轮重规划
                    let blocked = self.planner.blocked_tasks(&plan);
                    let message = format!(
                        "plan stalled: {} pending task(s) have unsatisfiable dependencies",
                        blocked.len()
                    );
                    self.events.emit(AgentEventKind::Error {
                        message: message.clone(),
                    });
                    self.record_iteration_error(message);
                    replan_feedback =
                        "The plan is stalled: some pending tasks have dependencies that can never complete. \
                         Restructure the remaining work without those dependencies."
                            .to_string();
                    force_replan = true;
                    continue;
                }
            };

            // ---- Reflect ----
            if let Some(feedback) = self.reflect(&outcome, &context).await {
                replan_feedback = feedback;
                force_replan = true;
            }

            // 定期记忆整理
            let iteration = self.state.lock().unwrap().iteration_count;
            if budget.consolidation_interval > 0 && iteration % budget.consolidation_interval == 0 {
                self.memory.consolidate().await;
            }
        }
    }

    /// Think 阶段：汇总工作记忆与语义检索，再做一次简短的形势评估（Reasoning）。
    /// 评估调用失败被吞掉（记日志与情景记忆），不阻塞 Plan/Act
    async fn think(&self, directive: &str) -> String {
        let mut context = self.memory.context_summary();
        let related = self.memory.search_semantic(directive, 5).await;
        if !related.is_empty() {
            context.push_str("## Relevant knowledge\n");
            for entry in &related {
                context.push_str(&format!("- {}\n", entry.content));
            }
        }

        let messages = vec![Message::user(format!(
            "Directive: {}\n\n{}\nIn two or three sentences, assess the current situation: \
             what has been done, what remains, and any risk to watch.",
            directive, context
        ))];
        let options = ChatOptions {
            temperature: Some(0.2),
            ..Default::default()
        };
        match self.llm.chat(&messages, TaskType::Reasoning, &options).await {
            Ok(response) => {
                self.memory.add_working(
                    format!("Assessment: {}", response.content),
                    0.4,
                    serde_json::json!({"kind": "assessment"}),
                );
                self.events.emit(AgentEventKind::ThinkingCompleted {
                    summary: response.content,
                });
            }
            Err(e) => {
                self.record_iteration_error(format!("situational assessment failed: {}", e));
            }
        }
        context
    }

    /// Plan 阶段：无计划则创建，有计划（被强制进入 Planning）则修订
    async fn plan(
        &self,
        directive: &str,
        context: &str,
        replan_feedback: &str,
    ) -> Result<(), AgentError> {
        let current = self.state.lock().unwrap().current_plan.clone();
        match current {
            None => {
                let plan = self.planner.create_plan(directive, context).await?;
                self.events.emit(AgentEventKind::PlanCreated {
                    plan_id: plan.id,
                    tasks: plan.tasks.len(),
                });
                self.memory.add_working(
                    format!("Created plan with {} task(s): {}", plan.tasks.len(), plan.strategy),
                    0.7,
                    serde_json::json!({"kind": "plan", "plan_id": plan.id}),
                );
                self.state.lock().unwrap().current_plan = Some(plan);
            }
            Some(current) => {
                let feedback = if replan_feedback.is_empty() {
                    "Progress has stalled or quality is insufficient. Revise the remaining tasks."
                } else {
                    replan_feedback
                };
                let revised = self.planner.revise_plan(&current, feedback, context).await?;
                if revised.id != current.id {
                    self.events.emit(AgentEventKind::PlanRevised {
                        plan_id: revised.id,
                        tasks: revised.tasks.len(),
                    });
                }
                self.state.lock().unwrap().current_plan = Some(revised);
            }
        }
        Ok(())
    }

    /// Act 阶段：调度并执行一个任务；无可执行任务时返回 None（计划未完成即为卡死）
    async fn act(
        &self,
        plan: &Plan,
        context: &str,
        cancel: &CancellationToken,
    ) -> Option<ActOutcome> {
        let task = self.planner.next_task(plan)?.clone();

        self.set_phase(AgentPhase::Executing);
        {
            let mut state = self.state.lock().unwrap();
            state.current_task_id = Some(task.id);
            if let Some(ref mut plan) = state.current_plan {
                self.planner.update_task_status(plan, task.id, TaskStatus::InProgress);
            }
        }
        self.events.emit(AgentEventKind::TaskStarted {
            task_id: task.id,
            description: task.description.clone(),
        });

        let cost_before = self.sync_spend();
        let result = tokio::select! {
            result = self.executor.execute_task(&task, context, cost_before) => result,
            _ = cancel.cancelled() => {
                crate::react::ExecutionResult {
                    success: false,
                    output: String::new(),
                    error: Some("cancelled by stop request".to_string()),
                    tool_calls: Vec::new(),
                    tokens_used: 0,
                    cost: 0.0,
                }
            }
        };
        self.sync_spend();

        let status = if result.success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        {
            let mut state = self.state.lock().unwrap();
            state.current_task_id = None;
            if let Some(ref mut plan) = state.current_plan {
                self.planner.update_task_status(plan, task.id, status);
            }
        }

        if result.success {
            self.events.emit(AgentEventKind::TaskCompleted { task_id: task.id });
            self.memory.add_episodic(
                format!("Task completed: {} -> {}", task.description, result.output),
                0.6,
                serde_json::json!({"kind": "task_result", "task_id": task.id}),
            );
        } else {
            let error = result.error.clone().unwrap_or_else(|| "unknown error".to_string());
            self.events.emit(AgentEventKind::TaskFailed {
                task_id: task.id,
                error: error.clone(),
            });
            self.memory.add_episodic(
                format!("Task failed: {} -> {}", task.description, error),
                0.8,
                serde_json::json!({"kind": "task_failure", "task_id": task.id}),
            );
        }

        Some(ActOutcome {
            task_id: task.id,
            result,
        })
    }

    /// Reflect 阶段：单任务反思 + 计划进度评估；需要重规划时返回修订反馈
    async fn reflect(&self, outcome: &ActOutcome, context: &str) -> Option<String> {
        self.set_phase(AgentPhase::Reflecting);
        let plan = self.state.lock().unwrap().current_plan.clone()?;
        let task = plan.task(outcome.task_id)?.clone();

        let reflection = self.critic.reflect(&task, &outcome.result, context).await;
        self.events.emit(AgentEventKind::ReflectionCompleted {
            task_id: task.id,
            quality_score: reflection.quality_score,
            should_replan: reflection.should_replan,
        });
        if !reflection.learnings.is_empty() {
            self.memory.add_episodic(
                format!("Learning: {}", reflection.learnings),
                reflection.quality_score.max(0.5),
                serde_json::json!({"kind": "learning", "task_id": task.id}),
            );
        }

        let evaluation = self
            .critic
            .evaluate_plan_progress(&plan.completed(), &plan.remaining(), &plan.objective)
            .await;
        if !evaluation.feedback.is_empty() {
            self.memory.add_working(
                format!("Progress feedback: {}", evaluation.feedback),
                0.4,
                serde_json::json!({"kind": "progress_feedback"}),
            );
        }

        let failed = plan.failed().len();
        let too_many_failures = failed > self.config.agent.max_failed_tasks_before_replan;
        if reflection.should_replan || !evaluation.should_continue || too_many_failures {
            let mut feedback = String::new();
            if too_many_failures {
                feedback.push_str(&format!("{} task(s) have failed. ", failed));
            }
            for issue in &reflection.issues {
                feedback.push_str(issue);
                feedback.push_str(". ");
            }
            feedback.push_str(&evaluation.feedback);
            return Some(feedback);
        }
        None
    }

    /// 迭代内失败的统一处理：写情景记忆，循环继续
    fn record_iteration_error(&self, message: String) {
        tracing::warn!(error = %message, "iteration error, continuing");
        self.memory.add_episodic(
            format!("Iteration error: {}", message),
            0.6,
            serde_json::json!({"kind": "iteration_error"}),
        );
    }
}
