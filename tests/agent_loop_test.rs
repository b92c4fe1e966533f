//! 端到端：脚本化 Mock LLM 驱动完整控制循环（指令 -> 计划 -> Shell 执行 -> 完成）

use std::sync::Arc;

use hornet::config::AppConfig;
use hornet::core::{AgentEventKind, AgentPhase, Orchestrator};
use hornet::llm::MockLlmClient;
use hornet::tools::{EchoTool, SecureCommandGate, ShellTool, ToolRegistry};

fn orchestrator_with(mock: Arc<MockLlmClient>, config: AppConfig) -> Orchestrator {
    let gate = Arc::new(SecureCommandGate::new(&config.tools.shell));
    let mut registry = ToolRegistry::new();
    registry.register(ShellTool::new(gate));
    registry.register(EchoTool);
    Orchestrator::new(config, mock, Arc::new(registry))
}

fn good_reflection() -> &'static str {
    r#"{"quality_score": 0.9, "criteria_met": [true], "should_replan": false, "issues": [], "learnings": ""}"#
}

fn good_progress() -> &'static str {
    r#"{"progress_score": 0.8, "should_continue": true, "feedback": "on track"}"#
}

#[tokio::test]
async fn test_directive_runs_dependent_tasks_to_completion() {
    let mock = Arc::new(MockLlmClient::new());
    // 两任务计划：先跑命令，再汇总（依赖前者）
    mock.push("new directive, no work done yet"); // Think 1
    mock.push(
        r#"{"strategy": "run then report", "tasks": [
            {"description": "run `echo test` in the shell", "priority": 2, "dependencies": [],
             "acceptance_criteria": ["the command output contains the word test"]},
            {"description": "summarize the command output", "priority": 1, "dependencies": [0],
             "acceptance_criteria": ["a one-line summary exists"]}
        ]}"#,
    );
    mock.push(r#"{"tool": "execute_shell", "args": {"command": "echo test"}}"#);
    mock.push("The command printed: test");
    mock.push("COMPLETE");
    mock.push(good_reflection());
    mock.push(good_progress());
    mock.push("first task done, summary remains"); // Think 2
    mock.push("Summary: `echo test` produced the word test.");
    mock.push("COMPLETE");
    mock.push(good_reflection());
    mock.push(good_progress());
    // Think 3 走回显兜底，随后计划完成

    let orchestrator = orchestrator_with(mock, AppConfig::default());
    let mut rx = orchestrator.subscribe();

    orchestrator
        .process_directive("echo the word test and summarize the output")
        .await
        .unwrap();

    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        kinds.push(event.kind);
    }

    // 指令开始的 idle -> thinking 迁移对订阅者可见
    assert!(kinds.iter().any(|k| matches!(
        k,
        AgentEventKind::PhaseChanged {
            from: AgentPhase::Idle,
            to: AgentPhase::Thinking
        }
    )));

    // 依赖序：shell 任务先于汇总任务开始
    let started: Vec<&str> = kinds
        .iter()
        .filter_map(|k| match k {
            AgentEventKind::TaskStarted { description, .. } => Some(description.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(started.len(), 2);
    assert!(started[0].contains("echo test"));
    assert!(started[1].contains("summarize"));

    let completed = kinds
        .iter()
        .filter(|k| matches!(k, AgentEventKind::TaskCompleted { .. }))
        .count();
    assert_eq!(completed, 2);

    let plan_done = kinds
        .iter()
        .position(|k| matches!(k, AgentEventKind::PlanCompleted { .. }))
        .unwrap();
    let stopped = kinds
        .iter()
        .position(|k| matches!(k, AgentEventKind::AgentStopped { .. }))
        .unwrap();
    assert!(plan_done < stopped);
    assert_eq!(stopped, kinds.len() - 1);

    let state = orchestrator.state();
    assert_eq!(state.current_phase, AgentPhase::Completed);
    let plan = state.current_plan.unwrap();
    assert!(plan.is_complete());
    assert_eq!(plan.failed().len(), 0);
    assert!(!orchestrator.is_running());
}

#[tokio::test]
async fn test_blocked_command_surfaces_to_model_and_task_fails() {
    let mock = Arc::new(MockLlmClient::new());
    mock.push("about to try python");
    mock.push(
        r#"{"strategy": "direct", "tasks": [
            {"description": "run a python snippet", "priority": 1, "dependencies": [],
             "acceptance_criteria": ["python output captured"]}
        ]}"#,
    );
    // 不在白名单的命令被闸门拒绝；模型坚持同一命令直到尝试耗尽
    mock.push(r#"{"tool": "execute_shell", "args": {"command": "python3 -c 'print(1)'"}}"#);
    mock.push(r#"{"tool": "execute_shell", "args": {"command": "python3 -c 'print(1)'"}}"#);

    let mut config = AppConfig::default();
    config.agent.max_iterations = 1;
    config.agent.max_task_attempts = 2;
    let orchestrator = orchestrator_with(mock, config);
    let mut rx = orchestrator.subscribe();

    orchestrator.process_directive("run some python").await.unwrap();

    let mut failed = false;
    while let Ok(event) = rx.try_recv() {
        if let AgentEventKind::TaskFailed { .. } = event.kind {
            failed = true;
        }
    }
    assert!(failed);
    let plan = orchestrator.state().current_plan.unwrap();
    assert_eq!(plan.failed().len(), 1);
}

#[tokio::test]
async fn test_iteration_budget_bounds_session() {
    let mock = Arc::new(MockLlmClient::new());
    // 互相依赖的任务使计划永远卡住；修订回复不可解析，只能靠迭代预算收尾
    mock.push("assessing");
    mock.push(
        r#"{"strategy": "stuck", "tasks": [
            {"description": "first", "priority": 1, "dependencies": [1], "acceptance_criteria": []},
            {"description": "second", "priority": 1, "dependencies": [0], "acceptance_criteria": []}
        ]}"#,
    );
    let mut config = AppConfig::default();
    config.agent.max_iterations = 3;
    let orchestrator = orchestrator_with(mock, config);
    let mut rx = orchestrator.subscribe();

    orchestrator.process_directive("unachievable").await.unwrap();

    let mut reason = None;
    while let Ok(event) = rx.try_recv() {
        if let AgentEventKind::AgentStopped { reason: r } = event.kind {
            reason = Some(r);
        }
    }
    assert!(reason.unwrap().contains("iteration budget"));
    assert_eq!(orchestrator.state().iteration_count, 3);
    assert!(!orchestrator.is_running());
}

#[tokio::test]
async fn test_cost_budget_emits_cost_limit_event() {
    let mock = Arc::new(MockLlmClient::new().with_cost_per_call(0.6));
    mock.push("assessing");
    mock.push(
        r#"{"strategy": "direct", "tasks": [
            {"description": "spend", "priority": 1, "dependencies": [],
             "acceptance_criteria": ["money spent"]}
        ]}"#,
    );
    let mut config = AppConfig::default();
    config.agent.max_cost_per_session = 1.0;
    let orchestrator = orchestrator_with(mock, config);
    let mut rx = orchestrator.subscribe();

    orchestrator.process_directive("spend money").await.unwrap();

    let mut saw_cost_limit = false;
    while let Ok(event) = rx.try_recv() {
        if let AgentEventKind::CostLimitReached { spent, limit } = event.kind {
            assert!(spent > limit);
            saw_cost_limit = true;
        }
    }
    assert!(saw_cost_limit);
    assert!(orchestrator.state().total_cost > 1.0);
}

#[tokio::test]
async fn test_stop_before_directive_is_harmless() {
    let mock = Arc::new(MockLlmClient::new());
    let orchestrator = orchestrator_with(mock, AppConfig::default());
    orchestrator.stop();
    orchestrator.stop();
    assert!(!orchestrator.is_running());
    assert_eq!(orchestrator.state().current_phase, AgentPhase::Idle);
}
