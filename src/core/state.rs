//! Agent 运行状态：阶段机与会话计数

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::react::Plan;

/// 控制循环阶段：idle -> thinking -> planning -> executing -> reflecting -> ... -> completed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentPhase {
    Idle,
    Thinking,
    Planning,
    Executing,
    Reflecting,
    Completed,
}

impl std::fmt::Display for AgentPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentPhase::Idle => "idle",
            AgentPhase::Thinking => "thinking",
            AgentPhase::Planning => "planning",
            AgentPhase::Executing => "executing",
            AgentPhase::Reflecting => "reflecting",
            AgentPhase::Completed => "completed",
        };
        f.write_str(s)
    }
}

/// 会话状态快照；指令开始时计数器归零
#[derive(Debug, Clone, Serialize)]
pub struct AgentState {
    pub current_phase: AgentPhase,
    pub current_plan: Option<Plan>,
    pub current_task_id: Option<Uuid>,
    pub iteration_count: u32,
    pub start_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub total_tokens_used: u64,
    pub total_cost: f64,
}

impl AgentState {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            current_phase: AgentPhase::Idle,
            current_plan: None,
            current_task_id: None,
            iteration_count: 0,
            start_time: now,
            last_activity: now,
            total_tokens_used: 0,
            total_cost: 0.0,
        }
    }

    /// 新指令开始：计数与成本归零；阶段保持 idle，首轮循环迁移到 thinking 时发 PhaseChanged
    pub fn reset_for_directive(&mut self) {
        let now = Utc::now();
        self.current_phase = AgentPhase::Idle;
        self.current_plan = None;
        self.current_task_id = None;
        self.iteration_count = 0;
        self.start_time = now;
        self.last_activity = now;
        self.total_tokens_used = 0;
        self.total_cost = 0.0;
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}

impl Default for AgentState {
    fn default() -> Self {
        Self::new()
    }
}
