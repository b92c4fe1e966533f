//! Agent 事件流：broadcast 发布，观察者按需订阅
//!
//! 事件仅为观察用途，不参与控制流；零订阅者时发送失败被忽略，循环照常推进。

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::core::state::AgentPhase;

/// 事件种类；serde tag 便于 JSON 订阅端按 type 分发
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEventKind {
    DirectiveReceived { directive: String },
    PhaseChanged { from: AgentPhase, to: AgentPhase },
    ThinkingCompleted { summary: String },
    PlanCreated { plan_id: Uuid, tasks: usize },
    PlanRevised { plan_id: Uuid, tasks: usize },
    TaskStarted { task_id: Uuid, description: String },
    TaskCompleted { task_id: Uuid },
    TaskFailed { task_id: Uuid, error: String },
    ReflectionCompleted { task_id: Uuid, quality_score: f64, should_replan: bool },
    PlanCompleted { plan_id: Uuid },
    CostLimitReached { spent: f64, limit: f64 },
    Error { message: String },
    AgentStopped { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: AgentEventKind,
}

impl AgentEvent {
    pub fn new(kind: AgentEventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
        }
    }
}

/// 事件总线：薄封装 broadcast channel
pub struct EventBus {
    sender: broadcast::Sender<AgentEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.sender.subscribe()
    }

    /// 发布事件；无订阅者时静默丢弃
    pub fn emit(&self, kind: AgentEventKind) {
        let _ = self.sender.send(AgentEvent::new(kind));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_without_subscribers_does_not_panic() {
        let bus = EventBus::default();
        bus.emit(AgentEventKind::Error {
            message: "nobody listening".to_string(),
        });
    }

    #[tokio::test]
    async fn test_subscriber_receives_events_in_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.emit(AgentEventKind::DirectiveReceived {
            directive: "do it".to_string(),
        });
        bus.emit(AgentEventKind::AgentStopped {
            reason: "done".to_string(),
        });
        assert!(matches!(
            rx.recv().await.unwrap().kind,
            AgentEventKind::DirectiveReceived { .. }
        ));
        assert!(matches!(
            rx.recv().await.unwrap().kind,
            AgentEventKind::AgentStopped { .. }
        ));
    }
}
