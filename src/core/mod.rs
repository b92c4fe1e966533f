//! 核心层：错误、状态机、事件流与主循环编排

pub mod error;
pub mod events;
pub mod orchestrator;
pub mod state;

pub use error::AgentError;
pub use events::{AgentEvent, AgentEventKind, EventBus};
pub use orchestrator::Orchestrator;
pub use state::{AgentPhase, AgentState};
