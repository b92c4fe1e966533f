//! ReAct 层：Planner / Executor / Critic

pub mod critic;
pub mod executor;
pub mod planner;

pub use critic::{Critic, ProgressEvaluation, Reflection};
pub use executor::{ExecutionResult, TaskExecutor, ToolCallRecord};
pub use planner::{Plan, Planner, Task, TaskStatus};
