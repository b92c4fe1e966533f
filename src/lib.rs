//! hornet - 自主任务智能体
//!
//! Think -> Plan -> Act -> Reflect 控制循环：指令分解为带依赖的任务图，
//! 逐任务执行（工具增强 + 独立完成校验），反思驱动重规划；
//! 三层记忆（工作 / 情景 / 语义）承载跨迭代上下文，
//! Secure Command Gate 把关所有 Shell 命令，预算（迭代 / 时间 / 成本）约束整个会话。

pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod tools;
