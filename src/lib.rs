//! Hive - 自适应任务协调器
//!
//! 把任务目标分解为版本化的计划 DAG，有界并发地执行，
//! 在步骤提升前执行同步 gate、之后执行异步回溯校验；
//! 校验失败时只失效下游血缘并从失败步骤重放，策略耗尽时升级给运维方。
//!
//! 模块划分：
//! - **config**: 配置加载（TOML + `HIVE__*` 环境变量）
//! - **observability**: tracing 订阅器初始化
//! - **core**: 错误分类、执行状态、观测日志、检查点、预算账本
//! - **capability**: 能力抽象与注册表
//! - **llm**: planning brain 使用的文本补全抽象
//! - **plan**: 任务输入、动作契约、版本化计划、血缘 arena
//! - **planner**: 候选生成、能力校验、补丁
//! - **executor**: 就绪集派发、超时、补偿
//! - **verify**: gate、验收测试、异步回溯校验
//! - **policy**: Continue / Retry / Replan / Escalate 决策
//! - **coordinator**: 状态机、升级、快照

pub mod capability;
pub mod config;
pub mod coordinator;
pub mod core;
pub mod executor;
pub mod llm;
pub mod observability;
pub mod plan;
pub mod planner;
pub mod policy;
pub mod verify;

pub use capability::{Capability, CapabilityRegistry, CapabilitySpec};
pub use coordinator::{Coordinator, CoordinatorBuilder, OperatorDecision, TaskOutcome};
pub use plan::{ActionContract, Plan, TaskBrief};
