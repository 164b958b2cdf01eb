//! 协调层：任务状态机、升级通道、快照与任务结果

pub mod builder;
pub mod engine;
pub mod escalation;
pub mod outcome;
pub mod persistence;

pub use builder::CoordinatorBuilder;
pub use engine::Coordinator;
pub use escalation::{ChannelOperator, EscalationRequest, OperatorChannel, OperatorDecision, PendingDecision};
pub use outcome::{TaskOutcome, METRIC_NAMES};
pub use persistence::{SnapshotStore, TaskSnapshot};
