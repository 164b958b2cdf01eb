//! 计划模型：任务输入、动作契约、版本化计划、血缘 arena
pub mod brief;
pub mod builder;
pub mod contract;
pub mod lineage;
pub mod types;

pub use brief::{AcceptanceTest, Constraints, TaskBrief, ValueType};
pub use builder::PlanBuilder;
pub use contract::{ActionContract, Gate, GatePredicate, OnFail, RetrospectSpec};
pub use lineage::{topological_order, LineageTracker, Validity};
pub use types::{PatchOp, Plan, PlanVersion, StepId};
