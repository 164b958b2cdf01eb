//! 核心数据层：错误分类、观测日志、检查点、执行状态与预算账本

pub mod checkpoint;
pub mod error;
pub mod observation;
pub mod state;

pub use checkpoint::{Checkpoint, CheckpointStore};
pub use error::{
    CapabilityError, CoordinatorError, FailureKind, PlanError, PlannerError, Severity,
};
pub use observation::{FailureInfo, Observation, ObservationLog, ObservationStatus};
pub use state::{
    BudgetLedger, CoordinatorPhase, ExecutionState, PendingRetrospect, StepStatus,
};
