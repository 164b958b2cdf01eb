//! 错误分类与严重级别
//!
//! 组件边界上的错误用 thiserror 枚举表达；任务运行期间的失败一律落成
//! Observation / InvalidationRecord，由 PolicyEngine 统一转换为控制决策。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::plan::{PlanVersion, StepId};

/// 步骤失败分类（决定是否可重试）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// 步骤超时
    Timeout,
    /// 能力方限流
    RateLimited,
    /// 其他暂时性错误（含 Partial 结果）
    Transient,
    /// 同步 gate 未通过
    GateRejected,
    /// 结构性错误：能力缺失、schema 不匹配、验收失败
    Structural,
    /// 能力明确拒绝，重试无意义
    Permanent,
    /// 协作式取消
    Cancelled,
}

impl FailureKind {
    /// 超时 / 限流 / 暂时性错误可重试
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Timeout | Self::RateLimited | Self::Transient)
    }

    pub fn is_structural(self) -> bool {
        matches!(self, Self::Structural)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::Transient => "transient",
            Self::GateRejected => "gate_rejected",
            Self::Structural => "structural",
            Self::Permanent => "permanent",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// 升级严重级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    /// 完整性失败：立即停止
    S1,
    /// 预算超限：暂停等待人工决定，可恢复
    S2,
    /// 结构性问题或策略耗尽：需要人工输入
    S3,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::S1 => write!(f, "S1"),
            Severity::S2 => write!(f, "S2"),
            Severity::S3 => write!(f, "S3"),
        }
    }
}

/// 计划图结构错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanError {
    #[error("Plan contains no steps")]
    EmptyPlan,
    #[error("Duplicate step id: {0}")]
    DuplicateStep(StepId),
    #[error("Step not found: {0}")]
    UnknownStep(StepId),
    #[error("Step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: StepId, dependency: StepId },
    #[error("Cyclic dependency detected among: {}", .0.join(", "))]
    CyclicDependency(Vec<StepId>),
    #[error("Step '{step}' still has dependents: {}", .dependents.join(", "))]
    HasDependents { step: StepId, dependents: Vec<StepId> },
}

/// Planner 错误；CapabilityGap 会被 PolicyEngine 直接转为升级
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlannerError {
    #[error("Capability gap: step '{step}' references unknown capability '{capability}'")]
    CapabilityGap { step: StepId, capability: String },
    #[error("Schema mismatch at step '{step}': {detail}")]
    SchemaMismatch { step: StepId, detail: String },
    #[error("Invalid plan: {0}")]
    Plan(#[from] PlanError),
    #[error("Planning brain returned an unusable proposal: {0}")]
    InvalidProposal(String),
    #[error("Planning brain produced no usable candidates")]
    NoCandidates,
    #[error("Planning brain error: {0}")]
    Brain(String),
}

impl PlannerError {
    pub fn is_capability_gap(&self) -> bool {
        matches!(self, Self::CapabilityGap { .. })
    }

    /// 与错误相关的步骤（用于升级请求中的血缘说明）
    pub fn step(&self) -> Option<&str> {
        match self {
            Self::CapabilityGap { step, .. } | Self::SchemaMismatch { step, .. } => Some(step),
            Self::Plan(PlanError::UnknownDependency { step, .. })
            | Self::Plan(PlanError::DuplicateStep(step))
            | Self::Plan(PlanError::UnknownStep(step)) => Some(step),
            _ => None,
        }
    }
}

/// 能力调用错误（由 Capability 实现返回）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CapabilityError {
    #[error("Capability timed out")]
    Timeout,
    #[error("Rate limited, retry after {retry_after_ms:?}ms")]
    RateLimited { retry_after_ms: Option<u64> },
    #[error("Transient failure: {0}")]
    Transient(String),
    #[error("Invalid invocation: {0}")]
    Invalid(String),
    #[error("Capability failed: {0}")]
    Failed(String),
    #[error("Invocation cancelled")]
    Cancelled,
    #[error("Compensation not supported by capability '{0}'")]
    CompensationUnsupported(String),
    #[error("Capability not found: {0}")]
    NotFound(String),
}

impl CapabilityError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Timeout => FailureKind::Timeout,
            Self::RateLimited { .. } => FailureKind::RateLimited,
            Self::Transient(_) => FailureKind::Transient,
            Self::Invalid(_) | Self::NotFound(_) | Self::CompensationUnsupported(_) => {
                FailureKind::Structural
            }
            Self::Failed(_) => FailureKind::Permanent,
            Self::Cancelled => FailureKind::Cancelled,
        }
    }
}

/// 协调器内部故障（非任务失败；任务失败走 PolicyEngine）
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Checkpoint for '{step}' requires valid checkpoints for dependencies: {}", .missing.join(", "))]
    CheckpointCausality { step: StepId, missing: Vec<StepId> },
    #[error("Observation for '{step}' at plan v{attempted} after v{recorded} was already recorded")]
    VersionRegression {
        step: StepId,
        recorded: PlanVersion,
        attempted: PlanVersion,
    },
    #[error("Observation for '{step}' v{version} attempt {attempt} already recorded")]
    DuplicateObservation {
        step: StepId,
        version: PlanVersion,
        attempt: u32,
    },
    #[error("Plan version must increase: current v{current}, proposed v{proposed}")]
    PlanVersionRegression {
        current: PlanVersion,
        proposed: PlanVersion,
    },
    #[error("Task is not escalated")]
    NotEscalated,
    #[error("No plan installed")]
    NoPlan,
    #[error("Operator channel error: {0}")]
    Operator(String),
    #[error("Coordinator misconfigured: {0}")]
    Misconfigured(String),
    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(FailureKind::Timeout.is_transient());
        assert!(FailureKind::RateLimited.is_transient());
        assert!(!FailureKind::Structural.is_transient());
        assert!(!FailureKind::GateRejected.is_transient());
    }

    #[test]
    fn test_capability_error_kind() {
        assert_eq!(CapabilityError::Timeout.kind(), FailureKind::Timeout);
        assert_eq!(
            CapabilityError::Invalid("bad".into()).kind(),
            FailureKind::Structural
        );
        assert_eq!(CapabilityError::Failed("x".into()).kind(), FailureKind::Permanent);
    }

    #[test]
    fn test_planner_error_step() {
        let err = PlannerError::CapabilityGap {
            step: "fetch".into(),
            capability: "nonexistent_tool".into(),
        };
        assert!(err.is_capability_gap());
        assert_eq!(err.step(), Some("fetch"));
    }
}
