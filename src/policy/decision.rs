//! 策略决策与输入

use serde::{Deserialize, Serialize};

use crate::core::{Observation, PlannerError, Severity};
use crate::plan::StepId;
use crate::verify::InvalidationRecord;

/// 控制决策
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Decision {
    Continue,
    /// 只重新派发该步骤
    Retry(StepId),
    /// 回到规划；由回溯失败触发时表示应用补丁并重放失效血缘
    Replan,
    /// 暂停并请求运维决定
    Escalate { severity: Severity, reason: String },
}

impl Decision {
    pub fn escalate(severity: Severity, reason: impl Into<String>) -> Self {
        Self::Escalate {
            severity,
            reason: reason.into(),
        }
    }

    pub fn is_escalate(&self) -> bool {
        matches!(self, Self::Escalate { .. })
    }
}

/// 触发一次决策的事件
#[derive(Debug, Clone, Copy)]
pub enum PolicyInput<'a> {
    /// 步骤观测；`retry_safe` 表示能力幂等或可补偿
    Observation {
        observation: &'a Observation,
        retry_safe: bool,
    },
    /// 回溯校验失败
    Invalidation(&'a InvalidationRecord),
    /// 规划失败（含能力缺失）
    PlanningFailed(&'a PlannerError),
    /// 完成前验收测试未通过
    AcceptanceFailed(&'a [String]),
}
