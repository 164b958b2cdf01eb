//! 任务结果

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::coordinator::EscalationRequest;
use crate::core::{CoordinatorPhase, Severity};
use crate::plan::{PlanVersion, StepId};
use crate::verify::InvalidationRecord;

/// 可记录的指标名
pub const METRIC_NAMES: [&str; 7] = [
    "cost_usd",
    "tokens",
    "elapsed_ms",
    "retries",
    "replans",
    "observations",
    "invalidations",
];

/// `Coordinator::run` / `settle` 的返回值；Escalated / Failed 时附带说明与涉及的血缘
///
/// Completed 且仍有未决回溯校验时结果是临时的（`provisional`），
/// 迟到的失败结论仍可能让任务重新执行。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: String,
    pub status: CoordinatorPhase,
    pub plan_version: PlanVersion,
    pub outputs: BTreeMap<String, Value>,
    #[serde(default)]
    pub explanation: Option<String>,
    #[serde(default)]
    pub severity: Option<Severity>,
    #[serde(default)]
    pub implicated: Vec<StepId>,
    #[serde(default)]
    pub escalation: Option<EscalationRequest>,
    #[serde(default)]
    pub invalidations: Vec<InvalidationRecord>,
    #[serde(default)]
    pub provisional: bool,
    #[serde(default)]
    pub pending_retrospects: usize,
    pub metrics: BTreeMap<String, f64>,
}

impl TaskOutcome {
    pub fn is_completed(&self) -> bool {
        self.status == CoordinatorPhase::Completed
    }

    /// 进入终态且不再有未决回溯校验
    pub fn is_final(&self) -> bool {
        self.status.is_terminal() && !self.provisional
    }

    pub fn is_escalated(&self) -> bool {
        self.status == CoordinatorPhase::Escalated
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }
}
