//! Observation：单次执行 ActionContract 的标准化结果
//!
//! 记录后不可变；同一步骤的重放产生挂在新版本上的新 Observation，而不是覆盖。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{CoordinatorError, FailureKind};
use crate::plan::{PlanVersion, StepId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObservationStatus {
    Success,
    Failure,
    Partial,
}

/// 失败详情
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub kind: FailureKind,
    pub reason: String,
    /// 能力建议的重试等待时间
    #[serde(default)]
    pub retry_after_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub step_id: StepId,
    pub plan_version: PlanVersion,
    /// 契约 revision
    pub revision: u32,
    /// 同一版本内的第几次派发（从 1 开始）
    pub attempt: u32,
    pub status: ObservationStatus,
    /// 发送给能力的参数（补偿时回传）
    pub input: Value,
    pub output: Value,
    pub failure: Option<FailureInfo>,
    /// 毫秒时间戳
    pub timestamp: i64,
    pub cost_usd: f64,
    pub tokens: u64,
    pub duration_ms: u64,
    /// 能力原始响应（不透明）
    #[serde(default)]
    pub raw: Option<Value>,
}

impl Observation {
    pub fn is_success(&self) -> bool {
        self.status == ObservationStatus::Success
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.failure.as_ref().map(|f| f.kind)
    }

    /// 把成功观测降级为失败（gate 未通过时使用）
    pub fn into_failure(mut self, kind: FailureKind, reason: impl Into<String>) -> Self {
        self.status = ObservationStatus::Failure;
        self.failure = Some(FailureInfo {
            kind,
            reason: reason.into(),
            retry_after_ms: None,
        });
        self
    }
}

/// 观测日志：追加写，保证同一步骤的版本单调
#[derive(Debug, Clone, Default)]
pub struct ObservationLog {
    entries: Vec<Observation>,
    latest_version: HashMap<StepId, PlanVersion>,
}

impl ObservationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<Observation>) -> Result<Self, CoordinatorError> {
        let mut log = Self::new();
        for obs in entries {
            log.record(obs)?;
        }
        Ok(log)
    }

    /// 追加观测；拒绝版本倒退与重复记录
    pub fn record(&mut self, obs: Observation) -> Result<(), CoordinatorError> {
        if let Some(&recorded) = self.latest_version.get(&obs.step_id) {
            if obs.plan_version < recorded {
                return Err(CoordinatorError::VersionRegression {
                    step: obs.step_id.clone(),
                    recorded,
                    attempted: obs.plan_version,
                });
            }
        }
        let duplicate = self.entries.iter().any(|o| {
            o.step_id == obs.step_id && o.plan_version == obs.plan_version && o.attempt == obs.attempt
        });
        if duplicate {
            return Err(CoordinatorError::DuplicateObservation {
                step: obs.step_id.clone(),
                version: obs.plan_version,
                attempt: obs.attempt,
            });
        }
        self.latest_version
            .insert(obs.step_id.clone(), obs.plan_version);
        self.entries.push(obs);
        Ok(())
    }

    pub fn all(&self) -> &[Observation] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn for_step<'a>(&'a self, step: &'a str) -> impl Iterator<Item = &'a Observation> + 'a {
        self.entries.iter().filter(move |o| o.step_id == step)
    }

    /// 某步骤最近一次成功观测
    pub fn latest_success(&self, step: &str) -> Option<&Observation> {
        self.entries
            .iter()
            .rev()
            .find(|o| o.step_id == step && o.is_success())
    }

    /// 当前版本内的（总尝试数, 失败数）
    pub fn attempts_in_version(&self, version: PlanVersion) -> (usize, usize) {
        self.entries
            .iter()
            .filter(|o| o.plan_version == version)
            .fold((0, 0), |(total, failed), o| {
                (total + 1, failed + usize::from(!o.is_success()))
            })
    }

    pub fn into_entries(self) -> Vec<Observation> {
        self.entries
    }
}

#[cfg(test)]
pub(crate) fn test_observation(step: &str, version: PlanVersion, attempt: u32) -> Observation {
    Observation {
        step_id: step.to_string(),
        plan_version: version,
        revision: 0,
        attempt,
        status: ObservationStatus::Success,
        input: Value::Null,
        output: serde_json::json!({"ok": true}),
        failure: None,
        timestamp: 0,
        cost_usd: 0.0,
        tokens: 0,
        duration_ms: 0,
        raw: None,
    }
}
