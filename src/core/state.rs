//! 执行状态：每个任务一份，只由 Coordinator 提交状态迁移
//!
//! 其他组件只读取或基于它推导。整个结构可序列化，用于进程重启后恢复。

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::core::CoordinatorError;
use crate::plan::{Constraints, LineageTracker, Plan, PlanVersion, StepId};

/// 步骤状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    /// 等待依赖
    Pending,
    /// 依赖均已 Done，可派发
    Ready,
    /// 正在执行
    Running,
    /// 已完成且 gate 通过
    Done,
    /// 被回溯校验失效
    Invalidated,
}

/// 协调器阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordinatorPhase {
    Planning,
    Executing,
    /// 步骤全部完成，正在验收
    Verifying,
    Completed,
    Escalated,
    Failed,
}

impl CoordinatorPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// 预算账本
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetLedger {
    pub cost_usd: f64,
    pub tokens: u64,
    pub elapsed_ms: u64,
    /// 幂等步骤最近一次成功的计费，重放时替换而非累加
    settled: BTreeMap<StepId, f64>,
}

impl BudgetLedger {
    /// 记一笔观测的消耗
    pub fn charge(&mut self, step: &str, cost_usd: f64, tokens: u64, success: bool, idempotent: bool) {
        self.tokens += tokens;
        if success && idempotent {
            if let Some(previous) = self.settled.insert(step.to_string(), cost_usd) {
                self.cost_usd -= previous;
            }
        }
        self.cost_usd += cost_usd;
    }

    /// 与限额比较，返回第一个被突破的约束说明
    pub fn breach(&self, limits: &Constraints) -> Option<String> {
        if let Some(limit) = limits.cost_usd {
            if self.cost_usd > limit + f64::EPSILON {
                return Some(format!("cost {:.4} USD exceeds limit {:.4} USD", self.cost_usd, limit));
            }
        }
        if let Some(limit) = limits.latency_sec {
            let elapsed = self.elapsed_ms as f64 / 1000.0;
            if elapsed > limit {
                return Some(format!("elapsed {elapsed:.3}s exceeds limit {limit:.3}s"));
            }
        }
        if let Some(limit) = limits.max_tokens {
            if self.tokens > limit {
                return Some(format!("tokens {} exceed limit {}", self.tokens, limit));
            }
        }
        None
    }
}

/// 未决的异步回溯校验
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PendingRetrospect {
    pub step_id: StepId,
    pub retrospect_id: String,
    pub plan_version: PlanVersion,
    pub revision: u32,
}

/// 每任务可变状态
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionState {
    pub task_id: String,
    pub plan_version: PlanVersion,
    pub phase: CoordinatorPhase,
    statuses: BTreeMap<StepId, StepStatus>,
    pub budget: BudgetLedger,
    /// 有效限额（初始取自 brief，可被运维方扩展）
    pub limits: Constraints,
    pub retry_counts: BTreeMap<StepId, u32>,
    pub replan_count: u32,
    pub integrity_replays: BTreeMap<StepId, u32>,
    pub invalidation_count: u32,
    /// 步骤 -> (版本, 该版本内已派发次数)
    attempts: BTreeMap<StepId, (PlanVersion, u32)>,
    pub pending_retrospects: BTreeSet<PendingRetrospect>,
}

impl ExecutionState {
    pub fn new(task_id: impl Into<String>, limits: Constraints) -> Self {
        Self {
            task_id: task_id.into(),
            plan_version: 0,
            phase: CoordinatorPhase::Planning,
            statuses: BTreeMap::new(),
            budget: BudgetLedger::default(),
            limits,
            retry_counts: BTreeMap::new(),
            replan_count: 0,
            integrity_replays: BTreeMap::new(),
            invalidation_count: 0,
            attempts: BTreeMap::new(),
            pending_retrospects: BTreeSet::new(),
        }
    }

    pub fn status(&self, step: &str) -> Option<StepStatus> {
        self.statuses.get(step).copied()
    }

    pub fn statuses(&self) -> &BTreeMap<StepId, StepStatus> {
        &self.statuses
    }

    pub fn set_status(&mut self, step: &str, status: StepStatus) {
        if let Some(s) = self.statuses.get_mut(step) {
            *s = status;
        }
    }

    pub fn retry_count(&self, step: &str) -> u32 {
        self.retry_counts.get(step).copied().unwrap_or(0)
    }

    pub fn total_retries(&self) -> u32 {
        self.retry_counts.values().sum()
    }

    pub fn integrity_replays(&self, step: &str) -> u32 {
        self.integrity_replays.get(step).copied().unwrap_or(0)
    }

    /// 分配本版本内的下一次派发序号
    pub fn next_attempt(&mut self, step: &str) -> u32 {
        let version = self.plan_version;
        let entry = self
            .attempts
            .entry(step.to_string())
            .or_insert((version, 0));
        if entry.0 != version {
            *entry = (version, 0);
        }
        entry.1 += 1;
        entry.1
    }

    /// 安装新版本计划
    ///
    /// `stale` 为需要重新执行的步骤（血缘追踪器给出的变化节点及其下游）。
    /// 返回需要取消的运行中步骤。未变化的 Done / Running 步骤保持原状态。
    pub fn apply_plan(&mut self, plan: &Plan, stale: &[StepId]) -> Result<Vec<StepId>, CoordinatorError> {
        if plan.version <= self.plan_version {
            return Err(CoordinatorError::PlanVersionRegression {
                current: self.plan_version,
                proposed: plan.version,
            });
        }
        let mut cancelled = Vec::new();
        let mut next = BTreeMap::new();
        for id in plan.step_ids() {
            let previous = self.statuses.get(id).copied();
            let status = match previous {
                Some(StepStatus::Running) if stale.contains(id) => {
                    cancelled.push(id.clone());
                    StepStatus::Pending
                }
                Some(StepStatus::Done) if stale.contains(id) => StepStatus::Pending,
                Some(StepStatus::Done) => StepStatus::Done,
                Some(StepStatus::Running) => StepStatus::Running,
                _ => StepStatus::Pending,
            };
            next.insert(id.clone(), status);
        }
        for (id, status) in &self.statuses {
            if !plan.contains(id) && *status == StepStatus::Running {
                cancelled.push(id.clone());
            }
        }
        self.retry_counts.retain(|k, _| plan.contains(k));
        self.pending_retrospects
            .retain(|p| plan.contains(&p.step_id) && !stale.contains(&p.step_id));
        self.statuses = next;
        self.plan_version = plan.version;
        Ok(cancelled)
    }

    /// 把一组步骤标记为失效
    pub fn invalidate(&mut self, steps: &[StepId]) {
        for s in steps {
            self.set_status(s, StepStatus::Invalidated);
        }
        self.pending_retrospects.retain(|p| !steps.contains(&p.step_id));
        self.invalidation_count += 1;
    }

    /// 依据依赖状态刷新 Pending / Ready / Invalidated
    ///
    /// Ready 当且仅当所有依赖均为 Done。
    pub fn refresh_ready(&mut self, tracker: &LineageTracker) {
        for id in tracker.topological_order() {
            let deps_done = tracker
                .dependencies(id)
                .iter()
                .all(|d| self.status(d) == Some(StepStatus::Done));
            match self.status(id) {
                Some(StepStatus::Pending) if deps_done => self.set_status(id, StepStatus::Ready),
                Some(StepStatus::Ready) if !deps_done => self.set_status(id, StepStatus::Pending),
                _ => {}
            }
        }
    }

    /// Ready 步骤（拓扑序）
    pub fn ready_steps(&self, tracker: &LineageTracker) -> Vec<StepId> {
        tracker
            .topological_order()
            .iter()
            .filter(|id| self.status(id) == Some(StepStatus::Ready))
            .cloned()
            .collect()
    }

    pub fn running_steps(&self) -> Vec<StepId> {
        self.steps_with(StepStatus::Running)
    }

    pub fn steps_with(&self, status: StepStatus) -> Vec<StepId> {
        self.statuses
            .iter()
            .filter(|(_, s)| **s == status)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn all_done(&self) -> bool {
        !self.statuses.is_empty() && self.statuses.values().all(|s| *s == StepStatus::Done)
    }

    /// 检查 Ready / Done 不变式，返回违规描述
    pub fn check_invariants(&self, tracker: &LineageTracker) -> Vec<String> {
        let mut violations = Vec::new();
        for id in tracker.topological_order() {
            let status = self.status(id);
            let deps = tracker.dependencies(id);
            let deps_done = deps.iter().all(|d| self.status(d) == Some(StepStatus::Done));
            match status {
                Some(StepStatus::Ready) if !deps_done => {
                    violations.push(format!("{id} is Ready but a dependency is not Done"))
                }
                Some(StepStatus::Done) | Some(StepStatus::Running) if !deps_done => {
                    violations.push(format!("{id} is {status:?} before its dependencies"))
                }
                None => violations.push(format!("{id} has no status")),
                _ => {}
            }
        }
        violations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::ActionContract;

    fn chain() -> Plan {
        Plan::new(
            "t",
            1,
            vec![
                ActionContract::new("a", "echo"),
                ActionContract::new("b", "echo").depends_on("a"),
                ActionContract::new("c", "echo").depends_on("b"),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_refresh_ready_follows_dependencies() {
        let plan = chain();
        let tracker = LineageTracker::from_plan(&plan).unwrap();
        let mut state = ExecutionState::new("t", Constraints::default());
        state.apply_plan(&plan, &[]).unwrap();
        state.refresh_ready(&tracker);
        assert_eq!(state.ready_steps(&tracker), vec!["a"]);

        state.set_status("a", StepStatus::Done);
        state.refresh_ready(&tracker);
        assert_eq!(state.ready_steps(&tracker), vec!["b"]);
        assert!(state.check_invariants(&tracker).is_empty());

        state.invalidate(&["a".to_string()]);
        state.refresh_ready(&tracker);
        assert_eq!(state.status("b"), Some(StepStatus::Pending));
    }

    #[test]
    fn test_apply_plan_rejects_lower_version() {
        let plan = chain();
        let mut state = ExecutionState::new("t", Constraints::default());
        state.apply_plan(&plan, &[]).unwrap();
        let err = state.apply_plan(&plan, &[]).unwrap_err();
        assert!(matches!(err, CoordinatorError::PlanVersionRegression { .. }));
    }

    #[test]
    fn test_next_attempt_resets_per_version() {
        let mut state = ExecutionState::new("t", Constraints::default());
        state.plan_version = 1;
        assert_eq!(state.next_attempt("a"), 1);
        assert_eq!(state.next_attempt("a"), 2);
        state.plan_version = 2;
        assert_eq!(state.next_attempt("a"), 1);
    }

    #[test]
    fn test_idempotent_replay_charges_once() {
        let mut ledger = BudgetLedger::default();
        ledger.charge("a", 0.5, 10, true, true);
        ledger.charge("a", 0.5, 10, true, true);
        assert!((ledger.cost_usd - 0.5).abs() < 1e-9);
        assert_eq!(ledger.tokens, 20);

        ledger.charge("w", 0.2, 0, true, false);
        ledger.charge("w", 0.2, 0, true, false);
        assert!((ledger.cost_usd - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_breach_reports_cost() {
        let mut ledger = BudgetLedger::default();
        ledger.charge("a", 1.2, 0, true, false);
        let limits = Constraints {
            cost_usd: Some(1.0),
            ..Default::default()
        };
        assert!(ledger.breach(&limits).unwrap().contains("cost"));
        assert!(ledger.breach(&Constraints::default()).is_none());
    }
}
