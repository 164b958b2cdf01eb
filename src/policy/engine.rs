//! PolicyEngine：把失败转换为控制决策的唯一位置
//!
//! 纯函数：输入为 ExecutionState、观测日志、触发事件与配置，不修改任何状态。

use std::sync::Arc;

use tracing::debug;

use crate::config::PolicySection;
use crate::core::{ExecutionState, FailureKind, ObservationLog, Severity};
use crate::plan::ActionContract;
use crate::policy::{ConfidenceScorer, Decision, FailureRatioScorer, PolicyInput};

pub type PolicyConfig = PolicySection;

pub struct PolicyEngine {
    config: PolicyConfig,
    scorer: Arc<dyn ConfidenceScorer>,
}

impl PolicyEngine {
    pub fn new(config: PolicyConfig) -> Self {
        Self {
            config,
            scorer: Arc::new(FailureRatioScorer),
        }
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn ConfidenceScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    pub fn confidence(&self, state: &ExecutionState, log: &ObservationLog) -> f64 {
        self.scorer.score(state, log)
    }

    pub fn decide(&self, state: &ExecutionState, log: &ObservationLog, input: PolicyInput<'_>) -> Decision {
        if let Some(reason) = state.budget.breach(&state.limits) {
            return Decision::escalate(Severity::S2, format!("budget exceeded: {reason}"));
        }
        let decision = match input {
            PolicyInput::Observation {
                observation,
                retry_safe,
            } => {
                let Some(kind) = observation.failure_kind() else {
                    return Decision::Continue;
                };
                let step = &observation.step_id;
                let reason = observation
                    .failure
                    .as_ref()
                    .map(|f| f.reason.as_str())
                    .unwrap_or("unknown failure");
                let retryable = kind.is_transient()
                    || (kind == FailureKind::GateRejected && self.config.retry_gate_rejections);
                if kind == FailureKind::Cancelled {
                    Decision::Continue
                } else if retryable && retry_safe && state.retry_count(step) < self.config.max_retries {
                    Decision::Retry(step.clone())
                } else if kind.is_structural() {
                    self.replan_or_escalate(state, format!("structural failure at '{step}': {reason}"))
                } else {
                    let confidence = self.confidence(state, log);
                    if state.replan_count < self.config.max_replans
                        && confidence < self.config.confidence_threshold
                    {
                        Decision::Replan
                    } else {
                        Decision::escalate(
                            Severity::S3,
                            format!(
                                "step '{step}' failed ({kind}): {reason}; retries {}/{}, replans {}/{}, confidence {confidence:.2}",
                                state.retry_count(step),
                                self.config.max_retries,
                                state.replan_count,
                                self.config.max_replans
                            ),
                        )
                    }
                }
            }
            PolicyInput::Invalidation(record) => {
                if !record.replay {
                    Decision::escalate(
                        record.severity,
                        format!("retrospect '{}' failed on '{}': {}", record.retrospect_id, record.failed_step, record.reason),
                    )
                } else if state.integrity_replays(&record.failed_step) < self.config.max_integrity_replays {
                    Decision::Replan
                } else {
                    Decision::escalate(
                        Severity::S1,
                        format!(
                            "retrospect '{}' failed again on '{}' after replay: {}",
                            record.retrospect_id, record.failed_step, record.reason
                        ),
                    )
                }
            }
            PolicyInput::PlanningFailed(err) => {
                if err.is_capability_gap() {
                    Decision::escalate(Severity::S3, err.to_string())
                } else {
                    self.replan_or_escalate(state, format!("planning failed: {err}"))
                }
            }
            PolicyInput::AcceptanceFailed(names) => {
                self.replan_or_escalate(state, format!("acceptance tests failed: {}", names.join(", ")))
            }
        };
        debug!(decision = ?decision, "Policy decision");
        decision
    }

    fn replan_or_escalate(&self, state: &ExecutionState, reason: String) -> Decision {
        if state.replan_count < self.config.max_replans {
            Decision::Replan
        } else {
            Decision::escalate(Severity::S3, format!("{reason}; replans exhausted"))
        }
    }

    /// 派发前的准入检查：已消耗 + 在途预估 + 本步预估不得超过限额
    pub fn admit(&self, state: &ExecutionState, contract: &ActionContract, reserved_cost: f64) -> Decision {
        let limits = &state.limits;
        let budget = &state.budget;
        if let Some(reason) = budget.breach(limits) {
            return Decision::escalate(Severity::S2, format!("budget exceeded: {reason}"));
        }
        if let Some(limit) = limits.cost_usd {
            let projected = budget.cost_usd + reserved_cost + contract.estimated_cost_usd;
            if projected > limit + 1e-9 {
                return Decision::escalate(
                    Severity::S2,
                    format!(
                        "dispatching '{}' would raise cost to {projected:.4} USD, limit {limit:.4} USD",
                        contract.id
                    ),
                );
            }
        }
        if let Some(limit) = limits.latency_sec {
            let projected = (budget.elapsed_ms + contract.estimated_latency_ms) as f64 / 1000.0;
            if projected > limit {
                return Decision::escalate(
                    Severity::S2,
                    format!(
                        "dispatching '{}' would raise elapsed time to {projected:.3}s, limit {limit:.3}s",
                        contract.id
                    ),
                );
            }
        }
        if let Some(limit) = limits.max_tokens {
            if budget.tokens >= limit {
                return Decision::escalate(
                    Severity::S2,
                    format!("token budget {limit} exhausted before '{}'", contract.id),
                );
            }
        }
        Decision::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::observation::test_observation;
    use crate::core::PlannerError;
    use crate::plan::Constraints;
    use crate::policy::FixedConfidence;
    use crate::verify::InvalidationRecord;

    fn engine() -> PolicyEngine {
        PolicyEngine::new(PolicyConfig::default())
    }

    fn state() -> ExecutionState {
        let mut state = ExecutionState::new("t", Constraints::default());
        state.plan_version = 1;
        state
    }

    fn failure(kind: FailureKind) -> crate::core::Observation {
        test_observation("b", 1, 1).into_failure(kind, "boom")
    }

    #[test]
    fn test_transient_failure_retried_until_limit() {
        let engine = engine();
        let mut state = state();
        let log = ObservationLog::new();
        let obs = failure(FailureKind::Timeout);
        let input = PolicyInput::Observation { observation: &obs, retry_safe: true };
        assert_eq!(engine.decide(&state, &log, input), Decision::Retry("b".into()));

        state.retry_counts.insert("b".into(), 3);
        let engine = engine.with_scorer(Arc::new(FixedConfidence(0.2)));
        assert_eq!(engine.decide(&state, &log, input), Decision::Replan);

        state.replan_count = 2;
        assert!(engine.decide(&state, &log, input).is_escalate());
    }

    #[test]
    fn test_side_effecting_step_not_retried() {
        let engine = engine().with_scorer(Arc::new(FixedConfidence(0.9)));
        let obs = failure(FailureKind::Transient);
        let input = PolicyInput::Observation { observation: &obs, retry_safe: false };
        assert_eq!(
            engine.decide(&state(), &ObservationLog::new(), input),
            Decision::Escalate {
                severity: Severity::S3,
                reason: "step 'b' failed (transient): boom; retries 0/3, replans 0/2, confidence 0.90".into()
            }
        );
    }

    #[test]
    fn test_structural_never_retried() {
        let obs = failure(FailureKind::Structural);
        let input = PolicyInput::Observation { observation: &obs, retry_safe: true };
        assert_eq!(engine().decide(&state(), &ObservationLog::new(), input), Decision::Replan);
    }

    #[test]
    fn test_capability_gap_escalates() {
        let err = PlannerError::CapabilityGap { step: "x".into(), capability: "nonexistent_tool".into() };
        let decision = engine().decide(&state(), &ObservationLog::new(), PolicyInput::PlanningFailed(&err));
        assert!(matches!(decision, Decision::Escalate { severity: Severity::S3, .. }));
    }

    #[test]
    fn test_budget_breach_escalates_s2() {
        let mut state = state();
        state.limits.cost_usd = Some(1.0);
        state.budget.charge("a", 1.5, 0, true, false);
        let obs = test_observation("a", 1, 1);
        let input = PolicyInput::Observation { observation: &obs, retry_safe: true };
        assert!(matches!(
            engine().decide(&state, &ObservationLog::new(), input),
            Decision::Escalate { severity: Severity::S2, .. }
        ));
    }

    #[test]
    fn test_admission_counts_estimate() {
        let mut state = state();
        state.limits.cost_usd = Some(1.0);
        state.budget.charge("a", 0.6, 0, true, false);
        let contract = ActionContract::new("b", "echo").estimate(0.6, 0);
        assert!(matches!(
            engine().admit(&state, &contract, 0.0),
            Decision::Escalate { severity: Severity::S2, .. }
        ));
        let small = ActionContract::new("b", "echo").estimate(0.3, 0);
        assert_eq!(engine().admit(&state, &small, 0.0), Decision::Continue);
        assert!(engine().admit(&state, &small, 0.2).is_escalate());
    }

    #[test]
    fn test_integrity_replay_then_escalate() {
        let mut state = state();
        let record = InvalidationRecord {
            failed_step: "a".into(),
            retrospect_id: "r".into(),
            observed_version: 1,
            reason: "bad".into(),
            severity: Severity::S1,
            replay: true,
            affected: vec!["a".into(), "c".into()],
            compensations: vec![],
            patch: vec![],
        };
        let log = ObservationLog::new();
        assert_eq!(engine().decide(&state, &log, PolicyInput::Invalidation(&record)), Decision::Replan);
        state.integrity_replays.insert("a".into(), 1);
        assert!(matches!(
            engine().decide(&state, &log, PolicyInput::Invalidation(&record)),
            Decision::Escalate { severity: Severity::S1, .. }
        ));
        let no_replay = InvalidationRecord { replay: false, severity: Severity::S2, ..record };
        assert!(matches!(
            engine().decide(&ExecutionState::new("t", Constraints::default()), &log, PolicyInput::Invalidation(&no_replay)),
            Decision::Escalate { severity: Severity::S2, .. }
        ));
    }
}
