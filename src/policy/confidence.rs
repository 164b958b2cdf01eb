//! 计划置信度评分（可插拔）

use crate::core::{ExecutionState, ObservationLog};

/// 对当前计划结构的置信度打分，取值 [0, 1]
pub trait ConfidenceScorer: Send + Sync {
    fn score(&self, state: &ExecutionState, log: &ObservationLog) -> f64;
}

/// 默认实现：1 - 当前版本内失败观测占比；尚无观测时为 1
#[derive(Debug, Default, Clone, Copy)]
pub struct FailureRatioScorer;

impl ConfidenceScorer for FailureRatioScorer {
    fn score(&self, state: &ExecutionState, log: &ObservationLog) -> f64 {
        let (total, failed) = log.attempts_in_version(state.plan_version);
        if total == 0 {
            return 1.0;
        }
        1.0 - failed as f64 / total as f64
    }
}

/// 固定分值（测试或外部已算好置信度时使用）
#[derive(Debug, Clone, Copy)]
pub struct FixedConfidence(pub f64);

impl ConfidenceScorer for FixedConfidence {
    fn score(&self, _state: &ExecutionState, _log: &ObservationLog) -> f64 {
        self.0.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::observation::test_observation;
    use crate::core::FailureKind;
    use crate::plan::Constraints;

    #[test]
    fn test_failure_ratio() {
        let mut state = ExecutionState::new("t", Constraints::default());
        state.plan_version = 1;
        let mut log = ObservationLog::new();
        assert_eq!(FailureRatioScorer.score(&state, &log), 1.0);

        log.record(test_observation("a", 1, 1)).unwrap();
        log.record(test_observation("b", 1, 1).into_failure(FailureKind::Permanent, "no"))
            .unwrap();
        log.record(test_observation("b", 1, 2).into_failure(FailureKind::Permanent, "no"))
            .unwrap();
        let score = FailureRatioScorer.score(&state, &log);
        assert!((score - 1.0 / 3.0).abs() < 1e-9);
    }
}
