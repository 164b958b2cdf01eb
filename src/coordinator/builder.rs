//! Coordinator 构建器：统一组装 Planner / Executor / RetrospectEngine / PolicyEngine
//!
//! 能力注册表、检查注册表与 Verifier 在这里一次性注入，组件之间不共享全局状态。

use std::sync::Arc;

use crate::capability::{Capability, CapabilityRegistry};
use crate::config::AppConfig;
use crate::coordinator::engine::{Components, Coordinator};
use crate::coordinator::{OperatorChannel, TaskSnapshot};
use crate::core::CoordinatorError;
use crate::executor::Executor;
use crate::llm::LlmClient;
use crate::plan::TaskBrief;
use crate::planner::{FixedPlanBrain, LlmPlanningBrain, PlanCandidate, Planner, PlanningBrain};
use crate::policy::{ConfidenceScorer, PolicyEngine};
use crate::verify::{CheckRegistry, RetrospectCheck, RetrospectEngine, Verifier};

pub struct CoordinatorBuilder {
    brief: TaskBrief,
    config: AppConfig,
    registry: CapabilityRegistry,
    brain: Option<Arc<dyn PlanningBrain>>,
    checks: CheckRegistry,
    verifier: Verifier,
    operator: Option<Arc<dyn OperatorChannel>>,
    scorer: Option<Arc<dyn ConfidenceScorer>>,
    snapshot: Option<TaskSnapshot>,
}

impl CoordinatorBuilder {
    pub fn new(brief: TaskBrief, config: AppConfig) -> Self {
        Self {
            brief,
            config,
            registry: CapabilityRegistry::new(),
            brain: None,
            checks: CheckRegistry::new(),
            verifier: Verifier::new(),
            operator: None,
            scorer: None,
            snapshot: None,
        }
    }

    /// 从快照恢复；brief 以快照中的为准
    pub fn from_snapshot(snapshot: TaskSnapshot, config: AppConfig) -> Self {
        let mut builder = Self::new(snapshot.brief.clone(), config);
        builder.snapshot = Some(snapshot);
        builder
    }

    pub fn with_registry(mut self, registry: CapabilityRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_capability(mut self, capability: impl Capability + 'static) -> Self {
        self.registry.register(capability);
        self
    }

    pub fn with_brain(mut self, brain: Arc<dyn PlanningBrain>) -> Self {
        self.brain = Some(brain);
        self
    }

    /// 使用 LLM 作为 planning brain（系统提示词取自配置）
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        let brain = LlmPlanningBrain::new(llm, self.config.planner.system_prompt.clone());
        self.brain = Some(Arc::new(brain));
        self
    }

    /// 使用预先给定的候选计划
    pub fn with_candidates(mut self, candidates: Vec<PlanCandidate>) -> Self {
        self.brain = Some(Arc::new(FixedPlanBrain::from_candidates(candidates)));
        self
    }

    pub fn with_checks(mut self, checks: CheckRegistry) -> Self {
        self.checks = checks;
        self
    }

    pub fn with_check(mut self, check: impl RetrospectCheck + 'static) -> Self {
        self.checks.register(check);
        self
    }

    pub fn with_verifier(mut self, verifier: Verifier) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn with_operator(mut self, operator: Arc<dyn OperatorChannel>) -> Self {
        self.operator = Some(operator);
        self
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn ConfidenceScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn build(self) -> Result<Coordinator, CoordinatorError> {
        let brain = self
            .brain
            .ok_or_else(|| CoordinatorError::Misconfigured("planning brain not set".to_string()))?;
        let threshold = self.config.policy.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(CoordinatorError::Misconfigured(format!(
                "policy.confidence_threshold must be within [0, 1], got {threshold}"
            )));
        }

        let registry = Arc::new(self.registry);
        let planner = Planner::new(brain, Arc::clone(&registry), self.config.planner.clone());
        let executor = Executor::new(
            registry,
            Arc::new(self.verifier),
            self.checks.clone(),
            &self.config.executor,
            &self.config.retrospect,
        );
        let (retrospects, verdicts) = RetrospectEngine::new(self.checks, &self.config.retrospect);
        let mut policy = PolicyEngine::new(self.config.policy.clone());
        if let Some(scorer) = self.scorer {
            policy = policy.with_scorer(scorer);
        }

        Coordinator::from_components(
            Components {
                brief: self.brief,
                planner,
                executor,
                retrospects,
                verdicts,
                policy,
                operator: self.operator,
            },
            self.snapshot,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::EchoCapability;
    use crate::core::CoordinatorPhase;
    use crate::llm::MockLlmClient;

    #[test]
    fn test_build_requires_brain() {
        let err = CoordinatorBuilder::new(TaskBrief::new("x"), AppConfig::default())
            .with_capability(EchoCapability)
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, CoordinatorError::Misconfigured(_)));
    }

    #[test]
    fn test_build_rejects_bad_threshold() {
        let mut config = AppConfig::default();
        config.policy.confidence_threshold = 1.5;
        let result = CoordinatorBuilder::new(TaskBrief::new("x"), config)
            .with_candidates(Vec::new())
            .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_mock_llm_plan_runs_to_completion() {
        let coordinator = CoordinatorBuilder::new(TaskBrief::new("say hello").with_id("hello"), AppConfig::default())
            .with_capability(EchoCapability)
            .with_llm(Arc::new(MockLlmClient::new()));
        let mut coordinator = coordinator.build().unwrap();
        assert_eq!(coordinator.phase(), CoordinatorPhase::Planning);
        let outcome = coordinator.run().await.unwrap();
        assert!(outcome.is_completed());
        let respond = &outcome.outputs["respond"];
        assert!(respond["text"].as_str().unwrap().contains("say hello"));
    }
}
