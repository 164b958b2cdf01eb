//! Planner：brainstorm → capability verify → select，以及 replan / patch
//!
//! 所有返回的 Plan 都是新值；未变化的节点与旧计划共享同一个 `Arc<ActionContract>`，
//! 这样 LineageTracker 才能识别出可以复用的节点。

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::capability::{CapabilityRegistry, CapabilitySpec};
use crate::config::PlannerSection;
use crate::core::{PlanError, PlannerError};
use crate::plan::{topological_order, ActionContract, PatchOp, Plan, PlanVersion, StepId, TaskBrief};
use crate::planner::{parse_proposal, PlanCandidate, PlanningBrain, PlanningContext};

/// 通过能力校验的计划及其估算
#[derive(Debug, Clone)]
pub struct ValidatedPlan {
    pub plan: Plan,
    pub estimated_cost_usd: f64,
    pub estimated_latency_ms: u64,
}

impl ValidatedPlan {
    /// 比较顺序：成本、延迟、步数
    fn rank(&self, other: &Self) -> Ordering {
        self.estimated_cost_usd
            .partial_cmp(&other.estimated_cost_usd)
            .unwrap_or(Ordering::Equal)
            .then(self.estimated_latency_ms.cmp(&other.estimated_latency_ms))
            .then(self.plan.len().cmp(&other.plan.len()))
    }
}

pub struct Planner {
    brain: Arc<dyn PlanningBrain>,
    registry: Arc<CapabilityRegistry>,
    config: PlannerSection,
}

impl Planner {
    pub fn new(
        brain: Arc<dyn PlanningBrain>,
        registry: Arc<CapabilityRegistry>,
        config: PlannerSection,
    ) -> Self {
        Self {
            brain,
            registry,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    fn context(&self, brief: &TaskBrief, current: Option<&Plan>, hints: &[String]) -> PlanningContext {
        PlanningContext {
            capability_schema: self.registry.to_schema_json(),
            inputs: brief.inputs.clone(),
            required_outputs: brief.required_outputs.clone(),
            candidates: if self.config.single_path { 1 } else { self.config.candidates },
            current_plan: current.and_then(|p| {
                let steps: Vec<&ActionContract> = p.contracts().map(|c| c.as_ref()).collect();
                serde_json::to_string(&steps).ok()
            }),
            hints: hints.to_vec(),
        }
    }

    /// 向 brain 请求候选分解
    pub async fn brainstorm(&self, brief: &TaskBrief) -> Result<Vec<PlanCandidate>, PlannerError> {
        self.brainstorm_with(brief, None, &[]).await
    }

    async fn brainstorm_with(
        &self,
        brief: &TaskBrief,
        current: Option<&Plan>,
        hints: &[String],
    ) -> Result<Vec<PlanCandidate>, PlannerError> {
        let context = self.context(brief, current, hints);
        let text = self
            .brain
            .propose(&brief.objective, &context)
            .await
            .map_err(PlannerError::Brain)?;
        let mut candidates = parse_proposal(&text)?;
        let limit = if self.config.single_path {
            1
        } else {
            self.config.candidates.max(1)
        };
        candidates.truncate(limit);
        debug!(task = %brief.id, candidates = candidates.len(), "Brainstorm finished");
        Ok(candidates)
    }

    /// 执行前的快速失败校验：能力存在、契约与能力声明一致、边类型匹配、无环
    pub fn verify_capabilities(
        &self,
        candidate: &PlanCandidate,
        brief: &TaskBrief,
        version: PlanVersion,
    ) -> Result<ValidatedPlan, PlannerError> {
        let steps = candidate.steps.iter().cloned().map(Arc::new).collect();
        self.validate(&candidate.label, steps, brief, version)
    }

    fn validate(
        &self,
        label: &str,
        steps: Vec<Arc<ActionContract>>,
        brief: &TaskBrief,
        version: PlanVersion,
    ) -> Result<ValidatedPlan, PlannerError> {
        // 能力缺失优先于结构错误报告
        let mut specs: HashMap<StepId, CapabilitySpec> = HashMap::with_capacity(steps.len());
        for c in &steps {
            let spec = self
                .registry
                .resolve(&c.capability)
                .map_err(|_| PlannerError::CapabilityGap {
                    step: c.id.clone(),
                    capability: c.capability.clone(),
                })?;
            specs.insert(c.id.clone(), spec);
        }

        let plan = Plan::from_shared(brief.id.clone(), version, steps)?.with_label(label);
        topological_order(&plan)?;

        for c in plan.contracts() {
            let spec = &specs[&c.id];
            check_against_spec(c, spec)?;
            check_edges(c, &plan, brief)?;
        }

        for (name, ty) in &brief.required_outputs {
            let producer = plan
                .contracts()
                .find_map(|c| c.outputs.get(name).map(|p| (c.id.clone(), *p)));
            match producer {
                Some((step, produced)) if !ty.accepts(produced) => {
                    return Err(PlannerError::SchemaMismatch {
                        step,
                        detail: format!("required output '{name}' expects {ty}, step produces {produced}"),
                    });
                }
                Some(_) => {}
                None => {
                    return Err(PlannerError::SchemaMismatch {
                        step: plan.step_ids().last().cloned().unwrap_or_default(),
                        detail: format!("required output '{name}' is not produced by any step"),
                    });
                }
            }
        }

        Ok(ValidatedPlan {
            estimated_cost_usd: plan.estimated_cost(),
            estimated_latency_ms: plan.estimated_latency_ms(),
            plan,
        })
    }

    /// 生成初始计划
    pub async fn plan(&self, brief: &TaskBrief, version: PlanVersion) -> Result<Plan, PlannerError> {
        let candidates = self.brainstorm(brief).await?;
        self.select(candidates, brief, version, None)
    }

    /// 基于当前计划重新规划；内容未变的节点保留原身份
    pub async fn replan(
        &self,
        brief: &TaskBrief,
        current: &Plan,
        hints: &[String],
    ) -> Result<Plan, PlannerError> {
        let candidates = self.brainstorm_with(brief, Some(current), hints).await?;
        self.select(candidates, brief, current.version + 1, Some(current))
    }

    fn select(
        &self,
        candidates: Vec<PlanCandidate>,
        brief: &TaskBrief,
        version: PlanVersion,
        base: Option<&Plan>,
    ) -> Result<Plan, PlannerError> {
        let mut passed: Vec<ValidatedPlan> = Vec::new();
        let mut errors: Vec<PlannerError> = Vec::new();
        for candidate in candidates {
            let steps = match base {
                Some(base) => reconcile(base, candidate.steps),
                None => candidate.steps.into_iter().map(Arc::new).collect(),
            };
            match self.validate(&candidate.label, steps, brief, version) {
                Ok(validated) => {
                    passed.push(validated);
                    if self.config.single_path {
                        break;
                    }
                }
                Err(e) => {
                    warn!(task = %brief.id, candidate = %candidate.label, error = %e, "Candidate rejected");
                    errors.push(e);
                }
            }
        }

        let best = passed.into_iter().min_by(|a, b| a.rank(b));
        match best {
            Some(validated) => {
                info!(
                    task = %brief.id,
                    version,
                    label = %validated.plan.label,
                    steps = validated.plan.len(),
                    estimated_cost = validated.estimated_cost_usd,
                    "Plan selected"
                );
                Ok(validated.plan)
            }
            None => {
                let gap = errors.iter().position(PlannerError::is_capability_gap);
                match gap {
                    Some(i) => Err(errors.swap_remove(i)),
                    None => Err(errors.into_iter().next().unwrap_or(PlannerError::NoCandidates)),
                }
            }
        }
    }

    /// 对计划应用补丁操作，生成 version + 1（空补丁同样递增版本）
    pub fn patch(&self, plan: &Plan, ops: &[PatchOp]) -> Result<Plan, PlannerError> {
        let mut replaced: HashMap<StepId, ActionContract> = HashMap::new();
        let mut added: Vec<ActionContract> = Vec::new();
        let mut removed: Vec<StepId> = Vec::new();

        for op in ops {
            match op {
                PatchOp::AddStep { contract } => {
                    let exists = (plan.contains(&contract.id) && !removed.contains(&contract.id))
                        || added.iter().any(|c| c.id == contract.id);
                    if exists {
                        return Err(PlanError::DuplicateStep(contract.id.clone()).into());
                    }
                    self.registry.resolve(&contract.capability).map_err(|_| {
                        PlannerError::CapabilityGap {
                            step: contract.id.clone(),
                            capability: contract.capability.clone(),
                        }
                    })?;
                    // 同一补丁内先删后加的同名步骤是新节点，不能沿用旧 revision
                    let mut contract = contract.clone();
                    contract.revision = next_revision(plan, &contract.id);
                    added.push(contract);
                }
                PatchOp::ReplaceParams { step, params } => {
                    if let Some(c) = added.iter_mut().find(|c| &c.id == step) {
                        for (k, v) in params {
                            c.params.insert(k.clone(), v.clone());
                        }
                        continue;
                    }
                    let mut next = working(plan, &replaced, &removed, step)?;
                    for (k, v) in params {
                        next.params.insert(k.clone(), v.clone());
                    }
                    next.revision = next_revision(plan, step);
                    replaced.insert(step.clone(), next);
                }
                PatchOp::RerouteEdge { step, from, to } => {
                    let target_exists = (plan.contains(to) && !removed.contains(to))
                        || added.iter().any(|c| &c.id == to);
                    if !target_exists {
                        return Err(PlanError::UnknownStep(to.clone()).into());
                    }
                    if let Some(c) = added.iter_mut().find(|c| &c.id == step) {
                        reroute(c, step, from, to)?;
                        continue;
                    }
                    let mut next = working(plan, &replaced, &removed, step)?;
                    reroute(&mut next, step, from, to)?;
                    next.revision = next_revision(plan, step);
                    replaced.insert(step.clone(), next);
                }
                PatchOp::RemoveStep { step } => {
                    if let Some(i) = added.iter().position(|c| &c.id == step) {
                        added.remove(i);
                    } else {
                        working(plan, &replaced, &removed, step)?;
                        removed.push(step.clone());
                        replaced.remove(step);
                    }
                    let dependents: Vec<StepId> = plan
                        .contracts()
                        .filter(|c| !removed.contains(&c.id))
                        .map(|c| replaced.get(&c.id).unwrap_or(c.as_ref()))
                        .chain(added.iter())
                        .filter(|c| c.depends_on.contains(step))
                        .map(|c| c.id.clone())
                        .collect();
                    if !dependents.is_empty() {
                        return Err(PlanError::HasDependents {
                            step: step.clone(),
                            dependents,
                        }
                        .into());
                    }
                }
            }
        }

        let next = plan.derive(
            plan.version + 1,
            replaced.into_values().map(Arc::new).collect(),
            added.into_iter().map(Arc::new).collect(),
            &removed,
        )?;
        topological_order(&next)?;
        info!(task = %plan.task_id, version = next.version, ops = ops.len(), "Plan patched");
        Ok(next)
    }
}

/// 补丁后的 revision：同一补丁内多次修改只递增一次
fn next_revision(plan: &Plan, step: &str) -> u32 {
    plan.get(step).map(|c| c.revision + 1).unwrap_or(0)
}

/// 补丁过程中某步骤的当前工作副本
fn working(
    plan: &Plan,
    replaced: &HashMap<StepId, ActionContract>,
    removed: &[StepId],
    step: &str,
) -> Result<ActionContract, PlannerError> {
    if removed.iter().any(|r| r == step) {
        return Err(PlanError::UnknownStep(step.to_string()).into());
    }
    if let Some(c) = replaced.get(step) {
        return Ok(c.clone());
    }
    plan.get(step)
        .map(|c| c.as_ref().clone())
        .ok_or_else(|| PlanError::UnknownStep(step.to_string()).into())
}

fn reroute(contract: &mut ActionContract, step: &str, from: &str, to: &str) -> Result<(), PlannerError> {
    let Some(i) = contract.depends_on.iter().position(|d| d == from) else {
        return Err(PlanError::UnknownDependency {
            step: step.to_string(),
            dependency: from.to_string(),
        }
        .into());
    };
    if contract.depends_on.iter().any(|d| d == to) {
        contract.depends_on.remove(i);
    } else {
        contract.depends_on[i] = to.to_string();
    }
    Ok(())
}

/// 把新提案与当前计划对齐：内容相同则复用原节点，否则 revision + 1
fn reconcile(base: &Plan, steps: Vec<ActionContract>) -> Vec<Arc<ActionContract>> {
    steps
        .into_iter()
        .map(|mut step| match base.get(&step.id) {
            Some(existing) if existing.same_content(&step) => Arc::clone(existing),
            Some(existing) => {
                step.revision = existing.revision + 1;
                Arc::new(step)
            }
            None => Arc::new(step),
        })
        .collect()
}

fn check_against_spec(c: &ActionContract, spec: &CapabilitySpec) -> Result<(), PlannerError> {
    if !spec.inputs.is_empty() {
        for (name, ty) in &c.inputs {
            match spec.inputs.get(name) {
                None => {
                    return Err(PlannerError::SchemaMismatch {
                        step: c.id.clone(),
                        detail: format!("capability '{}' does not accept input '{name}'", spec.name),
                    })
                }
                Some(accepted) if !accepted.accepts(*ty) => {
                    return Err(PlannerError::SchemaMismatch {
                        step: c.id.clone(),
                        detail: format!("capability '{}' expects input '{name}' as {accepted}, got {ty}", spec.name),
                    })
                }
                Some(_) => {}
            }
        }
    }
    if !spec.outputs.is_empty() {
        for (name, ty) in &c.outputs {
            match spec.outputs.get(name) {
                None => {
                    return Err(PlannerError::SchemaMismatch {
                        step: c.id.clone(),
                        detail: format!("capability '{}' does not produce output '{name}'", spec.name),
                    })
                }
                Some(produced) if !ty.accepts(*produced) => {
                    return Err(PlannerError::SchemaMismatch {
                        step: c.id.clone(),
                        detail: format!("output '{name}' declared as {ty}, capability '{}' produces {produced}", spec.name),
                    })
                }
                Some(_) => {}
            }
        }
    }
    Ok(())
}

/// 每个声明输入必须由依赖产出、由 brief 提供或在参数中给出，且类型匹配
fn check_edges(c: &ActionContract, plan: &Plan, brief: &TaskBrief) -> Result<(), PlannerError> {
    for (name, ty) in &c.inputs {
        let producers: Vec<(&str, crate::plan::ValueType)> = c
            .depends_on
            .iter()
            .filter_map(|d| plan.get(d))
            .filter_map(|p| p.outputs.get(name).map(|t| (p.id.as_str(), *t)))
            .collect();
        if !producers.is_empty() {
            if let Some((dep, produced)) = producers.iter().find(|(_, p)| !ty.accepts(*p)) {
                return Err(PlannerError::SchemaMismatch {
                    step: c.id.clone(),
                    detail: format!("input '{name}' expects {ty} but '{dep}' produces {produced}"),
                });
            }
        } else if let Some(value) = brief.inputs.get(name) {
            if !ty.matches_value(value) {
                return Err(PlannerError::SchemaMismatch {
                    step: c.id.clone(),
                    detail: format!("task input '{name}' does not match {ty}"),
                });
            }
        } else if !c.params.contains_key(name) {
            return Err(PlannerError::SchemaMismatch {
                step: c.id.clone(),
                detail: format!("input '{name}' is not produced by any dependency or provided by the task"),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{Capability, EchoCapability, Invocation, InvocationRequest};
    use crate::core::CapabilityError;
    use crate::plan::{LineageTracker, ValueType};
    use crate::planner::FixedPlanBrain;
    use async_trait::async_trait;
    use serde_json::{json, Map};

    struct Summarise;

    #[async_trait]
    impl Capability for Summarise {
        fn name(&self) -> &str {
            "summarise"
        }

        fn spec(&self) -> CapabilitySpec {
            CapabilitySpec::new("summarise")
                .input("text", ValueType::String)
                .output("summary", ValueType::String)
        }

        async fn invoke(&self, _request: InvocationRequest) -> Result<Invocation, CapabilityError> {
            Ok(Invocation::new(json!({"summary": "ok"})))
        }
    }

    fn registry() -> Arc<CapabilityRegistry> {
        let mut registry = CapabilityRegistry::new();
        registry.register(EchoCapability);
        registry.register(Summarise);
        Arc::new(registry)
    }

    fn planner(brain: FixedPlanBrain) -> Planner {
        Planner::new(Arc::new(brain), registry(), PlannerSection::default())
    }

    fn brief() -> TaskBrief {
        TaskBrief::new("summarise a document").with_id("t1")
    }

    #[tokio::test]
    async fn test_capability_gap_reported_first() {
        let p = planner(FixedPlanBrain::from_candidates(vec![PlanCandidate::new(
            "bad",
            vec![
                ActionContract::new("fetch", "nonexistent_tool"),
                ActionContract::new("b", "echo").depends_on("zz"),
            ],
        )]));
        let err = p.plan(&brief(), 1).await.unwrap_err();
        assert_eq!(
            err,
            PlannerError::CapabilityGap {
                step: "fetch".into(),
                capability: "nonexistent_tool".into()
            }
        );
    }

    #[tokio::test]
    async fn test_tie_break_cost_latency_steps() {
        let cheap_slow = PlanCandidate::new("cheap_slow", vec![ActionContract::new("a", "echo").estimate(0.1, 900)]);
        let cheap_fast = PlanCandidate::new(
            "cheap_fast",
            vec![
                ActionContract::new("a", "echo").estimate(0.05, 100),
                ActionContract::new("b", "echo").estimate(0.05, 100),
            ],
        );
        let pricey = PlanCandidate::new("pricey", vec![ActionContract::new("a", "echo").estimate(1.0, 10)]);
        let p = planner(FixedPlanBrain::from_candidates(vec![pricey, cheap_slow, cheap_fast]));
        let plan = p.plan(&brief(), 1).await.unwrap();
        // 成本相同（0.1）时比较关键路径延迟：cheap_fast 为 100
        assert_eq!(plan.label, "cheap_fast");
        assert_eq!(plan.version, 1);
    }

    #[test]
    fn test_edge_type_mismatch_rejected() {
        let p = planner(FixedPlanBrain::from_candidates(vec![]));
        let candidate = PlanCandidate::new(
            "typed",
            vec![
                ActionContract::new("count", "echo").output("text", ValueType::Integer),
                ActionContract::new("sum", "summarise")
                    .input("text", ValueType::String)
                    .depends_on("count"),
            ],
        );
        let err = p.verify_capabilities(&candidate, &brief(), 1).unwrap_err();
        assert!(matches!(err, PlannerError::SchemaMismatch { ref step, .. } if step == "sum"));
    }

    #[test]
    fn test_unbound_input_and_required_output() {
        let p = planner(FixedPlanBrain::from_candidates(vec![]));
        let unbound = PlanCandidate::new("x", vec![ActionContract::new("sum", "summarise").input("text", ValueType::String)]);
        assert!(p.verify_capabilities(&unbound, &brief(), 1).is_err());

        let bound = brief().with_input("text", json!("hello")).require_output("summary", ValueType::String);
        let candidate = PlanCandidate::new(
            "ok",
            vec![ActionContract::new("sum", "summarise")
                .input("text", ValueType::String)
                .output("summary", ValueType::String)],
        );
        assert!(p.verify_capabilities(&candidate, &bound, 1).is_ok());

        let missing = brief().require_output("report", ValueType::Object);
        let err = p.verify_capabilities(&candidate, &missing.with_input("text", json!("x")), 1).unwrap_err();
        assert!(err.to_string().contains("report"));
    }

    #[test]
    fn test_cycle_rejected() {
        let p = planner(FixedPlanBrain::from_candidates(vec![]));
        let candidate = PlanCandidate::new(
            "loop",
            vec![
                ActionContract::new("a", "echo").depends_on("b"),
                ActionContract::new("b", "echo").depends_on("a"),
            ],
        );
        assert!(matches!(
            p.verify_capabilities(&candidate, &brief(), 1),
            Err(PlannerError::Plan(PlanError::CyclicDependency(_)))
        ));
    }

    #[tokio::test]
    async fn test_replan_preserves_unchanged_identity() {
        let v1 = vec![
            ActionContract::new("a", "echo").param("q", json!(1)),
            ActionContract::new("b", "echo").depends_on("a"),
        ];
        let mut v2 = v1.clone();
        v2[0] = ActionContract::new("a", "echo").param("q", json!(2));
        let p = planner(FixedPlanBrain::from_rounds(vec![
            vec![PlanCandidate::new("v1", v1)],
            vec![PlanCandidate::new("v2", v2)],
        ]));
        let first = p.plan(&brief(), 1).await.unwrap();
        let second = p.replan(&brief(), &first, &["a was wrong".into()]).await.unwrap();
        assert_eq!(second.version, 2);
        assert_eq!(second.get("a").unwrap().revision, 1);
        assert!(Arc::ptr_eq(first.get("b").unwrap(), second.get("b").unwrap()));
    }

    #[test]
    fn test_patch_ops() {
        let p = planner(FixedPlanBrain::from_candidates(vec![]));
        let plan = Plan::new(
            "t1",
            1,
            vec![
                ActionContract::new("a", "echo"),
                ActionContract::new("b", "echo"),
                ActionContract::new("c", "echo").depends_on("a"),
            ],
        )
        .unwrap();

        let mut params = Map::new();
        params.insert("strict".into(), json!(true));
        let next = p
            .patch(
                &plan,
                &[
                    PatchOp::ReplaceParams { step: "a".into(), params: params.clone() },
                    PatchOp::ReplaceParams { step: "a".into(), params },
                    PatchOp::RerouteEdge { step: "c".into(), from: "a".into(), to: "b".into() },
                    PatchOp::AddStep { contract: ActionContract::new("d", "echo").depends_on("c") },
                ],
            )
            .unwrap();
        assert_eq!(next.version, 2);
        assert_eq!(next.get("a").unwrap().revision, 1);
        assert_eq!(next.get("a").unwrap().params["strict"], json!(true));
        assert_eq!(next.get("c").unwrap().depends_on, vec!["b"]);
        assert!(next.contains("d"));
        assert!(Arc::ptr_eq(plan.get("b").unwrap(), next.get("b").unwrap()));

        let empty = p.patch(&next, &[]).unwrap();
        assert_eq!(empty.version, 3);

        let err = p.patch(&next, &[PatchOp::RemoveStep { step: "c".into() }]).unwrap_err();
        assert!(matches!(err, PlannerError::Plan(PlanError::HasDependents { .. })));
        let removed = p.patch(&next, &[PatchOp::RemoveStep { step: "d".into() }]).unwrap();
        assert!(!removed.contains("d"));
    }

    #[test]
    fn test_patch_readd_same_id_is_new_node() {
        let p = planner(FixedPlanBrain::from_candidates(vec![]));
        let plan = Plan::new(
            "t1",
            1,
            vec![
                ActionContract::new("a", "echo"),
                ActionContract::new("d", "echo").depends_on("a"),
            ],
        )
        .unwrap();
        let mut tracker = LineageTracker::from_plan(&plan).unwrap();
        tracker.mark_valid("a", 1);
        tracker.mark_valid("d", 1);

        let next = p
            .patch(
                &plan,
                &[
                    PatchOp::RemoveStep { step: "d".into() },
                    PatchOp::AddStep { contract: ActionContract::new("d", "summarise").depends_on("a") },
                ],
            )
            .unwrap();
        assert_eq!(next.get("d").unwrap().capability, "summarise");
        assert_eq!(next.get("d").unwrap().revision, 1);

        let stale = tracker.rebase(&next).unwrap();
        assert_eq!(stale, vec!["d"]);
        assert!(!tracker.is_valid("d"));
        assert!(tracker.is_valid("a"));
    }

    #[test]
    fn test_patch_add_unknown_capability_is_gap() {
        let p = planner(FixedPlanBrain::from_candidates(vec![]));
        let plan = Plan::new("t1", 1, vec![ActionContract::new("a", "echo")]).unwrap();
        let err = p
            .patch(&plan, &[PatchOp::AddStep { contract: ActionContract::new("x", "nonexistent_tool") }])
            .unwrap_err();
        assert!(err.is_capability_gap());
    }
}
