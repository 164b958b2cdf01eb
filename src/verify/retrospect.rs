//! RetrospectEngine：异步回溯校验
//!
//! 校验在独立的有界工作池中运行（与步骤执行的并发上限分开），结果通过 mpsc 通道
//! 投递给 Coordinator。Coordinator 是唯一的消费者，也是唯一修改 ExecutionState 的一方。
//!
//! 校验失败时 `assess` 基于当前版本的血缘计算下游闭包，生成 InvalidationRecord：
//! 兄弟分支不受影响，它们的检查点继续有效。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, Semaphore};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capability::CapabilityRegistry;
use crate::config::RetrospectSection;
use crate::core::{ExecutionState, Observation, PendingRetrospect, Severity, StepStatus};
use crate::plan::{LineageTracker, PatchOp, Plan, PlanVersion, RetrospectSpec, StepId};

/// 单个回溯检查；返回 Err(原因) 表示不通过
#[async_trait]
pub trait RetrospectCheck: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self, observation: &Observation) -> Result<(), String>;
}

/// 检查注册表（在 Executor 与 RetrospectEngine 之间共享）
#[derive(Clone, Default)]
pub struct CheckRegistry {
    checks: HashMap<String, Arc<dyn RetrospectCheck>>,
}

impl CheckRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, check: impl RetrospectCheck + 'static) {
        self.checks.insert(check.name().to_string(), Arc::new(check));
    }

    pub fn register_arc(&mut self, check: Arc<dyn RetrospectCheck>) {
        self.checks.insert(check.name().to_string(), check);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn RetrospectCheck>> {
        self.checks.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.checks.keys().cloned().collect();
        names.sort();
        names
    }

    /// 按声明顺序执行全部检查；未注册的检查视为失败
    pub async fn run(&self, spec: &RetrospectSpec, observation: &Observation, limit: Duration) -> Result<(), String> {
        for name in &spec.checks {
            let Some(check) = self.get(name) else {
                return Err(format!("unknown check '{name}'"));
            };
            match timeout(limit, check.check(observation)).await {
                Ok(Ok(())) => {}
                Ok(Err(reason)) => return Err(format!("{name}: {reason}")),
                Err(_) => return Err(format!("{name}: timed out after {}ms", limit.as_millis())),
            }
        }
        Ok(())
    }
}

/// 一次回溯校验的结论
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrospectVerdict {
    pub step_id: StepId,
    pub retrospect_id: String,
    pub plan_version: PlanVersion,
    pub revision: u32,
    pub passed: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

impl RetrospectVerdict {
    /// 对应的未决记录键
    pub fn key(&self) -> PendingRetrospect {
        PendingRetrospect {
            step_id: self.step_id.clone(),
            retrospect_id: self.retrospect_id.clone(),
            plan_version: self.plan_version,
            revision: self.revision,
        }
    }
}

/// 回溯失败产生的失效记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidationRecord {
    pub failed_step: StepId,
    pub retrospect_id: String,
    /// 被校验输出所在的计划版本
    pub observed_version: PlanVersion,
    pub reason: String,
    pub severity: Severity,
    /// false 表示不重放，直接升级
    pub replay: bool,
    /// 当前版本内的下游闭包（含失败步骤，拓扑序）
    pub affected: Vec<StepId>,
    /// 需要补偿的已完成步骤（逆拓扑序，最近的副作用先补偿）
    pub compensations: Vec<StepId>,
    /// 重放前应用的补丁
    #[serde(default)]
    pub patch: Vec<PatchOp>,
}

pub struct RetrospectEngine {
    checks: CheckRegistry,
    semaphore: Arc<Semaphore>,
    check_timeout: Duration,
    tx: mpsc::UnboundedSender<RetrospectVerdict>,
    cancel: CancellationToken,
}

impl RetrospectEngine {
    pub fn new(
        checks: CheckRegistry,
        config: &RetrospectSection,
    ) -> (Self, mpsc::UnboundedReceiver<RetrospectVerdict>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = Self {
            checks,
            semaphore: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            check_timeout: Duration::from_millis(config.check_timeout_ms),
            tx,
            cancel: CancellationToken::new(),
        };
        (engine, rx)
    }

    pub fn checks(&self) -> &CheckRegistry {
        &self.checks
    }

    /// 非阻塞地调度一次回溯校验
    pub fn schedule(&self, spec: &RetrospectSpec, observation: Observation) {
        let checks = self.checks.clone();
        let semaphore = Arc::clone(&self.semaphore);
        let limit = self.check_timeout;
        let tx = self.tx.clone();
        let cancel = self.cancel.clone();
        let spec = spec.clone();
        debug!(
            step = %observation.step_id,
            retrospect = %spec.id,
            version = observation.plan_version,
            "Retrospect scheduled"
        );
        tokio::spawn(async move {
            let permit = tokio::select! {
                permit = semaphore.acquire_owned() => permit,
                _ = cancel.cancelled() => return,
            };
            let Ok(_permit) = permit else {
                return;
            };
            let result = tokio::select! {
                result = checks.run(&spec, &observation, limit) => result,
                _ = cancel.cancelled() => return,
            };
            let verdict = RetrospectVerdict {
                step_id: observation.step_id.clone(),
                retrospect_id: spec.id.clone(),
                plan_version: observation.plan_version,
                revision: observation.revision,
                passed: result.is_ok(),
                reason: result.err(),
            };
            // 接收端关闭说明任务已结束，丢弃即可
            let _ = tx.send(verdict);
        });
    }

    /// 评估一个失败结论；结论已过期（步骤不再处于对应的完成状态）时返回 None
    pub fn assess(
        &self,
        verdict: &RetrospectVerdict,
        plan: &Plan,
        tracker: &LineageTracker,
        state: &ExecutionState,
        registry: &CapabilityRegistry,
    ) -> Option<InvalidationRecord> {
        if verdict.passed {
            return None;
        }
        let contract = plan.get(&verdict.step_id)?;
        if contract.revision != verdict.revision || tracker.generation(&verdict.step_id) != Some(verdict.revision) {
            debug!(step = %verdict.step_id, "Ignoring verdict for superseded revision");
            return None;
        }
        let spec = contract.retrospects.iter().find(|r| r.id == verdict.retrospect_id)?;

        let affected = tracker.downstream_closure(&verdict.step_id);
        let compensations: Vec<StepId> = affected
            .iter()
            .rev()
            .filter(|s| state.status(s) == Some(StepStatus::Done))
            .filter(|s| {
                plan.get(s)
                    .and_then(|c| registry.resolve(&c.capability).ok())
                    .map(|spec| spec.compensable)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();

        let patch = match &spec.on_fail.patch_params {
            Some(params) => vec![PatchOp::ReplaceParams {
                step: verdict.step_id.clone(),
                params: params.clone(),
            }],
            None => Vec::new(),
        };

        let reason = verdict
            .reason
            .clone()
            .unwrap_or_else(|| "retrospect failed".to_string());
        info!(
            step = %verdict.step_id,
            retrospect = %verdict.retrospect_id,
            affected = ?affected,
            reason = %reason,
            "Retrospect failed"
        );
        Some(InvalidationRecord {
            failed_step: verdict.step_id.clone(),
            retrospect_id: verdict.retrospect_id.clone(),
            observed_version: verdict.plan_version,
            reason,
            severity: spec.on_fail.severity,
            replay: spec.on_fail.replay,
            affected,
            compensations,
            patch,
        })
    }

    /// 停止尚未完成的校验
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for RetrospectEngine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// 由闭包构造的检查（测试与简单场景）
pub struct FnCheck<F> {
    name: String,
    f: F,
}

impl<F> FnCheck<F>
where
    F: Fn(&Observation) -> Result<(), String> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

#[async_trait]
impl<F> RetrospectCheck for FnCheck<F>
where
    F: Fn(&Observation) -> Result<(), String> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self, observation: &Observation) -> Result<(), String> {
        (self.f)(observation)
    }
}

/// 生成补丁参数的便捷函数
pub fn patch_params(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::EchoCapability;
    use crate::core::observation::test_observation;
    use crate::plan::{ActionContract, Constraints, OnFail};
    use serde_json::json;

    fn diamond() -> Plan {
        let on_fail = OnFail {
            patch_params: Some(patch_params(&[("strict", json!(true))])),
            ..Default::default()
        };
        Plan::new(
            "t",
            1,
            vec![
                ActionContract::new("a", "echo")
                    .retrospect(RetrospectSpec::new("verify_a", vec!["always_fail".into()]).on_fail(on_fail)),
                ActionContract::new("b", "echo"),
                ActionContract::new("c", "echo").depends_on("a").depends_on("b"),
            ],
        )
        .unwrap()
    }

    fn checks() -> CheckRegistry {
        let mut checks = CheckRegistry::new();
        checks.register(FnCheck::new("always_fail", |_: &Observation| Err("bad data".to_string())));
        checks.register(FnCheck::new("always_pass", |_: &Observation| Ok(())));
        checks
    }

    #[tokio::test]
    async fn test_schedule_posts_verdict() {
        let (engine, mut rx) = RetrospectEngine::new(checks(), &RetrospectSection::default());
        let spec = RetrospectSpec::new("r", vec!["always_pass".into(), "always_fail".into()]);
        engine.schedule(&spec, test_observation("a", 1, 1));
        let verdict = rx.recv().await.unwrap();
        assert!(!verdict.passed);
        assert_eq!(verdict.reason.as_deref(), Some("always_fail: bad data"));
        assert_eq!(verdict.key().retrospect_id, "r");
    }

    #[tokio::test]
    async fn test_unknown_check_fails() {
        let spec = RetrospectSpec::new("r", vec!["nope".into()]);
        let result = checks()
            .run(&spec, &test_observation("a", 1, 1), Duration::from_millis(100))
            .await;
        assert!(result.unwrap_err().contains("unknown check"));
    }

    #[test]
    fn test_assess_selects_downstream_closure_only() {
        let plan = diamond();
        let tracker = LineageTracker::from_plan(&plan).unwrap();
        let mut state = ExecutionState::new("t", Constraints::default());
        state.apply_plan(&plan, &[]).unwrap();
        for s in ["a", "b", "c"] {
            state.set_status(s, StepStatus::Done);
        }
        let mut registry = CapabilityRegistry::new();
        registry.register(EchoCapability);
        let (engine, _rx) = RetrospectEngine::new(checks(), &RetrospectSection::default());
        let verdict = RetrospectVerdict {
            step_id: "a".into(),
            retrospect_id: "verify_a".into(),
            plan_version: 1,
            revision: 0,
            passed: false,
            reason: Some("bad data".into()),
        };
        let record = engine.assess(&verdict, &plan, &tracker, &state, &registry).unwrap();
        assert_eq!(record.affected, vec!["a", "c"]);
        assert!(record.compensations.is_empty());
        assert_eq!(record.severity, Severity::S1);
        assert!(matches!(&record.patch[0], PatchOp::ReplaceParams { step, .. } if step == "a"));

        let stale = RetrospectVerdict { revision: 3, ..verdict };
        assert!(engine.assess(&stale, &plan, &tracker, &state, &registry).is_none());
    }
}
