//! Executor：有界并发地执行就绪步骤
//!
//! 每次派发在 JoinSet 中作为独立任务运行：退避等待 → 获取并发许可 → 在超时内调用能力 →
//! 执行同步 gate 与同步回溯检查 → 产出 Observation。任何失败都落成 Failure 观测，
//! 由 Coordinator 交给 PolicyEngine；Executor 从不自行重试。

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio::task::{Id, JoinSet};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::capability::{CapabilityRegistry, InvocationRequest};
use crate::config::{ExecutorSection, RetrospectSection};
use crate::core::{
    CapabilityError, CheckpointStore, ExecutionState, FailureInfo, FailureKind, Observation,
    ObservationStatus,
};
use crate::plan::{ActionContract, LineageTracker, PlanVersion, StepId, TaskBrief};
use crate::verify::{CheckRegistry, Verifier};

/// 一次派发
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub contract: Arc<ActionContract>,
    pub plan_version: PlanVersion,
    pub attempt: u32,
    pub inputs: Map<String, Value>,
    /// 派发前的退避等待
    pub delay: Duration,
    pub cancel: CancellationToken,
}

/// 派发结果
#[derive(Debug, Clone)]
pub struct StepReport {
    pub observation: Observation,
    pub idempotent: bool,
    pub compensable: bool,
}

/// 需要补偿的一次已完成调用
#[derive(Debug, Clone)]
pub struct Compensation {
    pub step_id: StepId,
    pub capability: String,
    pub input: Value,
    pub output: Value,
}

#[derive(Clone)]
pub struct Executor {
    registry: Arc<CapabilityRegistry>,
    verifier: Arc<Verifier>,
    checks: CheckRegistry,
    semaphore: Arc<Semaphore>,
    config: ExecutorSection,
    check_timeout: Duration,
}

impl Executor {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        verifier: Arc<Verifier>,
        checks: CheckRegistry,
        config: &ExecutorSection,
        retrospect: &RetrospectSection,
    ) -> Self {
        Self {
            registry,
            verifier,
            checks,
            semaphore: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            config: config.clone(),
            check_timeout: Duration::from_millis(retrospect.check_timeout_ms),
        }
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn verifier(&self) -> &Arc<Verifier> {
        &self.verifier
    }

    /// 拓扑前沿：依赖全部 Done 的 Ready 步骤
    pub fn ready_set(&self, state: &ExecutionState, tracker: &LineageTracker) -> Vec<StepId> {
        state.ready_steps(tracker)
    }

    /// 第 n 次重试前的等待；限流时优先使用能力建议的时间
    pub fn backoff(&self, retry: u32, retry_after_ms: Option<u64>) -> Duration {
        if let Some(ms) = retry_after_ms {
            return Duration::from_millis(ms);
        }
        if self.config.retry_backoff_ms == 0 || retry == 0 {
            return Duration::ZERO;
        }
        let factor = 1u64 << (retry - 1).min(16);
        Duration::from_millis(self.config.retry_backoff_ms.saturating_mul(factor))
    }

    /// 解析声明输入：优先取依赖检查点输出中的同名字段，其次取 brief 输入
    pub fn resolve_inputs(
        &self,
        contract: &ActionContract,
        brief: &TaskBrief,
        checkpoints: &CheckpointStore,
    ) -> Map<String, Value> {
        let mut inputs = Map::new();
        for name in contract.inputs.keys() {
            let from_dep = contract
                .depends_on
                .iter()
                .filter_map(|d| checkpoints.get(d))
                .find_map(|cp| cp.output.get(name).cloned());
            if let Some(value) = from_dep.or_else(|| brief.inputs.get(name).cloned()) {
                inputs.insert(name.clone(), value);
            }
        }
        inputs
    }

    /// 在 JoinSet 中启动一次派发
    ///
    /// 返回任务 id，任务被中止时调用方据此找回步骤。
    pub fn spawn(&self, set: &mut JoinSet<StepReport>, dispatch: Dispatch) -> Id {
        let this = self.clone();
        set.spawn(async move {
            let step_id = dispatch.contract.id.clone();
            let plan_version = dispatch.plan_version;
            let attempt = dispatch.attempt;
            let revision = dispatch.contract.revision;
            match AssertUnwindSafe(this.execute(dispatch)).catch_unwind().await {
                Ok(report) => report,
                Err(_) => {
                    warn!(step = %step_id, "Capability panicked");
                    Self::lost_report(&step_id, plan_version, revision, attempt, "capability panicked")
                }
            }
        })
        .id()
    }

    /// 没有正常交回结果的派发（panic 或任务被中止），按永久失败记
    pub fn lost_report(
        step: &str,
        plan_version: PlanVersion,
        revision: u32,
        attempt: u32,
        reason: &str,
    ) -> StepReport {
        StepReport {
            observation: failure_observation(
                step,
                plan_version,
                revision,
                attempt,
                Value::Null,
                FailureKind::Permanent,
                reason,
                0,
            ),
            idempotent: false,
            compensable: false,
        }
    }

    /// 执行一次派发并产出报告
    pub async fn execute(&self, dispatch: Dispatch) -> StepReport {
        let Dispatch {
            contract,
            plan_version,
            attempt,
            inputs,
            delay,
            cancel,
        } = dispatch;
        let step = contract.id.as_str();
        let request = InvocationRequest {
            step_id: contract.id.clone(),
            params: contract.params.clone(),
            inputs,
            cancel: cancel.clone(),
        };
        let input = request.to_value();
        let fail = |kind: FailureKind, reason: &str, duration_ms: u64| StepReport {
            observation: failure_observation(
                step,
                plan_version,
                contract.revision,
                attempt,
                input.clone(),
                kind,
                reason,
                duration_ms,
            ),
            idempotent: false,
            compensable: false,
        };

        let Some(capability) = self.registry.get(&contract.capability) else {
            return fail(
                FailureKind::Structural,
                &format!("capability '{}' not registered", contract.capability),
                0,
            );
        };
        let spec = capability.spec();

        if !delay.is_zero() {
            debug!(step, delay_ms = delay.as_millis() as u64, "Backing off before dispatch");
            tokio::select! {
                _ = sleep(delay) => {}
                _ = cancel.cancelled() => return fail(FailureKind::Cancelled, "cancelled before dispatch", 0),
            }
        }

        let permit = tokio::select! {
            permit = Arc::clone(&self.semaphore).acquire_owned() => permit,
            _ = cancel.cancelled() => return fail(FailureKind::Cancelled, "cancelled before dispatch", 0),
        };
        let Ok(_permit) = permit else {
            return fail(FailureKind::Cancelled, "executor closed", 0);
        };

        let limit = Duration::from_millis(contract.timeout_ms.unwrap_or(self.config.default_step_timeout_ms));
        let start = Instant::now();
        // 取消是协作式的：能力通过 request.cancel 自行停止，这里不丢弃调用
        let result = timeout(limit, capability.invoke(request)).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let mut observation = match result {
            Ok(Ok(invocation)) => {
                let (status, failure) = if invocation.complete {
                    (ObservationStatus::Success, None)
                } else {
                    (
                        ObservationStatus::Partial,
                        Some(FailureInfo {
                            kind: FailureKind::Transient,
                            reason: "partial result".to_string(),
                            retry_after_ms: None,
                        }),
                    )
                };
                Observation {
                    step_id: contract.id.clone(),
                    plan_version,
                    revision: contract.revision,
                    attempt,
                    status,
                    input: input.clone(),
                    output: invocation.output,
                    failure,
                    timestamp: chrono::Utc::now().timestamp_millis(),
                    cost_usd: invocation.cost_usd,
                    tokens: invocation.tokens,
                    duration_ms,
                    raw: invocation.raw,
                }
            }
            Ok(Err(e)) => {
                let retry_after_ms = match &e {
                    CapabilityError::RateLimited { retry_after_ms } => *retry_after_ms,
                    _ => None,
                };
                let mut obs = failure_observation(
                    step,
                    plan_version,
                    contract.revision,
                    attempt,
                    input.clone(),
                    e.kind(),
                    &e.to_string(),
                    duration_ms,
                );
                if let Some(f) = obs.failure.as_mut() {
                    f.retry_after_ms = retry_after_ms;
                }
                obs
            }
            Err(_) => failure_observation(
                step,
                plan_version,
                contract.revision,
                attempt,
                input.clone(),
                FailureKind::Timeout,
                "timeout",
                duration_ms,
            ),
        };

        if observation.is_success() {
            if let Err(reason) = self.verifier.check_gates(&contract, &observation) {
                observation = observation.into_failure(FailureKind::GateRejected, reason);
            }
        }
        if observation.is_success() {
            for retro in contract.retrospects.iter().filter(|r| !r.is_async) {
                if let Err(reason) = self.checks.run(retro, &observation, self.check_timeout).await {
                    observation = observation
                        .into_failure(FailureKind::GateRejected, format!("retrospect '{}': {reason}", retro.id));
                    break;
                }
            }
        }

        let outcome = match observation.status {
            ObservationStatus::Success => "ok".to_string(),
            ObservationStatus::Partial => "partial".to_string(),
            ObservationStatus::Failure => observation
                .failure_kind()
                .map(|k| k.to_string())
                .unwrap_or_else(|| "error".to_string()),
        };
        let audit = serde_json::json!({
            "event": "step_audit",
            "step": step,
            "capability": contract.capability,
            "plan_version": plan_version,
            "attempt": attempt,
            "outcome": outcome,
            "duration_ms": duration_ms,
            "cost_usd": observation.cost_usd,
            "params_preview": params_preview(&contract.params),
        });
        tracing::info!(audit = %audit.to_string(), "step");

        StepReport {
            observation,
            idempotent: spec.idempotent,
            compensable: spec.compensable,
        }
    }

    /// 依次执行补偿（调用方负责给出逆依赖顺序），返回每一步的结果
    pub async fn compensate(&self, targets: &[Compensation]) -> BTreeMap<StepId, Result<(), String>> {
        let mut results = BTreeMap::new();
        for target in targets {
            let result = match self.registry.get(&target.capability) {
                Some(capability) => capability
                    .compensate(&target.input, &target.output)
                    .await
                    .map_err(|e| e.to_string()),
                None => Err(format!("capability '{}' not registered", target.capability)),
            };
            match &result {
                Ok(()) => debug!(step = %target.step_id, "Compensated"),
                Err(e) => warn!(step = %target.step_id, error = %e, "Compensation failed"),
            }
            results.insert(target.step_id.clone(), result);
        }
        results
    }
}

#[allow(clippy::too_many_arguments)]
fn failure_observation(
    step: &str,
    plan_version: PlanVersion,
    revision: u32,
    attempt: u32,
    input: Value,
    kind: FailureKind,
    reason: &str,
    duration_ms: u64,
) -> Observation {
    Observation {
        step_id: step.to_string(),
        plan_version,
        revision,
        attempt,
        status: ObservationStatus::Failure,
        input,
        output: Value::Null,
        failure: Some(FailureInfo {
            kind,
            reason: reason.to_string(),
            retry_after_ms: None,
        }),
        timestamp: chrono::Utc::now().timestamp_millis(),
        cost_usd: 0.0,
        tokens: 0,
        duration_ms,
        raw: None,
    }
}

fn params_preview(params: &Map<String, Value>) -> String {
    let s = Value::Object(params.clone()).to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
