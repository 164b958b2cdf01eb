//! Coordinator：任务状态机
//!
//! 状态：Planning → Executing → (Verifying ⇄ Executing) → Completed | Escalated | Failed。
//! 回溯校验不阻塞完成：仍有未决结论时 Completed 是临时的，`settle` 等待它们，
//! 迟到的失败结论会让任务重新进入 Executing。
//!
//! Coordinator 是 ExecutionState、LineageTracker 与 CheckpointStore 的唯一写入方。
//! 步骤执行结果（JoinSet）与异步回溯结论（mpsc）都回到这一个循环里串行处理，
//! 所有失败都交给 PolicyEngine 转换为 Continue / Retry / Replan / Escalate。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::{Id, JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coordinator::{
    EscalationRequest, OperatorChannel, OperatorDecision, TaskOutcome, TaskSnapshot, METRIC_NAMES,
};
use crate::core::{
    Checkpoint, CheckpointStore, CoordinatorError, CoordinatorPhase, ExecutionState, Observation,
    ObservationLog, PendingRetrospect, Severity, StepStatus,
};
use crate::executor::{Compensation, Dispatch, Executor, StepReport};
use crate::plan::{LineageTracker, Plan, PlanVersion, RetrospectSpec, StepId, TaskBrief};
use crate::planner::Planner;
use crate::policy::{Decision, PolicyEngine, PolicyInput};
use crate::verify::{InvalidationRecord, RetrospectEngine, RetrospectVerdict};

/// 在途派发
#[derive(Debug)]
struct InFlight {
    token: CancellationToken,
    plan_version: PlanVersion,
    attempt: u32,
    estimated_cost: f64,
}

/// 主循环等待到的事件
enum Event {
    Report(Result<(Id, StepReport), JoinError>),
    Verdict(RetrospectVerdict),
    Idle,
}

/// 由 CoordinatorBuilder 组装的组件
pub(crate) struct Components {
    pub brief: TaskBrief,
    pub planner: Planner,
    pub executor: Executor,
    pub retrospects: RetrospectEngine,
    pub verdicts: mpsc::UnboundedReceiver<RetrospectVerdict>,
    pub policy: PolicyEngine,
    pub operator: Option<Arc<dyn OperatorChannel>>,
}

pub struct Coordinator {
    brief: TaskBrief,
    planner: Planner,
    executor: Executor,
    retrospects: RetrospectEngine,
    verdicts: mpsc::UnboundedReceiver<RetrospectVerdict>,
    policy: PolicyEngine,
    operator: Option<Arc<dyn OperatorChannel>>,

    plan: Option<Plan>,
    tracker: LineageTracker,
    state: ExecutionState,
    checkpoints: CheckpointStore,
    log: ObservationLog,

    in_flight: JoinSet<StepReport>,
    running: HashMap<StepId, InFlight>,
    /// JoinSet 任务 id → (步骤, 版本, 尝试)，任务被中止时据此找回步骤
    tasks: HashMap<Id, (StepId, PlanVersion, u32)>,
    retry_delays: HashMap<StepId, Duration>,
    hints: Vec<String>,
    escalation: Option<EscalationRequest>,
    abort_reason: Option<String>,
    invalidations: Vec<InvalidationRecord>,
    /// 恢复后待重新调度的回溯校验
    rescheduled: Vec<(RetrospectSpec, Observation)>,

    clock: Option<Instant>,
    elapsed_base_ms: u64,
    cancel: CancellationToken,
    phase_tx: watch::Sender<CoordinatorPhase>,
}

impl Coordinator {
    pub(crate) fn from_components(
        components: Components,
        snapshot: Option<TaskSnapshot>,
    ) -> Result<Self, CoordinatorError> {
        let Components {
            brief,
            planner,
            executor,
            retrospects,
            verdicts,
            policy,
            operator,
        } = components;
        let state = ExecutionState::new(brief.id.clone(), brief.constraints.clone());
        let (phase_tx, _) = watch::channel(state.phase);
        let mut coordinator = Self {
            brief,
            planner,
            executor,
            retrospects,
            verdicts,
            policy,
            operator,
            plan: None,
            tracker: LineageTracker::new(),
            state,
            checkpoints: CheckpointStore::new(),
            log: ObservationLog::new(),
            in_flight: JoinSet::new(),
            running: HashMap::new(),
            tasks: HashMap::new(),
            retry_delays: HashMap::new(),
            hints: Vec::new(),
            escalation: None,
            abort_reason: None,
            invalidations: Vec::new(),
            rescheduled: Vec::new(),
            clock: None,
            elapsed_base_ms: 0,
            cancel: CancellationToken::new(),
            phase_tx,
        };
        if let Some(snapshot) = snapshot {
            coordinator.restore(snapshot)?;
        }
        Ok(coordinator)
    }

    pub fn task_id(&self) -> &str {
        &self.brief.id
    }

    pub fn brief(&self) -> &TaskBrief {
        &self.brief
    }

    pub fn phase(&self) -> CoordinatorPhase {
        self.state.phase
    }

    /// 订阅阶段变化
    pub fn subscribe(&self) -> watch::Receiver<CoordinatorPhase> {
        self.phase_tx.subscribe()
    }

    pub fn state(&self) -> &ExecutionState {
        &self.state
    }

    pub fn plan(&self) -> Option<&Plan> {
        self.plan.as_ref()
    }

    pub fn tracker(&self) -> &LineageTracker {
        &self.tracker
    }

    pub fn observations(&self) -> &ObservationLog {
        &self.log
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn pending_escalation(&self) -> Option<&EscalationRequest> {
        self.escalation.as_ref()
    }

    pub fn invalidations(&self) -> &[InvalidationRecord] {
        &self.invalidations
    }

    /// 驱动状态机直到终态，或在没有升级通道时停在 Escalated
    pub async fn run(&mut self) -> Result<TaskOutcome, CoordinatorError> {
        self.schedule_restored();
        loop {
            self.publish_phase();
            match self.state.phase {
                CoordinatorPhase::Planning => {
                    self.start_clock();
                    self.plan_step().await?;
                }
                CoordinatorPhase::Executing | CoordinatorPhase::Verifying => {
                    self.start_clock();
                    self.execute_round().await?;
                }
                CoordinatorPhase::Escalated => {
                    let Some(operator) = self.operator.clone() else {
                        return Ok(self.outcome());
                    };
                    let request = self.escalation.clone().ok_or(CoordinatorError::NotEscalated)?;
                    let decision = operator
                        .notify(request)
                        .await
                        .map_err(CoordinatorError::Operator)?;
                    self.apply_decision(decision).await?;
                }
                CoordinatorPhase::Completed | CoordinatorPhase::Failed => {
                    self.finish();
                    return Ok(self.outcome());
                }
            }
        }
    }

    /// 以运维方决策从挂起点继续
    pub async fn resume(&mut self, decision: OperatorDecision) -> Result<TaskOutcome, CoordinatorError> {
        if self.state.phase != CoordinatorPhase::Escalated {
            return Err(CoordinatorError::NotEscalated);
        }
        self.apply_decision(decision).await?;
        self.run().await
    }

    /// 等待临时完成后仍未决的回溯校验，返回最终结果
    ///
    /// 失败结论按正常路径失效、重放；任务停在 Escalated（无升级通道）或 Failed 时提前返回。
    pub async fn settle(&mut self) -> Result<TaskOutcome, CoordinatorError> {
        self.schedule_restored();
        loop {
            match self.state.phase {
                CoordinatorPhase::Completed if !self.state.pending_retrospects.is_empty() => {
                    let Some(verdict) = self.verdicts.recv().await else {
                        warn!(task = %self.brief.id, "Retrospect channel closed with verdicts outstanding");
                        self.state.pending_retrospects.clear();
                        continue;
                    };
                    self.on_verdict(verdict).await?;
                    self.publish_phase();
                }
                CoordinatorPhase::Completed | CoordinatorPhase::Failed => {
                    self.finish();
                    return Ok(self.outcome());
                }
                CoordinatorPhase::Escalated if self.operator.is_none() => return Ok(self.outcome()),
                _ => {
                    self.run().await?;
                }
            }
        }
    }

    fn schedule_restored(&mut self) {
        for (spec, observation) in std::mem::take(&mut self.rescheduled) {
            self.retrospects.schedule(&spec, observation);
        }
    }

    // ---- Planning ----

    async fn plan_step(&mut self) -> Result<(), CoordinatorError> {
        let result = match &self.plan {
            Some(current) => self.planner.replan(&self.brief, current, &self.hints).await,
            None => self.planner.plan(&self.brief, self.state.plan_version + 1).await,
        };
        let err = match result {
            Ok(plan) => {
                self.hints.clear();
                return self.install_plan(plan);
            }
            Err(e) => e,
        };
        warn!(task = %self.brief.id, error = %err, "Planning failed");
        match self.policy.decide(&self.state, &self.log, PolicyInput::PlanningFailed(&err)) {
            Decision::Escalate { severity, reason } => {
                let implicated = err.step().map(|s| vec![s.to_string()]).unwrap_or_default();
                self.escalate(severity, reason, implicated).await
            }
            Decision::Replan => {
                self.state.replan_count += 1;
                self.hints.push(format!("previous proposal rejected: {err}"));
                Ok(())
            }
            Decision::Continue | Decision::Retry(_) => Ok(()),
        }
    }

    /// 安装新版本计划：重定位血缘、保留未变化步骤的状态与检查点、取消过期的在途步骤
    fn install_plan(&mut self, plan: Plan) -> Result<(), CoordinatorError> {
        if plan.version <= self.state.plan_version {
            return Err(CoordinatorError::PlanVersionRegression {
                current: self.state.plan_version,
                proposed: plan.version,
            });
        }
        let stale = self.tracker.rebase(&plan)?;
        let cancelled = self.state.apply_plan(&plan, &stale)?;
        for step in &cancelled {
            if let Some(flight) = self.running.remove(step) {
                flight.token.cancel();
            }
        }
        self.checkpoints.invalidate(&stale);
        self.checkpoints.retain(|step| plan.contains(step));
        self.retry_delays.retain(|step, _| plan.contains(step));
        self.state.refresh_ready(&self.tracker);
        self.state.phase = CoordinatorPhase::Executing;

        let violations = self.state.check_invariants(&self.tracker);
        if !violations.is_empty() {
            warn!(task = %self.brief.id, violations = ?violations, "State invariants violated after plan install");
        }
        info!(
            task = %self.brief.id,
            version = plan.version,
            label = %plan.label,
            steps = plan.len(),
            stale = ?stale,
            cancelled = ?cancelled,
            "Plan installed"
        );
        self.plan = Some(plan);
        Ok(())
    }

    // ---- Executing / Verifying ----

    async fn execute_round(&mut self) -> Result<(), CoordinatorError> {
        self.tick();
        if let Some(reason) = self.state.budget.breach(&self.state.limits) {
            let implicated = self.running.keys().cloned().collect();
            return self
                .escalate(Severity::S2, format!("budget exceeded: {reason}"), implicated)
                .await;
        }

        self.dispatch_ready().await?;
        if self.state.phase == CoordinatorPhase::Escalated {
            return Ok(());
        }

        if self.in_flight.is_empty() {
            if self.state.all_done() {
                self.state.phase = CoordinatorPhase::Verifying;
                self.publish_phase();
                if self.accept().await? {
                    let pending = self.state.pending_retrospects.len();
                    if pending > 0 {
                        info!(task = %self.brief.id, pending, "Completed provisionally, retrospects outstanding");
                    }
                    self.state.phase = CoordinatorPhase::Completed;
                }
                return Ok(());
            }
            if self.state.pending_retrospects.is_empty() {
                let blocked: Vec<StepId> = self
                    .state
                    .statuses()
                    .iter()
                    .filter(|(_, s)| **s != StepStatus::Done)
                    .map(|(id, _)| id.clone())
                    .collect();
                return self
                    .escalate(Severity::S3, "no runnable steps remain".to_string(), blocked)
                    .await;
            }
        }

        let has_in_flight = !self.in_flight.is_empty();
        let awaiting_verdicts = !self.state.pending_retrospects.is_empty();
        let event = tokio::select! {
            Some(joined) = self.in_flight.join_next_with_id(), if has_in_flight => Event::Report(joined),
            Some(verdict) = self.verdicts.recv(), if awaiting_verdicts => Event::Verdict(verdict),
            else => Event::Idle,
        };
        match event {
            Event::Report(Ok((id, report))) => {
                self.tasks.remove(&id);
                self.on_report(report).await
            }
            Event::Report(Err(e)) => self.on_lost_task(e).await,
            Event::Verdict(verdict) => self.on_verdict(verdict).await,
            Event::Idle => Ok(()),
        }
    }

    /// 派发全部就绪步骤；准入检查不通过时升级
    async fn dispatch_ready(&mut self) -> Result<(), CoordinatorError> {
        let Some(plan) = self.plan.clone() else {
            return Ok(());
        };
        for step in self.executor.ready_set(&self.state, &self.tracker) {
            let Some(contract) = plan.get(&step).cloned() else {
                continue;
            };
            let reserved: f64 = self.running.values().map(|f| f.estimated_cost).sum();
            if let Decision::Escalate { severity, reason } = self.policy.admit(&self.state, &contract, reserved) {
                return self.escalate(severity, reason, vec![step]).await;
            }
            let attempt = self.state.next_attempt(&step);
            let token = self.cancel.child_token();
            let inputs = self
                .executor
                .resolve_inputs(&contract, &self.brief, &self.checkpoints);
            let delay = self.retry_delays.remove(&step).unwrap_or_default();
            let plan_version = self.state.plan_version;
            self.running.insert(
                step.clone(),
                InFlight {
                    token: token.clone(),
                    plan_version,
                    attempt,
                    estimated_cost: contract.estimated_cost_usd,
                },
            );
            self.state.set_status(&step, StepStatus::Running);
            info!(
                task = %self.brief.id,
                step = %step,
                capability = %contract.capability,
                version = plan_version,
                attempt,
                "Step dispatched"
            );
            let task = self.executor.spawn(
                &mut self.in_flight,
                Dispatch {
                    contract,
                    plan_version,
                    attempt,
                    inputs,
                    delay,
                    cancel: token,
                },
            );
            self.tasks.insert(task, (step, plan_version, attempt));
        }
        Ok(())
    }

    /// 记账并记录观测；返回需要交给 PolicyEngine 的当前派发失败
    fn absorb(&mut self, report: StepReport) -> Result<Option<Observation>, CoordinatorError> {
        let StepReport {
            observation,
            idempotent,
            ..
        } = report;
        let step = observation.step_id.clone();
        let current = self
            .running
            .get(&step)
            .is_some_and(|f| f.plan_version == observation.plan_version && f.attempt == observation.attempt);
        self.state.budget.charge(
            &step,
            observation.cost_usd,
            observation.tokens,
            current && observation.is_success(),
            idempotent,
        );
        if !current {
            debug!(
                step = %step,
                version = observation.plan_version,
                attempt = observation.attempt,
                "Result of a superseded dispatch"
            );
            if let Err(e) = self.log.record(observation) {
                debug!(step = %step, error = %e, "Superseded observation not recorded");
            }
            return Ok(None);
        }
        self.running.remove(&step);
        self.log.record(observation.clone())?;
        if observation.is_success() {
            self.promote(&observation)?;
            Ok(None)
        } else {
            Ok(Some(observation))
        }
    }

    /// 成功步骤：建立检查点、标记有效、调度异步回溯
    fn promote(&mut self, observation: &Observation) -> Result<(), CoordinatorError> {
        let plan = self.plan.as_ref().ok_or(CoordinatorError::NoPlan)?;
        let step = observation.step_id.as_str();
        let Some(contract) = plan.get(step).cloned() else {
            return Ok(());
        };
        self.checkpoints
            .create(Checkpoint::from_observation(observation), &contract.depends_on)?;
        self.tracker.mark_valid(step, observation.plan_version);
        self.state.set_status(step, StepStatus::Done);
        for retro in contract.async_retrospects() {
            self.state.pending_retrospects.insert(PendingRetrospect {
                step_id: step.to_string(),
                retrospect_id: retro.id.clone(),
                plan_version: observation.plan_version,
                revision: observation.revision,
            });
            self.retrospects.schedule(retro, observation.clone());
        }
        self.state.refresh_ready(&self.tracker);
        info!(
            task = %self.brief.id,
            step,
            version = observation.plan_version,
            attempt = observation.attempt,
            cost_usd = observation.cost_usd,
            duration_ms = observation.duration_ms,
            "Step done"
        );
        Ok(())
    }

    async fn on_report(&mut self, report: StepReport) -> Result<(), CoordinatorError> {
        let retry_safe = report.idempotent || report.compensable;
        let Some(observation) = self.absorb(report)? else {
            return Ok(());
        };
        let step = observation.step_id.clone();
        let failure = observation.failure.clone();
        let decision = self.policy.decide(
            &self.state,
            &self.log,
            PolicyInput::Observation {
                observation: &observation,
                retry_safe,
            },
        );
        info!(
            task = %self.brief.id,
            step = %step,
            kind = ?failure.as_ref().map(|f| f.kind),
            reason = failure.as_ref().map(|f| f.reason.as_str()).unwrap_or(""),
            decision = ?decision,
            "Step failed"
        );
        self.state.set_status(&step, StepStatus::Pending);
        match decision {
            Decision::Continue => {}
            Decision::Retry(step) => {
                let count = {
                    let count = self.state.retry_counts.entry(step.clone()).or_insert(0);
                    *count += 1;
                    *count
                };
                let delay = self
                    .executor
                    .backoff(count, failure.as_ref().and_then(|f| f.retry_after_ms));
                self.retry_delays.insert(step, delay);
            }
            Decision::Replan => {
                self.state.replan_count += 1;
                let reason = failure.map(|f| f.reason).unwrap_or_default();
                self.hints.push(format!("step '{step}' failed: {reason}"));
                self.state.phase = CoordinatorPhase::Planning;
            }
            Decision::Escalate { severity, reason } => {
                let implicated = self.tracker.upstream_closure(&step);
                return self.escalate(severity, reason, implicated).await;
            }
        }
        self.state.refresh_ready(&self.tracker);
        Ok(())
    }

    /// 步骤任务没有交回报告就结束了（被中止）：补一条永久失败观测交给策略
    async fn on_lost_task(&mut self, err: JoinError) -> Result<(), CoordinatorError> {
        warn!(task = %self.brief.id, error = %err, "Step task aborted");
        let Some((step, plan_version, attempt)) = self.tasks.remove(&err.id()) else {
            return Ok(());
        };
        let revision = self
            .plan
            .as_ref()
            .and_then(|p| p.get(&step))
            .map(|c| c.revision)
            .unwrap_or_default();
        let report = Executor::lost_report(
            &step,
            plan_version,
            revision,
            attempt,
            &format!("step task aborted: {err}"),
        );
        self.on_report(report).await
    }

    async fn on_verdict(&mut self, verdict: RetrospectVerdict) -> Result<(), CoordinatorError> {
        if !self.state.pending_retrospects.remove(&verdict.key()) {
            debug!(step = %verdict.step_id, retrospect = %verdict.retrospect_id, "Stale retrospect verdict");
            return Ok(());
        }
        if verdict.passed {
            debug!(step = %verdict.step_id, retrospect = %verdict.retrospect_id, "Retrospect passed");
            return Ok(());
        }
        let plan = self.plan.clone().ok_or(CoordinatorError::NoPlan)?;
        let Some(record) = self.retrospects.assess(
            &verdict,
            &plan,
            &self.tracker,
            &self.state,
            self.executor.registry(),
        ) else {
            return Ok(());
        };

        let decision = self
            .policy
            .decide(&self.state, &self.log, PolicyInput::Invalidation(&record));
        let uncompensated = self.invalidate(&plan, &record).await;
        if !uncompensated.is_empty() {
            let reason = format!(
                "compensation failed for {:?} after retrospect '{}' on '{}'; replay would build on unreverted side effects",
                uncompensated, record.retrospect_id, record.failed_step
            );
            return self.escalate(Severity::S1, reason, uncompensated).await;
        }

        match decision {
            Decision::Replan => {
                *self
                    .state
                    .integrity_replays
                    .entry(record.failed_step.clone())
                    .or_insert(0) += 1;
                match self.planner.patch(&plan, &record.patch) {
                    Ok(next) => {
                        info!(
                            task = %self.brief.id,
                            step = %record.failed_step,
                            version = next.version,
                            "Replaying from invalidated step"
                        );
                        self.install_plan(next)
                    }
                    Err(e) => {
                        let reason = format!("replay patch for '{}' failed: {e}", record.failed_step);
                        self.escalate(Severity::S1, reason, record.affected.clone()).await
                    }
                }
            }
            Decision::Escalate { severity, reason } => {
                self.escalate(severity, reason, record.affected.clone()).await
            }
            Decision::Continue | Decision::Retry(_) => {
                if self.state.phase == CoordinatorPhase::Completed {
                    self.state.phase = CoordinatorPhase::Executing;
                }
                self.state.refresh_ready(&self.tracker);
                Ok(())
            }
        }
    }

    /// 失效下游闭包：取消闭包内在途步骤、执行补偿、删除检查点
    ///
    /// 返回补偿失败的步骤。
    async fn invalidate(&mut self, plan: &Plan, record: &InvalidationRecord) -> Vec<StepId> {
        for step in &record.affected {
            if let Some(flight) = self.running.remove(step) {
                flight.token.cancel();
            }
        }
        let targets: Vec<Compensation> = record
            .compensations
            .iter()
            .filter_map(|step| {
                let checkpoint = self.checkpoints.get(step)?;
                let contract = plan.get(step)?;
                Some(Compensation {
                    step_id: step.clone(),
                    capability: contract.capability.clone(),
                    input: checkpoint.input.clone(),
                    output: checkpoint.output.clone(),
                })
            })
            .collect();
        let uncompensated: Vec<StepId> = if targets.is_empty() {
            Vec::new()
        } else {
            self.executor
                .compensate(&targets)
                .await
                .into_iter()
                .filter_map(|(step, result)| result.err().map(|_| step))
                .collect()
        };
        self.checkpoints.invalidate(&record.affected);
        self.tracker.invalidate_closure(&record.failed_step);
        self.state.invalidate(&record.affected);
        warn!(
            task = %self.brief.id,
            step = %record.failed_step,
            retrospect = %record.retrospect_id,
            affected = ?record.affected,
            compensated = ?record.compensations,
            uncompensated = ?uncompensated,
            "Lineage invalidated"
        );
        self.invalidations.push(record.clone());
        uncompensated
    }

    /// 验收：必需输出齐全且验收测试通过；失败交给 PolicyEngine
    async fn accept(&mut self) -> Result<bool, CoordinatorError> {
        let outputs = self.collect_outputs();
        let mut failed: Vec<String> = self
            .brief
            .required_outputs
            .keys()
            .filter(|name| !outputs.contains_key(*name))
            .map(|name| format!("missing output '{name}'"))
            .collect();
        let log = &self.log;
        failed.extend(self.executor.verifier().run_acceptance(
            &self.brief.acceptance_tests,
            &outputs,
            self.state.budget.cost_usd,
            |step| log.latest_success(step),
        ));
        if failed.is_empty() {
            return Ok(true);
        }
        warn!(task = %self.brief.id, failed = ?failed, "Acceptance failed");
        match self
            .policy
            .decide(&self.state, &self.log, PolicyInput::AcceptanceFailed(&failed))
        {
            Decision::Escalate { severity, reason } => {
                let implicated = self.tracker.topological_order().to_vec();
                self.escalate(severity, reason, implicated).await?;
            }
            Decision::Replan => {
                self.state.replan_count += 1;
                self.hints
                    .push(format!("acceptance failed: {}", failed.join(", ")));
                self.state.phase = CoordinatorPhase::Planning;
            }
            Decision::Continue | Decision::Retry(_) => return Ok(true),
        }
        Ok(false)
    }

    // ---- Escalation ----

    async fn escalate(
        &mut self,
        severity: Severity,
        reason: String,
        implicated: Vec<StepId>,
    ) -> Result<(), CoordinatorError> {
        warn!(
            task = %self.brief.id,
            severity = %severity,
            reason = %reason,
            implicated = ?implicated,
            "Escalating"
        );
        self.drain_in_flight().await?;
        self.pause_clock();
        self.escalation = Some(EscalationRequest {
            task_id: self.brief.id.clone(),
            plan_version: self.state.plan_version,
            severity,
            reason,
            implicated,
            budget: self.state.budget.clone(),
            limits: self.state.limits.clone(),
            raised_at: chrono::Utc::now().timestamp_millis(),
        });
        self.state.phase = CoordinatorPhase::Escalated;
        self.publish_phase();
        Ok(())
    }

    /// 取消全部在途步骤并等待它们返回（协作式取消）
    async fn drain_in_flight(&mut self) -> Result<(), CoordinatorError> {
        for flight in self.running.values() {
            flight.token.cancel();
        }
        while let Some(joined) = self.in_flight.join_next_with_id().await {
            match joined {
                Ok((id, report)) => {
                    self.tasks.remove(&id);
                    if let Some(observation) = self.absorb(report)? {
                        self.state.set_status(&observation.step_id, StepStatus::Pending);
                    }
                }
                Err(e) => {
                    self.tasks.remove(&e.id());
                    warn!(task = %self.brief.id, error = %e, "Step task aborted");
                }
            }
        }
        for (step, _) in self.running.drain() {
            if self.state.status(&step) == Some(StepStatus::Running) {
                self.state.set_status(&step, StepStatus::Pending);
            }
        }
        self.state.refresh_ready(&self.tracker);
        Ok(())
    }

    async fn apply_decision(&mut self, decision: OperatorDecision) -> Result<(), CoordinatorError> {
        info!(task = %self.brief.id, decision = ?decision, "Operator decision");
        let escalation = self.escalation.take();
        match decision {
            OperatorDecision::Resume => {
                if let Some(request) = &escalation {
                    for step in &request.implicated {
                        self.state.retry_counts.remove(step);
                    }
                }
                self.reopen().await
            }
            OperatorDecision::ExtendBudget {
                cost_usd,
                latency_sec,
                max_tokens,
            } => {
                let limits = &mut self.state.limits;
                if cost_usd.is_some() {
                    limits.cost_usd = cost_usd;
                }
                if latency_sec.is_some() {
                    limits.latency_sec = latency_sec;
                }
                if max_tokens.is_some() {
                    limits.max_tokens = max_tokens;
                }
                self.reopen().await
            }
            OperatorDecision::Replan { note } => {
                self.hints.push(note);
                self.state.phase = CoordinatorPhase::Planning;
                Ok(())
            }
            OperatorDecision::Abort { reason } => {
                self.abort_reason = Some(reason);
                self.escalation = escalation;
                self.state.phase = CoordinatorPhase::Failed;
                Ok(())
            }
        }
    }

    /// 回到执行；存在失效步骤时先生成新版本，重放的观测必须属于新版本
    async fn reopen(&mut self) -> Result<(), CoordinatorError> {
        let invalidated = self.state.steps_with(StepStatus::Invalidated);
        let Some(plan) = self.plan.clone() else {
            self.state.phase = CoordinatorPhase::Planning;
            return Ok(());
        };
        if invalidated.is_empty() {
            self.state.refresh_ready(&self.tracker);
            self.state.phase = CoordinatorPhase::Executing;
            return Ok(());
        }
        match self.planner.patch(&plan, &[]) {
            Ok(next) => {
                info!(
                    task = %self.brief.id,
                    version = next.version,
                    replay = ?invalidated,
                    "Replaying invalidated steps after resume"
                );
                self.install_plan(next)
            }
            Err(e) => {
                let reason = format!("replay patch after resume failed: {e}");
                self.escalate(Severity::S1, reason, invalidated).await
            }
        }
    }

    fn finish(&mut self) {
        self.pause_clock();
        let failed = self.state.phase == CoordinatorPhase::Failed;
        if !failed && !self.state.pending_retrospects.is_empty() {
            info!(
                task = %self.brief.id,
                version = self.state.plan_version,
                pending = self.state.pending_retrospects.len(),
                "Task completed provisionally"
            );
            return;
        }
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        if failed {
            self.retrospects.shutdown();
        }
        info!(
            task = %self.brief.id,
            status = ?self.state.phase,
            version = self.state.plan_version,
            cost_usd = self.state.budget.cost_usd,
            observations = self.log.len(),
            "Task finished"
        );
    }

    // ---- Clock ----

    fn start_clock(&mut self) {
        if self.clock.is_none() {
            self.elapsed_base_ms = self.state.budget.elapsed_ms;
            self.clock = Some(Instant::now());
        }
    }

    fn tick(&mut self) {
        if let Some(since) = self.clock {
            self.state.budget.elapsed_ms = self.elapsed_base_ms + since.elapsed().as_millis() as u64;
        }
    }

    /// 挂起期间不计入耗时
    fn pause_clock(&mut self) {
        self.tick();
        self.elapsed_base_ms = self.state.budget.elapsed_ms;
        self.clock = None;
    }

    fn publish_phase(&self) {
        self.phase_tx.send_replace(self.state.phase);
    }

    // ---- Results ----

    /// 汇总输出：必需输出取自产出该字段的步骤检查点；未声明时取所有汇点步骤的输出
    pub fn collect_outputs(&self) -> BTreeMap<String, Value> {
        let mut outputs = BTreeMap::new();
        let Some(plan) = &self.plan else {
            return outputs;
        };
        let order = self.tracker.topological_order();
        if self.brief.required_outputs.is_empty() {
            for id in order {
                if self.tracker.dependents(id).is_empty() {
                    if let Some(cp) = self.checkpoints.get(id) {
                        outputs.insert(id.clone(), cp.output.clone());
                    }
                }
            }
            return outputs;
        }
        for name in self.brief.required_outputs.keys() {
            let producer = order.iter().rev().find_map(|id| {
                let declares = plan.get(id).is_some_and(|c| c.outputs.contains_key(name));
                if declares {
                    self.checkpoints.get(id)
                } else {
                    None
                }
            });
            if let Some(cp) = producer {
                let value = cp.output.get(name).cloned().unwrap_or_else(|| cp.output.clone());
                outputs.insert(name.clone(), value);
            }
        }
        outputs
    }

    fn metric_value(&self, name: &str) -> Option<f64> {
        let budget = &self.state.budget;
        let value = match name {
            "cost_usd" => budget.cost_usd,
            "tokens" => budget.tokens as f64,
            "elapsed_ms" => budget.elapsed_ms as f64,
            "retries" => f64::from(self.state.total_retries()),
            "replans" => f64::from(self.state.replan_count),
            "observations" => self.log.len() as f64,
            "invalidations" => f64::from(self.state.invalidation_count),
            _ => return None,
        };
        Some(value)
    }

    pub fn metrics(&self) -> BTreeMap<String, f64> {
        let names: Vec<&str> = if self.brief.metrics.is_empty() {
            METRIC_NAMES.to_vec()
        } else {
            self.brief.metrics.iter().map(String::as_str).collect()
        };
        let mut metrics = BTreeMap::new();
        for name in names {
            match self.metric_value(name) {
                Some(v) => {
                    metrics.insert(name.to_string(), v);
                }
                None => warn!(metric = name, "Unknown metric requested"),
            }
        }
        metrics
    }

    pub fn outcome(&self) -> TaskOutcome {
        let (explanation, severity, implicated) = match (&self.state.phase, &self.escalation) {
            (CoordinatorPhase::Escalated, Some(e)) => {
                (Some(e.reason.clone()), Some(e.severity), e.implicated.clone())
            }
            (CoordinatorPhase::Failed, escalation) => {
                let reason = self.abort_reason.clone().unwrap_or_else(|| "aborted".to_string());
                let explanation = match escalation {
                    Some(e) => format!("{reason} (after escalation: {})", e.reason),
                    None => reason,
                };
                (
                    Some(explanation),
                    escalation.as_ref().map(|e| e.severity),
                    escalation.as_ref().map(|e| e.implicated.clone()).unwrap_or_default(),
                )
            }
            _ => (None, None, Vec::new()),
        };
        TaskOutcome {
            task_id: self.brief.id.clone(),
            status: self.state.phase,
            plan_version: self.state.plan_version,
            outputs: self.collect_outputs(),
            explanation,
            severity,
            implicated,
            escalation: self.escalation.clone(),
            invalidations: self.invalidations.clone(),
            provisional: self.state.phase == CoordinatorPhase::Completed
                && !self.state.pending_retrospects.is_empty(),
            pending_retrospects: self.state.pending_retrospects.len(),
            metrics: self.metrics(),
        }
    }

    // ---- Persistence ----

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            brief: self.brief.clone(),
            plan: self.plan.clone(),
            state: self.state.clone(),
            checkpoints: self.checkpoints.clone(),
            observations: self.log.all().to_vec(),
            escalation: self.escalation.clone(),
            invalidations: self.invalidations.clone(),
            hints: self.hints.clone(),
            saved_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    fn restore(&mut self, snapshot: TaskSnapshot) -> Result<(), CoordinatorError> {
        let TaskSnapshot {
            brief,
            plan,
            mut state,
            checkpoints,
            observations,
            escalation,
            invalidations,
            hints,
            ..
        } = snapshot;
        self.log = ObservationLog::from_entries(observations)?;
        if let Some(plan) = &plan {
            self.tracker = LineageTracker::from_plan(plan)?;
            for cp in checkpoints.iter() {
                self.tracker.mark_valid(&cp.step_id, cp.plan_version);
            }
            // 进程退出时的在途步骤没有可信结果，重新执行
            for step in state.running_steps() {
                state.set_status(&step, StepStatus::Pending);
            }
            state.refresh_ready(&self.tracker);

            let pending: Vec<PendingRetrospect> = state.pending_retrospects.iter().cloned().collect();
            for key in pending {
                let spec = plan
                    .get(&key.step_id)
                    .and_then(|c| c.retrospects.iter().find(|r| r.id == key.retrospect_id))
                    .cloned();
                let observation = self
                    .log
                    .for_step(&key.step_id)
                    .filter(|o| o.is_success() && o.plan_version == key.plan_version && o.revision == key.revision)
                    .last()
                    .cloned();
                match (spec, observation) {
                    (Some(spec), Some(observation)) => self.rescheduled.push((spec, observation)),
                    _ => {
                        warn!(step = %key.step_id, retrospect = %key.retrospect_id, "Dropping unrecoverable retrospect");
                        state.pending_retrospects.remove(&key);
                    }
                }
            }
        }
        self.elapsed_base_ms = state.budget.elapsed_ms;
        info!(
            task = %brief.id,
            phase = ?state.phase,
            version = state.plan_version,
            checkpoints = checkpoints.len(),
            retrospects = self.rescheduled.len(),
            "Task restored"
        );
        self.brief = brief;
        self.plan = plan;
        self.state = state;
        self.checkpoints = checkpoints;
        self.escalation = escalation;
        self.invalidations = invalidations;
        self.hints = hints;
        self.phase_tx.send_replace(self.state.phase);
        Ok(())
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::EchoCapability;
    use crate::config::AppConfig;
    use crate::coordinator::CoordinatorBuilder;
    use crate::core::FailureKind;
    use crate::plan::ActionContract;
    use crate::planner::PlanCandidate;

    fn single_step() -> Coordinator {
        CoordinatorBuilder::new(TaskBrief::new("one step").with_id("lost"), AppConfig::default())
            .with_capability(EchoCapability)
            .with_candidates(vec![PlanCandidate::new("main", vec![ActionContract::new("a", "echo")])])
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_aborted_step_task_is_reported_as_permanent_failure() {
        let mut coordinator = single_step();
        coordinator.plan_step().await.unwrap();
        coordinator.dispatch_ready().await.unwrap();
        assert_eq!(coordinator.state.status("a"), Some(StepStatus::Running));
        assert_eq!(coordinator.tasks.len(), 1);

        // 任务还没被调度就中止，JoinSet 只能交回 JoinError
        coordinator.in_flight.abort_all();
        coordinator.execute_round().await.unwrap();

        assert!(coordinator.running.is_empty());
        assert!(coordinator.tasks.is_empty());
        assert_ne!(coordinator.state.status("a"), Some(StepStatus::Running));
        let recorded = coordinator.observations().all();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].failure_kind(), Some(FailureKind::Permanent));
        assert!(recorded[0].failure.as_ref().unwrap().reason.contains("aborted"));
        // 与其他永久失败一样交给策略：首次失败触发重规划
        assert_eq!(coordinator.phase(), CoordinatorPhase::Planning);
        assert_eq!(coordinator.state.replan_count, 1);
    }

    #[tokio::test]
    async fn test_completion_is_provisional_until_verdicts_settle() {
        let mut coordinator = single_step();
        let outcome = coordinator.run().await.unwrap();
        assert!(outcome.is_final());

        coordinator.state.pending_retrospects.insert(PendingRetrospect {
            step_id: "a".into(),
            retrospect_id: "audit".into(),
            plan_version: 1,
            revision: 0,
        });
        let outcome = coordinator.outcome();
        assert!(outcome.is_completed());
        assert!(outcome.provisional);
        assert_eq!(outcome.pending_retrospects, 1);
        assert!(!outcome.is_final());
    }
}
