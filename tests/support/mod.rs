//! 集成测试共用：可编排的能力与回溯检查
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Notify;

use hive::capability::{Capability, CapabilitySpec, Invocation, InvocationRequest};
use hive::config::AppConfig;
use hive::coordinator::{Coordinator, CoordinatorBuilder};
use hive::core::{CapabilityError, Observation};
use hive::plan::{ActionContract, TaskBrief};
use hive::planner::PlanCandidate;
use hive::verify::{CheckRegistry, RetrospectCheck};

#[derive(Default)]
struct Counters {
    calls: AtomicUsize,
    compensations: AtomicUsize,
    current: AtomicUsize,
    peak: AtomicUsize,
}

/// 确定性能力：按脚本依次返回错误，脚本用完后成功
#[derive(Clone)]
pub struct Scripted {
    name: String,
    idempotent: bool,
    compensable: bool,
    compensation_fails: bool,
    cost: f64,
    script: Arc<Mutex<VecDeque<CapabilityError>>>,
    always_fail: Option<CapabilityError>,
    signal: Option<Arc<Notify>>,
    slow_first: Option<Duration>,
    hold: Option<Duration>,
    counters: Arc<Counters>,
}

impl Scripted {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            idempotent: true,
            compensable: false,
            compensation_fails: false,
            cost: 0.0,
            script: Arc::new(Mutex::new(VecDeque::new())),
            always_fail: None,
            signal: None,
            slow_first: None,
            hold: None,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    pub fn compensable(mut self, compensable: bool) -> Self {
        self.compensable = compensable;
        self
    }

    /// 声明可补偿，但补偿调用总是失败
    pub fn compensation_fails(mut self) -> Self {
        self.compensable = true;
        self.compensation_fails = true;
        self
    }

    pub fn cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    pub fn fail_with(self, errors: Vec<CapabilityError>) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.extend(errors);
        }
        self
    }

    pub fn always_fail(mut self, error: CapabilityError) -> Self {
        self.always_fail = Some(error);
        self
    }

    /// 每次调用时 notify_one
    pub fn signal(mut self, notify: Arc<Notify>) -> Self {
        self.signal = Some(notify);
        self
    }

    pub fn slow_first(mut self, delay: Duration) -> Self {
        self.slow_first = Some(delay);
        self
    }

    pub fn hold(mut self, delay: Duration) -> Self {
        self.hold = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.counters.calls.load(Ordering::SeqCst)
    }

    pub fn compensations(&self) -> usize {
        self.counters.compensations.load(Ordering::SeqCst)
    }

    pub fn peak_concurrency(&self) -> usize {
        self.counters.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Capability for Scripted {
    fn name(&self) -> &str {
        &self.name
    }

    fn spec(&self) -> CapabilitySpec {
        CapabilitySpec::new(self.name.clone())
            .idempotent(self.idempotent)
            .compensable(self.compensable)
    }

    async fn invoke(&self, request: InvocationRequest) -> Result<Invocation, CapabilityError> {
        let call = self.counters.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let now = self.counters.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(now, Ordering::SeqCst);
        if let Some(signal) = &self.signal {
            signal.notify_one();
        }
        let delay = match (call, self.slow_first, self.hold) {
            (1, Some(d), _) => Some(d),
            (_, _, Some(d)) => Some(d),
            _ => None,
        };
        if let Some(d) = delay {
            tokio::select! {
                _ = tokio::time::sleep(d) => {}
                _ = request.cancel.cancelled() => {
                    self.counters.current.fetch_sub(1, Ordering::SeqCst);
                    return Err(CapabilityError::Cancelled);
                }
            }
        }
        self.counters.current.fetch_sub(1, Ordering::SeqCst);

        if let Some(err) = &self.always_fail {
            return Err(err.clone());
        }
        let scripted = self.script.lock().ok().and_then(|mut s| s.pop_front());
        if let Some(err) = scripted {
            return Err(err);
        }
        let mut output = request.params.clone();
        output.insert("step".into(), json!(request.step_id));
        output.insert("call".into(), json!(call));
        Ok(Invocation::new(Value::Object(output)).with_cost(self.cost))
    }

    async fn compensate(&self, _input: &Value, _output: &Value) -> Result<(), CapabilityError> {
        if !self.compensable {
            return Err(CapabilityError::CompensationUnsupported(self.name.clone()));
        }
        self.counters.compensations.fetch_add(1, Ordering::SeqCst);
        if self.compensation_fails {
            return Err(CapabilityError::Transient("ledger unavailable".to_string()));
        }
        Ok(())
    }
}

/// 前 n 次失败的回溯检查；可选地在失败前等待信号
pub struct FailFirst {
    name: String,
    failures_left: AtomicUsize,
    runs: Arc<AtomicUsize>,
    wait: Option<Arc<Notify>>,
}

impl FailFirst {
    pub fn new(name: &str, failures: usize) -> Self {
        Self {
            name: name.to_string(),
            failures_left: AtomicUsize::new(failures),
            runs: Arc::new(AtomicUsize::new(0)),
            wait: None,
        }
    }

    pub fn after(mut self, notify: Arc<Notify>) -> Self {
        self.wait = Some(notify);
        self
    }

    pub fn runs(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.runs)
    }
}

#[async_trait]
impl RetrospectCheck for FailFirst {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self, _observation: &Observation) -> Result<(), String> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if self.failures_left.load(Ordering::SeqCst) == 0 {
            return Ok(());
        }
        if let Some(wait) = &self.wait {
            wait.notified().await;
        }
        self.failures_left.fetch_sub(1, Ordering::SeqCst);
        Err("stale upstream data".to_string())
    }
}

/// 测试配置：短超时、无退避
pub fn config() -> AppConfig {
    let mut config = AppConfig::default();
    config.executor.default_step_timeout_ms = 2_000;
    config.executor.retry_backoff_ms = 0;
    config.retrospect.check_timeout_ms = 5_000;
    config
}

pub fn builder(
    brief: TaskBrief,
    steps: Vec<ActionContract>,
    capabilities: &[Scripted],
    checks: CheckRegistry,
) -> CoordinatorBuilder {
    capabilities.iter().fold(
        CoordinatorBuilder::new(brief, config())
            .with_candidates(vec![PlanCandidate::new("main", steps)])
            .with_checks(checks),
        |b, cap| b.with_capability(cap.clone()),
    )
}

pub fn coordinator(
    brief: TaskBrief,
    steps: Vec<ActionContract>,
    capabilities: &[Scripted],
    checks: CheckRegistry,
) -> Coordinator {
    builder(brief, steps, capabilities, checks)
        .build()
        .expect("coordinator builds")
}

pub fn checks(list: Vec<Arc<dyn RetrospectCheck>>) -> CheckRegistry {
    let mut registry = CheckRegistry::new();
    for check in list {
        registry.register_arc(check);
    }
    registry
}

/// 同一步骤的观测版本不倒退
pub fn assert_versions_monotonic(coordinator: &Coordinator) {
    let mut seen = std::collections::HashMap::new();
    for obs in coordinator.observations().all() {
        let last = seen.entry(obs.step_id.clone()).or_insert(0);
        assert!(obs.plan_version >= *last, "{} went back to v{}", obs.step_id, obs.plan_version);
        *last = obs.plan_version;
    }
}

/// 每个检查点的依赖都有不晚于它的检查点
pub fn assert_checkpoint_causality(coordinator: &Coordinator) {
    let plan = coordinator.plan().expect("plan installed");
    for cp in coordinator.checkpoints().iter() {
        let contract = plan.get(&cp.step_id).expect("checkpointed step in plan");
        for dep in &contract.depends_on {
            let dep_cp = coordinator
                .checkpoints()
                .get(dep)
                .unwrap_or_else(|| panic!("{} checkpointed without {dep}", cp.step_id));
            assert!(dep_cp.plan_version <= cp.plan_version);
        }
    }
}
