//! Verifier：同步 gate 与任务验收测试
//!
//! gate 是作用在单个 Observation 上的廉价谓词，只阻止该步骤的提升；
//! 未通过时产出 GateRejected 失败观测，交给 PolicyEngine 处理，而不是报错退出。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::Value;

use crate::core::{Observation, ObservationStatus};
use crate::plan::{AcceptanceTest, ActionContract, GatePredicate};

/// 自定义谓词
pub type CustomPredicate = Arc<dyn Fn(&Observation) -> bool + Send + Sync>;

#[derive(Clone, Default)]
pub struct Verifier {
    custom: HashMap<String, CustomPredicate>,
}

impl std::fmt::Debug for Verifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.custom.keys().collect();
        names.sort();
        f.debug_struct("Verifier").field("custom", &names).finish()
    }
}

impl Verifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册 `GatePredicate::Custom(name)` 使用的谓词
    pub fn register<F>(&mut self, name: impl Into<String>, predicate: F)
    where
        F: Fn(&Observation) -> bool + Send + Sync + 'static,
    {
        self.custom.insert(name.into(), Arc::new(predicate));
    }

    pub fn with_predicate<F>(mut self, name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Observation) -> bool + Send + Sync + 'static,
    {
        self.register(name, predicate);
        self
    }

    /// 对单个观测求值；未注册的自定义谓词视为不通过
    pub fn evaluate(&self, predicate: &GatePredicate, obs: &Observation) -> bool {
        match predicate {
            GatePredicate::Succeeded => obs.status == ObservationStatus::Success,
            GatePredicate::OutputNonEmpty => match &obs.output {
                Value::Null => false,
                Value::String(s) => !s.trim().is_empty(),
                Value::Array(a) => !a.is_empty(),
                Value::Object(o) => !o.is_empty(),
                _ => true,
            },
            GatePredicate::HasField(field) => obs.output.get(field).is_some(),
            GatePredicate::FieldEquals { field, value } => obs.output.get(field) == Some(value),
            GatePredicate::OutputContains(text) => match &obs.output {
                Value::String(s) => s.contains(text.as_str()),
                other => other.to_string().contains(text.as_str()),
            },
            GatePredicate::MaxCost(limit) => obs.cost_usd <= *limit,
            GatePredicate::Custom(name) => match self.custom.get(name) {
                Some(f) => f(obs),
                None => {
                    tracing::warn!(predicate = %name, "Unknown custom gate predicate");
                    false
                }
            },
        }
    }

    /// 依次执行契约上的 gate，返回第一个未通过的说明
    pub fn check_gates(&self, contract: &ActionContract, obs: &Observation) -> Result<(), String> {
        for gate in &contract.gates {
            if !self.evaluate(&gate.predicate, obs) {
                return Err(format!("gate '{}' rejected output of '{}'", gate.name, contract.id));
            }
        }
        Ok(())
    }

    /// 执行验收测试，返回未通过的测试名
    ///
    /// 指定 step 的测试针对该步骤的最新有效输出；否则针对汇总后的任务输出。
    pub fn run_acceptance<'a, F>(
        &self,
        tests: &[AcceptanceTest],
        outputs: &BTreeMap<String, Value>,
        total_cost: f64,
        step_output: F,
    ) -> Vec<String>
    where
        F: Fn(&str) -> Option<&'a Observation>,
    {
        let assembled = Observation {
            step_id: String::from("task"),
            plan_version: 0,
            revision: 0,
            attempt: 0,
            status: ObservationStatus::Success,
            input: Value::Null,
            output: Value::Object(outputs.clone().into_iter().collect()),
            failure: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
            cost_usd: total_cost,
            tokens: 0,
            duration_ms: 0,
            raw: None,
        };
        tests
            .iter()
            .filter(|t| {
                let passed = match &t.step {
                    Some(step) => step_output(step)
                        .map(|obs| self.evaluate(&t.predicate, obs))
                        .unwrap_or(false),
                    None => self.evaluate(&t.predicate, &assembled),
                };
                !passed
            })
            .map(|t| t.name.clone())
            .collect()
    }
}
