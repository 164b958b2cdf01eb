//! TaskBrief：一次任务请求的不可变输入契约

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::plan::contract::GatePredicate;
use crate::plan::StepId;

/// 声明的值类型，用于能力输入输出与计划边的类型匹配
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    #[default]
    Any,
}

impl ValueType {
    /// 生产方类型 `produced` 能否满足本类型的消费方
    pub fn accepts(self, produced: ValueType) -> bool {
        match (self, produced) {
            (ValueType::Any, _) | (_, ValueType::Any) => true,
            (ValueType::Number, ValueType::Integer) => true,
            (a, b) => a == b,
        }
    }

    /// 运行时检查 JSON 值是否符合该类型
    pub fn matches_value(self, value: &Value) -> bool {
        match self {
            ValueType::Any => true,
            ValueType::String => value.is_string(),
            ValueType::Number => value.is_number(),
            ValueType::Integer => value.is_i64() || value.is_u64(),
            ValueType::Boolean => value.is_boolean(),
            ValueType::Object => value.is_object(),
            ValueType::Array => value.is_array(),
        }
    }

    pub fn of_value(value: &Value) -> ValueType {
        match value {
            Value::String(_) => ValueType::String,
            Value::Number(n) if n.is_i64() || n.is_u64() => ValueType::Integer,
            Value::Number(_) => ValueType::Number,
            Value::Bool(_) => ValueType::Boolean,
            Value::Object(_) => ValueType::Object,
            Value::Array(_) => ValueType::Array,
            Value::Null => ValueType::Any,
        }
    }
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ValueType::String => "string",
            ValueType::Number => "number",
            ValueType::Integer => "integer",
            ValueType::Boolean => "boolean",
            ValueType::Object => "object",
            ValueType::Array => "array",
            ValueType::Any => "any",
        };
        f.write_str(s)
    }
}

/// 预算约束（均为可选上限）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Constraints {
    #[serde(default)]
    pub cost_usd: Option<f64>,
    #[serde(default)]
    pub latency_sec: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
}

/// 验收测试：完成前对输出执行的命名谓词
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptanceTest {
    pub name: String,
    /// 指定步骤时针对该步骤输出，否则针对汇总后的最终输出
    #[serde(default)]
    pub step: Option<StepId>,
    pub predicate: GatePredicate,
}

/// 任务输入契约：创建后不再修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskBrief {
    pub id: String,
    pub objective: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,
    #[serde(default)]
    pub required_outputs: BTreeMap<String, ValueType>,
    #[serde(default)]
    pub constraints: Constraints,
    #[serde(default)]
    pub acceptance_tests: Vec<AcceptanceTest>,
    /// 需要记录的指标名（为空时记录全部）
    #[serde(default)]
    pub metrics: Vec<String>,
}

impl TaskBrief {
    pub fn new(objective: impl Into<String>) -> Self {
        Self {
            id: format!("task_{}", uuid::Uuid::new_v4()),
            objective: objective.into(),
            inputs: BTreeMap::new(),
            required_outputs: BTreeMap::new(),
            constraints: Constraints::default(),
            acceptance_tests: Vec::new(),
            metrics: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_input(mut self, name: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(name.into(), value);
        self
    }

    pub fn require_output(mut self, name: impl Into<String>, ty: ValueType) -> Self {
        self.required_outputs.insert(name.into(), ty);
        self
    }

    pub fn with_constraints(mut self, constraints: Constraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn with_cost_limit(mut self, cost_usd: f64) -> Self {
        self.constraints.cost_usd = Some(cost_usd);
        self
    }

    pub fn with_acceptance_test(mut self, test: AcceptanceTest) -> Self {
        self.acceptance_tests.push(test);
        self
    }

    pub fn record_metric(mut self, name: impl Into<String>) -> Self {
        self.metrics.push(name.into());
        self
    }
}
