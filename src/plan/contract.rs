//! ActionContract：计划中的单个节点
//!
//! 由 Planner 创建；补丁会生成同 id、更高 revision 的新契约，旧契约不被修改。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::Severity;
use crate::plan::brief::ValueType;
use crate::plan::StepId;

/// 同步 gate 谓词（可序列化）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "arg", rename_all = "snake_case")]
pub enum GatePredicate {
    /// 观测状态为 Success
    Succeeded,
    /// 输出非 null、非空字符串/对象/数组
    OutputNonEmpty,
    /// 输出对象包含指定字段
    HasField(String),
    /// 输出字段等于给定值
    FieldEquals { field: String, value: Value },
    /// 输出（序列化后）包含指定文本
    OutputContains(String),
    /// 本次调用成本不超过上限
    MaxCost(f64),
    /// 在 Verifier 上注册的自定义谓词
    Custom(String),
}

/// 命名 gate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gate {
    pub name: String,
    pub predicate: GatePredicate,
}

impl Gate {
    pub fn new(name: impl Into<String>, predicate: GatePredicate) -> Self {
        Self {
            name: name.into(),
            predicate,
        }
    }
}

/// 回溯校验失败时的处置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnFail {
    #[serde(default = "default_on_fail_severity")]
    pub severity: Severity,
    /// 为 false 时不重放，直接升级
    #[serde(default = "default_replay")]
    pub replay: bool,
    /// 重放前合并到失败步骤参数中的补丁（例如更严格的参数）
    #[serde(default)]
    pub patch_params: Option<Map<String, Value>>,
}

fn default_on_fail_severity() -> Severity {
    Severity::S1
}

fn default_replay() -> bool {
    true
}

impl Default for OnFail {
    fn default() -> Self {
        Self {
            severity: default_on_fail_severity(),
            replay: default_replay(),
            patch_params: None,
        }
    }
}

/// 回溯校验声明
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrospectSpec {
    pub id: String,
    /// false 表示在步骤提升前同步执行（当作 gate）
    #[serde(default = "default_async", rename = "async")]
    pub is_async: bool,
    /// RetrospectEngine 上注册的检查名
    pub checks: Vec<String>,
    #[serde(default)]
    pub on_fail: OnFail,
}

fn default_async() -> bool {
    true
}

impl RetrospectSpec {
    pub fn new(id: impl Into<String>, checks: Vec<String>) -> Self {
        Self {
            id: id.into(),
            is_async: true,
            checks,
            on_fail: OnFail::default(),
        }
    }

    pub fn on_fail(mut self, on_fail: OnFail) -> Self {
        self.on_fail = on_fail;
        self
    }
}

/// 计划节点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionContract {
    pub id: StepId,
    #[serde(default)]
    pub revision: u32,
    #[serde(default)]
    pub intent: String,
    /// 能力名（在 CapabilityRegistry 中解析）
    pub capability: String,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub inputs: BTreeMap<String, ValueType>,
    #[serde(default)]
    pub outputs: BTreeMap<String, ValueType>,
    #[serde(default)]
    pub depends_on: Vec<StepId>,
    #[serde(default)]
    pub gates: Vec<Gate>,
    #[serde(default)]
    pub retrospects: Vec<RetrospectSpec>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub estimated_cost_usd: f64,
    #[serde(default)]
    pub estimated_latency_ms: u64,
}

impl ActionContract {
    pub fn new(id: impl Into<StepId>, capability: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            revision: 0,
            intent: String::new(),
            capability: capability.into(),
            params: Map::new(),
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            depends_on: Vec::new(),
            gates: Vec::new(),
            retrospects: Vec::new(),
            timeout_ms: None,
            estimated_cost_usd: 0.0,
            estimated_latency_ms: 0,
        }
    }

    pub fn intent(mut self, intent: impl Into<String>) -> Self {
        self.intent = intent.into();
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn input(mut self, name: impl Into<String>, ty: ValueType) -> Self {
        self.inputs.insert(name.into(), ty);
        self
    }

    pub fn output(mut self, name: impl Into<String>, ty: ValueType) -> Self {
        self.outputs.insert(name.into(), ty);
        self
    }

    pub fn depends_on(mut self, step: impl Into<StepId>) -> Self {
        self.depends_on.push(step.into());
        self
    }

    pub fn gate(mut self, gate: Gate) -> Self {
        self.gates.push(gate);
        self
    }

    pub fn retrospect(mut self, spec: RetrospectSpec) -> Self {
        self.retrospects.push(spec);
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    pub fn estimate(mut self, cost_usd: f64, latency_ms: u64) -> Self {
        self.estimated_cost_usd = cost_usd;
        self.estimated_latency_ms = latency_ms;
        self
    }

    /// 内容相同（忽略 revision）
    pub fn same_content(&self, other: &ActionContract) -> bool {
        self.id == other.id
            && self.intent == other.intent
            && self.capability == other.capability
            && self.params == other.params
            && self.inputs == other.inputs
            && self.outputs == other.outputs
            && self.depends_on == other.depends_on
            && self.gates == other.gates
            && self.retrospects == other.retrospects
            && self.timeout_ms == other.timeout_ms
    }

    /// 派生下一 revision（参数合并补丁）
    pub fn with_patched_params(&self, patch: &Map<String, Value>) -> ActionContract {
        let mut next = self.clone();
        for (k, v) in patch {
            next.params.insert(k.clone(), v.clone());
        }
        next.revision = self.revision + 1;
        next
    }

    pub fn async_retrospects(&self) -> impl Iterator<Item = &RetrospectSpec> {
        self.retrospects.iter().filter(|r| r.is_async)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_patched_params_bumps_revision() {
        let base = ActionContract::new("a", "echo").param("mode", json!("fast"));
        let mut patch = Map::new();
        patch.insert("mode".into(), json!("strict"));
        let next = base.with_patched_params(&patch);
        assert_eq!(next.revision, 1);
        assert_eq!(next.params["mode"], json!("strict"));
        assert_eq!(base.params["mode"], json!("fast"));
        assert!(!base.same_content(&next));
    }

    #[test]
    fn test_contract_deserializes_from_brain_shape() {
        let c: ActionContract = serde_json::from_value(json!({
            "id": "fetch",
            "capability": "http",
            "outputs": {"body": "string"},
            "retrospects": [{"id": "audit", "checks": ["schema"]}],
            "gates": [{"name": "has_body", "predicate": {"kind": "has_field", "arg": "body"}}]
        }))
        .unwrap();
        assert_eq!(c.revision, 0);
        assert!(c.retrospects[0].is_async);
        assert!(c.retrospects[0].on_fail.replay);
        assert_eq!(c.gates[0].predicate, GatePredicate::HasField("body".into()));
    }
}
