//! 能力注册表
//!
//! 所有 agent / tool 实现 Capability trait（name / spec / invoke / compensate），
//! 由 CapabilityRegistry 按名注册与解析；注册表作为显式对象注入 Planner 与 Executor。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::core::CapabilityError;
use crate::plan::{StepId, ValueType};

/// 能力声明：输入输出契约与副作用属性
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// 接受的输入（为空表示不限）
    #[serde(default)]
    pub inputs: BTreeMap<String, ValueType>,
    /// 产出的输出（为空表示不限）
    #[serde(default)]
    pub outputs: BTreeMap<String, ValueType>,
    /// 重复调用无额外副作用
    #[serde(default)]
    pub idempotent: bool,
    /// 提供补偿动作
    #[serde(default)]
    pub compensable: bool,
}

impl CapabilitySpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            idempotent: false,
            compensable: false,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
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

    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    pub fn compensable(mut self, compensable: bool) -> Self {
        self.compensable = compensable;
        self
    }

    /// 重试不会产生重复副作用
    pub fn safe_to_retry(&self) -> bool {
        self.idempotent || self.compensable
    }
}

/// 一次调用请求
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub step_id: StepId,
    pub params: Map<String, Value>,
    /// 由上游输出与 brief 输入解析出的声明输入
    pub inputs: Map<String, Value>,
    pub cancel: CancellationToken,
}

impl InvocationRequest {
    /// 补偿与审计使用的参数快照
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "params": Value::Object(self.params.clone()),
            "inputs": Value::Object(self.inputs.clone()),
        })
    }
}

/// 调用结果
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub output: Value,
    pub cost_usd: f64,
    pub tokens: u64,
    /// false 表示 Partial
    pub complete: bool,
    pub raw: Option<Value>,
}

impl Invocation {
    pub fn new(output: Value) -> Self {
        Self {
            output,
            cost_usd: 0.0,
            tokens: 0,
            complete: true,
            raw: None,
        }
    }

    pub fn with_cost(mut self, cost_usd: f64) -> Self {
        self.cost_usd = cost_usd;
        self
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn partial(mut self) -> Self {
        self.complete = false;
        self
    }

    pub fn with_raw(mut self, raw: Value) -> Self {
        self.raw = Some(raw);
        self
    }
}

/// 能力 trait：声明 + 异步调用 + 可选补偿
#[async_trait]
pub trait Capability: Send + Sync {
    /// 能力名称（计划中的 capability 字段）
    fn name(&self) -> &str;

    /// 输入输出契约
    fn spec(&self) -> CapabilitySpec;

    /// 执行；应在 `request.cancel` 触发后尽快返回 Cancelled
    async fn invoke(&self, request: InvocationRequest) -> Result<Invocation, CapabilityError>;

    /// 撤销一次已完成调用的副作用
    async fn compensate(&self, _input: &Value, _output: &Value) -> Result<(), CapabilityError> {
        Err(CapabilityError::CompensationUnsupported(self.name().to_string()))
    }
}

/// 能力注册表：按名称存储 Arc<dyn Capability>
#[derive(Default, Clone)]
pub struct CapabilityRegistry {
    capabilities: HashMap<String, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, capability: impl Capability + 'static) {
        let name = capability.name().to_string();
        self.capabilities.insert(name, Arc::new(capability));
    }

    pub fn register_arc(&mut self, capability: Arc<dyn Capability>) {
        self.capabilities
            .insert(capability.name().to_string(), capability);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.capabilities.get(name).cloned()
    }

    /// 解析能力声明
    pub fn resolve(&self, name: &str) -> Result<CapabilitySpec, CapabilityError> {
        self.capabilities
            .get(name)
            .map(|c| c.spec())
            .ok_or_else(|| CapabilityError::NotFound(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.capabilities.keys().cloned().collect();
        names.sort();
        names
    }

    /// 生成能力 schema JSON，供 planning brain 的 prompt 使用
    pub fn to_schema_json(&self) -> String {
        let specs: Vec<CapabilitySpec> = self
            .names()
            .iter()
            .filter_map(|n| self.capabilities.get(n).map(|c| c.spec()))
            .collect();
        serde_json::to_string_pretty(&specs).unwrap_or_else(|_| "[]".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::EchoCapability;

    #[test]
    fn test_resolve_known_and_unknown() {
        let mut registry = CapabilityRegistry::new();
        registry.register(EchoCapability);
        assert_eq!(registry.resolve("echo").unwrap().name, "echo");
        assert_eq!(
            registry.resolve("nonexistent_tool").unwrap_err(),
            CapabilityError::NotFound("nonexistent_tool".into())
        );
    }

    #[test]
    fn test_schema_json_lists_specs() {
        let mut registry = CapabilityRegistry::new();
        registry.register(EchoCapability);
        let json: Value = serde_json::from_str(&registry.to_schema_json()).unwrap();
        assert_eq!(json[0]["name"], "echo");
        assert_eq!(json[0]["idempotent"], true);
    }

    #[test]
    fn test_safe_to_retry() {
        assert!(CapabilitySpec::new("x").idempotent(true).safe_to_retry());
        assert!(CapabilitySpec::new("x").compensable(true).safe_to_retry());
        assert!(!CapabilitySpec::new("x").safe_to_retry());
    }
}
