//! 计划类型：Plan（版本化的契约集合）与补丁操作
//!
//! Plan 内部以 `Arc<ActionContract>` 为节点，补丁只替换受影响的节点，
//! 其余节点在版本之间共享同一份内存（结构共享）。

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::PlanError;
use crate::plan::contract::ActionContract;

pub type StepId = String;
pub type PlanVersion = u64;

/// 补丁操作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PatchOp {
    /// 新增节点
    AddStep { contract: ActionContract },
    /// 合并替换参数（revision + 1）
    ReplaceParams {
        step: StepId,
        params: Map<String, Value>,
    },
    /// 把依赖边 from -> step 改为 to -> step
    RerouteEdge {
        step: StepId,
        from: StepId,
        to: StepId,
    },
    /// 删除无下游的节点
    RemoveStep { step: StepId },
}

/// 版本化计划（DAG）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub task_id: String,
    pub version: PlanVersion,
    /// 选中候选的标签
    #[serde(default)]
    pub label: String,
    /// 节点插入顺序
    order: Vec<StepId>,
    contracts: HashMap<StepId, Arc<ActionContract>>,
}

impl Plan {
    /// 由契约列表构造；检查 id 唯一与依赖存在（环检测由 LineageTracker 负责）
    pub fn new(
        task_id: impl Into<String>,
        version: PlanVersion,
        contracts: Vec<ActionContract>,
    ) -> Result<Self, PlanError> {
        Self::from_shared(task_id, version, contracts.into_iter().map(Arc::new).collect())
    }

    pub fn from_shared(
        task_id: impl Into<String>,
        version: PlanVersion,
        contracts: Vec<Arc<ActionContract>>,
    ) -> Result<Self, PlanError> {
        if contracts.is_empty() {
            return Err(PlanError::EmptyPlan);
        }
        let mut order = Vec::with_capacity(contracts.len());
        let mut map = HashMap::with_capacity(contracts.len());
        for c in contracts {
            if map.contains_key(&c.id) {
                return Err(PlanError::DuplicateStep(c.id.clone()));
            }
            order.push(c.id.clone());
            map.insert(c.id.clone(), c);
        }
        let plan = Self {
            task_id: task_id.into(),
            version,
            label: String::new(),
            order,
            contracts: map,
        };
        plan.check_dependencies()?;
        Ok(plan)
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    fn check_dependencies(&self) -> Result<(), PlanError> {
        for c in self.contracts() {
            for dep in &c.depends_on {
                if !self.contracts.contains_key(dep) {
                    return Err(PlanError::UnknownDependency {
                        step: c.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, step: &str) -> Option<&Arc<ActionContract>> {
        self.contracts.get(step)
    }

    pub fn contains(&self, step: &str) -> bool {
        self.contracts.contains_key(step)
    }

    pub fn step_ids(&self) -> &[StepId] {
        &self.order
    }

    /// 按插入顺序遍历
    pub fn contracts(&self) -> impl Iterator<Item = &Arc<ActionContract>> {
        self.order.iter().filter_map(|id| self.contracts.get(id))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn estimated_cost(&self) -> f64 {
        self.contracts().map(|c| c.estimated_cost_usd).sum()
    }

    /// 关键路径延迟估计（最长依赖链上的 estimated_latency_ms 之和）
    pub fn estimated_latency_ms(&self) -> u64 {
        let mut memo: HashMap<&str, u64> = HashMap::new();
        fn finish<'a>(plan: &'a Plan, id: &'a str, memo: &mut HashMap<&'a str, u64>, depth: usize) -> u64 {
            if let Some(v) = memo.get(id) {
                return *v;
            }
            let Some(c) = plan.contracts.get(id) else {
                return 0;
            };
            // 环由 LineageTracker 拒绝；这里只防止无限递归
            if depth > plan.order.len() {
                return c.estimated_latency_ms;
            }
            let start = c
                .depends_on
                .iter()
                .map(|d| finish(plan, d, memo, depth + 1))
                .max()
                .unwrap_or(0);
            let total = start + c.estimated_latency_ms;
            memo.insert(id, total);
            total
        }
        self.order
            .iter()
            .map(|id| finish(self, id, &mut memo, 0))
            .max()
            .unwrap_or(0)
    }

    /// 基于本计划派生新版本（只替换给定节点，其他节点共享）
    pub(crate) fn derive(
        &self,
        version: PlanVersion,
        replaced: Vec<Arc<ActionContract>>,
        added: Vec<Arc<ActionContract>>,
        removed: &[StepId],
    ) -> Result<Plan, PlanError> {
        let mut contracts = self.contracts.clone();
        let mut order: Vec<StepId> = self
            .order
            .iter()
            .filter(|id| !removed.contains(id))
            .cloned()
            .collect();
        for id in removed {
            contracts.remove(id);
        }
        for c in replaced {
            if !contracts.contains_key(&c.id) {
                return Err(PlanError::UnknownStep(c.id.clone()));
            }
            contracts.insert(c.id.clone(), c);
        }
        for c in added {
            if contracts.contains_key(&c.id) {
                return Err(PlanError::DuplicateStep(c.id.clone()));
            }
            order.push(c.id.clone());
            contracts.insert(c.id.clone(), c);
        }
        let plan = Plan {
            task_id: self.task_id.clone(),
            version,
            label: self.label.clone(),
            order,
            contracts,
        };
        plan.check_dependencies()?;
        Ok(plan)
    }
}
