//! 血缘追踪：计划节点的 arena
//!
//! 节点以稳定下标存放在 Vec 中，每个节点带 revision（代）与有效性戳。
//! 计划换版时未变化的节点原样复用（保留有效性），变化节点分配新槽位；
//! 选择性失效建立在 `downstream_closure` 之上。

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::core::PlanError;
use crate::plan::types::{Plan, PlanVersion, StepId};

/// arena 下标
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeIdx(usize);

/// 节点有效性
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Validity {
    /// 尚未产生可信输出
    Unverified,
    /// 在该版本建立了检查点
    Valid(PlanVersion),
    /// 在该版本被失效
    Invalidated(PlanVersion),
}

#[derive(Debug, Clone)]
struct LineageNode {
    step_id: StepId,
    revision: u32,
    introduced_in: PlanVersion,
    deps: Vec<NodeIdx>,
    dependents: Vec<NodeIdx>,
    validity: Validity,
    live: bool,
}

/// 血缘追踪器
#[derive(Debug, Clone, Default)]
pub struct LineageTracker {
    nodes: Vec<LineageNode>,
    index: HashMap<StepId, NodeIdx>,
    /// 当前计划的拓扑序
    topo: Vec<StepId>,
    version: PlanVersion,
}

/// Kahn 拓扑排序；有环时返回环上（无法排序）的节点
pub fn topological_order(plan: &Plan) -> Result<Vec<StepId>, PlanError> {
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for c in plan.contracts() {
        in_degree.entry(c.id.as_str()).or_insert(0);
        for dep in &c.depends_on {
            if !plan.contains(dep) {
                return Err(PlanError::UnknownDependency {
                    step: c.id.clone(),
                    dependency: dep.clone(),
                });
            }
            adjacency.entry(dep.as_str()).or_default().push(c.id.as_str());
            *in_degree.entry(c.id.as_str()).or_insert(0) += 1;
        }
    }

    // 以插入顺序出队，保证结果确定
    let mut queue: VecDeque<&str> = plan
        .step_ids()
        .iter()
        .map(String::as_str)
        .filter(|id| in_degree.get(id).copied() == Some(0))
        .collect();
    let mut order = Vec::with_capacity(plan.len());
    while let Some(id) = queue.pop_front() {
        order.push(id.to_string());
        if let Some(next) = adjacency.get(id) {
            for n in next {
                if let Some(d) = in_degree.get_mut(n) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(n);
                    }
                }
            }
        }
    }

    if order.len() != plan.len() {
        let placed: HashSet<&str> = order.iter().map(String::as_str).collect();
        let cyclic = plan
            .step_ids()
            .iter()
            .filter(|id| !placed.contains(id.as_str()))
            .cloned()
            .collect();
        return Err(PlanError::CyclicDependency(cyclic));
    }
    Ok(order)
}

impl LineageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_plan(plan: &Plan) -> Result<Self, PlanError> {
        let mut tracker = Self::new();
        tracker.rebase(plan)?;
        Ok(tracker)
    }

    pub fn version(&self) -> PlanVersion {
        self.version
    }

    /// 切换到新版本计划，返回需要重新验证的步骤（变化节点及其下游，拓扑序）
    ///
    /// revision 与依赖集合都未变化的节点复用原槽位和有效性。
    pub fn rebase(&mut self, plan: &Plan) -> Result<Vec<StepId>, PlanError> {
        let topo = topological_order(plan)?;

        let mut changed: HashSet<StepId> = HashSet::new();
        let mut next_index: HashMap<StepId, NodeIdx> = HashMap::with_capacity(plan.len());
        for c in plan.contracts() {
            let reuse = self.index.get(&c.id).copied().filter(|idx| {
                let node = &self.nodes[idx.0];
                let old_deps: BTreeSet<&str> = node
                    .deps
                    .iter()
                    .map(|d| self.nodes[d.0].step_id.as_str())
                    .collect();
                let new_deps: BTreeSet<&str> = c.depends_on.iter().map(String::as_str).collect();
                node.live && node.revision == c.revision && old_deps == new_deps
            });
            let idx = match reuse {
                Some(idx) => idx,
                None => {
                    changed.insert(c.id.clone());
                    self.nodes.push(LineageNode {
                        step_id: c.id.clone(),
                        revision: c.revision,
                        introduced_in: plan.version,
                        deps: Vec::new(),
                        dependents: Vec::new(),
                        validity: Validity::Unverified,
                        live: true,
                    });
                    NodeIdx(self.nodes.len() - 1)
                }
            };
            next_index.insert(c.id.clone(), idx);
        }

        // 旧节点中不再使用的标记为非活跃
        for (id, idx) in &self.index {
            if next_index.get(id) != Some(idx) {
                self.nodes[idx.0].live = false;
            }
        }

        for idx in next_index.values() {
            self.nodes[idx.0].deps.clear();
            self.nodes[idx.0].dependents.clear();
        }
        for c in plan.contracts() {
            let idx = next_index[&c.id];
            for dep in &c.depends_on {
                let dep_idx = next_index[dep];
                self.nodes[idx.0].deps.push(dep_idx);
                self.nodes[dep_idx.0].dependents.push(idx);
            }
        }

        self.index = next_index;
        self.topo = topo;
        self.version = plan.version;

        // 变化节点的下游输出都建立在旧输入上，一并作废
        let mut stale: HashSet<StepId> = HashSet::new();
        for id in &changed {
            stale.extend(self.downstream_closure(id));
        }
        for id in &stale {
            let idx = self.index[id];
            if changed.contains(id) {
                continue;
            }
            if matches!(self.nodes[idx.0].validity, Validity::Valid(_)) {
                self.nodes[idx.0].validity = Validity::Unverified;
            }
        }

        Ok(self
            .topo
            .iter()
            .filter(|id| stale.contains(*id))
            .cloned()
            .collect())
    }

    fn node(&self, step: &str) -> Option<&LineageNode> {
        self.index.get(step).map(|idx| &self.nodes[idx.0])
    }

    pub fn contains(&self, step: &str) -> bool {
        self.index.contains_key(step)
    }

    /// 当前计划的拓扑序
    pub fn topological_order(&self) -> &[StepId] {
        &self.topo
    }

    pub fn dependencies(&self, step: &str) -> Vec<StepId> {
        self.node(step)
            .map(|n| n.deps.iter().map(|d| self.nodes[d.0].step_id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn dependents(&self, step: &str) -> Vec<StepId> {
        self.node(step)
            .map(|n| {
                n.dependents
                    .iter()
                    .map(|d| self.nodes[d.0].step_id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 下游闭包（含自身），按拓扑序返回；只在当前版本内计算
    pub fn downstream_closure(&self, step: &str) -> Vec<StepId> {
        let reached = self.walk(step, |n| &n.dependents);
        self.topo.iter().filter(|id| reached.contains(*id)).cloned().collect()
    }

    /// 上游闭包（含自身），按拓扑序返回
    pub fn upstream_closure(&self, step: &str) -> Vec<StepId> {
        let reached = self.walk(step, |n| &n.deps);
        self.topo.iter().filter(|id| reached.contains(*id)).cloned().collect()
    }

    fn walk<F>(&self, step: &str, edges: F) -> HashSet<StepId>
    where
        F: Fn(&LineageNode) -> &Vec<NodeIdx>,
    {
        let mut seen = HashSet::new();
        let Some(start) = self.index.get(step).copied() else {
            return seen;
        };
        let mut stack = vec![start];
        while let Some(idx) = stack.pop() {
            let node = &self.nodes[idx.0];
            if seen.insert(node.step_id.clone()) {
                stack.extend(edges(node).iter().copied());
            }
        }
        seen
    }

    pub fn generation(&self, step: &str) -> Option<u32> {
        self.node(step).map(|n| n.revision)
    }

    pub fn introduced_in(&self, step: &str) -> Option<PlanVersion> {
        self.node(step).map(|n| n.introduced_in)
    }

    pub fn validity(&self, step: &str) -> Option<Validity> {
        self.node(step).map(|n| n.validity)
    }

    pub fn is_valid(&self, step: &str) -> bool {
        matches!(self.validity(step), Some(Validity::Valid(_)))
    }

    pub fn mark_valid(&mut self, step: &str, version: PlanVersion) {
        if let Some(idx) = self.index.get(step).copied() {
            self.nodes[idx.0].validity = Validity::Valid(version);
        }
    }

    /// 失效下游闭包，返回受影响步骤（拓扑序）
    pub fn invalidate_closure(&mut self, step: &str) -> Vec<StepId> {
        let closure = self.downstream_closure(step);
        for id in &closure {
            let idx = self.index[id];
            self.nodes[idx.0].validity = Validity::Invalidated(self.version);
        }
        closure
    }

    /// 当前仍有效的步骤（拓扑序）
    pub fn valid_steps(&self) -> Vec<StepId> {
        self.topo.iter().filter(|id| self.is_valid(id)).cloned().collect()
    }

    /// arena 中累计分配的节点数（含历史版本）
    pub fn arena_len(&self) -> usize {
        self.nodes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::ActionContract;
    use serde_json::Map;
    use std::sync::Arc;

    fn diamond() -> Plan {
        Plan::new(
            "t",
            1,
            vec![
                ActionContract::new("a", "echo"),
                ActionContract::new("b", "echo"),
                ActionContract::new("c", "echo").depends_on("a").depends_on("b"),
                ActionContract::new("d", "echo").depends_on("c"),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_topological_order_is_deterministic() {
        let tracker = LineageTracker::from_plan(&diamond()).unwrap();
        assert_eq!(tracker.topological_order(), &["a", "b", "c", "d"]);
    }

    #[test]
    fn test_cycle_rejected() {
        let plan = Plan::new(
            "t",
            1,
            vec![
                ActionContract::new("x", "echo").depends_on("y"),
                ActionContract::new("y", "echo").depends_on("x"),
                ActionContract::new("z", "echo"),
            ],
        )
        .unwrap();
        let err = LineageTracker::from_plan(&plan).unwrap_err();
        assert_eq!(err, PlanError::CyclicDependency(vec!["x".into(), "y".into()]));
    }

    #[test]
    fn test_downstream_closure_skips_siblings() {
        let tracker = LineageTracker::from_plan(&diamond()).unwrap();
        assert_eq!(tracker.downstream_closure("a"), vec!["a", "c", "d"]);
        assert_eq!(tracker.upstream_closure("c"), vec!["a", "b", "c"]);
        assert_eq!(tracker.dependents("b"), vec!["c"]);
    }

    #[test]
    fn test_invalidate_closure_keeps_sibling_valid() {
        let mut tracker = LineageTracker::from_plan(&diamond()).unwrap();
        for s in ["a", "b", "c", "d"] {
            tracker.mark_valid(s, 1);
        }
        let affected = tracker.invalidate_closure("a");
        assert_eq!(affected, vec!["a", "c", "d"]);
        assert!(tracker.is_valid("b"));
        assert_eq!(tracker.validity("c"), Some(Validity::Invalidated(1)));
        assert_eq!(tracker.valid_steps(), vec!["b"]);
    }

    #[test]
    fn test_rebase_reuses_unchanged_nodes() {
        let plan = diamond();
        let mut tracker = LineageTracker::from_plan(&plan).unwrap();
        for s in ["a", "b", "c", "d"] {
            tracker.mark_valid(s, 1);
        }
        let allocated = tracker.arena_len();

        let new_a = Arc::new(plan.get("a").unwrap().with_patched_params(&Map::new()));
        let next = plan.derive(2, vec![new_a], vec![], &[]).unwrap();
        let stale = tracker.rebase(&next).unwrap();

        assert_eq!(stale, vec!["a", "c", "d"]);
        assert_eq!(tracker.arena_len(), allocated + 1);
        assert!(tracker.is_valid("b"));
        assert_eq!(tracker.introduced_in("b"), Some(1));
        assert_eq!(tracker.introduced_in("a"), Some(2));
        assert_eq!(tracker.generation("a"), Some(1));
        assert!(!tracker.is_valid("c"));
    }
}
