//! 计划构建器
//!
//! 提供流畅的 API 来构建计划（宿主直接提供计划或测试时使用）

use crate::core::PlanError;
use crate::plan::contract::ActionContract;
use crate::plan::lineage::topological_order;
use crate::plan::types::{Plan, PlanVersion, StepId};

/// 计划构建器
pub struct PlanBuilder {
    task_id: String,
    version: PlanVersion,
    label: String,
    steps: Vec<ActionContract>,
}

impl PlanBuilder {
    /// 创建新的计划构建器
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            version: 1,
            label: String::new(),
            steps: Vec::new(),
        }
    }

    /// 设置版本号
    pub fn version(mut self, version: PlanVersion) -> Self {
        self.version = version;
        self
    }

    /// 设置标签
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// 添加步骤
    pub fn step(mut self, contract: ActionContract) -> Self {
        self.steps.push(contract);
        self
    }

    /// 设置顺序依赖
    pub fn sequential(mut self, from: impl Into<StepId>, to: impl Into<StepId>) -> Self {
        let to_id = to.into();
        let from_id = from.into();
        if let Some(step) = self.steps.iter_mut().find(|s| s.id == to_id) {
            if !step.depends_on.contains(&from_id) {
                step.depends_on.push(from_id);
            }
        }
        self
    }

    /// 设置 AND 依赖（所有前置步骤）
    pub fn depends_on_all(mut self, step_id: impl Into<StepId>, deps: Vec<StepId>) -> Self {
        let id = step_id.into();
        if let Some(step) = self.steps.iter_mut().find(|s| s.id == id) {
            for dep in deps {
                if !step.depends_on.contains(&dep) {
                    step.depends_on.push(dep);
                }
            }
        }
        self
    }

    /// 构建计划（拒绝环）
    pub fn build(self) -> Result<Plan, PlanError> {
        let plan = Plan::new(self.task_id, self.version, self.steps)?.with_label(self.label);
        topological_order(&plan)?;
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_diamond() {
        let plan = PlanBuilder::new("task1")
            .label("diamond")
            .step(ActionContract::new("a", "echo"))
            .step(ActionContract::new("b", "echo"))
            .step(ActionContract::new("c", "echo"))
            .depends_on_all("c", vec!["a".to_string(), "b".to_string()])
            .build()
            .expect("Failed to build plan");

        assert_eq!(plan.version, 1);
        assert_eq!(plan.len(), 3);
        assert_eq!(plan.get("c").unwrap().depends_on, vec!["a", "b"]);
    }

    #[test]
    fn test_build_rejects_cycle() {
        let result = PlanBuilder::new("task1")
            .step(ActionContract::new("a", "echo"))
            .step(ActionContract::new("b", "echo"))
            .sequential("a", "b")
            .sequential("b", "a")
            .build();

        assert!(matches!(result, Err(PlanError::CyclicDependency(_))));
    }

    #[test]
    fn test_build_empty_fails() {
        assert_eq!(PlanBuilder::new("t").build().unwrap_err(), PlanError::EmptyPlan);
    }
}
