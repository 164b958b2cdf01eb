//! 检查点：最后一次确认有效的步骤输出
//!
//! 只有当所有依赖都持有有效检查点时才能为步骤建立检查点，
//! 因此存储中的集合始终是 DAG 的一个一致切面，可作为回滚目标。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{CoordinatorError, Observation};
use crate::plan::{PlanVersion, StepId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub step_id: StepId,
    pub plan_version: PlanVersion,
    pub revision: u32,
    pub attempt: u32,
    pub output: Value,
    pub input: Value,
    pub created_at: i64,
}

impl Checkpoint {
    pub fn from_observation(obs: &Observation) -> Self {
        Self {
            step_id: obs.step_id.clone(),
            plan_version: obs.plan_version,
            revision: obs.revision,
            attempt: obs.attempt,
            output: obs.output.clone(),
            input: obs.input.clone(),
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// 检查点存储（按步骤）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointStore {
    checkpoints: BTreeMap<StepId, Checkpoint>,
}

impl CheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 建立检查点；任一依赖缺少不晚于本版本的检查点时拒绝
    pub fn create(
        &mut self,
        checkpoint: Checkpoint,
        dependencies: &[StepId],
    ) -> Result<&Checkpoint, CoordinatorError> {
        let missing: Vec<StepId> = dependencies
            .iter()
            .filter(|d| {
                self.checkpoints
                    .get(*d)
                    .map(|c| c.plan_version > checkpoint.plan_version)
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(CoordinatorError::CheckpointCausality {
                step: checkpoint.step_id.clone(),
                missing,
            });
        }
        let step = checkpoint.step_id.clone();
        self.checkpoints.insert(step.clone(), checkpoint);
        Ok(&self.checkpoints[&step])
    }

    pub fn get(&self, step: &str) -> Option<&Checkpoint> {
        self.checkpoints.get(step)
    }

    pub fn contains(&self, step: &str) -> bool {
        self.checkpoints.contains_key(step)
    }

    /// 删除一组步骤的检查点，返回实际删除的
    pub fn invalidate(&mut self, steps: &[StepId]) -> Vec<Checkpoint> {
        steps
            .iter()
            .filter_map(|s| self.checkpoints.remove(s))
            .collect()
    }

    /// 只保留给定集合中的步骤
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&str) -> bool,
    {
        self.checkpoints.retain(|k, _| keep(k));
    }

    pub fn iter(&self) -> impl Iterator<Item = &Checkpoint> {
        self.checkpoints.values()
    }

    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::observation::test_observation;

    #[test]
    fn test_create_requires_dependency_checkpoints() {
        let mut store = CheckpointStore::new();
        let c = Checkpoint::from_observation(&test_observation("c", 1, 1));
        let err = store.create(c, &["a".into(), "b".into()]).unwrap_err();
        match err {
            CoordinatorError::CheckpointCausality { step, missing } => {
                assert_eq!(step, "c");
                assert_eq!(missing, vec!["a", "b"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_dependency_from_earlier_version_is_accepted() {
        let mut store = CheckpointStore::new();
        store
            .create(Checkpoint::from_observation(&test_observation("a", 1, 1)), &[])
            .unwrap();
        store
            .create(
                Checkpoint::from_observation(&test_observation("c", 2, 1)),
                &["a".into()],
            )
            .unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_dependency_from_later_version_is_rejected() {
        let mut store = CheckpointStore::new();
        store
            .create(Checkpoint::from_observation(&test_observation("a", 3, 1)), &[])
            .unwrap();
        let result = store.create(
            Checkpoint::from_observation(&test_observation("c", 2, 1)),
            &["a".into()],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_invalidate_returns_removed() {
        let mut store = CheckpointStore::new();
        store
            .create(Checkpoint::from_observation(&test_observation("a", 1, 1)), &[])
            .unwrap();
        let removed = store.invalidate(&["a".into(), "zz".into()]);
        assert_eq!(removed.len(), 1);
        assert!(store.is_empty());
    }
}
