//! 任务快照：进程重启后恢复执行所需的最小状态面
//!
//! 保存 brief、当前计划、ExecutionState、检查点、观测日志与挂起的升级；
//! 存储格式为每任务一个 JSON 文件。

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::coordinator::EscalationRequest;
use crate::core::{CheckpointStore, ExecutionState, Observation};
use crate::plan::{Plan, TaskBrief};
use crate::verify::InvalidationRecord;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub brief: TaskBrief,
    #[serde(default)]
    pub plan: Option<Plan>,
    pub state: ExecutionState,
    #[serde(default)]
    pub checkpoints: CheckpointStore,
    #[serde(default)]
    pub observations: Vec<Observation>,
    #[serde(default)]
    pub escalation: Option<EscalationRequest>,
    #[serde(default)]
    pub invalidations: Vec<InvalidationRecord>,
    #[serde(default)]
    pub hints: Vec<String>,
    pub saved_at: i64,
}

impl TaskSnapshot {
    pub fn task_id(&self) -> &str {
        &self.brief.id
    }
}

/// 快照目录
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, task_id: &str) -> PathBuf {
        let safe: String = task_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }

    pub fn save(&self, snapshot: &TaskSnapshot) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create snapshot dir {}", self.dir.display()))?;
        let path = self.path_for(snapshot.task_id());
        let body = serde_json::to_string_pretty(snapshot).context("serialize snapshot")?;
        // 先写临时文件再重命名，避免留下半个快照
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, body).with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("rename to {}", path.display()))?;
        tracing::info!(task = %snapshot.task_id(), path = %path.display(), "Snapshot saved");
        Ok(path)
    }

    pub fn load(&self, task_id: &str) -> Result<TaskSnapshot> {
        let path = self.path_for(task_id);
        let body = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        serde_json::from_str(&body).with_context(|| format!("parse snapshot {}", path.display()))
    }

    /// 已保存的任务 id（按名称排序）
    pub fn list(&self) -> Result<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir).with_context(|| format!("read dir {}", self.dir.display()))? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub fn remove(&self, task_id: &str) -> Result<()> {
        let path = self.path_for(task_id);
        if path.exists() {
            fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{ActionContract, Constraints};

    fn snapshot() -> TaskSnapshot {
        let brief = TaskBrief::new("demo").with_id("task-1");
        let plan = Plan::new("task-1", 1, vec![ActionContract::new("a", "echo")]).unwrap();
        let mut state = ExecutionState::new("task-1", Constraints::default());
        state.apply_plan(&plan, &[]).unwrap();
        TaskSnapshot {
            brief,
            plan: Some(plan),
            state,
            checkpoints: CheckpointStore::new(),
            observations: Vec::new(),
            escalation: None,
            invalidations: Vec::new(),
            hints: vec!["try harder".into()],
            saved_at: 0,
        }
    }

    #[test]
    fn test_save_load_list_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("snaps"));
        assert!(store.list().unwrap().is_empty());

        store.save(&snapshot()).unwrap();
        assert_eq!(store.list().unwrap(), vec!["task-1"]);

        let loaded = store.load("task-1").unwrap();
        assert_eq!(loaded.state.plan_version, 1);
        assert_eq!(loaded.plan.unwrap().step_ids(), ["a".to_string()]);
        assert_eq!(loaded.hints, vec!["try harder"]);

        store.remove("task-1").unwrap();
        assert!(store.load("task-1").is_err());
    }
}
