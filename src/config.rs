//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__POLICY__MAX_RETRIES=5`）。
//! 每个字段都有默认值，空配置也合法。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub policy: PolicySection,
    pub executor: ExecutorSection,
    pub retrospect: RetrospectSection,
    pub planner: PlannerSection,
    pub persistence: PersistenceSection,
}

/// [policy] 段：重试 / 重规划 / 升级阈值
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolicySection {
    pub max_retries: u32,
    pub max_replans: u32,
    /// 计划置信度低于该值时才重规划
    pub confidence_threshold: f64,
    /// 同一步骤因回溯校验失败而重放的上限，超出后升级 S1
    pub max_integrity_replays: u32,
    /// gate 未通过是否按暂时性失败重试
    pub retry_gate_rejections: bool,
}

impl Default for PolicySection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_replans: 2,
            confidence_threshold: 0.5,
            max_integrity_replays: 1,
            retry_gate_rejections: true,
        }
    }
}

/// [executor] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
    /// 同时执行的步骤上限
    pub max_concurrency: usize,
    /// 契约未声明 timeout_ms 时的默认超时
    pub default_step_timeout_ms: u64,
    /// 重试退避基数（0 表示立即重试）
    pub retry_backoff_ms: u64,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            default_step_timeout_ms: 60_000,
            retry_backoff_ms: 0,
        }
    }
}

/// [retrospect] 段：回溯校验的独立工作池
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrospectSection {
    pub max_concurrency: usize,
    /// 单次检查超时，超时视为失败
    pub check_timeout_ms: u64,
}

impl Default for RetrospectSection {
    fn default() -> Self {
        Self {
            max_concurrency: 2,
            check_timeout_ms: 120_000,
        }
    }
}

/// [planner] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlannerSection {
    /// 向 planning brain 请求的候选数量
    pub candidates: usize,
    /// 只取第一个可用候选，跳过比较
    pub single_path: bool,
    pub system_prompt: String,
}

fn default_system_prompt() -> String {
    "You decompose an objective into a DAG of steps. Reply with JSON only: \
     {\"candidates\":[{\"label\":\"...\",\"steps\":[{\"id\":\"...\",\"capability\":\"...\",\
     \"intent\":\"...\",\"params\":{},\"inputs\":{},\"outputs\":{},\"depends_on\":[],\
     \"estimated_cost_usd\":0.0,\"estimated_latency_ms\":0}]}]}. \
     Only use capabilities from the provided schema."
        .to_string()
}

impl Default for PlannerSection {
    fn default() -> Self {
        Self {
            candidates: 3,
            single_path: false,
            system_prompt: default_system_prompt(),
        }
    }
}

/// [persistence] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceSection {
    /// 任务快照目录
    pub snapshot_dir: PathBuf,
}

impl Default for PersistenceSection {
    fn default() -> Self {
        Self {
            snapshot_dir: PathBuf::from("./snapshots"),
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.policy.max_retries, 3);
        assert_eq!(cfg.policy.max_replans, 2);
        assert_eq!(cfg.executor.max_concurrency, 4);
        assert_eq!(cfg.retrospect.max_concurrency, 2);
        assert!(!cfg.planner.single_path);
    }

    #[test]
    fn test_load_explicit_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[policy]\nmax_retries = 7\n\n[executor]\nmax_concurrency = 1").unwrap();
        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.policy.max_retries, 7);
        assert_eq!(cfg.policy.max_replans, 2);
        assert_eq!(cfg.executor.max_concurrency, 1);
        assert_eq!(cfg.executor.default_step_timeout_ms, 60_000);
    }
}
