//! Planning brain：把目标转成候选计划文本的外部协作方
//!
//! Planner 只依赖 `PlanningBrain::propose`；返回值是不可靠的文本，由 Planner 负责校验。

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::llm::{LlmClient, Message};
use crate::plan::ValueType;
use crate::planner::PlanCandidate;

/// 传给 brain 的上下文
#[derive(Debug, Clone, Default)]
pub struct PlanningContext {
    /// 能力 schema JSON
    pub capability_schema: String,
    pub inputs: BTreeMap<String, Value>,
    pub required_outputs: BTreeMap<String, ValueType>,
    /// 期望的候选数量
    pub candidates: usize,
    /// 重规划时的当前计划（JSON）
    pub current_plan: Option<String>,
    /// 失败说明、运维备注等提示
    pub hints: Vec<String>,
}

impl PlanningContext {
    /// 渲染为 user 消息正文
    pub fn render(&self, objective: &str) -> String {
        let mut out = format!("Objective: {objective}\n\nAvailable capabilities:\n{}\n", self.capability_schema);
        if !self.inputs.is_empty() {
            let inputs = serde_json::to_string(&self.inputs).unwrap_or_default();
            out.push_str(&format!("\nInputs: {inputs}\n"));
        }
        if !self.required_outputs.is_empty() {
            let outputs = serde_json::to_string(&self.required_outputs).unwrap_or_default();
            out.push_str(&format!("Required outputs: {outputs}\n"));
        }
        out.push_str(&format!("\nPropose up to {} candidate plans.\n", self.candidates.max(1)));
        if let Some(plan) = &self.current_plan {
            out.push_str(&format!("\nCurrent plan:\n{plan}\n"));
        }
        if !self.hints.is_empty() {
            out.push_str("\nContext from execution:\n");
            for hint in &self.hints {
                out.push_str(&format!("- {hint}\n"));
            }
        }
        out
    }
}

#[async_trait]
pub trait PlanningBrain: Send + Sync {
    async fn propose(&self, objective: &str, context: &PlanningContext) -> Result<String, String>;
}

/// 基于 LlmClient 的 brain：system prompt + 渲染后的上下文
pub struct LlmPlanningBrain {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
}

impl LlmPlanningBrain {
    pub fn new(llm: Arc<dyn LlmClient>, system_prompt: impl Into<String>) -> Self {
        Self {
            llm,
            system_prompt: system_prompt.into(),
        }
    }

    /// 获取 LLM 累计 token 使用统计
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.token_usage()
    }
}

#[async_trait]
impl PlanningBrain for LlmPlanningBrain {
    async fn propose(&self, objective: &str, context: &PlanningContext) -> Result<String, String> {
        let messages = vec![
            Message::system(self.system_prompt.clone()),
            Message::user(context.render(objective)),
        ];
        self.llm.complete(&messages).await
    }
}

/// 预先写好的候选（单路径部署与测试用）
///
/// 每次 propose 依次返回下一组候选；最后一组会被重复返回。
pub struct FixedPlanBrain {
    rounds: Mutex<VecDeque<String>>,
    last: Mutex<Option<String>>,
}

impl FixedPlanBrain {
    pub fn from_candidates(candidates: Vec<PlanCandidate>) -> Self {
        Self::from_rounds(vec![candidates])
    }

    /// 多轮提案：第 n 次 propose 返回第 n 组
    pub fn from_rounds(rounds: Vec<Vec<PlanCandidate>>) -> Self {
        let rounds = rounds
            .into_iter()
            .map(|candidates| serde_json::json!({ "candidates": candidates }).to_string())
            .collect();
        Self {
            rounds: Mutex::new(rounds),
            last: Mutex::new(None),
        }
    }

    /// 原始文本（用于测试解析容错）
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            rounds: Mutex::new(VecDeque::from(vec![text.into()])),
            last: Mutex::new(None),
        }
    }
}

#[async_trait]
impl PlanningBrain for FixedPlanBrain {
    async fn propose(&self, _objective: &str, _context: &PlanningContext) -> Result<String, String> {
        let next = self
            .rounds
            .lock()
            .map_err(|e| format!("brain poisoned: {e}"))?
            .pop_front();
        let mut last = self.last.lock().map_err(|e| format!("brain poisoned: {e}"))?;
        match next {
            Some(text) => {
                *last = Some(text.clone());
                Ok(text)
            }
            None => last.clone().ok_or_else(|| "no plan available".to_string()),
        }
    }
}
