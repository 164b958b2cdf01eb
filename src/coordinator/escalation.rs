//! 升级：挂起自动执行，向运维方请求决策
//!
//! 升级不是崩溃。Coordinator 在升级时停止派发、排空在途步骤，
//! 然后把 EscalationRequest 交给 OperatorChannel；拿到 OperatorDecision 后从挂起点继续。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::core::{BudgetLedger, Severity};
use crate::plan::{Constraints, PlanVersion, StepId};

/// 升级请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRequest {
    pub task_id: String,
    pub plan_version: PlanVersion,
    pub severity: Severity,
    /// 人类可读的说明
    pub reason: String,
    /// 涉及的步骤血缘
    pub implicated: Vec<StepId>,
    pub budget: BudgetLedger,
    pub limits: Constraints,
    pub raised_at: i64,
}

/// 运维方决策
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum OperatorDecision {
    /// 原样继续；失效步骤重新执行，涉及步骤的重试计数清零
    Resume,
    /// 替换给出的限额后继续
    ExtendBudget {
        #[serde(default)]
        cost_usd: Option<f64>,
        #[serde(default)]
        latency_sec: Option<f64>,
        #[serde(default)]
        max_tokens: Option<u64>,
    },
    /// 带提示重新规划（不计入自动重规划次数）
    Replan { note: String },
    /// 终止任务
    Abort { reason: String },
}

/// 升级通道
#[async_trait]
pub trait OperatorChannel: Send + Sync {
    /// 通知运维方并等待决策；可以任意晚返回
    async fn notify(&self, request: EscalationRequest) -> Result<OperatorDecision, String>;
}

/// 等待回复的升级
#[derive(Debug)]
pub struct PendingDecision {
    pub request: EscalationRequest,
    reply: oneshot::Sender<OperatorDecision>,
}

impl PendingDecision {
    /// 回复决策；Coordinator 已不再等待时原样返回
    pub fn decide(self, decision: OperatorDecision) -> Result<(), OperatorDecision> {
        self.reply.send(decision)
    }
}

/// 基于 mpsc / oneshot 的进程内升级通道
#[derive(Clone)]
pub struct ChannelOperator {
    tx: mpsc::Sender<PendingDecision>,
}

impl ChannelOperator {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<PendingDecision>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl OperatorChannel for ChannelOperator {
    async fn notify(&self, request: EscalationRequest) -> Result<OperatorDecision, String> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PendingDecision { request, reply })
            .await
            .map_err(|_| "operator channel closed".to_string())?;
        rx.await
            .map_err(|_| "operator dropped the escalation without a decision".to_string())
    }
}
