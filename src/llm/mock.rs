//! Mock LLM 客户端（用于测试与演示，无需 API）
//!
//! 默认把最后一条 User 消息包装成单步 echo 计划；也可预置按顺序返回的响应。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, Message, Role};

/// Mock 客户端
#[derive(Debug, Default)]
pub struct MockLlmClient {
    scripted: Mutex<VecDeque<String>>,
    calls: AtomicU64,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按顺序返回给定响应，用完后回到默认行为
    pub fn with_responses<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            scripted: Mutex::new(responses.into_iter().map(Into::into).collect()),
            calls: AtomicU64::new(0),
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self
            .scripted
            .lock()
            .map_err(|e| format!("mock poisoned: {e}"))?
            .pop_front();
        if let Some(response) = scripted {
            return Ok(response);
        }

        let last_user = messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        let plan = serde_json::json!({
            "steps": [{
                "id": "respond",
                "capability": "echo",
                "intent": "Echo the request",
                "params": { "text": format!("Echo from Mock: {last_user}") }
            }]
        });
        Ok(format!("```json\n{plan}\n```"))
    }
}
