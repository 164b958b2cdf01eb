//! LLM 层：planning brain 使用的文本补全抽象与 Mock 实现

pub mod message;
pub mod mock;
pub mod traits;

pub use message::{Message, Role};
pub use mock::MockLlmClient;
pub use traits::LlmClient;
