//! LLM 层：补全服务抽象与实现（OpenRouter / Mock）

pub mod mock;
pub mod openrouter;
pub mod traits;

pub use mock::{MockLlmClient, ScriptedLlmClient};
pub use openrouter::{OpenRouterClient, OpenRouterConfig, OPENROUTER_BASE_URL};
pub use traits::{CompletionRequest, LlmClient, LlmError};
