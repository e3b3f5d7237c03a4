//! 补全服务抽象
//!
//! 所有后端（OpenRouter / Mock）实现 LlmClient：对指定候选模型做一次非流式补全。
//! 失败必须带分类（LlmError::class），派发器据此决定重试、换候选还是终止。

use async_trait::async_trait;
use thiserror::Error;

use crate::core::FailureClass;
use crate::memory::Message;

/// 一次补全请求：候选目标（模型标识）+ 有序消息列表
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletionRequest {
    pub candidate: String,
    pub messages: Vec<Message>,
}

/// 单次调用的错误（已分类）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("Rate limited")]
    RateLimited,

    #[error("Request timed out")]
    Timeout,

    #[error("Network error: {0}")]
    Network(String),

    /// 响应无法解析或内容为空
    #[error("Malformed response: {0}")]
    Malformed(String),

    /// 请求本身有问题（鉴权失败、参数错误），换候选也不会好
    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl LlmError {
    pub fn class(&self) -> FailureClass {
        match self {
            LlmError::RateLimited => FailureClass::RateLimited,
            LlmError::Timeout => FailureClass::Timeout,
            LlmError::Network(_) => FailureClass::Network,
            LlmError::Malformed(_) => FailureClass::Malformed,
            LlmError::Fatal(_) => FailureClass::Fatal,
        }
    }
}

/// LLM 客户端 trait：对 request.candidate 指定的模型做一次补全
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError>;
}
