//! OpenRouter（OpenAI chat-completions 兼容）客户端
//!
//! 通过 reqwest 直接调用 `{base_url}/chat/completions`，把 HTTP 状态与传输错误映射为分类后的 LlmError。
//! 不在客户端内部重试：重试 / 换候选由派发器统一决定。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use crate::llm::{CompletionRequest, LlmClient, LlmError};
use crate::memory::Message;

pub const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// 客户端配置
#[derive(Debug, Clone)]
pub struct OpenRouterConfig {
    pub base_url: String,
    pub api_key: String,
    pub temperature: f32,
    /// 可选 HTTP-Referer 头（OpenRouter 统计用）
    pub referer: Option<String>,
    /// 可选 X-Title 头
    pub title: Option<String>,
    /// reqwest 层的兜底超时；单次尝试的真正超时由派发器控制
    pub request_timeout: Duration,
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            base_url: OPENROUTER_BASE_URL.to_string(),
            api_key: String::new(),
            temperature: 0.7,
            referer: None,
            title: None,
            request_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequestBody<'a> {
    model: &'a str,
    temperature: f32,
    messages: &'a [Message],
}

#[derive(Debug, Deserialize)]
struct ChatResponseBody {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChatChoiceMessage>,
    /// 旧式 completions 兼容字段
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

/// OpenRouter 客户端：持有带默认头的 reqwest::Client
pub struct OpenRouterClient {
    client: reqwest::Client,
    endpoint: String,
    temperature: f32,
}

impl OpenRouterClient {
    pub fn new(config: OpenRouterConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", config.api_key.trim()))?,
        );
        if let Some(referer) = config.referer.as_deref().filter(|s| !s.is_empty()) {
            headers.insert("HTTP-Referer", HeaderValue::from_str(referer)?);
        }
        if let Some(title) = config.title.as_deref().filter(|s| !s.is_empty()) {
            headers.insert("X-Title", HeaderValue::from_str(title)?);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            temperature: config.temperature,
        })
    }
}

/// 按 HTTP 状态码分类错误：429 限流，408/5xx 视为网络瞬时故障，其余 4xx 为致命
pub fn classify_status(status: u16, body: &str) -> LlmError {
    let detail = format!("HTTP {status}: {}", body.trim());
    match status {
        429 => LlmError::RateLimited,
        408 | 500..=599 => LlmError::Network(detail),
        _ => LlmError::Fatal(detail),
    }
}

fn classify_transport(err: &reqwest::Error) -> LlmError {
    if err.is_timeout() {
        LlmError::Timeout
    } else if err.is_decode() {
        LlmError::Malformed(err.to_string())
    } else if err.is_builder() {
        LlmError::Fatal(err.to_string())
    } else {
        LlmError::Network(err.to_string())
    }
}

/// 从响应体取首条非空 content
fn extract_content(body: ChatResponseBody) -> Result<String, LlmError> {
    body.choices
        .into_iter()
        .next()
        .and_then(|c| c.message.and_then(|m| m.content).or(c.text))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| LlmError::Malformed("no content in response".to_string()))
}

#[async_trait]
impl LlmClient for OpenRouterClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        let body = ChatRequestBody {
            model: &request.candidate,
            temperature: self.temperature,
            messages: &request.messages,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &text));
        }

        let parsed: ChatResponseBody = response.json().await.map_err(|e| classify_transport(&e))?;
        extract_content(parsed)
    }
}
