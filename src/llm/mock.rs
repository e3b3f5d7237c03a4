//! Mock LLM 客户端（用于测试与无 API Key 时本地跑通）
//!
//! - MockLlmClient：回显最后一条 User 消息
//! - ScriptedLlmClient：按候选预置结果队列，记录调用顺序与并发峰值

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::llm::{CompletionRequest, LlmClient, LlmError};
use crate::memory::last_user_content;

/// Mock 客户端：回显用户最后一条消息
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        let last_user = last_user_content(&request.messages).unwrap_or("(no input)");
        Ok(format!("Echo from Mock ({}): {}", request.candidate, last_user))
    }
}

/// 预置脚本客户端：每个候选一条结果队列，队列耗尽后回显成功
#[derive(Default)]
pub struct ScriptedLlmClient {
    scripts: Mutex<HashMap<String, VecDeque<Result<String, LlmError>>>>,
    calls: Mutex<Vec<CompletionRequest>>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 每次调用前等待 delay（用于超时与并发测试）
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// 为候选追加一个结果
    pub fn push(&self, candidate: &str, outcome: Result<String, LlmError>) -> &Self {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts
                .entry(candidate.to_string())
                .or_default()
                .push_back(outcome);
        }
        self
    }

    /// 已发生的调用（按发生顺序）
    pub fn calls(&self) -> Vec<CompletionRequest> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// 按顺序返回被调用的候选名
    pub fn called_candidates(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.candidate).collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// 观察到的最大同时在途调用数
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn next_outcome(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        let scripted = self
            .scripts
            .lock()
            .ok()
            .and_then(|mut s| s.get_mut(&request.candidate).and_then(|q| q.pop_front()));
        scripted.unwrap_or_else(|| {
            Ok(format!(
                "reply from {}: {}",
                request.candidate,
                last_user_content(&request.messages).unwrap_or_default()
            ))
        })
    }
}

/// 在途计数守卫：drop 时减一（超时取消时同样生效）
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(request.clone());
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.next_outcome(request)
    }
}
