//! 限流派发器：全局并发上限 + 单次超时 + 限流退避重试 + 候选顺序故障转移
//!
//! 并发许可用 Semaphore（FIFO 释放）按「单次尝试」获取：退避等待期间不占用许可，
//! 超时后 future 被 drop，许可随之归还。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

use crate::core::{DispatchError, RecoveryAction, RecoveryEngine};
use crate::llm::{CompletionRequest, LlmClient, LlmError};
use crate::memory::Message;

/// 派发参数
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// 全进程同时在途的调用上限
    pub max_concurrent: usize,
    /// 单次尝试超时
    pub attempt_timeout: Duration,
    pub rate_limit_backoff_min: Duration,
    pub rate_limit_backoff_max: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            attempt_timeout: Duration::from_secs(25),
            rate_limit_backoff_min: Duration::from_millis(300),
            rate_limit_backoff_max: Duration::from_millis(800),
        }
    }
}

/// 派发请求（调用结束即丢弃）
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    /// 会话键，仅用于日志
    pub key: String,
    pub messages: Vec<Message>,
}

/// 派发成功结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchResponse {
    /// 成功的候选
    pub candidate: String,
    pub content: String,
    /// 包括成功那次在内的总尝试次数
    pub attempts: usize,
}

/// 派发器：所有会话共享一个实例
pub struct Dispatcher {
    client: Arc<dyn LlmClient>,
    admission: Arc<Semaphore>,
    max_concurrent: usize,
    attempt_timeout: Duration,
    recovery: RecoveryEngine,
}

impl Dispatcher {
    pub fn new(client: Arc<dyn LlmClient>, settings: DispatchSettings) -> Self {
        let max_concurrent = settings.max_concurrent.max(1);
        Self {
            client,
            admission: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            attempt_timeout: settings.attempt_timeout,
            recovery: RecoveryEngine::new(
                settings.rate_limit_backoff_min,
                settings.rate_limit_backoff_max,
            ),
        }
    }

    /// 当前在途调用数
    pub fn in_flight(&self) -> usize {
        self.max_concurrent - self.admission.available_permits()
    }

    /// 按候选顺序尝试，返回第一个成功；Fatal 立即终止，全部失败返回 Exhausted
    pub async fn dispatch(
        &self,
        request: &DispatchRequest,
        candidates: &[String],
    ) -> Result<DispatchResponse, DispatchError> {
        let mut attempts = 0usize;
        let mut last_failure: Option<(String, LlmError)> = None;

        for candidate in candidates {
            let call = CompletionRequest {
                candidate: candidate.clone(),
                messages: request.messages.clone(),
            };
            let mut retries = 0u32;

            loop {
                attempts += 1;
                let err = match self.attempt(&call).await {
                    Ok(content) => {
                        debug!(key = %request.key, candidate = %candidate, attempts, "dispatch succeeded");
                        return Ok(DispatchResponse {
                            candidate: candidate.clone(),
                            content,
                            attempts,
                        });
                    }
                    Err(err) => err,
                };

                let class = err.class();
                warn!(
                    key = %request.key,
                    candidate = %candidate,
                    attempt = attempts,
                    class = %class,
                    error = %err,
                    "dispatch attempt failed"
                );

                match self.recovery.decide(class, retries) {
                    RecoveryAction::RetrySameAfter(delay) => {
                        retries += 1;
                        tokio::time::sleep(delay).await;
                    }
                    RecoveryAction::NextCandidate => {
                        last_failure = Some((candidate.clone(), err));
                        break;
                    }
                    RecoveryAction::Abort => {
                        error!(key = %request.key, candidate = %candidate, error = %err, "dispatch aborted");
                        return Err(DispatchError::Fatal {
                            candidate: candidate.clone(),
                            source: err,
                        });
                    }
                }
            }
        }

        match last_failure {
            Some((last_candidate, source)) => {
                error!(key = %request.key, attempts, candidate = %last_candidate, error = %source, "all dispatch candidates exhausted");
                Err(DispatchError::Exhausted {
                    attempts,
                    last_candidate,
                    source,
                })
            }
            None => Err(DispatchError::NoCandidates),
        }
    }

    /// 单次尝试：排队拿许可，带超时调用；空内容按 Malformed 处理
    async fn attempt(&self, call: &CompletionRequest) -> Result<String, LlmError> {
        let _permit = self
            .admission
            .acquire()
            .await
            .map_err(|_| LlmError::Fatal("dispatcher admission closed".to_string()))?;

        match tokio::time::timeout(self.attempt_timeout, self.client.complete(call)).await {
            Ok(Ok(content)) if content.trim().is_empty() => {
                Err(LlmError::Malformed("empty payload".to_string()))
            }
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::FailureClass;
    use crate::llm::ScriptedLlmClient;

    fn candidates(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn request() -> DispatchRequest {
        DispatchRequest {
            key: "u1".to_string(),
            messages: vec![Message::user("ราคาเท่าไหร่")],
        }
    }

    fn dispatcher(client: Arc<ScriptedLlmClient>, max_concurrent: usize) -> Dispatcher {
        Dispatcher::new(
            client,
            DispatchSettings {
                max_concurrent,
                ..DispatchSettings::default()
            },
        )
    }

    #[tokio::test]
    async fn test_failover_in_order_without_retry() {
        let client = Arc::new(ScriptedLlmClient::new());
        client.push("m1", Err(LlmError::Network("reset".into())));
        client.push("m2", Err(LlmError::Timeout));
        client.push("m3", Ok("from m3".into()));

        let d = dispatcher(client.clone(), 2);
        let resp = d.dispatch(&request(), &candidates(&["m1", "m2", "m3"])).await.unwrap();

        assert_eq!(resp.candidate, "m3");
        assert_eq!(resp.content, "from m3");
        assert_eq!(resp.attempts, 3);
        assert_eq!(client.called_candidates(), vec!["m1", "m2", "m3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_retries_same_candidate_once() {
        let client = Arc::new(ScriptedLlmClient::new());
        client.push("m1", Err(LlmError::RateLimited));
        client.push("m1", Ok("after backoff".into()));

        let d = dispatcher(client.clone(), 2);
        let started = tokio::time::Instant::now();
        let resp = d.dispatch(&request(), &candidates(&["m1", "m2"])).await.unwrap();

        assert_eq!(resp.content, "after backoff");
        assert_eq!(resp.attempts, 2);
        assert_eq!(client.called_candidates(), vec!["m1", "m1"]);
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_rate_limit_moves_on() {
        let client = Arc::new(ScriptedLlmClient::new());
        client.push("m1", Err(LlmError::RateLimited));
        client.push("m1", Err(LlmError::RateLimited));
        client.push("m2", Ok("m2 ok".into()));

        let d = dispatcher(client.clone(), 2);
        let resp = d.dispatch(&request(), &candidates(&["m1", "m2"])).await.unwrap();

        assert_eq!(resp.candidate, "m2");
        assert_eq!(client.called_candidates(), vec!["m1", "m1", "m2"]);
    }

    #[tokio::test]
    async fn test_fatal_aborts_without_failover() {
        let client = Arc::new(ScriptedLlmClient::new());
        client.push("m1", Err(LlmError::Fatal("401 unauthorized".into())));

        let d = dispatcher(client.clone(), 2);
        let err = d.dispatch(&request(), &candidates(&["m1", "m2"])).await.unwrap_err();

        assert!(matches!(err, DispatchError::Fatal { ref candidate, .. } if candidate == "m1"));
        assert_eq!(client.called_candidates(), vec!["m1"]);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_last_cause() {
        let client = Arc::new(ScriptedLlmClient::new());
        client.push("m1", Err(LlmError::Network("reset".into())));
        client.push("m2", Ok("   ".into()));

        let d = dispatcher(client.clone(), 2);
        let err = d.dispatch(&request(), &candidates(&["m1", "m2"])).await.unwrap_err();

        match err {
            DispatchError::Exhausted {
                attempts,
                last_candidate,
                source,
            } => {
                assert_eq!(attempts, 2);
                assert_eq!(last_candidate, "m2");
                assert_eq!(source.class(), FailureClass::Malformed);
            }
            other => panic!("Expected Exhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_no_candidates() {
        let client = Arc::new(ScriptedLlmClient::new());
        let d = dispatcher(client.clone(), 2);
        let err = d.dispatch(&request(), &[]).await.unwrap_err();
        assert!(matches!(err, DispatchError::NoCandidates));
        assert_eq!(client.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_fails_over() {
        let client = Arc::new(ScriptedLlmClient::new().with_delay(Duration::from_secs(30)));
        let d = Dispatcher::new(
            client.clone(),
            DispatchSettings {
                attempt_timeout: Duration::from_secs(25),
                ..DispatchSettings::default()
            },
        );

        let err = d.dispatch(&request(), &candidates(&["m1", "m2"])).await.unwrap_err();
        assert_eq!(err.class(), Some(FailureClass::Timeout));
        assert_eq!(client.called_candidates(), vec!["m1", "m2"]);
        assert_eq!(d.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_ceiling() {
        let client = Arc::new(ScriptedLlmClient::new().with_delay(Duration::from_millis(100)));
        let d = Arc::new(dispatcher(client.clone(), 2));

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let d = d.clone();
                tokio::spawn(async move { d.dispatch(&request(), &candidates(&["m1"])).await })
            })
            .collect();

        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(client.call_count(), 5);
        assert!(client.peak_in_flight() <= 2);
        assert_eq!(client.peak_in_flight(), 2);
        assert_eq!(d.in_flight(), 0);
    }
}
