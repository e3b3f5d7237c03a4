//! 协调器构建器：按配置装配聚合器、派发器、编排器与共享状态
//!
//! 控制台与 LINE 两种接入方式共用同一套装配逻辑；测试可替换 LLM、历史存储与回复通道。

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::{
    CoordinatorState, Dispatcher, FragmentAggregator, KeywordTopicPolicy, NoTopicReset,
    ReassemblyNormalizer, TakeoverState, TopicPolicy, TurnOrchestrator, TurnSettings,
};
use crate::integrations::{InboundMessage, LogReplyChannel, ReplyChannel};
use crate::llm::{LlmClient, MockLlmClient, OpenRouterClient, OpenRouterConfig};
use crate::memory::{HistoryStore, InMemoryHistoryStore};

/// 根据环境变量选择 LLM 后端：有 OPENROUTER_API_KEY 走 OpenRouter，否则 Mock
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let Ok(api_key) = std::env::var("OPENROUTER_API_KEY") else {
        tracing::warn!("OPENROUTER_API_KEY not set, using Mock LLM");
        return Arc::new(MockLlmClient);
    };
    let config = OpenRouterConfig {
        base_url: cfg.llm.base_url.clone(),
        api_key,
        temperature: cfg.llm.temperature,
        referer: cfg.llm.referer.clone(),
        title: cfg.llm.title.clone(),
        ..OpenRouterConfig::default()
    };
    match OpenRouterClient::new(config) {
        Ok(client) => {
            tracing::info!(candidates = ?cfg.dispatcher.candidates, "Using OpenRouter LLM");
            Arc::new(client)
        }
        Err(e) => {
            tracing::warn!("Failed to build OpenRouter client ({}), using Mock LLM", e);
            Arc::new(MockLlmClient)
        }
    }
}

/// 协调器构建器
pub struct CoordinatorBuilder {
    config: AppConfig,
    llm: Option<Arc<dyn LlmClient>>,
    history: Option<Arc<dyn HistoryStore>>,
    channel: Option<Arc<dyn ReplyChannel>>,
    topic_policy: Option<Arc<dyn TopicPolicy>>,
}

impl CoordinatorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            llm: None,
            history: None,
            channel: None,
            topic_policy: None,
        }
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_history(mut self, history: Arc<dyn HistoryStore>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_channel(mut self, channel: Arc<dyn ReplyChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn with_topic_policy(mut self, policy: Arc<dyn TopicPolicy>) -> Self {
        self.topic_policy = Some(policy);
        self
    }

    fn build_topic_policy(&self) -> Arc<dyn TopicPolicy> {
        let keywords = &self.config.conversation.topic_reset_keywords;
        if keywords.is_empty() {
            Arc::new(NoTopicReset)
        } else {
            Arc::new(KeywordTopicPolicy::new(keywords))
        }
    }

    pub fn build(self) -> Coordinator {
        let cfg = &self.config;
        let llm = self.llm.clone().unwrap_or_else(|| create_llm_from_config(cfg));
        let history = self.history.clone().unwrap_or_else(|| {
            Arc::new(InMemoryHistoryStore::new(
                cfg.conversation.history_max_messages,
                Duration::from_secs(cfg.conversation.history_ttl_secs),
            ))
        });
        let channel = self
            .channel
            .clone()
            .unwrap_or_else(|| Arc::new(LogReplyChannel));
        let topic_policy = self
            .topic_policy
            .clone()
            .unwrap_or_else(|| self.build_topic_policy());

        if cfg.dispatcher.candidates.is_empty() {
            tracing::warn!("No dispatch candidates configured, every turn will fall back");
        }

        let state = Arc::new(CoordinatorState::new(cfg.carry_over_settings()));
        let dispatcher = Arc::new(Dispatcher::new(llm, cfg.dispatch_settings()));
        let mut orchestrator = TurnOrchestrator::new(
            state.clone(),
            dispatcher.clone(),
            history,
            channel.clone(),
            topic_policy,
            TurnSettings {
                candidates: cfg.dispatcher.candidates.clone(),
                system_prompt: cfg.system_prompt(),
                fallback_message: cfg.conversation.fallback_message.clone(),
                max_reply_chars: cfg.conversation.max_reply_chars.max(1),
            },
        );
        if cfg.conversation.reassemble {
            orchestrator = orchestrator.with_normalizer(Arc::new(ReassemblyNormalizer::new(
                dispatcher.clone(),
                cfg.dispatcher.candidates.clone(),
            )));
        }
        let aggregator = FragmentAggregator::new(cfg.aggregator_settings(), Arc::new(orchestrator));

        Coordinator {
            aggregator,
            state,
            dispatcher,
            channel,
            default_takeover_minutes: cfg.takeover.default_minutes,
            unsupported_message_reply: cfg.conversation.unsupported_message_reply.clone(),
        }
    }
}

/// 协调器：入站消息与管理操作的统一入口
#[derive(Clone)]
pub struct Coordinator {
    aggregator: FragmentAggregator,
    state: Arc<CoordinatorState>,
    dispatcher: Arc<Dispatcher>,
    channel: Arc<dyn ReplyChannel>,
    default_takeover_minutes: u64,
    unsupported_message_reply: String,
}

impl Coordinator {
    /// 接收一条入站消息；空白文本忽略，接管期间到达的碎片直接丢弃
    ///
    /// 触发时编排器还会再查一次闸门，覆盖聚合途中才开始的接管。
    pub async fn submit(&self, message: InboundMessage) {
        let text = message.text.trim();
        if message.key.is_empty() || text.is_empty() {
            tracing::debug!(key = %message.key, "empty inbound message ignored");
            return;
        }
        if self.state.takeover.is_suspended(&message.key).await {
            tracing::info!(key = %message.key, "takeover active, fragment dropped");
            return;
        }
        self.aggregator.submit(&message.key, text).await;
    }

    /// 对不支持的消息类型（贴图、图片等）回一句提示；接管中或未配置文案时不回
    pub async fn notify_unsupported(&self, key: &str) -> bool {
        if key.is_empty() || self.unsupported_message_reply.trim().is_empty() {
            return false;
        }
        if self.state.takeover.is_suspended(key).await {
            return false;
        }
        match self.channel.send(key, &self.unsupported_message_reply).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "failed to deliver unsupported-message notice");
                false
            }
        }
    }

    /// 人工接管；minutes 为 None 时用配置默认值
    pub async fn suspend(&self, key: &str, minutes: Option<u64>) -> TakeoverState {
        let minutes = minutes.unwrap_or(self.default_takeover_minutes);
        self.state.takeover.suspend(key, minutes).await
    }

    pub async fn resume(&self, key: &str) -> bool {
        self.state.takeover.resume(key).await
    }

    pub async fn takeover_state(&self, key: &str) -> TakeoverState {
        self.state.takeover.state(key).await
    }

    pub async fn flush(&self, key: &str) -> bool {
        self.aggregator.flush(key).await
    }

    pub async fn flush_all(&self) -> usize {
        self.aggregator.flush_all().await
    }

    pub async fn pending_count(&self) -> usize {
        self.aggregator.pending_count().await
    }

    /// 等待所有已触发回合处理完毕
    pub async fn wait_idle(&self) {
        self.aggregator.wait_idle().await
    }

    /// 当前在途的补全调用数
    pub fn in_flight(&self) -> usize {
        self.dispatcher.in_flight()
    }

    pub fn state(&self) -> &Arc<CoordinatorState> {
        &self.state
    }

    /// 周期清扫过期接管记录与陈旧意图记录，token 取消时退出
    pub fn spawn_state_sweeper(
        &self,
        interval: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let state = self.state.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = state.takeover.sweep_expired().await;
                        if removed > 0 {
                            tracing::debug!(removed, "expired takeovers swept");
                        }
                        let stale = state.carry_over.sweep_stale().await;
                        if stale > 0 {
                            tracing::debug!(stale, "stale intents swept");
                        }
                    }
                }
            }
        })
    }
}
