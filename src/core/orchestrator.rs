//! 回合编排：聚合器触发一批碎片后的完整处理流程
//!
//! 接管检查 → 意图延续 → 读历史并归一化碎片（话题切换则清空历史）→ 派发 → 写历史并回复；
//! 派发失败时只发兜底文案，历史保持不变。

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::core::{
    BatchHandler, CarryOutcome, CoordinatorState, DispatchRequest, Dispatcher, JoinNormalizer,
    ReadyBatch, TopicPolicy, TurnNormalizer,
};
use crate::integrations::{truncate_chars, ReplyChannel};
use crate::memory::{HistoryStore, Message};

/// 回合参数
#[derive(Debug, Clone)]
pub struct TurnSettings {
    pub candidates: Vec<String>,
    /// 为空则不加 system 消息
    pub system_prompt: String,
    pub fallback_message: String,
    pub max_reply_chars: usize,
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self {
            candidates: vec!["openai/gpt-4o-mini".to_string()],
            system_prompt: String::new(),
            fallback_message: "ขอโทษค่ะ ระบบขัดข้องชั่วคราว กรุณาลองใหม่อีกครั้งนะคะ 🙏".to_string(),
            max_reply_chars: 5000,
        }
    }
}

/// 单回合结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// 人工接管中，整批丢弃
    Suppressed,
    Replied { candidate: String },
    Fallback,
}

/// 回合编排器：聚合器的批次处理器
pub struct TurnOrchestrator {
    state: Arc<CoordinatorState>,
    dispatcher: Arc<Dispatcher>,
    history: Arc<dyn HistoryStore>,
    channel: Arc<dyn ReplyChannel>,
    topic_policy: Arc<dyn TopicPolicy>,
    normalizer: Arc<dyn TurnNormalizer>,
    settings: TurnSettings,
}

impl TurnOrchestrator {
    pub fn new(
        state: Arc<CoordinatorState>,
        dispatcher: Arc<Dispatcher>,
        history: Arc<dyn HistoryStore>,
        channel: Arc<dyn ReplyChannel>,
        topic_policy: Arc<dyn TopicPolicy>,
        settings: TurnSettings,
    ) -> Self {
        Self {
            state,
            dispatcher,
            history,
            channel,
            topic_policy,
            normalizer: Arc::new(JoinNormalizer),
            settings,
        }
    }

    pub fn with_normalizer(mut self, normalizer: Arc<dyn TurnNormalizer>) -> Self {
        self.normalizer = normalizer;
        self
    }

    /// 处理一批已触发的碎片
    pub async fn run_turn(&self, batch: ReadyBatch) -> TurnOutcome {
        let key = batch.key;

        // 聚合途中才开始的接管在此拦下；派发途中才接管时本轮回复仍会发出
        if self.state.takeover.is_suspended(&key).await {
            info!(key = %key, fragments = batch.fragments.len(), "takeover active, batch suppressed");
            return TurnOutcome::Suppressed;
        }

        let raw = batch.fragments.clone();
        let mut fragments = batch.fragments;
        let carry = self.state.carry_over.record_if_asked(&key, &mut fragments).await;
        if let CarryOutcome::Injected { subtopic, group } = &carry {
            info!(key = %key, subtopic = subtopic.as_str(), group = %group, "carry-over hint appended");
        }

        let mut history = self.history.get(&key).await;
        let merged = self.normalizer.normalize(&key, &fragments, &history).await;
        if self.topic_policy.should_reset(&history, &merged) {
            info!(key = %key, dropped = history.len(), "topic changed, history reset");
            history.clear();
        }

        let mut messages = Vec::with_capacity(history.len() + 2);
        if !self.settings.system_prompt.trim().is_empty() {
            messages.push(Message::system(self.settings.system_prompt.clone()));
        }
        messages.extend(history.iter().cloned());
        messages.push(Message::user(merged));

        let request = DispatchRequest {
            key: key.clone(),
            messages,
        };

        match self.dispatcher.dispatch(&request, &self.settings.candidates).await {
            Ok(response) => {
                history.extend(raw.into_iter().map(Message::user));
                history.push(Message::assistant(response.content.clone()));
                self.history.set(&key, history).await;

                let reply = truncate_chars(&response.content, self.settings.max_reply_chars);
                if let Err(e) = self.channel.send(&key, &reply).await {
                    warn!(key = %key, error = %e, "failed to deliver reply");
                }
                info!(
                    key = %key,
                    candidate = %response.candidate,
                    attempts = response.attempts,
                    reason = batch.reason.as_str(),
                    "turn completed"
                );
                TurnOutcome::Replied {
                    candidate: response.candidate,
                }
            }
            Err(e) => {
                let class = e.class().map(|c| c.to_string()).unwrap_or_else(|| "none".to_string());
                error!(key = %key, class = %class, error = %e, "turn failed, sending fallback");
                if let Err(e) = self.channel.send(&key, &self.settings.fallback_message).await {
                    warn!(key = %key, error = %e, "failed to deliver fallback");
                }
                TurnOutcome::Fallback
            }
        }
    }
}

#[async_trait]
impl BatchHandler for TurnOrchestrator {
    async fn handle_batch(&self, batch: ReadyBatch) {
        self.run_turn(batch).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        CarryOverSettings, DispatchSettings, FireReason, KeywordTopicPolicy, NoTopicReset,
    };
    use crate::integrations::MemoryReplyChannel;
    use crate::llm::{LlmError, ScriptedLlmClient};
    use crate::memory::{InMemoryHistoryStore, Role};
    use tokio::time::Instant;

    struct Fixture {
        orchestrator: TurnOrchestrator,
        client: Arc<ScriptedLlmClient>,
        history: Arc<InMemoryHistoryStore>,
        channel: Arc<MemoryReplyChannel>,
        state: Arc<CoordinatorState>,
    }

    fn fixture_with(policy: Arc<dyn TopicPolicy>) -> Fixture {
        let client = Arc::new(ScriptedLlmClient::new());
        let history = Arc::new(InMemoryHistoryStore::default());
        let channel = Arc::new(MemoryReplyChannel::new());
        let state = Arc::new(CoordinatorState::new(CarryOverSettings::default()));
        let dispatcher = Arc::new(Dispatcher::new(client.clone(), DispatchSettings::default()));
        let orchestrator = TurnOrchestrator::new(
            state.clone(),
            dispatcher,
            history.clone(),
            channel.clone(),
            policy,
            TurnSettings {
                candidates: vec!["m1".to_string(), "m2".to_string()],
                system_prompt: "You are a shop assistant.".to_string(),
                fallback_message: "sorry".to_string(),
                max_reply_chars: 5000,
            },
        );
        Fixture {
            orchestrator,
            client,
            history,
            channel,
            state,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(NoTopicReset))
    }

    fn batch(key: &str, fragments: &[&str]) -> ReadyBatch {
        ReadyBatch {
            key: key.to_string(),
            fragments: fragments.iter().map(|s| s.to_string()).collect(),
            reason: FireReason::Silence,
            opened_at: Instant::now(),
        }
    }

    #[tokio::test]
    async fn test_turn_merges_fragments_and_records_history() {
        let f = fixture();
        f.client.push("m1", Ok("ราคาเส้นละ 250 บาทค่ะ".into()));

        let outcome = f
            .orchestrator
            .run_turn(batch("u1", &["สวัสดีค่ะ", "เหล็กกล่อง 2 นิ้ว", "ราคาเท่าไหร่"]))
            .await;
        assert_eq!(outcome, TurnOutcome::Replied { candidate: "m1".into() });

        let calls = f.client.calls();
        let call = &calls[0];
        assert_eq!(call.messages[0].role, Role::System);
        assert_eq!(
            call.messages.last().unwrap().content,
            "สวัสดีค่ะ / เหล็กกล่อง 2 นิ้ว / ราคาเท่าไหร่"
        );

        let stored = f.history.get("u1").await;
        assert_eq!(stored.len(), 4);
        assert_eq!(stored[0], Message::user("สวัสดีค่ะ"));
        assert_eq!(stored[3], Message::assistant("ราคาเส้นละ 250 บาทค่ะ"));
        assert_eq!(f.channel.sent_to("u1"), vec!["ราคาเส้นละ 250 บาทค่ะ"]);
    }

    #[tokio::test]
    async fn test_suspended_key_makes_no_call_and_no_reply() {
        let f = fixture();
        f.state.takeover.suspend("u1", 30).await;

        let outcome = f.orchestrator.run_turn(batch("u1", &["สวัสดี"])).await;
        assert_eq!(outcome, TurnOutcome::Suppressed);
        assert_eq!(f.client.call_count(), 0);
        assert!(f.channel.sent().is_empty());
        assert!(f.history.get("u1").await.is_empty());
    }

    #[tokio::test]
    async fn test_failure_sends_fallback_and_keeps_history() {
        let f = fixture();
        f.history
            .set("u1", vec![Message::user("ท่อ"), Message::assistant("มีค่ะ")])
            .await;
        f.client.push("m1", Err(LlmError::Fatal("401".into())));

        let outcome = f.orchestrator.run_turn(batch("u1", &["ราคา"])).await;
        assert_eq!(outcome, TurnOutcome::Fallback);
        assert_eq!(f.channel.sent_to("u1"), vec!["sorry"]);
        assert_eq!(f.history.get("u1").await.len(), 2);
    }

    #[tokio::test]
    async fn test_carry_over_hint_reaches_llm_but_not_history() {
        let f = fixture();
        f.client.push("m1", Ok("ขนาดไหนคะ".into()));
        f.client.push("m1", Ok("ขนาด 2x2 นิ้ว ยาว 6 เมตรค่ะ".into()));

        f.orchestrator
            .run_turn(batch("u1", &["เหล็กกล่อง ขนาดเท่าไหร่"]))
            .await;
        f.orchestrator.run_turn(batch("u1", &["เหล็กกล่อง 2 นิ้ว"])).await;

        let calls = f.client.calls();
        let second = &calls[1];
        let sent_user = &second.messages.last().unwrap().content;
        assert!(sent_user.starts_with("เหล็กกล่อง 2 นิ้ว / "));
        assert!(sent_user.ends_with(&CarryOverSettings::default().dimension_hint));

        let stored = f.history.get("u1").await;
        assert!(stored
            .iter()
            .all(|m| m.content != CarryOverSettings::default().dimension_hint));
        assert_eq!(stored[2], Message::user("เหล็กกล่อง 2 นิ้ว"));
    }

    #[tokio::test]
    async fn test_topic_switch_resets_history() {
        let f = fixture_with(Arc::new(KeywordTopicPolicy::new(&["ส่ง".to_string()])));
        f.history
            .set("u1", vec![Message::user("ท่อ 4 หุน"), Message::assistant("มีค่ะ")])
            .await;
        f.client.push("m1", Ok("ส่งได้ค่ะ".into()));

        f.orchestrator.run_turn(batch("u1", &["ส่งบางนาได้ไหม"])).await;

        let calls = f.client.calls();
        assert_eq!(calls[0].messages.len(), 2);
        let stored = f.history.get("u1").await;
        assert_eq!(
            stored,
            vec![Message::user("ส่งบางนาได้ไหม"), Message::assistant("ส่งได้ค่ะ")]
        );
    }

    #[tokio::test]
    async fn test_reply_is_truncated_for_delivery_only() {
        let mut f = fixture();
        f.orchestrator.settings.max_reply_chars = 4;
        f.client.push("m1", Ok("abcdefgh".into()));

        f.orchestrator.run_turn(batch("u1", &["hi"])).await;
        assert_eq!(f.channel.sent_to("u1"), vec!["abcd"]);
        assert_eq!(f.history.get("u1").await[1].content, "abcdefgh");
    }

    struct FixedNormalizer;

    #[async_trait]
    impl TurnNormalizer for FixedNormalizer {
        async fn normalize(&self, _key: &str, fragments: &[String], _history: &[Message]) -> String {
            format!("{} fragments", fragments.len())
        }
    }

    #[tokio::test]
    async fn test_custom_normalizer_shapes_request_not_history() {
        let f = fixture();
        let orchestrator = f.orchestrator.with_normalizer(Arc::new(FixedNormalizer));
        f.client.push("m1", Ok("ok".into()));

        orchestrator.run_turn(batch("u1", &["ท่อ", "4 หุน"])).await;

        let calls = f.client.calls();
        assert_eq!(calls[0].messages.last().unwrap().content, "2 fragments");
        let stored = f.history.get("u1").await;
        assert_eq!(stored[0], Message::user("ท่อ"));
        assert_eq!(stored[1], Message::user("4 หุน"));
    }
}
