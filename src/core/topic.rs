//! 话题切换策略：决定本轮是否丢弃旧历史

use crate::core::carry_over::normalize;
use crate::memory::{last_user_content, Message};

/// 话题切换判定
pub trait TopicPolicy: Send + Sync {
    /// history 为当前存储的历史，merged 为本轮合并后的用户文本
    fn should_reset(&self, history: &[Message], merged: &str) -> bool;
}

/// 从不重置
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTopicReset;

impl TopicPolicy for NoTopicReset {
    fn should_reset(&self, _history: &[Message], _merged: &str) -> bool {
        false
    }
}

/// 关键词策略：本轮出现切换关键词（送货、地址、付款等），而上一条用户消息没有时重置
#[derive(Debug, Clone)]
pub struct KeywordTopicPolicy {
    keywords: Vec<String>,
}

impl KeywordTopicPolicy {
    pub fn new(keywords: &[String]) -> Self {
        Self {
            keywords: keywords
                .iter()
                .map(|k| normalize(k))
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    fn mentions(&self, text: &str) -> bool {
        let text = normalize(text);
        self.keywords.iter().any(|k| text.contains(k.as_str()))
    }
}

impl TopicPolicy for KeywordTopicPolicy {
    fn should_reset(&self, history: &[Message], merged: &str) -> bool {
        if self.keywords.is_empty() || history.is_empty() {
            return false;
        }
        let previous_mentions = last_user_content(history)
            .map(|prev| self.mentions(prev))
            .unwrap_or(false);
        self.mentions(merged) && !previous_mentions
    }
}
