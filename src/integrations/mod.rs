//! 外部集成：回复通道抽象与消息平台接入（LINE 需 `line` feature 与公网 Webhook 域名）

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

#[cfg(feature = "line")]
pub mod line;

/// 入站消息：平台侧已解析出的会话键与文本
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub key: String,
    pub text: String,
}

impl InboundMessage {
    pub fn new(key: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            text: text.into(),
        }
    }
}

/// 回复发送失败
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel rejected reply ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("channel transport error: {0}")]
    Transport(String),
}

/// 回复通道：把一条文本送达会话对端
#[async_trait]
pub trait ReplyChannel: Send + Sync {
    async fn send(&self, key: &str, text: &str) -> Result<(), ChannelError>;
}

/// 按字符截断（平台单条消息有长度上限）
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// 只写日志的通道，供控制台模式使用
#[derive(Debug, Default)]
pub struct LogReplyChannel;

#[async_trait]
impl ReplyChannel for LogReplyChannel {
    async fn send(&self, key: &str, text: &str) -> Result<(), ChannelError> {
        tracing::info!(key = %key, "reply: {}", text);
        println!("[{}] {}", key, text);
        Ok(())
    }
}

/// 内存通道：记录所有回复，测试用
#[derive(Debug, Default)]
pub struct MemoryReplyChannel {
    sent: Mutex<Vec<(String, String)>>,
}

impl MemoryReplyChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按发送顺序返回 (key, text)
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn sent_to(&self, key: &str) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter(|(k, _)| k == key)
            .map(|(_, text)| text)
            .collect()
    }

    /// 每个会话键收到的回复数
    pub fn counts(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for (key, _) in self.sent() {
            *counts.entry(key).or_insert(0) += 1;
        }
        counts
    }
}

#[async_trait]
impl ReplyChannel for MemoryReplyChannel {
    async fn send(&self, key: &str, text: &str) -> Result<(), ChannelError> {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push((key.to_string(), text.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_chars_respects_char_boundaries() {
        assert_eq!(truncate_chars("สวัสดีค่ะ", 3), "สวั");
        assert_eq!(truncate_chars("short", 10), "short");
        assert_eq!(truncate_chars("", 5), "");
    }

    #[tokio::test]
    async fn test_memory_channel_records_in_order() {
        let channel = MemoryReplyChannel::new();
        channel.send("u1", "a").await.unwrap();
        channel.send("u2", "b").await.unwrap();
        channel.send("u1", "c").await.unwrap();

        assert_eq!(channel.sent_to("u1"), vec!["a", "c"]);
        assert_eq!(channel.counts().get("u2"), Some(&1));
    }
}
