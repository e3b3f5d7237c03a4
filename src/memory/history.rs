//! 对话历史存储
//!
//! 编排器在派发前 get、成功后 set；保留条数与过期策略由存储实现负责。
//! 默认实现为进程内存版：只保留最近 N 条，超过 TTL 未写入的会话视为空。

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::memory::Message;

/// 历史存储接口（外部协作方）
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// 读取会话历史（按时间顺序）；不存在或已过期返回空
    async fn get(&self, key: &str) -> Vec<Message>;

    /// 覆盖写入会话历史
    async fn set(&self, key: &str, messages: Vec<Message>);
}

struct HistoryEntry {
    messages: Vec<Message>,
    written_at: Instant,
}

/// 内存历史存储：写入时裁剪到最近 `max_messages` 条，读取时按 TTL 懒过期
pub struct InMemoryHistoryStore {
    entries: RwLock<HashMap<String, HistoryEntry>>,
    max_messages: usize,
    ttl: Duration,
}

impl InMemoryHistoryStore {
    pub fn new(max_messages: usize, ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_messages: max_messages.max(1),
            ttl,
        }
    }

    /// 当前保存的会话数（含尚未被读取清理的过期项）
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl Default for InMemoryHistoryStore {
    fn default() -> Self {
        Self::new(10, Duration::from_secs(86_400))
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn get(&self, key: &str) -> Vec<Message> {
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                None => return Vec::new(),
                Some(entry) if entry.written_at.elapsed() < self.ttl => {
                    return entry.messages.clone();
                }
                Some(_) => {}
            }
        }
        self.entries.write().await.remove(key);
        Vec::new()
    }

    async fn set(&self, key: &str, mut messages: Vec<Message>) {
        if messages.len() > self.max_messages {
            messages.drain(..messages.len() - self.max_messages);
        }
        self.entries.write().await.insert(
            key.to_string(),
            HistoryEntry {
                messages,
                written_at: Instant::now(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_trims_to_most_recent() {
        let store = InMemoryHistoryStore::new(3, Duration::from_secs(60));
        let messages = (0..5).map(|i| Message::user(format!("m{i}"))).collect();
        store.set("u1", messages).await;

        let got = store.get("u1").await;
        let contents: Vec<_> = got.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn test_unknown_key_is_empty() {
        let store = InMemoryHistoryStore::default();
        assert!(store.get("nobody").await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() {
        let store = InMemoryHistoryStore::new(10, Duration::from_secs(30));
        store.set("u1", vec![Message::user("hello")]).await;

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(store.get("u1").await.len(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.get("u1").await.is_empty());
        assert!(store.is_empty().await);
    }
}
