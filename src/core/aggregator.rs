//! 消息碎片聚合器：把一阵连续的短消息合并成「一轮」
//!
//! 每个会话键至多一个活跃缓冲区。每来一条碎片重置静默计时；
//! 达到碎片数上限或窗口上限时立即触发，并取消挂起的计时任务。
//! 触发 = 在锁内把缓冲区从表中移除，再异步交给 BatchHandler；submit 从不等待静默期。
//! 同一键的批次按触发顺序串行处理（上一轮处理完才开始下一轮），不同键互不影响。

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// 会话键：对端的稳定标识，所有会话状态都按它分区
pub type ConversationKey = String;

/// 触发原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireReason {
    /// 静默期结束
    Silence,
    /// 碎片数达到上限
    MaxFragments,
    /// 距首条碎片超过窗口上限
    MaxWindow,
    /// 主动冲刷（如关闭前）
    Flush,
}

impl FireReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FireReason::Silence => "silence",
            FireReason::MaxFragments => "max_fragments",
            FireReason::MaxWindow => "max_window",
            FireReason::Flush => "flush",
        }
    }
}

/// 已就绪的一轮：按到达顺序的碎片
#[derive(Debug, Clone)]
pub struct ReadyBatch {
    pub key: ConversationKey,
    pub fragments: Vec<String>,
    pub reason: FireReason,
    pub opened_at: Instant,
}

/// 批次处理器（编排器实现）
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn handle_batch(&self, batch: ReadyBatch);
}

/// 聚合参数
#[derive(Debug, Clone)]
pub struct AggregatorSettings {
    pub silence: Duration,
    pub max_window: Duration,
    pub max_fragments: usize,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            silence: Duration::from_secs(15),
            max_window: Duration::from_secs(60),
            max_fragments: 16,
        }
    }
}

struct FragmentBuffer {
    fragments: Vec<String>,
    opened_at: Instant,
    /// 当前挂起计时任务的取消令牌
    timer: CancellationToken,
    /// 计时代次：计时任务只在代次未变时触发
    generation: u64,
}

#[derive(Default)]
struct Tables {
    buffers: HashMap<ConversationKey, FragmentBuffer>,
    /// 每个键最近一次批次处理任务
    lanes: HashMap<ConversationKey, JoinHandle<()>>,
    next_generation: u64,
}

/// 未完成的批次处理任务计数，归零时唤醒 wait_idle
#[derive(Default)]
struct LaneTracker {
    active: AtomicUsize,
    idle: Notify,
}

struct ActiveLane(Arc<LaneTracker>);

impl Drop for ActiveLane {
    fn drop(&mut self) {
        if self.0.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

struct Inner {
    settings: AggregatorSettings,
    tables: Mutex<Tables>,
    handler: Arc<dyn BatchHandler>,
    tracker: Arc<LaneTracker>,
}

impl Inner {
    /// 计时到期：仅当缓冲区仍是挂起计时时的那一代才触发
    async fn fire_if_current(&self, key: &str, generation: u64) {
        let mut tables = self.tables.lock().await;
        let current = tables.buffers.get(key).map(|b| b.generation);
        if current == Some(generation) {
            self.fire_locked(&mut tables, key, FireReason::Silence);
        }
    }

    /// 调用方必须持有表锁
    fn fire_locked(&self, tables: &mut Tables, key: &str, reason: FireReason) -> bool {
        let Some(buffer) = tables.buffers.remove(key) else {
            return false;
        };
        buffer.timer.cancel();
        tracing::debug!(
            key = %key,
            fragments = buffer.fragments.len(),
            reason = reason.as_str(),
            "fragment buffer fired"
        );

        let batch = ReadyBatch {
            key: key.to_string(),
            fragments: buffer.fragments,
            reason,
            opened_at: buffer.opened_at,
        };
        let previous = tables.lanes.remove(key);
        let handler = self.handler.clone();
        self.tracker.active.fetch_add(1, Ordering::SeqCst);
        let lane = ActiveLane(self.tracker.clone());
        let handle = tokio::spawn(async move {
            let _lane = lane;
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            handler.handle_batch(batch).await;
        });
        tables.lanes.retain(|_, h| !h.is_finished());
        tables.lanes.insert(key.to_string(), handle);
        true
    }
}

/// 碎片聚合器（可 clone，共享同一张表）
#[derive(Clone)]
pub struct FragmentAggregator {
    inner: Arc<Inner>,
}

impl FragmentAggregator {
    pub fn new(mut settings: AggregatorSettings, handler: Arc<dyn BatchHandler>) -> Self {
        settings.max_fragments = settings.max_fragments.max(1);
        Self {
            inner: Arc::new(Inner {
                settings,
                tables: Mutex::new(Tables::default()),
                handler,
                tracker: Arc::new(LaneTracker::default()),
            }),
        }
    }

    /// 追加一条碎片并重新评估触发条件；不等待静默期
    pub async fn submit(&self, key: &str, fragment: impl Into<String>) {
        let settings = &self.inner.settings;
        let mut tables = self.inner.tables.lock().await;
        let now = Instant::now();
        tables.next_generation += 1;
        let generation = tables.next_generation;

        let buffer = tables
            .buffers
            .entry(key.to_string())
            .or_insert_with(|| FragmentBuffer {
                fragments: Vec::new(),
                opened_at: now,
                timer: CancellationToken::new(),
                generation,
            });
        buffer.fragments.push(fragment.into());
        buffer.timer.cancel();

        let reason = if buffer.fragments.len() >= settings.max_fragments {
            Some(FireReason::MaxFragments)
        } else if now.duration_since(buffer.opened_at) >= settings.max_window {
            Some(FireReason::MaxWindow)
        } else {
            None
        };

        if let Some(reason) = reason {
            self.inner.fire_locked(&mut tables, key, reason);
            return;
        }

        let token = CancellationToken::new();
        buffer.timer = token.clone();
        buffer.generation = generation;

        let inner = self.inner.clone();
        let key = key.to_string();
        let silence = settings.silence;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(silence) => {
                    inner.fire_if_current(&key, generation).await;
                }
            }
        });
    }

    /// 立即触发某个键的缓冲区；没有缓冲区时返回 false
    pub async fn flush(&self, key: &str) -> bool {
        let mut tables = self.inner.tables.lock().await;
        self.inner.fire_locked(&mut tables, key, FireReason::Flush)
    }

    /// 立即触发所有缓冲区（关闭前调用），返回触发数
    pub async fn flush_all(&self) -> usize {
        let mut tables = self.inner.tables.lock().await;
        let keys: Vec<ConversationKey> = tables.buffers.keys().cloned().collect();
        keys.iter()
            .filter(|key| self.inner.fire_locked(&mut tables, key, FireReason::Flush))
            .count()
    }

    /// 活跃缓冲区数
    pub async fn pending_count(&self) -> usize {
        self.inner.tables.lock().await.buffers.len()
    }

    /// 等待所有已触发批次处理完成（不会触发挂起的缓冲区）
    pub async fn wait_idle(&self) {
        let tracker = &self.inner.tracker;
        loop {
            let idle = tracker.idle.notified();
            if tracker.active.load(Ordering::SeqCst) == 0 {
                break;
            }
            idle.await;
        }
        self.inner
            .tables
            .lock()
            .await
            .lanes
            .retain(|_, h| !h.is_finished());
    }
}
