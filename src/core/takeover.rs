//! 人工接管闸门：按会话暂停自动回复
//!
//! 两态：Automated（默认）⇄ Suspended(until)。到期后第一次查询时懒清理，
//! 不需要后台定时器；sweep_expired 仅用于可选的周期清扫。

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::Instant;

/// 单次接管最长一年
pub const MAX_TAKEOVER_MINUTES: u64 = 365 * 24 * 60;

/// 单个会话的接管状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TakeoverState {
    Automated,
    /// until 为墙钟时间，供管理端展示
    Suspended { until: DateTime<Utc> },
}

#[derive(Debug, Clone, Copy)]
struct TakeoverRecord {
    /// 单调时钟到期点，判断以此为准
    expires_at: Instant,
    until: DateTime<Utc>,
}

/// 接管闸门：会话键 -> 到期时间
#[derive(Debug, Default)]
pub struct TakeoverGate {
    records: Mutex<HashMap<String, TakeoverRecord>>,
}

impl TakeoverGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// 是否处于接管中；已过期的记录在此删除
    pub async fn is_suspended(&self, key: &str) -> bool {
        matches!(self.state(key).await, TakeoverState::Suspended { .. })
    }

    /// 当前状态（带懒过期）
    pub async fn state(&self, key: &str) -> TakeoverState {
        let mut records = self.records.lock().await;
        match records.get(key).copied() {
            Some(record) if Instant::now() < record.expires_at => {
                TakeoverState::Suspended { until: record.until }
            }
            Some(_) => {
                records.remove(key);
                tracing::info!(key = %key, "takeover expired, automated replies resumed");
                TakeoverState::Automated
            }
            None => TakeoverState::Automated,
        }
    }

    /// 设置/覆盖接管时长（分钟）；0 分钟等同 resume
    pub async fn suspend(&self, key: &str, minutes: u64) -> TakeoverState {
        if minutes == 0 {
            self.resume(key).await;
            return TakeoverState::Automated;
        }
        let minutes = minutes.min(MAX_TAKEOVER_MINUTES);
        let duration = Duration::from_secs(minutes * 60);
        let until = Utc::now()
            + chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365));
        let record = TakeoverRecord {
            expires_at: Instant::now() + duration,
            until,
        };
        self.records.lock().await.insert(key.to_string(), record);
        tracing::info!(key = %key, minutes, until = %until, "takeover started");
        TakeoverState::Suspended { until }
    }

    /// 无条件恢复自动回复；返回之前是否存在记录（幂等）
    pub async fn resume(&self, key: &str) -> bool {
        let removed = self.records.lock().await.remove(key).is_some();
        if removed {
            tracing::info!(key = %key, "takeover resumed");
        }
        removed
    }

    /// 清扫所有过期记录，返回清理条数
    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, r| now < r.expires_at);
        before - records.len()
    }

    /// 当前记录数（含尚未清理的过期项）
    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_default_is_automated() {
        let gate = TakeoverGate::new();
        assert!(!gate.is_suspended("u1").await);
        assert_eq!(gate.state("u1").await, TakeoverState::Automated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lazy_expiry_without_resume() {
        let gate = TakeoverGate::new();
        gate.suspend("u1", 5).await;
        assert!(gate.is_suspended("u1").await);

        tokio::time::advance(Duration::from_secs(5 * 60 - 1)).await;
        assert!(gate.is_suspended("u1").await);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!gate.is_suspended("u1").await);
        assert!(gate.is_empty().await);
    }

    #[tokio::test]
    async fn test_resume_is_idempotent() {
        let gate = TakeoverGate::new();
        gate.suspend("u1", 30).await;
        assert!(gate.resume("u1").await);
        assert!(!gate.is_suspended("u1").await);
        assert!(!gate.resume("u1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspend_overwrites_expiry() {
        let gate = TakeoverGate::new();
        gate.suspend("u1", 60).await;
        gate.suspend("u1", 1).await;

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!gate.is_suspended("u1").await);
    }

    #[tokio::test]
    async fn test_zero_minutes_resumes() {
        let gate = TakeoverGate::new();
        gate.suspend("u1", 10).await;
        assert_eq!(gate.suspend("u1", 0).await, TakeoverState::Automated);
        assert!(!gate.is_suspended("u1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_only_removes_expired() {
        let gate = TakeoverGate::new();
        gate.suspend("short", 1).await;
        gate.suspend("long", 10).await;

        tokio::time::advance(Duration::from_secs(120)).await;
        assert_eq!(gate.sweep_expired().await, 1);
        assert_eq!(gate.len().await, 1);
        assert!(gate.is_suspended("long").await);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let gate = TakeoverGate::new();
        gate.suspend("u1", 10).await;
        assert!(gate.is_suspended("u1").await);
        assert!(!gate.is_suspended("u2").await);
    }
}
