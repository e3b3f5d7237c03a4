//! 错误恢复策略
//!
//! 根据 FailureClass 返回 RecoveryAction，派发器只按动作执行，不自己判断错误类型。

use std::time::Duration;

use rand::Rng;

use crate::core::{FailureClass, RecoveryAction};

/// 同一候选在限流后最多重试的次数
pub const RATE_LIMIT_RETRIES: u32 = 1;

/// 失败分类 -> 动作的唯一映射点
#[derive(Debug, Clone)]
pub struct RecoveryEngine {
    backoff_min: Duration,
    backoff_max: Duration,
}

impl RecoveryEngine {
    pub fn new(backoff_min: Duration, backoff_max: Duration) -> Self {
        Self {
            backoff_min,
            backoff_max: backoff_max.max(backoff_min),
        }
    }

    /// `retries_on_candidate`：当前候选已经重试过的次数（首次尝试为 0）
    pub fn decide(&self, class: FailureClass, retries_on_candidate: u32) -> RecoveryAction {
        match class {
            FailureClass::RateLimited if retries_on_candidate < RATE_LIMIT_RETRIES => {
                RecoveryAction::RetrySameAfter(self.jittered_backoff())
            }
            FailureClass::RateLimited
            | FailureClass::Timeout
            | FailureClass::Network
            | FailureClass::Malformed => RecoveryAction::NextCandidate,
            FailureClass::Fatal => RecoveryAction::Abort,
        }
    }

    /// [min, max] 内均匀抖动
    fn jittered_backoff(&self) -> Duration {
        let min = self.backoff_min.as_millis() as u64;
        let max = self.backoff_max.as_millis() as u64;
        if max <= min {
            return self.backoff_min;
        }
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

impl Default for RecoveryEngine {
    fn default() -> Self {
        Self::new(Duration::from_millis(300), Duration::from_millis(800))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited_retries_once_with_jitter() {
        let engine = RecoveryEngine::default();
        for _ in 0..32 {
            match engine.decide(FailureClass::RateLimited, 0) {
                RecoveryAction::RetrySameAfter(d) => {
                    assert!(d >= Duration::from_millis(300), "{d:?}");
                    assert!(d <= Duration::from_millis(800), "{d:?}");
                }
                other => panic!("Expected RetrySameAfter, got {other:?}"),
            }
        }
        assert_eq!(
            engine.decide(FailureClass::RateLimited, 1),
            RecoveryAction::NextCandidate
        );
    }

    #[test]
    fn test_transient_classes_fail_over() {
        let engine = RecoveryEngine::default();
        for class in [FailureClass::Timeout, FailureClass::Network, FailureClass::Malformed] {
            assert_eq!(engine.decide(class, 0), RecoveryAction::NextCandidate);
        }
    }

    #[test]
    fn test_fatal_aborts() {
        let engine = RecoveryEngine::default();
        assert_eq!(engine.decide(FailureClass::Fatal, 0), RecoveryAction::Abort);
    }

    #[test]
    fn test_degenerate_range_uses_min() {
        let engine = RecoveryEngine::new(Duration::from_millis(500), Duration::from_millis(100));
        assert_eq!(
            engine.decide(FailureClass::RateLimited, 0),
            RecoveryAction::RetrySameAfter(Duration::from_millis(500))
        );
    }
}
