//! 派发错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 FailureClass 决定 RetrySameAfter / NextCandidate / Abort。

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::llm::LlmError;

/// 单次调用失败的分类（封闭集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// 远端限流：短暂退避后重试同一候选一次
    RateLimited,
    /// 单次尝试超时
    Timeout,
    /// 网络重置、连接失败、5xx
    Network,
    /// 响应为空或无法解析
    Malformed,
    /// 请求本身不可恢复（鉴权、参数）
    Fatal,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureClass::RateLimited => "rate_limited",
            FailureClass::Timeout => "timeout",
            FailureClass::Network => "network",
            FailureClass::Malformed => "malformed",
            FailureClass::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

/// 恢复引擎根据失败分类给出的动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 等待后重试同一候选
    RetrySameAfter(Duration),
    /// 换下一个候选
    NextCandidate,
    /// 终止整个派发
    Abort,
}

/// 派发失败（对编排器可见的唯一错误）
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("No dispatch candidates configured")]
    NoCandidates,

    #[error("Fatal failure on candidate {candidate}: {source}")]
    Fatal {
        candidate: String,
        #[source]
        source: LlmError,
    },

    #[error("All {attempts} attempts failed, last on candidate {last_candidate}: {source}")]
    Exhausted {
        attempts: usize,
        last_candidate: String,
        #[source]
        source: LlmError,
    },
}

impl DispatchError {
    /// 最后一次底层失败的分类（NoCandidates 时为 None）
    pub fn class(&self) -> Option<FailureClass> {
        match self {
            DispatchError::NoCandidates => None,
            DispatchError::Fatal { source, .. } | DispatchError::Exhausted { source, .. } => {
                Some(source.class())
            }
        }
    }
}
