//! 优雅关闭
//!
//! 收到 Ctrl+C / SIGTERM 后取消 token；调用方据此停止接收新消息，
//! 再 flush 所有未触发的缓冲并等待在途回合结束。

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::core::Coordinator;

/// 关闭信号管理器
#[derive(Clone, Default)]
pub struct ShutdownManager {
    shutdown_token: CancellationToken,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取关闭 token（用于停止后台任务）
    pub fn token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown_token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    pub async fn wait_for_shutdown(&self) {
        self.shutdown_token.cancelled().await;
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
                manager.shutdown();
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, initiating graceful shutdown...");
                    manager.shutdown();
                }
            });
        }
    }
}

/// 立即触发所有待处理缓冲并等待回合完成，超时则放弃等待
pub async fn drain(coordinator: &Coordinator, timeout: Duration) {
    let flushed = coordinator.flush_all().await;
    tracing::info!(flushed, "Pending buffers flushed, waiting for in-flight turns");
    if tokio::time::timeout(timeout, coordinator.wait_idle()).await.is_err() {
        tracing::warn!("In-flight turns did not finish within {}s", timeout.as_secs());
    }
}
