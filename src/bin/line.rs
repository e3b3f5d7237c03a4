//! ShopBee LINE 服务
//!
//! 通过 LINE Messaging API Webhook 接收顾客消息，聚合后派发给 OpenRouter，回复走 push API。
//!
//! 环境变量:
//! - LINE_CHANNEL_SECRET: Webhook 签名密钥
//! - LINE_CHANNEL_ACCESS_TOKEN: push API 令牌
//! - OPENROUTER_API_KEY: 补全服务 Key（未设置则使用 Mock）
//! - ADMIN_TOKEN: 人工接管管理端点的 Bearer 令牌（未设置则关闭管理端点）
//! - PORT: 监听端口 (默认 3000)
//!
//! 启动: cargo run --bin shopbee-line --features line

#[cfg(feature = "line")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::Context;
    use shopbee::config::load_config;
    use shopbee::core::shutdown::drain;
    use shopbee::core::{CoordinatorBuilder, ShutdownManager};
    use shopbee::integrations::line::{create_router, LinePushChannel, LineState};

    shopbee::observability::init();

    let channel_secret =
        std::env::var("LINE_CHANNEL_SECRET").context("LINE_CHANNEL_SECRET must be set")?;
    let access_token = std::env::var("LINE_CHANNEL_ACCESS_TOKEN")
        .context("LINE_CHANNEL_ACCESS_TOKEN must be set")?;
    let admin_token = std::env::var("ADMIN_TOKEN").ok().filter(|t| !t.is_empty());
    if admin_token.is_none() {
        tracing::warn!("ADMIN_TOKEN not set, takeover endpoints disabled");
    }

    let cfg = load_config(None).context("Failed to load config")?;
    let coordinator = CoordinatorBuilder::new(cfg)
        .with_channel(Arc::new(LinePushChannel::new(access_token)))
        .build();

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();
    let sweeper = coordinator.spawn_state_sweeper(Duration::from_secs(60), shutdown.token());

    let state = Arc::new(LineState {
        coordinator: coordinator.clone(),
        channel_secret,
        admin_token,
    });
    let app = create_router(state);

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(3000);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("ShopBee LINE server listening on http://{}", addr);
    tracing::info!("Webhook URL: http://YOUR_HOST:{}/webhook", port);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let graceful = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { graceful.wait_for_shutdown().await })
        .await?;

    drain(&coordinator, Duration::from_secs(30)).await;
    let _ = sweeper.await;

    Ok(())
}

#[cfg(not(feature = "line"))]
fn main() {
    eprintln!("请使用 --features line 编译: cargo run --bin shopbee-line --features line");
    std::process::exit(1);
}
