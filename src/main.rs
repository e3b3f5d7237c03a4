//! ShopBee 控制台模式
//!
//! 从标准输入读取消息，回复打印到标准输出；用于本地调试聚合与派发行为。
//!
//! 输入格式：
//! - `key<TAB>text`：指定会话键
//! - `text`：会话键为 "console"
//! - `/suspend key [minutes]`、`/resume key`、`/flush`：管理命令
//!
//! 未设置 OPENROUTER_API_KEY 时使用 Mock LLM（回显）。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use shopbee::config::load_config;
use shopbee::core::shutdown::drain;
use shopbee::core::{Coordinator, CoordinatorBuilder, ShutdownManager, TakeoverState};
use shopbee::integrations::InboundMessage;
use tokio::io::{AsyncBufReadExt, BufReader};

const CONSOLE_KEY: &str = "console";

#[derive(Debug, PartialEq, Eq)]
enum ConsoleInput {
    Message(InboundMessage),
    Suspend { key: String, minutes: Option<u64> },
    Resume { key: String },
    Flush,
    Empty,
}

fn parse_line(line: &str) -> ConsoleInput {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return ConsoleInput::Empty;
    }
    if let Some(rest) = line.strip_prefix('/') {
        let mut parts = rest.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("suspend"), Some(key)) => {
                return ConsoleInput::Suspend {
                    key: key.to_string(),
                    minutes: parts.next().and_then(|m| m.parse().ok()),
                }
            }
            (Some("resume"), Some(key)) => {
                return ConsoleInput::Resume {
                    key: key.to_string(),
                }
            }
            (Some("flush"), None) => return ConsoleInput::Flush,
            _ => {}
        }
    }
    match line.split_once('\t') {
        Some((key, text)) if !key.trim().is_empty() => {
            ConsoleInput::Message(InboundMessage::new(key.trim(), text))
        }
        _ => ConsoleInput::Message(InboundMessage::new(CONSOLE_KEY, line)),
    }
}

async fn handle_input(coordinator: &Coordinator, input: ConsoleInput) {
    match input {
        ConsoleInput::Message(message) => coordinator.submit(message).await,
        ConsoleInput::Suspend { key, minutes } => match coordinator.suspend(&key, minutes).await {
            TakeoverState::Suspended { until } => println!("[admin] {} suspended until {}", key, until),
            TakeoverState::Automated => println!("[admin] {} automated", key),
        },
        ConsoleInput::Resume { key } => {
            coordinator.resume(&key).await;
            println!("[admin] {} automated", key);
        }
        ConsoleInput::Flush => {
            let flushed = coordinator.flush_all().await;
            println!("[admin] flushed {} buffer(s)", flushed);
        }
        ConsoleInput::Empty => {}
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    shopbee::observability::init();

    let cfg = load_config(None).context("Failed to load config")?;
    let coordinator = CoordinatorBuilder::new(cfg).build();

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();
    let sweeper = coordinator.spawn_state_sweeper(Duration::from_secs(60), shutdown.token());

    tracing::info!("ShopBee console ready, type messages (key<TAB>text or text)");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = shutdown.wait_for_shutdown() => break,
            line = lines.next_line() => match line.context("Failed to read stdin")? {
                Some(line) => handle_input(&coordinator, parse_line(&line)).await,
                None => break,
            },
        }
    }

    shutdown.shutdown();
    drain(&coordinator, Duration::from_secs(30)).await;
    let _ = sweeper.await;

    Ok(())
}
