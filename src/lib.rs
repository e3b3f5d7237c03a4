//! ShopBee - 店铺聊天机器人的会话并发协调器
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 碎片聚合、限流派发与故障转移、人工接管、意图延续、回合编排
//! - **integrations**: 回复通道抽象与 LINE 接入（`line` feature）
//! - **llm**: 补全服务抽象与实现（OpenRouter / Mock）
//! - **memory**: 对话消息模型与会话历史
//! - **observability**: 日志初始化

pub mod config;
pub mod core;
pub mod integrations;
pub mod llm;
pub mod memory;
pub mod observability;

pub use crate::core::{Coordinator, CoordinatorBuilder};
