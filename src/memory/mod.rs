//! 记忆层：对话消息模型与会话历史存储

pub mod conversation;
pub mod history;

pub use conversation::{last_user_content, Message, Role};
pub use history::{HistoryStore, InMemoryHistoryStore};
