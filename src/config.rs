//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `SHOPBEE__*` 覆盖（双下划线表示嵌套，如 `SHOPBEE__DISPATCHER__MAX_CONCURRENT=2`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::{AggregatorSettings, CarryOverSettings, DispatchSettings, ProductGroup};
use crate::llm::OPENROUTER_BASE_URL;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub aggregator: AggregatorSection,
    pub dispatcher: DispatcherSection,
    pub llm: LlmSection,
    pub takeover: TakeoverSection,
    pub carry_over: CarryOverSection,
    pub conversation: ConversationSection,
}

/// [aggregator] 段：静默期、窗口上限、碎片数上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AggregatorSection {
    pub silence_ms: u64,
    pub max_window_ms: u64,
    pub max_fragments: usize,
}

impl Default for AggregatorSection {
    fn default() -> Self {
        Self {
            silence_ms: 15_000,
            max_window_ms: 60_000,
            max_fragments: 16,
        }
    }
}

/// [dispatcher] 段：并发上限、单次超时、限流退避、候选模型
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherSection {
    pub max_concurrent: usize,
    pub attempt_timeout_secs: u64,
    pub rate_limit_backoff_min_ms: u64,
    pub rate_limit_backoff_max_ms: u64,
    /// 按顺序尝试的模型标识
    pub candidates: Vec<String>,
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            attempt_timeout_secs: 25,
            rate_limit_backoff_min_ms: 300,
            rate_limit_backoff_max_ms: 800,
            candidates: vec!["openai/gpt-4o-mini".to_string()],
        }
    }
}

/// [llm] 段：补全服务端点（API Key 走环境变量 OPENROUTER_API_KEY）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub base_url: String,
    pub temperature: f32,
    pub referer: Option<String>,
    pub title: Option<String>,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            base_url: OPENROUTER_BASE_URL.to_string(),
            temperature: 0.7,
            referer: None,
            title: Some("shopbee".to_string()),
        }
    }
}

/// [takeover] 段：管理端未给时长时的默认接管分钟数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TakeoverSection {
    pub default_minutes: u64,
}

impl Default for TakeoverSection {
    fn default() -> Self {
        Self {
            default_minutes: 60,
        }
    }
}

/// [carry_over] 段：意图记录最长存活、商品组、提示文本
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CarryOverSection {
    pub max_age_secs: u64,
    pub groups: Vec<ProductGroup>,
    pub dimension_hint: String,
    pub bundle_hint: String,
}

impl Default for CarryOverSection {
    fn default() -> Self {
        let defaults = CarryOverSettings::default();
        Self {
            max_age_secs: defaults.max_age.as_secs(),
            groups: defaults.groups,
            dimension_hint: defaults.dimension_hint,
            bundle_hint: defaults.bundle_hint,
        }
    }
}

/// [conversation] 段：系统提示、兜底回复、历史保留、回复长度、话题切换关键词
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConversationSection {
    /// 为空时尝试读取 config/prompts/system.md
    pub system_prompt: String,
    pub fallback_message: String,
    pub history_max_messages: usize,
    pub history_ttl_secs: u64,
    pub max_reply_chars: usize,
    /// 为空表示关闭话题切换重置
    pub topic_reset_keywords: Vec<String>,
    /// 多条碎片先经模型整理再派发；关闭时直接拼接
    pub reassemble: bool,
    /// 收到非文本消息时的礼貌回复，为空则不回
    pub unsupported_message_reply: String,
}

impl Default for ConversationSection {
    fn default() -> Self {
        Self {
            system_prompt: String::new(),
            fallback_message: "ขอโทษค่ะ ระบบขัดข้องชั่วคราว กรุณาลองใหม่อีกครั้งนะคะ 🙏".to_string(),
            history_max_messages: 10,
            history_ttl_secs: 86_400,
            max_reply_chars: 5000,
            topic_reset_keywords: Vec::new(),
            reassemble: false,
            unsupported_message_reply: "ตอนนี้ระบบรองรับเฉพาะข้อความนะคะ 🙏".to_string(),
        }
    }
}

impl AppConfig {
    pub fn aggregator_settings(&self) -> AggregatorSettings {
        AggregatorSettings {
            silence: Duration::from_millis(self.aggregator.silence_ms),
            max_window: Duration::from_millis(self.aggregator.max_window_ms),
            max_fragments: self.aggregator.max_fragments.max(1),
        }
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        let min = self.dispatcher.rate_limit_backoff_min_ms;
        DispatchSettings {
            max_concurrent: self.dispatcher.max_concurrent.max(1),
            attempt_timeout: Duration::from_secs(self.dispatcher.attempt_timeout_secs.max(1)),
            rate_limit_backoff_min: Duration::from_millis(min),
            rate_limit_backoff_max: Duration::from_millis(
                self.dispatcher.rate_limit_backoff_max_ms.max(min),
            ),
        }
    }

    pub fn carry_over_settings(&self) -> CarryOverSettings {
        CarryOverSettings {
            max_age: Duration::from_secs(self.carry_over.max_age_secs),
            groups: self.carry_over.groups.clone(),
            dimension_hint: self.carry_over.dimension_hint.clone(),
            bundle_hint: self.carry_over.bundle_hint.clone(),
        }
    }

    /// 系统提示：配置内联 > config/prompts/system.md > 内置默认
    pub fn system_prompt(&self) -> String {
        if !self.conversation.system_prompt.trim().is_empty() {
            return self.conversation.system_prompt.clone();
        }
        [
            "config/prompts/system.md",
            "../config/prompts/system.md",
        ]
        .into_iter()
        .find_map(|p| std::fs::read_to_string(p).ok())
        .unwrap_or_else(|| {
            "You are a friendly Thai shop assistant. Answer product questions concisely and politely in Thai.".to_string()
        })
    }
}

/// 从 config 目录加载配置，环境变量 SHOPBEE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 SHOPBEE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("SHOPBEE")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("dispatcher.candidates")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = AppConfig::default();
        let agg = cfg.aggregator_settings();
        assert_eq!(agg.silence, Duration::from_secs(15));
        assert_eq!(agg.max_window, Duration::from_secs(60));
        assert_eq!(agg.max_fragments, 16);

        let dispatch = cfg.dispatch_settings();
        assert_eq!(dispatch.max_concurrent, 4);
        assert_eq!(dispatch.attempt_timeout, Duration::from_secs(25));
        assert_eq!(cfg.conversation.history_max_messages, 10);
        assert!(!cfg.carry_over.groups.is_empty());
    }

    #[test]
    fn test_load_from_explicit_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[aggregator]
silence_ms = 2000

[dispatcher]
max_concurrent = 2
candidates = ["a/model", "b/model"]

[[carry_over.groups]]
name = "nails"
keywords = ["ตะปู", "nail"]
"#
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.aggregator.silence_ms, 2000);
        assert_eq!(cfg.aggregator.max_window_ms, 60_000);
        assert_eq!(cfg.dispatcher.max_concurrent, 2);
        assert_eq!(cfg.dispatcher.candidates, vec!["a/model", "b/model"]);
        assert_eq!(cfg.carry_over.groups.len(), 1);
        assert_eq!(cfg.carry_over.groups[0].name, "nails");
    }

    #[test]
    fn test_invalid_values_are_clamped() {
        let mut cfg = AppConfig::default();
        cfg.aggregator.max_fragments = 0;
        cfg.dispatcher.max_concurrent = 0;
        cfg.dispatcher.rate_limit_backoff_min_ms = 900;
        cfg.dispatcher.rate_limit_backoff_max_ms = 100;
        cfg.dispatcher.attempt_timeout_secs = 0;

        assert_eq!(cfg.aggregator_settings().max_fragments, 1);
        let dispatch = cfg.dispatch_settings();
        assert_eq!(dispatch.max_concurrent, 1);
        assert_eq!(dispatch.attempt_timeout, Duration::from_secs(1));
        assert_eq!(dispatch.rate_limit_backoff_max, Duration::from_millis(900));
    }

    #[test]
    fn test_inline_system_prompt_wins() {
        let mut cfg = AppConfig::default();
        cfg.conversation.system_prompt = "custom".to_string();
        assert_eq!(cfg.system_prompt(), "custom");
    }
}
