//! 意图延续：一轮有效的子话题记忆
//!
//! 上一轮最后一条消息在问某商品组的「尺寸 / 每捆数量」时记下子话题；
//! 下一轮如果只是报了同组的某个规格（如「ฉาก 36 มิล」），就在批次末尾补一条提示，
//! 让下游按原子话题作答。记录只被读取一次，读完即删。

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// 子话题（封闭集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subtopic {
    /// 尺寸 / 规格
    Dimension,
    /// 每捆 / 每包数量
    BundleSize,
}

impl Subtopic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Subtopic::Dimension => "dimension",
            Subtopic::BundleSize => "bundle-size",
        }
    }
}

fn dimension_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // 只认提问句式；「ยาว 6 เมตร」这类规格描述不算
        Regex::new(concat!(
            r"(?i)(ขนาด\s*(เท่า|อะไร|ไหน|\?)|กี่ขนาด|ไซ[สซ]์\s*(อะไร|ไหน|เท่า)",
            r"|(ยาว|กว้าง|หนา|สูง)\s*(เท่า|กี่)|กี่\s*(มิล|มม|ซม|เซน|นิ้ว|เมตร|หุน)",
            r"|(what|which)\s+size|\bsize\s*\?|\bdimensions?\s*\?|how (big|long|wide|thick))"
        ))
        .expect("dimension regex")
    })
}

fn bundle_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(กี่เส้น|กี่ชิ้น|กี่แผ่น|กี่ตัว|มัดละ|ต่อมัด|แพ็คละ|ต่อแพ็ค|bundle|per pack|pieces per)")
            .expect("bundle regex")
    })
}

fn token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"#?\d+|[a-zA-Zก-๙]+").expect("token regex"))
}

/// 识别子话题；尺寸优先
pub fn detect_subtopic(text: &str) -> Option<Subtopic> {
    if dimension_regex().is_match(text) {
        Some(Subtopic::Dimension)
    } else if bundle_regex().is_match(text) {
        Some(Subtopic::BundleSize)
    } else {
        None
    }
}

/// 切词：数字（可带 #）或连续字母 / 泰文
pub fn tokens(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    token_regex()
        .find_iter(&lower)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// 归一化：小写，去空白与标点
pub fn normalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .filter(|c| !c.is_whitespace() && !c.is_ascii_punctuation() && !"“”‘’".contains(*c))
        .collect()
}

/// 商品组：名称 + 关键词
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProductGroup {
    pub name: String,
    pub keywords: Vec<String>,
}

impl ProductGroup {
    pub fn new(name: impl Into<String>, keywords: &[&str]) -> Self {
        Self {
            name: name.into(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
        }
    }
}

/// 默认商品组（钢材店）
pub fn default_product_groups() -> Vec<ProductGroup> {
    vec![
        ProductGroup::new("angle-zinc-edge", &["ฉากริมสังกะสี"]),
        ProductGroup::new("angle", &["ฉาก", "angle"]),
        ProductGroup::new("box-steel", &["เหล็กกล่อง", "box steel"]),
        ProductGroup::new("pipe", &["ท่อ", "pipe"]),
    ]
}

/// 关键词 -> 商品组，最长关键词优先（「ฉากริมสังกะสี」优先于「ฉาก」）
#[derive(Debug, Clone)]
pub struct GroupMatcher {
    /// (归一化关键词, 组名)，按关键词长度降序
    keywords: Vec<(String, String)>,
}

impl GroupMatcher {
    pub fn new(groups: &[ProductGroup]) -> Self {
        let mut keywords: Vec<(String, String)> = groups
            .iter()
            .flat_map(|g| {
                g.keywords
                    .iter()
                    .map(|k| (normalize(k), g.name.clone()))
                    .filter(|(k, _)| !k.is_empty())
            })
            .collect();
        keywords.sort_by(|a, b| b.0.chars().count().cmp(&a.0.chars().count()));
        Self { keywords }
    }

    pub fn detect(&self, text: &str) -> Option<&str> {
        let normalized = normalize(text);
        self.keywords
            .iter()
            .find(|(k, _)| normalized.contains(k.as_str()))
            .map(|(_, name)| name.as_str())
    }
}

/// 一轮有效的意图记录
#[derive(Debug, Clone)]
pub struct IntentRecord {
    pub subtopic: Subtopic,
    pub group: String,
    pub created_at: Instant,
}

/// 延续参数
#[derive(Debug, Clone)]
pub struct CarryOverSettings {
    /// 超过该时长的记录视为不存在（仍会被删除）
    pub max_age: Duration,
    pub groups: Vec<ProductGroup>,
    pub dimension_hint: String,
    pub bundle_hint: String,
}

impl Default for CarryOverSettings {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(600),
            groups: default_product_groups(),
            dimension_hint: "(ต่อจากคำถามก่อนหน้า: ลูกค้าถามเรื่องขนาดของสินค้านี้ กรุณาบอกขนาด)"
                .to_string(),
            bundle_hint: "(ต่อจากคำถามก่อนหน้า: ลูกค้าถามว่าหนึ่งมัดมีกี่ชิ้น กรุณาบอกจำนวนต่อมัด)"
                .to_string(),
        }
    }
}

/// 本轮对意图记录做了什么
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CarryOutcome {
    /// 无记录可用，也未新建
    Untouched,
    /// 本轮在问子话题，已记下
    Recorded { subtopic: Subtopic, group: String },
    /// 已在批次末尾补上提示
    Injected { subtopic: Subtopic, group: String },
    /// 旧记录不适用（换组、无法识别组、过期、不是单纯报规格），已丢弃
    Discarded,
}

/// 意图延续存储：会话键 -> 单槽记录
pub struct IntentCarryOver {
    records: Mutex<HashMap<String, IntentRecord>>,
    groups: GroupMatcher,
    settings: CarryOverSettings,
}

impl IntentCarryOver {
    pub fn new(settings: CarryOverSettings) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            groups: GroupMatcher::new(&settings.groups),
            settings,
        }
    }

    fn hint(&self, subtopic: Subtopic) -> &str {
        match subtopic {
            Subtopic::Dimension => &self.settings.dimension_hint,
            Subtopic::BundleSize => &self.settings.bundle_hint,
        }
    }

    /// 检查刚触发批次的最后一条：是子话题提问则记录，否则消费旧记录并按需注入提示
    pub async fn record_if_asked(&self, key: &str, batch: &mut Vec<String>) -> CarryOutcome {
        let Some(last) = batch.last().cloned() else {
            return CarryOutcome::Untouched;
        };
        let group = self.groups.detect(&last).map(str::to_string);
        let mut records = self.records.lock().await;
        let previous = records.remove(key);

        if let Some(subtopic) = detect_subtopic(&last) {
            // 无法确定商品组时不记录，旧记录同样作废
            return match group {
                Some(group) => {
                    records.insert(
                        key.to_string(),
                        IntentRecord {
                            subtopic,
                            group: group.clone(),
                            created_at: Instant::now(),
                        },
                    );
                    tracing::debug!(key = %key, subtopic = subtopic.as_str(), group = %group, "intent recorded");
                    CarryOutcome::Recorded { subtopic, group }
                }
                None if previous.is_some() => CarryOutcome::Discarded,
                None => CarryOutcome::Untouched,
            };
        }
        drop(records);

        let Some(record) = previous else {
            return CarryOutcome::Untouched;
        };
        if record.created_at.elapsed() > self.settings.max_age {
            tracing::debug!(key = %key, "stale intent discarded");
            return CarryOutcome::Discarded;
        }
        let is_bare_reference = tokens(&last).iter().any(|t| is_content_token(t));
        match group {
            Some(group) if group == record.group && is_bare_reference => {
                batch.push(self.hint(record.subtopic).to_string());
                tracing::debug!(key = %key, subtopic = record.subtopic.as_str(), group = %group, "intent carried over");
                CarryOutcome::Injected {
                    subtopic: record.subtopic,
                    group,
                }
            }
            _ => {
                tracing::debug!(key = %key, "intent discarded, topic changed");
                CarryOutcome::Discarded
            }
        }
    }

    /// 清除超过 max_age 的记录（会话不再发消息时不会被读取），返回清除数
    pub async fn sweep_stale(&self) -> usize {
        let max_age = self.settings.max_age;
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, r| r.created_at.elapsed() <= max_age);
        before - records.len()
    }

    /// 当前记录数
    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

/// 数字或至少两个字符的词
fn is_content_token(token: &str) -> bool {
    token.chars().any(|c| c.is_ascii_digit()) || token.chars().count() >= 2
}

impl Default for IntentCarryOver {
    fn default() -> Self {
        Self::new(CarryOverSettings::default())
    }
}
