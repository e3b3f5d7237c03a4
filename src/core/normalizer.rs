//! 回合归一化：把一批碎片合成一条发给补全服务的用户消息
//!
//! 默认 JoinNormalizer 用 " / " 直接拼接；ReassemblyNormalizer 先让模型把碎片整理成
//! {merged_text, items, followups} JSON，任何失败都退回拼接结果。

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::core::{DispatchRequest, Dispatcher};
use crate::memory::Message;

/// 合并碎片时的分隔符
pub const FRAGMENT_SEPARATOR: &str = " / ";

/// 整理时带上的最近历史条数
const REASSEMBLY_HISTORY: usize = 4;

const REASSEMBLY_PROMPT: &str = r#"You are a Thai conversation normalizer for a shop chat.
Input: multiple raw message fragments from a customer.
Goal: merge them into ONE structured JSON capturing products, quantity and follow-up questions.

Rules:
- Do NOT invent products or numbers.
- If a quantity has a unit (เส้น/ตัว/กิโล etc.), keep it.
- If no product is clearly stated, leave items empty and put the text into followups.
- Keep delivery/payment/stock questions as followups.
- Output ONLY minified JSON. No markdown.
JSON schema:
{"merged_text":"string","items":[{"product":"string","qty":number|null,"unit":"string|null"}],"followups":["string"]}"#;

#[async_trait]
pub trait TurnNormalizer: Send + Sync {
    /// fragments 已包含延续提示；history 为本轮将要发送的历史
    async fn normalize(&self, key: &str, fragments: &[String], history: &[Message]) -> String;
}

/// 直接拼接
pub fn join_fragments(fragments: &[String]) -> String {
    fragments.join(FRAGMENT_SEPARATOR)
}

pub struct JoinNormalizer;

#[async_trait]
impl TurnNormalizer for JoinNormalizer {
    async fn normalize(&self, _key: &str, fragments: &[String], _history: &[Message]) -> String {
        join_fragments(fragments)
    }
}

#[derive(Debug, Deserialize)]
struct ReassembledItem {
    #[serde(default)]
    product: Option<String>,
    #[serde(default)]
    qty: Option<f64>,
    #[serde(default)]
    unit: Option<String>,
}

impl ReassembledItem {
    fn render(&self) -> String {
        let mut out = self.product.clone().unwrap_or_default();
        if let Some(qty) = self.qty.filter(|q| q.is_finite()) {
            out.push(' ');
            out.push_str(&qty.to_string());
        }
        if let Some(unit) = self.unit.as_deref().filter(|u| !u.trim().is_empty()) {
            out.push(' ');
            out.push_str(unit.trim());
        }
        out.trim().to_string()
    }
}

#[derive(Debug, Deserialize)]
struct Reassembled {
    merged_text: String,
    #[serde(default)]
    items: Vec<ReassembledItem>,
    #[serde(default)]
    followups: Vec<String>,
}

impl Reassembled {
    /// 有商品条目时按「条目 / 追问」重排，否则用 merged_text
    fn render(&self) -> Option<String> {
        let items: Vec<String> = self
            .items
            .iter()
            .map(ReassembledItem::render)
            .filter(|s| !s.is_empty())
            .collect();
        let text = if items.is_empty() {
            self.merged_text.trim().to_string()
        } else {
            items
                .into_iter()
                .chain(self.followups.iter().map(|f| f.trim().to_string()))
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join(FRAGMENT_SEPARATOR)
        };
        (!text.is_empty()).then_some(text)
    }
}

/// 从模型输出中取出 JSON（兼容 ```json 包裹）并解析
fn parse_reassembled(content: &str) -> Option<Reassembled> {
    let trimmed = content.trim();
    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim())
    } else {
        match (trimmed.find('{'), trimmed.rfind('}')) {
            (Some(start), Some(end)) if start < end => &trimmed[start..=end],
            _ => return None,
        }
    };
    serde_json::from_str(json_str).ok()
}

/// 经派发器调用模型整理碎片，受同一并发上限约束
pub struct ReassemblyNormalizer {
    dispatcher: Arc<Dispatcher>,
    candidates: Vec<String>,
}

impl ReassemblyNormalizer {
    pub fn new(dispatcher: Arc<Dispatcher>, candidates: Vec<String>) -> Self {
        Self {
            dispatcher,
            candidates,
        }
    }
}

#[async_trait]
impl TurnNormalizer for ReassemblyNormalizer {
    async fn normalize(&self, key: &str, fragments: &[String], history: &[Message]) -> String {
        let fallback = join_fragments(fragments);
        // 单条碎片无需整理
        if fragments.len() < 2 || self.candidates.is_empty() {
            return fallback;
        }

        let mut messages = Vec::with_capacity(REASSEMBLY_HISTORY + 2);
        messages.push(Message::system(REASSEMBLY_PROMPT));
        let skip = history.len().saturating_sub(REASSEMBLY_HISTORY);
        messages.extend(history.iter().skip(skip).cloned());
        let numbered: Vec<String> = fragments
            .iter()
            .enumerate()
            .map(|(i, f)| format!("[{}] {}", i + 1, f))
            .collect();
        messages.push(Message::user(numbered.join("\n")));

        let request = DispatchRequest {
            key: key.to_string(),
            messages,
        };
        match self.dispatcher.dispatch(&request, &self.candidates).await {
            Ok(response) => match parse_reassembled(&response.content).and_then(|r| r.render()) {
                Some(text) => text,
                None => {
                    tracing::warn!(key = %key, "reassembly output unusable, joining fragments");
                    fallback
                }
            },
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "reassembly failed, joining fragments");
                fallback
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DispatchSettings;
    use crate::llm::{LlmError, ScriptedLlmClient};

    fn frags(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn reassembler(client: Arc<ScriptedLlmClient>) -> ReassemblyNormalizer {
        let dispatcher = Arc::new(Dispatcher::new(client, DispatchSettings::default()));
        ReassemblyNormalizer::new(dispatcher, vec!["m1".to_string()])
    }

    #[tokio::test]
    async fn test_join_normalizer() {
        let merged = JoinNormalizer
            .normalize("u1", &frags(&["ฉาก", "2 นิ้ว"]), &[])
            .await;
        assert_eq!(merged, "ฉาก / 2 นิ้ว");
    }

    #[test]
    fn test_parse_reassembled_variants() {
        let plain = parse_reassembled(r#"{"merged_text":"ฉาก 2 นิ้ว ราคา"}"#).unwrap();
        assert_eq!(plain.render().as_deref(), Some("ฉาก 2 นิ้ว ราคา"));

        let fenced = parse_reassembled(
            "```json\n{\"merged_text\":\"x\",\"items\":[{\"product\":\"ฉาก 2 นิ้ว\",\"qty\":10,\"unit\":\"เส้น\"}],\"followups\":[\"ส่งได้ไหม\"]}\n```",
        )
        .unwrap();
        assert_eq!(fenced.render().as_deref(), Some("ฉาก 2 นิ้ว 10 เส้น / ส่งได้ไหม"));

        assert!(parse_reassembled("sorry, I cannot").is_none());
        assert!(parse_reassembled(r#"{"items":[]}"#).is_none());
    }

    #[tokio::test]
    async fn test_reassembly_uses_model_output() {
        let client = Arc::new(ScriptedLlmClient::new());
        client.push("m1", Ok(r#"{"merged_text":"ท่อ 4 หุน ราคาเท่าไหร่","items":[],"followups":[]}"#.into()));
        let n = reassembler(client.clone());

        let merged = n
            .normalize("u1", &frags(&["ท่อ", "4 หุน", "ราคาเท่าไหร่"]), &[])
            .await;
        assert_eq!(merged, "ท่อ 4 หุน ราคาเท่าไหร่");
        let calls = client.calls();
        assert_eq!(calls[0].messages.last().unwrap().content, "[1] ท่อ\n[2] 4 หุน\n[3] ราคาเท่าไหร่");
    }

    #[tokio::test]
    async fn test_reassembly_falls_back_to_join() {
        let client = Arc::new(ScriptedLlmClient::new());
        client.push("m1", Ok("not json".into()));
        client.push("m1", Err(LlmError::Fatal("bad key".into())));
        let n = reassembler(client.clone());

        let input = frags(&["ฉาก", "2 นิ้ว"]);
        assert_eq!(n.normalize("u1", &input, &[]).await, "ฉาก / 2 นิ้ว");
        assert_eq!(n.normalize("u1", &input, &[]).await, "ฉาก / 2 นิ้ว");

        // 单条碎片不调用模型
        assert_eq!(n.normalize("u1", &frags(&["ฉาก"]), &[]).await, "ฉาก");
        assert_eq!(client.call_count(), 2);
    }
}
