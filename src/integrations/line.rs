//! LINE Messaging API 集成
//!
//! Webhook 收到文本事件后只做签名校验与入队，立即返回 200；
//! 回复经聚合、派发后通过 push API 异步发出（reply token 等不到 15 秒静默期）。
//! 贴图、图片等非文本消息回一句固定提示，不进入聚合。
//!
//! 另提供人工接管的管理端点（Bearer ADMIN_TOKEN）：
//! - GET    /admin/takeover/:key  查询状态
//! - POST   /admin/takeover/:key  接管，body 可选 {"minutes": n}，格式错误返回 400
//! - DELETE /admin/takeover/:key  恢复自动回复

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::Sha256;

use crate::core::{Coordinator, TakeoverState};
use crate::integrations::{truncate_chars, ChannelError, InboundMessage, ReplyChannel};

pub const LINE_API_BASE: &str = "https://api.line.me";
pub const SIGNATURE_HEADER: &str = "x-line-signature";
/// LINE 单条文本上限
pub const LINE_MAX_TEXT_CHARS: usize = 5000;

/// LINE 服务状态
pub struct LineState {
    pub coordinator: Coordinator,
    pub channel_secret: String,
    /// 未配置时管理端点一律 403
    pub admin_token: Option<String>,
}

/// Webhook 请求体
#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub events: Vec<WebhookEvent>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: Option<EventSource>,
    pub message: Option<EventMessage>,
}

#[derive(Debug, Deserialize)]
pub struct EventSource {
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EventMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    pub text: Option<String>,
}

/// Webhook 事件的处理方式
#[derive(Debug, PartialEq, Eq)]
pub enum LineEvent {
    Text(InboundMessage),
    /// 用户发来的非文本消息
    Unsupported { key: String },
    Ignored,
}

impl WebhookEvent {
    pub fn classify(self) -> LineEvent {
        if self.event_type != "message" {
            return LineEvent::Ignored;
        }
        let (Some(key), Some(message)) = (self.source.and_then(|s| s.user_id), self.message) else {
            return LineEvent::Ignored;
        };
        match (message.message_type.as_str(), message.text) {
            ("text", Some(text)) => LineEvent::Text(InboundMessage::new(key, text)),
            ("text", None) => LineEvent::Ignored,
            _ => LineEvent::Unsupported { key },
        }
    }
}

/// 校验 x-line-signature：base64(HMAC-SHA256(channel_secret, raw_body))
pub fn verify_signature(channel_secret: &str, body: &[u8], signature: &str) -> bool {
    if channel_secret.is_empty() {
        return false;
    }
    let Ok(expected) = base64::engine::general_purpose::STANDARD.decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(channel_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// 创建 LINE 路由
pub fn create_router(state: Arc<LineState>) -> Router {
    Router::new()
        .route("/webhook", post(webhook_receive))
        .route("/health", get(|| async { "OK" }))
        .route(
            "/admin/takeover/:key",
            get(takeover_get).post(takeover_suspend).delete(takeover_resume),
        )
        .with_state(state)
}

/// POST /webhook - 接收 LINE 事件
async fn webhook_receive(
    State(state): State<Arc<LineState>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !verify_signature(&state.channel_secret, &body, signature) {
        tracing::warn!("LINE webhook signature verification failed");
        return StatusCode::UNAUTHORIZED;
    }

    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!("Invalid LINE webhook payload: {}", e);
            return StatusCode::BAD_REQUEST;
        }
    };

    for event in payload.events {
        match event.classify() {
            LineEvent::Text(inbound) => {
                tracing::debug!(key = %inbound.key, "LINE text event received");
                state.coordinator.submit(inbound).await;
            }
            LineEvent::Unsupported { key } => {
                tracing::debug!(key = %key, "LINE non-text message received");
                state.coordinator.notify_unsupported(&key).await;
            }
            LineEvent::Ignored => {}
        }
    }

    StatusCode::OK
}

#[derive(Debug, Deserialize)]
pub struct SuspendBody {
    pub minutes: Option<u64>,
}

#[derive(Debug, Serialize)]
struct TakeoverView {
    key: String,
    state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    until: Option<String>,
}

impl TakeoverView {
    fn new(key: String, state: TakeoverState) -> Self {
        match state {
            TakeoverState::Automated => Self {
                key,
                state: "automated",
                until: None,
            },
            TakeoverState::Suspended { until } => Self {
                key,
                state: "suspended",
                until: Some(until.to_rfc3339()),
            },
        }
    }
}

fn authorized(state: &LineState, headers: &HeaderMap) -> bool {
    let Some(expected) = state.admin_token.as_deref().filter(|t| !t.is_empty()) else {
        return false;
    };
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|token| token.trim() == expected)
        .unwrap_or(false)
}

type AdminResult = Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)>;

fn forbidden() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::FORBIDDEN, Json(json!({ "error": "forbidden" })))
}

/// 空 body 视为未指定时长；非空但解析失败为 Err
fn parse_suspend_body(body: &[u8]) -> Result<Option<u64>, serde_json::Error> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice::<SuspendBody>(body).map(|b| b.minutes)
}

fn view_json(key: String, state: TakeoverState) -> Json<serde_json::Value> {
    Json(serde_json::to_value(TakeoverView::new(key, state)).unwrap_or_default())
}

/// GET /admin/takeover/:key
async fn takeover_get(
    State(state): State<Arc<LineState>>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> AdminResult {
    if !authorized(&state, &headers) {
        return Err(forbidden());
    }
    let current = state.coordinator.takeover_state(&key).await;
    Ok(view_json(key, current))
}

/// POST /admin/takeover/:key
async fn takeover_suspend(
    State(state): State<Arc<LineState>>,
    Path(key): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> AdminResult {
    if !authorized(&state, &headers) {
        return Err(forbidden());
    }
    let minutes = parse_suspend_body(&body).map_err(|e| {
        tracing::warn!(key = %key, "invalid takeover body: {}", e);
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": format!("invalid body: {}", e) })),
        )
    })?;
    let current = state.coordinator.suspend(&key, minutes).await;
    Ok(view_json(key, current))
}

/// DELETE /admin/takeover/:key
async fn takeover_resume(
    State(state): State<Arc<LineState>>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> AdminResult {
    if !authorized(&state, &headers) {
        return Err(forbidden());
    }
    state.coordinator.resume(&key).await;
    Ok(view_json(key, TakeoverState::Automated))
}

#[derive(Debug, Serialize)]
struct PushRequest<'a> {
    to: &'a str,
    messages: Vec<PushText>,
}

#[derive(Debug, Serialize)]
struct PushText {
    #[serde(rename = "type")]
    message_type: &'static str,
    text: String,
}

/// 通过 LINE push API 发送回复
pub struct LinePushChannel {
    client: reqwest::Client,
    access_token: String,
    api_base: String,
}

impl LinePushChannel {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self::with_base(access_token, LINE_API_BASE)
    }

    pub fn with_base(access_token: impl Into<String>, api_base: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            access_token: access_token.into(),
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ReplyChannel for LinePushChannel {
    async fn send(&self, key: &str, text: &str) -> Result<(), ChannelError> {
        let req = PushRequest {
            to: key,
            messages: vec![PushText {
                message_type: "text",
                text: truncate_chars(text, LINE_MAX_TEXT_CHARS),
            }],
        };
        let url = format!("{}/v2/bot/message/push", self.api_base);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(&req)
            .send()
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ChannelError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}
