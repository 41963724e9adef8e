//! Usage: Generation request / wire record model (request body, NDJSON stream record normalisation).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};

pub const FALLBACK_MODEL: &str = "DeepSeek-R1";
pub const SEARCH_PROMPT_REQUIRED: &str = "联网搜索需要文本内容，请输入问题";
pub const EMPTY_MESSAGE: &str = "消息内容不能为空";

static LAST_MESSAGE_MILLIS: AtomicI64 = AtomicI64::new(0);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageAttachment {
    /// Raw base64 payload. A `data:<mime>;base64,` prefix is tolerated and stripped on send.
    pub base64: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub file_name: String,
}

impl ImageAttachment {
    pub fn payload(&self) -> &str {
        let raw = self.base64.trim();
        if raw.starts_with("data:") {
            if let Some((_, rest)) = raw.split_once(',') {
                return rest;
            }
        }
        raw
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub message_id: String,
    pub conversation_id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub image: Option<ImageAttachment>,
    #[serde(default)]
    pub online_search: bool,
    #[serde(default)]
    pub user_id: Option<String>,
}

impl GenerationRequest {
    pub fn new(conversation_id: impl Into<String>, model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            message_id: next_message_id(),
            conversation_id: conversation_id.into(),
            model: model.into(),
            prompt: prompt.into(),
            image: None,
            online_search: false,
            user_id: None,
        }
    }

    pub fn effective_model<'a>(&'a self, fallback: &'a str) -> &'a str {
        let model = self.model.trim();
        if model.is_empty() {
            fallback
        } else {
            model
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.message_id.trim().is_empty() {
            return Err("message_id is required".to_string());
        }
        if self.conversation_id.trim().is_empty() {
            return Err("conversation_id is required".to_string());
        }
        let prompt_empty = self.prompt.trim().is_empty();
        if self.online_search && prompt_empty {
            return Err(SEARCH_PROMPT_REQUIRED.to_string());
        }
        if prompt_empty && self.image.is_none() {
            return Err(EMPTY_MESSAGE.to_string());
        }
        Ok(())
    }

    pub(crate) fn to_body<'a>(&'a self, model: &'a str) -> GenerateBody<'a> {
        let image = self.image.as_ref();
        GenerateBody {
            prompt: &self.prompt,
            message: &self.prompt,
            conversation_id: &self.conversation_id,
            model_name: model,
            model,
            has_image: image.is_some(),
            image: image.map(ImageAttachment::payload),
            image_type: image
                .map(|v| v.mime_type.as_str())
                .filter(|v| !v.is_empty()),
            image_name: image
                .map(|v| v.file_name.as_str())
                .filter(|v| !v.is_empty()),
            online_search: self.online_search,
            message_id: &self.message_id,
        }
    }
}

/// `ai-<unix millis>`, strictly increasing within the process.
pub fn next_message_id() -> String {
    let now = crate::shared::time::now_unix_millis();
    let mut prev = LAST_MESSAGE_MILLIS.load(Ordering::Relaxed);
    loop {
        let next = now.max(prev + 1);
        match LAST_MESSAGE_MILLIS.compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return format!("ai-{next}"),
            Err(actual) => prev = actual,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct GenerateBody<'a> {
    pub prompt: &'a str,
    pub message: &'a str,
    pub conversation_id: &'a str,
    pub model_name: &'a str,
    pub model: &'a str,
    pub has_image: bool,
    pub image: Option<&'a str>,
    pub image_type: Option<&'a str>,
    pub image_name: Option<&'a str>,
    pub online_search: bool,
    pub message_id: &'a str,
}

/// One decoded NDJSON line. Text fields carry full cumulative values, never deltas.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamRecord {
    pub message_id: Option<String>,
    pub content: Option<String>,
    pub think: Option<String>,
    pub think_time: Option<f64>,
    pub model_name: Option<String>,
    pub search: Option<String>,
    /// Server-side failure; the message text arrives in `content` like any other text.
    pub error: bool,
    pub finished: bool,
    pub heartbeat: bool,
}

#[derive(Debug, Deserialize)]
struct RawStreamRecord {
    #[serde(default)]
    message_id: Option<Value>,
    #[serde(default)]
    content: Option<Value>,
    #[serde(default)]
    text: Option<Value>,
    #[serde(default)]
    think: Option<Value>,
    #[serde(default)]
    thinking: Option<Value>,
    #[serde(default)]
    think_time: Option<Value>,
    #[serde(default)]
    model_name: Option<Value>,
    #[serde(default)]
    search: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    finished: Option<Value>,
    #[serde(default)]
    heartbeat: Option<Value>,
}

impl StreamRecord {
    pub fn from_json_slice(line: &[u8]) -> Result<Self, String> {
        let raw: RawStreamRecord =
            serde_json::from_slice(line).map_err(|e| format!("PROTOCOL_ERROR: {e}"))?;
        Ok(Self::from_raw(raw))
    }

    fn from_raw(raw: RawStreamRecord) -> Self {
        // `content` wins over `text`, `think` over `thinking`; empty values count as absent.
        let content = raw
            .content
            .as_ref()
            .and_then(text_value)
            .or_else(|| raw.text.as_ref().and_then(text_value));
        let think = raw
            .think
            .as_ref()
            .and_then(text_value)
            .or_else(|| raw.thinking.as_ref().and_then(text_value));

        Self {
            message_id: raw.message_id.as_ref().and_then(plain_string),
            content,
            think,
            think_time: raw.think_time.as_ref().and_then(number_value),
            model_name: raw.model_name.as_ref().and_then(plain_string),
            search: raw.search.as_ref().and_then(text_value),
            error: raw.error.as_ref().is_some_and(truthy),
            finished: raw.finished.as_ref().is_some_and(truthy),
            heartbeat: raw.heartbeat.as_ref().is_some_and(truthy),
        }
    }

    pub fn has_visible_text(&self) -> bool {
        self.content.is_some() || self.think.is_some()
    }
}

fn plain_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Non-string payloads: prefer a nested `content`/`text` string, else the JSON text.
fn text_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Bool(false) => None,
        Value::String(s) => (!s.is_empty()).then(|| s.clone()),
        Value::Object(map) => {
            for key in ["content", "text"] {
                if let Some(Value::String(s)) = map.get(key) {
                    return (!s.is_empty()).then(|| s.clone());
                }
            }
            Some(value.to_string())
        }
        other => Some(other.to_string()),
    }
}

fn number_value(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    (n.is_finite() && n >= 0.0).then_some(n)
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|v| v != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Null => false,
        _ => true,
    }
}

/// Entry shape the browser client kept in local storage (`pending_ai_messages`).
#[derive(Debug, Deserialize)]
pub(crate) struct LegacyPendingEntry {
    #[serde(rename = "messageData")]
    pub message_data: LegacyMessageData,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LegacyMessageData {
    #[serde(default)]
    pub message: Option<String>,
    pub conversation_id: Value,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub user_id: Option<Value>,
    pub message_id: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub image_type: Option<String>,
    #[serde(default)]
    pub image_name: Option<String>,
}

impl LegacyMessageData {
    pub(crate) fn into_request(self) -> Option<GenerationRequest> {
        let conversation_id = plain_string(&self.conversation_id)?;
        if self.message_id.trim().is_empty() {
            return None;
        }
        let image = self.image.filter(|v| !v.is_empty()).map(|base64| ImageAttachment {
            base64,
            mime_type: self.image_type.unwrap_or_default(),
            file_name: self.image_name.unwrap_or_default(),
        });
        Some(GenerationRequest {
            message_id: self.message_id,
            conversation_id,
            model: self.model.unwrap_or_default(),
            prompt: self.message.unwrap_or_default(),
            image,
            online_search: false,
            user_id: self.user_id.as_ref().and_then(plain_string),
        })
    }
}
