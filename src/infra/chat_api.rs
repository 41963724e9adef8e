//! Usage: HTTP client for the chat server (generate stream, persistence and account collaborators).

use crate::domain::generation::GenerationRequest;
use crate::settings::ClientSettings;
use reqwest::header::{HeaderValue, COOKIE};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

const ERROR_BODY_PREVIEW_CHARS: usize = 300;

#[derive(Debug, Clone)]
pub struct ChatApiConfig {
    pub base_url: String,
    pub session_cookie: Option<String>,
    pub connect_timeout: Duration,
    /// Applied to every call except the generate stream. `None` = no limit.
    pub request_timeout: Option<Duration>,
}

impl ChatApiConfig {
    pub fn from_settings(settings: &ClientSettings) -> Self {
        let cookie = settings.session_cookie.trim();
        Self {
            base_url: settings.base_url.trim().trim_end_matches('/').to_string(),
            session_cookie: (!cookie.is_empty()).then(|| cookie.to_string()),
            connect_timeout: Duration::from_secs(settings.connect_timeout_seconds.max(1) as u64),
            request_timeout: (settings.request_timeout_seconds > 0)
                .then(|| Duration::from_secs(settings.request_timeout_seconds as u64)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConversationInfo {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PointsInfo {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub points: Option<f64>,
    #[serde(default)]
    pub formatted_points: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FreeUsageInfo {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub current: i64,
    #[serde(default)]
    pub limit: i64,
    #[serde(default)]
    pub remaining: i64,
}

/// Conversation ids are integers on the server but travel as strings everywhere else.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}

#[derive(Debug, Clone)]
pub struct ChatApi {
    client: reqwest::Client,
    config: ChatApiConfig,
}

fn body_preview(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= ERROR_BODY_PREVIEW_CHARS {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(ERROR_BODY_PREVIEW_CHARS).collect();
    out.push('…');
    out
}

impl ChatApi {
    pub fn new(config: ChatApiConfig) -> Result<Self, String> {
        if !(config.base_url.starts_with("http://") || config.base_url.starts_with("https://")) {
            return Err(format!(
                "SEC_INVALID_INPUT: base_url must start with http:// or https:// (got {})",
                config.base_url
            ));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .user_agent(concat!("chat-stream/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| format!("HTTP_CLIENT_INIT: {e}"))?;
        Ok(Self { client, config })
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let Some(cookie) = self.config.session_cookie.as_deref() else {
            return builder;
        };
        match HeaderValue::from_str(cookie) {
            Ok(value) => builder.header(COOKIE, value),
            Err(_) => {
                tracing::warn!("session_cookie 含非法字符，已忽略");
                builder
            }
        }
    }

    fn bounded(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = self.authorized(builder);
        match self.config.request_timeout {
            Some(timeout) => builder.timeout(timeout),
            None => builder,
        }
    }

    async fn ensure_success(resp: reqwest::Response, what: &str) -> Result<reqwest::Response, String> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let text = resp.text().await.unwrap_or_default();
        Err(format!(
            "HTTP_ERROR: {what} failed: status={} body={}",
            status.as_u16(),
            body_preview(&text)
        ))
    }

    /// Opens the NDJSON generate stream. No overall timeout: the body may stay open for minutes.
    pub(crate) async fn start_generation(
        &self,
        request: &GenerationRequest,
        model: &str,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let url = self.url(&format!("/api/chat/{}/generate", request.conversation_id));
        self.authorized(self.client.post(url))
            .json(&request.to_body(model))
            .send()
            .await
    }

    /// Message ids the server still streams for. Accepts `{id: {...}}` or `[id, ...]`.
    pub async fn active_responses(&self) -> Result<HashSet<String>, String> {
        let resp = self
            .bounded(self.client.get(self.url("/api/chat/active_responses")))
            .send()
            .await
            .map_err(|e| format!("HTTP_REQUEST_FAILED: active_responses: {e}"))?;
        let resp = Self::ensure_success(resp, "active_responses").await?;
        let value: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| format!("HTTP_INVALID_BODY: active_responses: {e}"))?;
        parse_active_ids(&value)
    }

    pub async fn save_message(&self, conversation_id: &str, content: &str) -> Result<(), String> {
        let resp = self
            .bounded(
                self.client
                    .post(self.url(&format!("/conversations/{conversation_id}/messages"))),
            )
            .json(&serde_json::json!({ "content": content, "is_user": false }))
            .send()
            .await
            .map_err(|e| format!("HTTP_REQUEST_FAILED: save_message: {e}"))?;
        Self::ensure_success(resp, "save_message").await?;
        Ok(())
    }

    pub async fn stop_generation(&self, message_id: &str) -> Result<(), String> {
        let resp = self
            .bounded(self.client.post(self.url("/stop")))
            .json(&serde_json::json!({ "message_id": message_id }))
            .send()
            .await
            .map_err(|e| format!("HTTP_REQUEST_FAILED: stop: {e}"))?;
        Self::ensure_success(resp, "stop").await?;
        Ok(())
    }

    /// Asks the server to title the conversation; the response body is the plain-text title.
    pub async fn name_conversation(&self, conversation_id: &str) -> Result<String, String> {
        let resp = self
            .bounded(
                self.client
                    .get(self.url(&format!("/name_conversation/{conversation_id}"))),
            )
            .send()
            .await
            .map_err(|e| format!("HTTP_REQUEST_FAILED: name_conversation: {e}"))?;
        let resp = Self::ensure_success(resp, "name_conversation").await?;
        let text = resp
            .text()
            .await
            .map_err(|e| format!("HTTP_INVALID_BODY: name_conversation: {e}"))?;
        Ok(text.trim().trim_matches('"').to_string())
    }

    pub async fn create_conversation(&self) -> Result<ConversationInfo, String> {
        let resp = self
            .bounded(self.client.post(self.url("/conversations")))
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(|e| format!("HTTP_REQUEST_FAILED: create_conversation: {e}"))?;
        let resp = Self::ensure_success(resp, "create_conversation").await?;
        resp.json::<ConversationInfo>()
            .await
            .map_err(|e| format!("HTTP_INVALID_BODY: create_conversation: {e}"))
    }

    pub async fn points(&self, user_id: &str) -> Result<PointsInfo, String> {
        let resp = self
            .bounded(
                self.client
                    .get(self.url(&format!("/points/get_points/{user_id}"))),
            )
            .send()
            .await
            .map_err(|e| format!("HTTP_REQUEST_FAILED: points: {e}"))?;
        let resp = Self::ensure_success(resp, "points").await?;
        resp.json::<PointsInfo>()
            .await
            .map_err(|e| format!("HTTP_INVALID_BODY: points: {e}"))
    }

    pub async fn free_usage(&self, model: &str, user_id: &str) -> Result<FreeUsageInfo, String> {
        let resp = self
            .bounded(self.client.get(self.url("/api/model/free_usage")))
            .query(&[("model", model), ("user_id", user_id)])
            .send()
            .await
            .map_err(|e| format!("HTTP_REQUEST_FAILED: free_usage: {e}"))?;
        let resp = Self::ensure_success(resp, "free_usage").await?;
        resp.json::<FreeUsageInfo>()
            .await
            .map_err(|e| format!("HTTP_INVALID_BODY: free_usage: {e}"))
    }
}

fn truthy_entry(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

pub(crate) fn parse_active_ids(value: &serde_json::Value) -> Result<HashSet<String>, String> {
    match value {
        serde_json::Value::Object(map) => Ok(map
            .iter()
            .filter(|(_, v)| truthy_entry(v))
            .map(|(k, _)| k.clone())
            .collect()),
        serde_json::Value::Array(items) => Ok(items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect()),
        other => Err(format!(
            "HTTP_INVALID_BODY: active_responses: expected object or array, got {}",
            match other {
                serde_json::Value::Null => "null",
                serde_json::Value::Bool(_) => "bool",
                serde_json::Value::Number(_) => "number",
                _ => "string",
            }
        )),
    }
}
