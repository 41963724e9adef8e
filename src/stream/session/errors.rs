//! Usage: Session error taxonomy + classification of generate failures (HTTP body, transport).

use std::fmt;

pub const PROMPT_MISSING_NOTICE: &str = "联网搜索需要输入有效的问题";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    PromptMissing,
    ModelError,
    Transport,
    StreamInterrupted,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::PromptMissing => "prompt_missing",
            Self::ModelError => "model_error",
            Self::Transport => "transport",
            Self::StreamInterrupted => "stream_interrupted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionError {
    pub category: ErrorCategory,
    pub code: &'static str,
    pub message: String,
    pub status: Option<u16>,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for SessionError {}

impl SessionError {
    fn new(category: ErrorCategory, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            category,
            code,
            message: message.into(),
            status: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Validation, "SEC_INVALID_INPUT", message)
    }

    pub fn stream_interrupted(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::StreamInterrupted, code, message)
    }

    /// Text for the user-facing notice.
    pub fn user_message(&self) -> String {
        match self.category {
            ErrorCategory::Validation => self.message.clone(),
            ErrorCategory::PromptMissing => PROMPT_MISSING_NOTICE.to_string(),
            ErrorCategory::ModelError => format!("模型选择错误: {}", self.message),
            ErrorCategory::Transport => match self.status {
                Some(status) => format!("AI服务不可用，HTTP状态: {status}"),
                None => format!("AI服务不可用: {}", self.message),
            },
            ErrorCategory::StreamInterrupted => format!("响应流中断: {}", self.message),
        }
    }

    /// The server may still be generating, so the pending record must survive.
    pub fn keeps_pending(&self) -> bool {
        self.category == ErrorCategory::StreamInterrupted
    }
}

fn error_text(body: &str) -> String {
    if let Ok(serde_json::Value::Object(map)) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(serde_json::Value::String(s)) = map.get("error") {
            return s.clone();
        }
    }
    body.trim().to_string()
}

/// Classifies a non-2xx generate response. Prompt phrases win over model phrases.
pub(crate) fn classify_error_body(status: u16, body: &str) -> SessionError {
    let text = error_text(body);

    let (category, code) = if text.contains("缺少提示内容")
        || text.contains("无法继续")
        || text.contains("prompt")
    {
        (ErrorCategory::PromptMissing, "CHAT_PROMPT_MISSING")
    } else if text.contains("model") || text.contains("模型") {
        (ErrorCategory::ModelError, "CHAT_MODEL_ERROR")
    } else {
        (ErrorCategory::Transport, "CHAT_UPSTREAM_STATUS")
    };

    let message = if text.is_empty() {
        format!("status={status}")
    } else {
        text
    };
    SessionError {
        category,
        code,
        message,
        status: Some(status),
    }
}

pub(crate) fn classify_reqwest_error(err: &reqwest::Error) -> SessionError {
    let code = if err.is_timeout() {
        "CHAT_UPSTREAM_TIMEOUT"
    } else if err.is_connect() {
        "CHAT_UPSTREAM_CONNECT_FAILED"
    } else {
        "CHAT_REQUEST_FAILED"
    };
    SessionError::new(ErrorCategory::Transport, code, err.to_string())
}
