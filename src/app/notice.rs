//! Notice（用户提示）模块。
//!
//! 用法：
//! - 会话控制器在校验失败 / 生成失败时调用 `Notifier::notify(level, body)`
//! - CLI 使用 `TerminalNotifier`（stderr），嵌入方可实现自己的 `Notifier`

const NOTICE_PREFIX: &str = "Chat Stream";

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Success,
    Warning,
    Error,
}

impl NoticeLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct NoticePayload {
    pub level: NoticeLevel,
    pub title: String,
    pub body: String,
}

fn default_title(level: NoticeLevel) -> &'static str {
    match level {
        NoticeLevel::Info => "提示",
        NoticeLevel::Success => "成功",
        NoticeLevel::Warning => "提醒",
        NoticeLevel::Error => "错误",
    }
}

pub fn build(level: NoticeLevel, body: &str) -> NoticePayload {
    NoticePayload {
        level,
        title: format!("{NOTICE_PREFIX} · {}", default_title(level)),
        body: body.trim().to_string(),
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, level: NoticeLevel, body: &str);
}

/// Prints notices on stderr and mirrors them into the log.
#[derive(Debug, Default)]
pub struct TerminalNotifier;

impl Notifier for TerminalNotifier {
    fn notify(&self, level: NoticeLevel, body: &str) {
        let payload = build(level, body);
        if payload.body.is_empty() {
            return;
        }
        tracing::info!(level = level.as_str(), "notice: {}", payload.body);
        eprintln!("[{}] {}", payload.title, payload.body);
    }
}

#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingNotifier {
    notices: std::sync::Mutex<Vec<NoticePayload>>,
}

#[cfg(test)]
impl RecordingNotifier {
    pub(crate) fn notices(&self) -> Vec<NoticePayload> {
        use crate::shared::mutex_ext::MutexExt;
        self.notices.lock_or_recover().clone()
    }
}

#[cfg(test)]
impl Notifier for RecordingNotifier {
    fn notify(&self, level: NoticeLevel, body: &str) {
        use crate::shared::mutex_ext::MutexExt;
        self.notices.lock_or_recover().push(build(level, body));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_prefixes_title_and_trims_body() {
        let payload = build(NoticeLevel::Warning, "  消息内容不能为空 \n");
        assert_eq!(payload.title, "Chat Stream · 提醒");
        assert_eq!(payload.body, "消息内容不能为空");
        assert_eq!(
            serde_json::to_value(payload.level).expect("serialize"),
            serde_json::json!("warning")
        );
    }
}
