//! Usage: Known conversation titles + placeholder-title refresh after the first reply.

use crate::chat_api::{ChatApi, ConversationInfo};
use crate::shared::mutex_ext::MutexExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

pub const PLACEHOLDER_TITLE: &str = "新对话";

#[derive(Debug, Default)]
pub struct ConversationTitles {
    titles: Mutex<HashMap<String, String>>,
}

impl ConversationTitles {
    pub fn set(&self, conversation_id: &str, title: &str) {
        self.titles
            .lock_or_recover()
            .insert(conversation_id.to_string(), title.to_string());
    }

    pub fn get(&self, conversation_id: &str) -> Option<String> {
        self.titles.lock_or_recover().get(conversation_id).cloned()
    }

    pub fn forget(&self, conversation_id: &str) -> bool {
        self.titles.lock_or_recover().remove(conversation_id).is_some()
    }

    pub fn has_placeholder_title(&self, conversation_id: &str) -> bool {
        self.get(conversation_id)
            .is_some_and(|t| t.trim() == PLACEHOLDER_TITLE)
    }

    /// Asks the server to name a conversation that still carries the placeholder title.
    /// Returns `None` (and spawns nothing) for conversations that are already named or unknown.
    pub fn spawn_title_refresh(
        self: &Arc<Self>,
        api: Arc<ChatApi>,
        conversation_id: &str,
    ) -> Option<JoinHandle<()>> {
        if !self.has_placeholder_title(conversation_id) {
            return None;
        }
        let titles = Arc::clone(self);
        let conversation_id = conversation_id.to_string();
        Some(tokio::spawn(async move {
            match api.name_conversation(&conversation_id).await {
                Ok(title) if !title.is_empty() => {
                    tracing::info!(conversation_id = %conversation_id, title = %title, "对话已命名");
                    titles.set(&conversation_id, &title);
                }
                Ok(_) => {
                    tracing::warn!(conversation_id = %conversation_id, "服务端返回空标题");
                }
                Err(err) => {
                    tracing::warn!(conversation_id = %conversation_id, "对话命名失败: {}", err);
                }
            }
        }))
    }
}

/// Creates a conversation on the server and remembers its (placeholder) title.
pub async fn create_conversation(
    api: &ChatApi,
    titles: &ConversationTitles,
) -> Result<ConversationInfo, String> {
    let mut info = api.create_conversation().await?;
    if info.id.trim().is_empty() {
        return Err("HTTP_INVALID_BODY: create_conversation: missing id".to_string());
    }
    if info.title.trim().is_empty() {
        info.title = PLACEHOLDER_TITLE.to_string();
    }
    titles.set(&info.id, &info.title);
    tracing::info!(conversation_id = %info.id, "新建对话");
    Ok(info)
}
