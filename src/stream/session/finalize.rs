//! Usage: Interrupted-response finalization (display notice, persisted text, retried save).

use super::render_state::{RenderState, ThinkHeader};
use crate::chat_api::ChatApi;
use crate::domain::content::{self, ThinkBlock};
use crate::domain::markup::{self, INTERRUPTED_MARKER};
use crate::stream::retry::RetryPolicy;
use crate::stream::sink::{RenderSink, RenderedContent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedMessage {
    /// Answer text as persisted, marker included.
    pub content: String,
    pub think: Option<ThinkBlock>,
    pub header: ThinkHeader,
}

/// Whitespace-only content counts as empty, matching what `finalize_aborted` displays.
pub fn persisted_text(content: &str) -> String {
    if content.trim().is_empty() {
        INTERRUPTED_MARKER.to_string()
    } else {
        format!("{content}\n\n{INTERRUPTED_MARKER}")
    }
}

/// Turns whatever was received before the abort into the final message view.
pub fn finalize_aborted(state: &mut RenderState, sink: &mut dyn RenderSink) -> FinalizedMessage {
    if !state.content_container_created {
        state.content_container_created = true;
        if let Err(err) = sink.replace_with_content_container(&state.message_id) {
            tracing::warn!(message_id = %state.message_id, "替换加载占位失败: {}", err);
        }
    }

    let has_content = !state.current_content.trim().is_empty();
    let display = if has_content {
        let mut rendered = state.rendered_content(sink);
        rendered.html.push_str(&markup::interrupted_notice_html());
        rendered
    } else {
        RenderedContent {
            source: INTERRUPTED_MARKER.to_string(),
            html: markup::interrupted_notice_html(),
        }
    };
    if let Err(err) = sink.set_content(&state.message_id, &display) {
        tracing::warn!(message_id = %state.message_id, "中断提示渲染失败: {}", err);
    }

    let header = match state.reported_think_seconds() {
        Some(seconds) if has_content => ThinkHeader::Completed { seconds },
        _ => ThinkHeader::Thinking,
    };
    state.set_header(header, sink);

    let think = (!state.current_think.is_empty()).then(|| ThinkBlock {
        seconds: state.think_seconds(),
        body: content::think_display_body(&state.current_think),
    });

    FinalizedMessage {
        content: persisted_text(&state.current_content),
        think,
        header,
    }
}

/// Persists the interrupted message via `POST /conversations/{id}/messages`, retrying per `policy`.
pub async fn save_final(
    api: &ChatApi,
    policy: &RetryPolicy,
    conversation_id: &str,
    content: &str,
    think: Option<&ThinkBlock>,
    model: &str,
) -> Result<(), String> {
    let composed = content::compose_message(Some(model), think, content);
    policy
        .run("save_interrupted", |attempt| {
            let composed = composed.as_str();
            async move {
                tracing::debug!(conversation_id = conversation_id, attempt = attempt, "保存中断响应");
                api.save_message(conversation_id, composed).await
            }
        })
        .await
}
