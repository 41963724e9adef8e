//! Usage: Stream session controller (start one generation, consume its NDJSON body, abort it).
//!
//! One controller drives at most one generation at a time; starting a new one replaces the
//! abort handle of the previous one.

mod abort;
mod errors;
mod finalize;
mod render_state;

#[cfg(test)]
mod tests;

pub use abort::{AbortHandle, AbortSignal, AbortSlot, AbortSlotGuard};
pub use errors::{ErrorCategory, SessionError, PROMPT_MISSING_NOTICE};
pub use finalize::{finalize_aborted, persisted_text, save_final, FinalizedMessage};
pub use render_state::{RenderState, ThinkHeader, THINKING_LABEL};

use crate::chat_api::ChatApi;
use crate::domain::content::ImageMode;
use crate::domain::conversations::ConversationTitles;
use crate::domain::generation::{GenerationRequest, FALLBACK_MODEL};
use crate::domain::markup;
use crate::notice::{NoticeLevel, Notifier};
use crate::settings::ClientSettings;
use crate::stream::decoder::NdjsonDecoder;
use crate::stream::retry::RetryPolicy;
use crate::stream::sink::{AccountInfo, RenderSink};
use crate::stream::next_item;
use bytes::Bytes;
use futures_core::Stream;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub default_model: String,
    pub retry: RetryPolicy,
    /// `None` = wait for the server indefinitely.
    pub stream_idle_timeout: Option<Duration>,
    pub user_id: Option<String>,
    pub image_mode: ImageMode,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            default_model: FALLBACK_MODEL.to_string(),
            retry: RetryPolicy::default(),
            stream_idle_timeout: None,
            user_id: None,
            image_mode: ImageMode::Inline,
        }
    }
}

impl SessionOptions {
    pub fn from_settings(settings: &ClientSettings) -> Self {
        let user_id = settings.user_id.trim();
        let default_model = settings.default_model.trim();
        Self {
            default_model: if default_model.is_empty() {
                FALLBACK_MODEL.to_string()
            } else {
                default_model.to_string()
            },
            retry: RetryPolicy::from_settings(settings),
            stream_idle_timeout: (settings.stream_idle_timeout_seconds > 0)
                .then(|| Duration::from_secs(settings.stream_idle_timeout_seconds as u64)),
            user_id: (!user_id.is_empty()).then(|| user_id.to_string()),
            image_mode: ImageMode::Inline,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedGeneration {
    pub message_id: String,
    pub model: String,
    pub content: String,
    pub think: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortedGeneration {
    pub message_id: String,
    pub finalized: FinalizedMessage,
    pub saved: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed(CompletedGeneration),
    Aborted(AbortedGeneration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamEnd {
    Completed,
    Aborted,
}

/// Reads the body until `finished`, end of stream, abort, read error or idle timeout.
pub(crate) async fn consume_body<S, E>(
    mut body: S,
    signal: &mut AbortSignal,
    idle_timeout: Option<Duration>,
    state: &mut RenderState,
    sink: &mut dyn RenderSink,
) -> Result<StreamEnd, SessionError>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    let mut decoder = NdjsonDecoder::default();

    loop {
        let next = tokio::select! {
            biased;
            _ = signal.aborted() => return Ok(StreamEnd::Aborted),
            next = async {
                match idle_timeout {
                    Some(limit) => tokio::time::timeout(limit, next_item(&mut body)).await,
                    None => Ok(next_item(&mut body).await),
                }
            } => next,
        };

        let chunk = match next {
            Ok(Some(Ok(chunk))) => chunk,
            Ok(Some(Err(err))) => {
                return Err(SessionError::stream_interrupted(
                    "CHAT_STREAM_READ_FAILED",
                    err.to_string(),
                ));
            }
            Ok(None) => {
                if let Some(record) = decoder.finish() {
                    state.apply(&record, sink);
                }
                if decoder.skipped_lines() > 0 {
                    tracing::warn!(
                        message_id = %state.message_id(),
                        skipped = decoder.skipped_lines(),
                        "响应流中存在无法解析的行"
                    );
                }
                return Ok(StreamEnd::Completed);
            }
            Err(_) => {
                let secs = idle_timeout.map(|d| d.as_secs()).unwrap_or_default();
                return Err(SessionError::stream_interrupted(
                    "CHAT_STREAM_IDLE_TIMEOUT",
                    format!("no data for {secs}s"),
                ));
            }
        };

        for record in decoder.push(&chunk) {
            if signal.is_aborted() {
                return Ok(StreamEnd::Aborted);
            }
            state.apply(&record, sink);
            if record.finished {
                return Ok(StreamEnd::Completed);
            }
        }
    }
}

pub struct StreamSession {
    api: Arc<ChatApi>,
    options: SessionOptions,
    notifier: Arc<dyn Notifier>,
    titles: Arc<ConversationTitles>,
    slot: Arc<AbortSlot>,
}

impl StreamSession {
    pub fn new(
        api: Arc<ChatApi>,
        options: SessionOptions,
        notifier: Arc<dyn Notifier>,
        titles: Arc<ConversationTitles>,
    ) -> Self {
        Self {
            api,
            options,
            notifier,
            titles,
            slot: Arc::new(AbortSlot::default()),
        }
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn api(&self) -> &Arc<ChatApi> {
        &self.api
    }

    pub fn titles(&self) -> &Arc<ConversationTitles> {
        &self.titles
    }

    /// Shared slot, so a signal handler can abort without borrowing the session.
    pub fn abort_slot(&self) -> Arc<AbortSlot> {
        Arc::clone(&self.slot)
    }

    /// Aborts the active generation. Idempotent; a no-op when idle.
    pub fn abort(&self) -> bool {
        self.slot.abort()
    }

    pub fn abort_handle(&self) -> Option<AbortHandle> {
        self.slot.current()
    }

    pub fn is_running(&self) -> bool {
        self.slot.is_active()
    }

    /// Runs one generation to its end. The message placeholder must already exist in `sink`.
    pub async fn run(
        &self,
        request: &GenerationRequest,
        sink: &mut dyn RenderSink,
    ) -> Result<SessionOutcome, SessionError> {
        if let Err(msg) = request.validate() {
            let err = SessionError::validation(msg);
            self.notifier
                .notify(NoticeLevel::Warning, &err.user_message());
            return Err(err);
        }

        let model = request
            .effective_model(&self.options.default_model)
            .to_string();
        let (_guard, mut signal) = self.slot.install();
        let mut state = RenderState::new(&request.message_id, self.options.image_mode);

        tracing::info!(
            message_id = %request.message_id,
            conversation_id = %request.conversation_id,
            model = %model,
            online_search = request.online_search,
            has_image = request.image.is_some(),
            "开始生成"
        );

        let sent = tokio::select! {
            biased;
            _ = signal.aborted() => None,
            resp = self.api.start_generation(request, &model) => Some(resp),
        };
        let Some(sent) = sent else {
            return Ok(self.finish_aborted(request, &model, &mut state, sink).await);
        };

        let response = match sent {
            Ok(response) => response,
            Err(err) => {
                let err = errors::classify_reqwest_error(&err);
                return Err(self.fail(request, err));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let err = errors::classify_error_body(status.as_u16(), &body);
            return Err(self.fail(request, err));
        }

        // reqwest inflates `content-encoding: gzip` bodies before they reach the decoder.
        let body = Box::pin(response.bytes_stream());
        let end = consume_body(
            body,
            &mut signal,
            self.options.stream_idle_timeout,
            &mut state,
            sink,
        )
        .await;

        match end {
            Ok(StreamEnd::Completed) => {
                tracing::info!(
                    message_id = %request.message_id,
                    records = state.records(),
                    content_chars = state.current_content().chars().count(),
                    "生成完成"
                );
                self.after_completed(request, &model, sink).await;
                Ok(SessionOutcome::Completed(CompletedGeneration {
                    message_id: request.message_id.clone(),
                    model: state.model_name().unwrap_or(model.as_str()).to_string(),
                    content: state.current_content().to_string(),
                    think: state.current_think().to_string(),
                }))
            }
            Ok(StreamEnd::Aborted) => Ok(self.finish_aborted(request, &model, &mut state, sink).await),
            Err(err) => {
                if let Err(note_err) = sink.append_error_note(
                    &request.message_id,
                    &markup::error_note_html(&err.user_message()),
                ) {
                    tracing::debug!(message_id = %request.message_id, "错误提示渲染失败: {}", note_err);
                }
                Err(self.fail(request, err))
            }
        }
    }

    fn fail(&self, request: &GenerationRequest, err: SessionError) -> SessionError {
        tracing::error!(
            message_id = %request.message_id,
            category = err.category.as_str(),
            status = err.status.unwrap_or_default(),
            "生成失败: {}",
            err
        );
        self.notifier.notify(NoticeLevel::Error, &err.user_message());
        err
    }

    pub(crate) async fn finish_aborted(
        &self,
        request: &GenerationRequest,
        model: &str,
        state: &mut RenderState,
        sink: &mut dyn RenderSink,
    ) -> SessionOutcome {
        tracing::info!(message_id = %request.message_id, "用户中断生成");

        if let Err(err) = self.api.stop_generation(&request.message_id).await {
            tracing::warn!(message_id = %request.message_id, "通知服务端停止失败: {}", err);
        }

        let finalized = finalize_aborted(state, sink);
        let model = state.model_name().unwrap_or(model).to_string();
        let saved = match save_final(
            &self.api,
            &self.options.retry,
            &request.conversation_id,
            &finalized.content,
            finalized.think.as_ref(),
            &model,
        )
        .await
        {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(message_id = %request.message_id, "保存中断响应失败: {}", err);
                let note = markup::error_note_html(&format!("保存中断响应失败: {err}"));
                if let Err(note_err) = sink.append_error_note(&request.message_id, &note) {
                    tracing::debug!(message_id = %request.message_id, "错误提示渲染失败: {}", note_err);
                }
                false
            }
        };

        SessionOutcome::Aborted(AbortedGeneration {
            message_id: request.message_id.clone(),
            finalized,
            saved,
        })
    }

    /// Best-effort refresh of account figures and the conversation title.
    async fn after_completed(&self, request: &GenerationRequest, model: &str, sink: &mut dyn RenderSink) {
        let _ = self
            .titles
            .spawn_title_refresh(Arc::clone(&self.api), &request.conversation_id);

        let Some(user_id) = request
            .user_id
            .as_deref()
            .or(self.options.user_id.as_deref())
        else {
            return;
        };

        let (points, free_usage) = tokio::join!(
            self.api.points(user_id),
            self.api.free_usage(model, user_id)
        );
        let points = match points {
            Ok(info) if info.success => info
                .formatted_points
                .or_else(|| info.points.map(|p| p.to_string())),
            Ok(_) => None,
            Err(err) => {
                tracing::warn!(user_id = user_id, "积分刷新失败: {}", err);
                None
            }
        };
        let free_usage = match free_usage {
            Ok(info) if info.success => Some(info),
            Ok(_) => None,
            Err(err) => {
                tracing::warn!(user_id = user_id, "免费额度刷新失败: {}", err);
                None
            }
        };
        if points.is_some() || free_usage.is_some() {
            sink.show_account_info(&AccountInfo { points, free_usage });
        }
    }
}
