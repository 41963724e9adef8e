//! Usage: `ChatContext`, the explicit client context (settings, storage, API, session) used by the binary.

use crate::app::notice::Notifier;
use crate::chat_api::{ChatApi, ChatApiConfig, ConversationInfo};
use crate::db::Db;
use crate::domain::conversations::{self, ConversationTitles};
use crate::domain::generation::{GenerationRequest, ImageAttachment};
use crate::domain::resume::{self, ResumeReport};
use crate::settings::ClientSettings;
use crate::shared::fs::read_file_limited;
use crate::stream::session::{SessionError, SessionOptions, SessionOutcome, StreamSession};
use crate::stream::sink::RenderSink;
use crate::{blocking, db, pending_store, preferences, settings};
use base64::Engine;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const MAX_IMAGE_BYTES: u64 = 10 * 1024 * 1024;
const MAX_LEGACY_PENDING_BYTES: u64 = 4 * 1024 * 1024;

fn image_mime_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|v| v.to_str())
        .map(|v| v.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        _ => "image/png",
    }
}

/// Reads an image file into an attachment (raw base64, no `data:` prefix).
pub(crate) fn image_attachment_from_file(path: &Path) -> Result<ImageAttachment, String> {
    let bytes = read_file_limited(path, MAX_IMAGE_BYTES)?;
    if bytes.is_empty() {
        return Err(format!("SEC_INVALID_INPUT: image file is empty: {}", path.display()));
    }
    Ok(ImageAttachment {
        base64: base64::engine::general_purpose::STANDARD.encode(&bytes),
        mime_type: image_mime_type(path).to_string(),
        file_name: path
            .file_name()
            .and_then(|v| v.to_str())
            .unwrap_or_default()
            .to_string(),
    })
}

pub struct ChatContext {
    app_dir: PathBuf,
    settings: ClientSettings,
    db: Db,
    session: StreamSession,
}

impl ChatContext {
    pub async fn open(app_dir: PathBuf, notifier: Arc<dyn Notifier>) -> Result<Self, String> {
        let dir = app_dir.clone();
        let settings = blocking::run("settings_read", move || settings::read(&dir)).await?;
        let dir = app_dir.clone();
        let db = blocking::run("db_init", move || db::init(&dir)).await?;
        Self::from_parts(app_dir, settings, db, notifier)
    }

    pub(crate) fn from_parts(
        app_dir: PathBuf,
        settings: ClientSettings,
        db: Db,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, String> {
        let api = ChatApi::new(ChatApiConfig::from_settings(&settings))?;
        let session = StreamSession::new(
            Arc::new(api),
            SessionOptions::from_settings(&settings),
            notifier,
            Arc::new(ConversationTitles::default()),
        );
        Ok(Self {
            app_dir,
            settings,
            db,
            session,
        })
    }

    pub fn app_dir(&self) -> &Path {
        &self.app_dir
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn session(&self) -> &StreamSession {
        &self.session
    }

    /// The persisted model selection, falling back to `default_model`.
    pub async fn selected_model(&self) -> String {
        let db = self.db.clone();
        match blocking::run("selected_model", move || preferences::selected_model(&db)).await {
            Ok(Some(model)) => model,
            Ok(None) => self.session.options().default_model.clone(),
            Err(err) => {
                tracing::warn!("读取已选模型失败: {}", err);
                self.session.options().default_model.clone()
            }
        }
    }

    pub async fn select_model(&self, model: &str) -> Result<(), String> {
        let db = self.db.clone();
        let model = model.to_string();
        blocking::run("set_selected_model", move || {
            preferences::set_selected_model(&db, &model)
        })
        .await
    }

    pub async fn new_conversation(&self) -> Result<ConversationInfo, String> {
        conversations::create_conversation(self.session.api(), self.session.titles()).await
    }

    /// Sends one prompt: placeholder, durable pending record, streaming run, pending settlement.
    pub async fn send(
        &self,
        request: &GenerationRequest,
        sink: &mut dyn RenderSink,
    ) -> Result<SessionOutcome, SessionError> {
        if request.validate().is_err() {
            // Rejected before any side effect; `run` reports it.
            return self.session.run(request, sink).await;
        }

        let model = request
            .effective_model(&self.session.options().default_model)
            .to_string();
        if let Err(err) = sink.create_placeholder(&request.message_id, &model) {
            tracing::warn!(message_id = %request.message_id, "创建消息占位失败: {}", err);
        }

        let db = self.db.clone();
        let pending = request.clone();
        if let Err(err) = blocking::run("pending_append", move || {
            pending_store::append(&db, &pending)
        })
        .await
        {
            tracing::warn!(message_id = %request.message_id, "写入待恢复记录失败: {}", err);
        }

        let result = self.session.run(request, sink).await;

        if resume::settles_pending(&result) {
            let db = self.db.clone();
            let message_id = request.message_id.clone();
            if let Err(err) = blocking::run("pending_remove", move || {
                pending_store::remove(&db, &message_id)
            })
            .await
            {
                tracing::warn!(message_id = %request.message_id, "删除待恢复记录失败: {}", err);
            }
        }
        result
    }

    pub async fn resume_pending(&self, sink: &mut dyn RenderSink) -> ResumeReport {
        resume::resume_pending(
            &self.db,
            &self.session,
            self.settings.pending_ttl_seconds,
            sink,
        )
        .await
    }

    /// Drops local state for a deleted conversation (pending records, cached title).
    pub async fn forget_conversation(&self, conversation_id: &str) -> Result<usize, String> {
        self.session.titles().forget(conversation_id);
        let db = self.db.clone();
        let id = conversation_id.to_string();
        let removed = blocking::run("pending_forget_conversation", move || {
            pending_store::forget_conversation(&db, &id)
        })
        .await?;
        if removed > 0 {
            tracing::info!(conversation_id = conversation_id, removed = removed, "已清理对话的待恢复记录");
        }
        Ok(removed)
    }

    /// Imports a pending list exported from the web client (`pending_ai_messages`).
    pub async fn import_legacy_pending(&self, path: &Path) -> Result<usize, String> {
        let db = self.db.clone();
        let path = path.to_path_buf();
        blocking::run("pending_import_legacy", move || {
            let bytes = read_file_limited(&path, MAX_LEGACY_PENDING_BYTES)?;
            let raw = String::from_utf8(bytes)
                .map_err(|_| "SEC_INVALID_INPUT: pending list must be UTF-8".to_string())?;
            pending_store::import_legacy_json(&db, &raw)
        })
        .await
    }

    #[cfg(test)]
    pub(crate) fn db(&self) -> &Db {
        &self.db
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notice::RecordingNotifier;
    use crate::shared::fs::test_support::unique_tmp_dir;
    use crate::stream::sink::MemorySink;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn context_for(server: &MockServer) -> ChatContext {
        context_with(ClientSettings {
            base_url: server.uri(),
            ..ClientSettings::default()
        })
    }

    fn context_with(settings: ClientSettings) -> ChatContext {
        ChatContext::from_parts(
            PathBuf::from("/nonexistent"),
            settings,
            crate::db::init_in_memory(),
            Arc::new(RecordingNotifier::default()),
        )
        .expect("context")
    }

    fn pending_count(ctx: &ChatContext) -> usize {
        pending_store::list(ctx.db()).expect("list").len()
    }

    #[tokio::test]
    async fn completed_send_clears_its_pending_record() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat/c1/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "{\"text\":\"Hi there\"}\n{\"finished\":true}\n",
                "application/x-ndjson",
            ))
            .mount(&server)
            .await;

        let ctx = context_for(&server);
        let request = GenerationRequest::new("c1", "", "hello");
        let mut sink = MemorySink::new();

        let outcome = ctx.send(&request, &mut sink).await.expect("send");
        assert!(matches!(outcome, SessionOutcome::Completed(_)));
        assert_eq!(pending_count(&ctx), 0);

        let message = sink.message(&request.message_id).expect("message");
        assert_eq!(message.model, "DeepSeek-R1");
        assert_eq!(
            message.content.as_ref().map(|c| c.source.as_str()),
            Some("Hi there")
        );
    }

    #[tokio::test]
    async fn rejected_send_leaves_no_trace() {
        let server = MockServer::start().await;
        let ctx = context_for(&server);
        let request = GenerationRequest::new("c1", "M", "   ");
        let mut sink = MemorySink::new();

        let err = ctx.send(&request, &mut sink).await.expect_err("empty");
        assert_eq!(err.message, crate::domain::generation::EMPTY_MESSAGE);
        assert_eq!(pending_count(&ctx), 0);
        assert!(sink.messages().is_empty());
    }

    #[tokio::test]
    async fn upstream_failure_clears_pending_record() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat/c1/generate"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let ctx = context_for(&server);
        let request = GenerationRequest::new("c1", "M", "hello");
        let mut sink = MemorySink::new();
        ctx.send(&request, &mut sink).await.expect_err("500");
        assert_eq!(pending_count(&ctx), 0);
    }

    #[tokio::test]
    async fn unsaved_abort_keeps_pending_record_for_resume() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat/c1/generate"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(std::time::Duration::from_secs(5))
                    .set_body_raw("{\"text\":\"late\"}\n", "application/x-ndjson"),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/stop"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/conversations/c1/messages"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .expect(1)
            .mount(&server)
            .await;

        let ctx = context_with(ClientSettings {
            base_url: server.uri(),
            save_retry_max_attempts: 1,
            ..ClientSettings::default()
        });
        let request = GenerationRequest::new("c1", "M", "hello");
        let mut sink = MemorySink::new();
        let slot = ctx.session().abort_slot();

        let (outcome, _) = tokio::join!(ctx.send(&request, &mut sink), async {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            assert!(slot.abort());
        });
        let aborted = match outcome.expect("send") {
            SessionOutcome::Aborted(aborted) => aborted,
            other => panic!("expected abort, got {other:?}"),
        };
        assert!(!aborted.saved);

        let records = pending_store::list(ctx.db()).expect("list");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].request.message_id, request.message_id);
    }

    #[tokio::test]
    async fn model_selection_and_conversation_cleanup() {
        let server = MockServer::start().await;
        let ctx = context_for(&server);
        assert_eq!(ctx.selected_model().await, "DeepSeek-R1");
        ctx.select_model("GPT-4o").await.expect("select");
        assert_eq!(ctx.selected_model().await, "GPT-4o");

        pending_store::append(ctx.db(), &GenerationRequest::new("c9", "M", "a")).expect("append");
        pending_store::append(ctx.db(), &GenerationRequest::new("c9", "M", "b")).expect("append");
        assert_eq!(ctx.forget_conversation("c9").await.expect("forget"), 2);
        assert_eq!(pending_count(&ctx), 0);
    }

    #[tokio::test]
    async fn legacy_pending_file_is_imported() {
        let server = MockServer::start().await;
        let ctx = context_for(&server);
        let dir = unique_tmp_dir("legacy-import");
        let file = dir.join("pending.json");
        std::fs::write(
            &file,
            r#"[{"messageData": {"message": "hi", "conversation_id": 3, "model": "M", "message_id": "ai-5"}}]"#,
        )
        .expect("write");

        assert_eq!(ctx.import_legacy_pending(&file).await.expect("import"), 1);
        let records = pending_store::list(ctx.db()).expect("list");
        assert_eq!(records[0].request.message_id, "ai-5");
        assert_eq!(records[0].request.conversation_id, "3");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn image_files_become_raw_base64_attachments() {
        let dir = unique_tmp_dir("image-attach");
        let file = dir.join("cat.JPG");
        std::fs::write(&file, b"ABC").expect("write");

        let image = image_attachment_from_file(&file).expect("image");
        assert_eq!(image.base64, "QUJD");
        assert_eq!(image.mime_type, "image/jpeg");
        assert_eq!(image.file_name, "cat.JPG");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
