//! Usage: Resume generations left pending by a previous run (reattach, evict stale, keep the rest).

use crate::blocking;
use crate::db::Db;
use crate::pending_store::{self, PendingRecord};
use crate::shared::time::now_unix_seconds;
use crate::stream::session::{SessionError, SessionOutcome, StreamSession};
use crate::stream::sink::RenderSink;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResumeReport {
    pub resumed: usize,
    pub evicted: usize,
    pub kept: usize,
    pub failed: usize,
}

/// Whether a finished run settles its pending record. An abort settles it only once the
/// interrupted text is saved; interrupted reads leave the server possibly still generating.
/// Records that stay are retried by the next resume or evicted by TTL.
pub fn settles_pending(result: &Result<SessionOutcome, SessionError>) -> bool {
    match result {
        Ok(SessionOutcome::Completed(_)) => true,
        Ok(SessionOutcome::Aborted(aborted)) => aborted.saved,
        Err(err) => !err.keeps_pending(),
    }
}

async fn remove_record(db: &Db, message_id: &str) {
    let db = db.clone();
    let id = message_id.to_string();
    match blocking::run("pending_remove", move || pending_store::remove(&db, &id)).await {
        Ok(true) => {}
        Ok(false) => tracing::debug!(message_id = message_id, "待恢复记录已不存在"),
        Err(err) => tracing::warn!(message_id = message_id, "删除待恢复记录失败: {}", err),
    }
}

fn is_expired(record: &PendingRecord, now: i64, ttl_seconds: u64) -> bool {
    if ttl_seconds == 0 {
        return false;
    }
    let ttl = i64::try_from(ttl_seconds).unwrap_or(i64::MAX);
    now.saturating_sub(record.created_at) >= ttl
}

/// Walks pending records in insertion order. Each record the server still reports active gets
/// a placeholder and exactly one streaming run through `session`.
pub async fn resume_pending(
    db: &Db,
    session: &StreamSession,
    ttl_seconds: u64,
    sink: &mut dyn RenderSink,
) -> ResumeReport {
    let mut report = ResumeReport::default();

    let db_for_list = db.clone();
    let records = match blocking::run("pending_list", move || pending_store::list(&db_for_list)).await {
        Ok(records) => records,
        Err(err) => {
            tracing::warn!("读取待恢复记录失败: {}", err);
            return report;
        }
    };
    if records.is_empty() {
        return report;
    }

    let active: HashSet<String> = match session.api().active_responses().await {
        Ok(active) => active,
        Err(err) => {
            tracing::warn!(pending = records.len(), "查询活跃响应失败，保留全部待恢复记录: {}", err);
            report.kept = records.len();
            return report;
        }
    };

    tracing::info!(pending = records.len(), active = active.len(), "开始恢复未完成的生成");

    let now = now_unix_seconds();
    for record in records {
        let message_id = record.request.message_id.clone();

        if !active.contains(&message_id) {
            if is_expired(&record, now, ttl_seconds) {
                tracing::info!(
                    message_id = %message_id,
                    age_seconds = now.saturating_sub(record.created_at),
                    "清理过期的待恢复记录"
                );
                remove_record(db, &message_id).await;
                report.evicted += 1;
            } else {
                report.kept += 1;
            }
            continue;
        }

        let model = record
            .request
            .effective_model(&session.options().default_model)
            .to_string();
        if let Err(err) = sink.create_placeholder(&message_id, &model) {
            tracing::warn!(message_id = %message_id, "创建恢复占位失败: {}", err);
        }

        tracing::info!(message_id = %message_id, "恢复生成");
        let result = session.run(&record.request, sink).await;
        let settled = settles_pending(&result);
        if settled {
            remove_record(db, &message_id).await;
        }
        match result {
            Ok(_) => {
                if !settled {
                    tracing::warn!(message_id = %message_id, "中断响应未保存，保留记录");
                }
                report.resumed += 1;
            }
            Err(err) if err.keeps_pending() => {
                tracing::warn!(message_id = %message_id, "恢复中断，保留记录: {}", err);
                report.kept += 1;
            }
            Err(err) => {
                tracing::warn!(message_id = %message_id, "恢复失败: {}", err);
                report.failed += 1;
            }
        }
    }

    tracing::info!(
        resumed = report.resumed,
        evicted = report.evicted,
        kept = report.kept,
        failed = report.failed,
        "待恢复记录处理完成"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat_api::{ChatApi, ChatApiConfig};
    use crate::domain::conversations::ConversationTitles;
    use crate::domain::generation::GenerationRequest;
    use crate::notice::RecordingNotifier;
    use crate::stream::session::{
        AbortedGeneration, ErrorCategory, FinalizedMessage, SessionOptions, ThinkHeader,
    };
    use crate::stream::sink::MemorySink;
    use std::sync::Arc;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const DAY: i64 = 24 * 60 * 60;

    fn session_for(server: &MockServer) -> StreamSession {
        let api = ChatApi::new(ChatApiConfig {
            base_url: server.uri(),
            session_cookie: None,
            connect_timeout: Duration::from_secs(2),
            request_timeout: Some(Duration::from_secs(5)),
        })
        .expect("build api");
        StreamSession::new(
            Arc::new(api),
            SessionOptions::default(),
            Arc::new(RecordingNotifier::default()),
            Arc::new(ConversationTitles::default()),
        )
    }

    fn pending(db: &Db, message_id: &str, created_at: i64) {
        let mut request = GenerationRequest::new("c1", "GPT-4o", "hello");
        request.message_id = message_id.to_string();
        pending_store::append_with_created_at(db, &request, created_at).expect("append");
    }

    fn pending_ids(db: &Db) -> Vec<String> {
        pending_store::list(db)
            .expect("list")
            .into_iter()
            .map(|r| r.request.message_id)
            .collect()
    }

    #[tokio::test]
    async fn active_records_resume_once_and_stale_ones_are_evicted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/chat/active_responses"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ai-1": {"message_id": "ai-1"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/chat/c1/generate"))
            .and(body_partial_json(serde_json::json!({"message_id": "ai-1", "model": "GPT-4o"})))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "{\"text\":\"resumed answer\"}\n{\"finished\":true}\n",
                "application/x-ndjson",
            ))
            .expect(1)
            .mount(&server)
            .await;

        let db = crate::db::init_in_memory();
        let now = now_unix_seconds();
        pending(&db, "ai-1", now - 60);
        pending(&db, "ai-2", now - 2 * DAY);
        pending(&db, "ai-3", now - 60);

        let session = session_for(&server);
        let mut sink = MemorySink::new();
        let report = resume_pending(&db, &session, DAY as u64, &mut sink).await;

        assert_eq!(
            report,
            ResumeReport {
                resumed: 1,
                evicted: 1,
                kept: 1,
                failed: 0
            }
        );
        assert_eq!(pending_ids(&db), vec!["ai-3".to_string()]);

        let message = sink.message("ai-1").expect("resumed message");
        assert_eq!(message.model, "GPT-4o");
        assert_eq!(
            message.content.as_ref().map(|c| c.source.as_str()),
            Some("resumed answer")
        );
        assert!(sink.message("ai-3").is_none());
    }

    #[tokio::test]
    async fn unreachable_server_keeps_every_record() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/chat/active_responses"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/chat/c1/generate"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let db = crate::db::init_in_memory();
        let now = now_unix_seconds();
        pending(&db, "ai-1", now - 3 * DAY);
        pending(&db, "ai-2", now);

        let session = session_for(&server);
        let mut sink = MemorySink::new();
        let report = resume_pending(&db, &session, DAY as u64, &mut sink).await;

        assert_eq!(report.kept, 2);
        assert_eq!(pending_ids(&db).len(), 2);
        assert!(sink.messages().is_empty());
    }

    #[tokio::test]
    async fn zero_ttl_never_evicts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/chat/active_responses"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let db = crate::db::init_in_memory();
        pending(&db, "ai-old", now_unix_seconds() - 365 * DAY);

        let session = session_for(&server);
        let mut sink = MemorySink::new();
        let report = resume_pending(&db, &session, 0, &mut sink).await;
        assert_eq!(report.kept, 1);
        assert_eq!(pending_ids(&db), vec!["ai-old".to_string()]);
    }

    #[test]
    fn interrupted_runs_do_not_settle_pending() {
        let interrupted: Result<SessionOutcome, SessionError> = Err(
            SessionError::stream_interrupted("CHAT_STREAM_READ_FAILED", "reset"),
        );
        assert!(!settles_pending(&interrupted));

        let validation: Result<SessionOutcome, SessionError> =
            Err(SessionError::validation("bad"));
        assert_eq!(
            validation.as_ref().map_err(|e| e.category).err(),
            Some(ErrorCategory::Validation)
        );
        assert!(settles_pending(&validation));
    }

    #[test]
    fn aborted_runs_settle_only_once_saved() {
        let aborted = |saved| -> Result<SessionOutcome, SessionError> {
            Ok(SessionOutcome::Aborted(AbortedGeneration {
                message_id: "ai-1".to_string(),
                finalized: FinalizedMessage {
                    content: "用户已中断此次响应".to_string(),
                    think: None,
                    header: ThinkHeader::Thinking,
                },
                saved,
            }))
        };
        assert!(settles_pending(&aborted(true)));
        assert!(!settles_pending(&aborted(false)));
    }
}
