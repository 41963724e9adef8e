use super::*;
use crate::chat_api::ChatApiConfig;
use crate::domain::markup::INTERRUPTED_MARKER;
use crate::notice::RecordingNotifier;
use crate::settings::RetryBackoff;
use crate::stream::sink::{MemorySink, SinkOp};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Body whose chunks the test feeds by hand; stays open until the sender is dropped.
struct ChannelBody {
    rx: mpsc::UnboundedReceiver<Result<Bytes, String>>,
}

impl Stream for ChannelBody {
    type Item = Result<Bytes, String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

fn channel_body() -> (mpsc::UnboundedSender<Result<Bytes, String>>, ChannelBody) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, ChannelBody { rx })
}

fn line(value: serde_json::Value) -> Bytes {
    Bytes::from(format!("{value}\n"))
}

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        delay: Duration::from_millis(1),
        backoff: RetryBackoff::Fixed,
        max_delay: Duration::from_millis(1),
    }
}

fn session_for(server: &MockServer, retry_attempts: u32) -> (StreamSession, Arc<RecordingNotifier>) {
    let api = ChatApi::new(ChatApiConfig {
        base_url: server.uri(),
        session_cookie: None,
        connect_timeout: Duration::from_secs(2),
        request_timeout: Some(Duration::from_secs(5)),
    })
    .expect("build api");
    let notifier = Arc::new(RecordingNotifier::default());
    let options = SessionOptions {
        retry: fast_retry(retry_attempts),
        ..SessionOptions::default()
    };
    let session = StreamSession::new(
        Arc::new(api),
        options,
        notifier.clone(),
        Arc::new(ConversationTitles::default()),
    );
    (session, notifier)
}

fn request(prompt: &str) -> GenerationRequest {
    GenerationRequest::new("c1", "DeepSeek-R1", prompt)
}

fn sink_with_placeholder(message_id: &str) -> MemorySink {
    let mut sink = MemorySink::new();
    sink.create_placeholder(message_id, "DeepSeek-R1")
        .expect("placeholder");
    sink
}

async fn mount_stop_and_save(server: &MockServer, expected_content: &str) {
    Mock::given(method("POST"))
        .and(path("/stop"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"success": true})))
        .expect(1)
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/conversations/c1/messages"))
        .and(body_json(serde_json::json!({
            "content": expected_content,
            "is_user": false
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": 9})))
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn completed_stream_renders_final_content() {
    let server = MockServer::start().await;
    let body = [
        serde_json::json!({"message_id": "x", "connected": true}),
        serde_json::json!({"message_id": "x", "think": "<think time=2>plan"}),
        serde_json::json!({"message_id": "x", "think": "<think time=2>plan</think>", "text": "Hel"}),
        serde_json::json!({"message_id": "x", "think": "<think time=2>plan</think>", "text": "Hello"}),
        serde_json::json!({"message_id": "x", "finished": true}),
    ]
    .iter()
    .map(|v| format!("{v}\n"))
    .collect::<String>();
    Mock::given(method("POST"))
        .and(path("/api/chat/c1/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/x-ndjson"))
        .expect(1)
        .mount(&server)
        .await;

    let (session, notifier) = session_for(&server, 1);
    let request = request("hi");
    let mut sink = sink_with_placeholder(&request.message_id);

    let outcome = session.run(&request, &mut sink).await.expect("run");
    let done = match outcome {
        SessionOutcome::Completed(done) => done,
        other => panic!("expected completion, got {other:?}"),
    };
    assert_eq!(done.content, "Hello");
    assert_eq!(done.think, "<think time=2>plan</think>");
    assert!(!session.is_running());
    assert!(notifier.notices().is_empty());

    let message = sink.message(&request.message_id).expect("message");
    assert_eq!(
        message.content.as_ref().map(|c| c.source.as_str()),
        Some("Hello")
    );
    let panel = message.think.as_ref().expect("think panel");
    assert_eq!(panel.header, "已深度思考（用时 2 秒）");
    assert_eq!(panel.body.source, "plan");
    assert_eq!(
        sink.count_ops(|op| matches!(op, SinkOp::ReplaceWithContentContainer(_))),
        1
    );
}

#[tokio::test]
async fn gzip_body_and_unterminated_last_line_are_handled() {
    let server = MockServer::start().await;
    let raw = "{\"text\":\"A\"}\nnot json\n{\"text\":\"AB\"}";
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(raw.as_bytes()).expect("gzip write");
    let gz = encoder.finish().expect("gzip finish");
    Mock::given(method("POST"))
        .and(path("/api/chat/c1/generate"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-encoding", "gzip")
                .set_body_raw(gz, "application/x-ndjson"),
        )
        .mount(&server)
        .await;

    let (session, _) = session_for(&server, 1);
    let request = request("hi");
    let mut sink = sink_with_placeholder(&request.message_id);

    let outcome = session.run(&request, &mut sink).await.expect("run");
    let done = match outcome {
        SessionOutcome::Completed(done) => done,
        other => panic!("expected completion, got {other:?}"),
    };
    assert_eq!(done.content, "AB");
}

#[tokio::test]
async fn model_error_response_notifies_and_renders_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat/c1/generate"))
        .respond_with(
            ResponseTemplate::new(400).set_body_json(serde_json::json!({"error": "不支持的模型"})),
        )
        .mount(&server)
        .await;

    let (session, notifier) = session_for(&server, 1);
    let request = request("hi");
    let mut sink = sink_with_placeholder(&request.message_id);

    let err = session
        .run(&request, &mut sink)
        .await
        .expect_err("model error");
    assert_eq!(err.category, ErrorCategory::ModelError);
    assert!(!err.keeps_pending());

    let notices = notifier.notices();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].level, NoticeLevel::Error);
    assert_eq!(notices[0].body, "模型选择错误: 不支持的模型");
    assert!(sink.message(&request.message_id).expect("message").loading);
}

#[tokio::test]
async fn invalid_request_never_reaches_the_server() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat/c1/generate"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let (session, notifier) = session_for(&server, 1);
    let mut request = request("  ");
    request.online_search = true;
    let mut sink = sink_with_placeholder(&request.message_id);

    let err = session
        .run(&request, &mut sink)
        .await
        .expect_err("validation");
    assert_eq!(err.category, ErrorCategory::Validation);
    assert_eq!(
        notifier.notices()[0].body,
        crate::domain::generation::SEARCH_PROMPT_REQUIRED
    );
}

#[tokio::test]
async fn abort_mid_stream_saves_partial_answer_with_marker() {
    let server = MockServer::start().await;
    mount_stop_and_save(
        &server,
        "<model=\"DeepSeek-R1\"/><think time=2>plan</think>\nHello\n\n用户已中断此次响应",
    )
    .await;

    let (session, _) = session_for(&server, 1);
    let request = request("hi");
    let mut sink = sink_with_placeholder(&request.message_id);
    let mut state = RenderState::new(&request.message_id, ImageMode::Inline);

    let (tx, body) = channel_body();
    tx.send(Ok(line(serde_json::json!({
        "text": "Hello",
        "think": "plan",
        "think_time": 2
    }))))
    .expect("send");

    let (handle, mut signal) = AbortHandle::pair();
    let (end, _) = tokio::join!(
        consume_body(body, &mut signal, None, &mut state, &mut sink),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(handle.abort());
        }
    );
    assert_eq!(end.expect("consume"), StreamEnd::Aborted);
    assert_eq!(state.current_content(), "Hello");
    drop(tx);

    let outcome = session
        .finish_aborted(&request, "DeepSeek-R1", &mut state, &mut sink)
        .await;
    let aborted = match outcome {
        SessionOutcome::Aborted(aborted) => aborted,
        other => panic!("expected abort, got {other:?}"),
    };
    assert!(aborted.saved);
    assert_eq!(aborted.finalized.content, "Hello\n\n用户已中断此次响应");
    assert_eq!(aborted.finalized.header, ThinkHeader::Completed { seconds: 2 });

    let message = sink.message(&request.message_id).expect("message");
    let html = &message.content.as_ref().expect("content").html;
    assert!(html.contains(INTERRUPTED_MARKER));
    assert!(message.error_notes.is_empty());
}

#[tokio::test]
async fn abort_during_reasoning_saves_think_block_and_marker() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/stop"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"success": true})))
        .mount(&server)
        .await;
    let saved_body = regex::Regex::new(
        r#"^<model="X"/><think time=\d+>reasoning\.\.\.</think>\n用户已中断此次响应$"#,
    )
    .expect("regex");
    Mock::given(method("POST"))
        .and(path("/conversations/c1/messages"))
        .and(move |req: &wiremock::Request| {
            serde_json::from_slice::<serde_json::Value>(&req.body)
                .ok()
                .is_some_and(|v| {
                    v["is_user"] == serde_json::json!(false)
                        && v["content"].as_str().is_some_and(|c| saved_body.is_match(c))
                })
        })
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": 9})))
        .expect(1)
        .mount(&server)
        .await;

    let (session, _) = session_for(&server, 1);
    let request = GenerationRequest::new("c1", "X", "hi");
    let mut sink = sink_with_placeholder(&request.message_id);
    let mut state = RenderState::new(&request.message_id, ImageMode::Inline);

    let (tx, body) = channel_body();
    tx.send(Ok(line(serde_json::json!({"think": "reasoning..."}))))
        .expect("send");

    let (handle, mut signal) = AbortHandle::pair();
    let (end, _) = tokio::join!(
        consume_body(body, &mut signal, None, &mut state, &mut sink),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(handle.abort());
        }
    );
    assert_eq!(end.expect("consume"), StreamEnd::Aborted);
    drop(tx);

    let outcome = session
        .finish_aborted(&request, "X", &mut state, &mut sink)
        .await;
    let aborted = match outcome {
        SessionOutcome::Aborted(aborted) => aborted,
        other => panic!("expected abort, got {other:?}"),
    };
    assert!(aborted.saved);
    assert_eq!(aborted.finalized.content, INTERRUPTED_MARKER);
    assert_eq!(aborted.finalized.header, ThinkHeader::Thinking);

    let message = sink.message(&request.message_id).expect("message");
    let panel = message.think.as_ref().expect("think panel");
    assert_eq!(panel.header, "思考中...");
    assert_eq!(panel.body.source, "reasoning...");
}

#[tokio::test]
async fn abort_before_response_persists_marker_only() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat/c1/generate"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_secs(5))
                .set_body_raw("{\"text\":\"late\"}\n", "application/x-ndjson"),
        )
        .mount(&server)
        .await;
    mount_stop_and_save(&server, "<model=\"DeepSeek-R1\"/>用户已中断此次响应").await;

    let (session, _) = session_for(&server, 1);
    let request = request("hi");
    let mut sink = sink_with_placeholder(&request.message_id);
    let slot = session.abort_slot();

    let (outcome, _) = tokio::join!(session.run(&request, &mut sink), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(slot.abort());
        assert!(!slot.abort());
    });
    let aborted = match outcome.expect("run") {
        SessionOutcome::Aborted(aborted) => aborted,
        other => panic!("expected abort, got {other:?}"),
    };
    assert_eq!(aborted.finalized.content, INTERRUPTED_MARKER);
    assert_eq!(aborted.finalized.header, ThinkHeader::Thinking);
    assert!(!session.is_running());
    assert!(!session.abort());

    let message = sink.message(&request.message_id).expect("message");
    assert!(!message.loading);
    assert!(message.think.is_none());
}

#[tokio::test]
async fn failed_save_is_retried_then_reported_inline() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/stop"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/conversations/c1/messages"))
        .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
        .expect(2)
        .mount(&server)
        .await;

    let (session, _) = session_for(&server, 2);
    let request = request("hi");
    let mut sink = sink_with_placeholder(&request.message_id);
    let mut state = RenderState::new(&request.message_id, ImageMode::Inline);

    let outcome = session
        .finish_aborted(&request, "DeepSeek-R1", &mut state, &mut sink)
        .await;
    let aborted = match outcome {
        SessionOutcome::Aborted(aborted) => aborted,
        other => panic!("expected abort, got {other:?}"),
    };
    assert!(!aborted.saved);
    let notes = &sink.message(&request.message_id).expect("message").error_notes;
    assert_eq!(notes.len(), 1);
    assert!(notes[0].contains("保存中断响应失败"), "{}", notes[0]);
}

#[tokio::test]
async fn idle_stream_times_out_as_interrupted() {
    let (tx, body) = channel_body();
    let (_handle, mut signal) = AbortHandle::pair();
    let mut state = RenderState::new("ai-1", ImageMode::Inline);
    let mut sink = sink_with_placeholder("ai-1");

    let err = consume_body(
        body,
        &mut signal,
        Some(Duration::from_millis(30)),
        &mut state,
        &mut sink,
    )
    .await
    .expect_err("idle");
    assert_eq!(err.code, "CHAT_STREAM_IDLE_TIMEOUT");
    assert!(err.keeps_pending());
    drop(tx);
}

#[tokio::test]
async fn read_error_after_partial_content_keeps_what_arrived() {
    let (tx, body) = channel_body();
    tx.send(Ok(line(serde_json::json!({"text": "partial"}))))
        .expect("send");
    tx.send(Err("connection reset".to_string())).expect("send");
    let (_handle, mut signal) = AbortHandle::pair();
    let mut state = RenderState::new("ai-1", ImageMode::Inline);
    let mut sink = sink_with_placeholder("ai-1");

    let err = consume_body(body, &mut signal, None, &mut state, &mut sink)
        .await
        .expect_err("read error");
    assert_eq!(err.code, "CHAT_STREAM_READ_FAILED");
    assert_eq!(err.category, ErrorCategory::StreamInterrupted);
    assert_eq!(state.current_content(), "partial");
}

#[tokio::test]
async fn finished_record_ends_stream_even_if_body_stays_open() {
    let (tx, body) = channel_body();
    tx.send(Ok(Bytes::from_static(
        b"{\"text\":\"done\"}\n{\"finished\":true}\n{\"text\":\"ignored\"}\n",
    )))
    .expect("send");
    let (_handle, mut signal) = AbortHandle::pair();
    let mut state = RenderState::new("ai-1", ImageMode::Inline);
    let mut sink = sink_with_placeholder("ai-1");

    let end = consume_body(body, &mut signal, None, &mut state, &mut sink)
        .await
        .expect("consume");
    assert_eq!(end, StreamEnd::Completed);
    assert_eq!(state.current_content(), "done");
    drop(tx);
}
