//! Usage: Per-message render state; applies decoded records to a `RenderSink` as diffs.

use crate::domain::content::{self, ImageMode};
use crate::domain::generation::StreamRecord;
use crate::domain::markup;
use crate::stream::sink::{RenderSink, RenderedContent, ThinkPanelHandle};
use std::time::Instant;

pub const THINKING_LABEL: &str = "思考中...";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThinkHeader {
    Thinking,
    Completed { seconds: u64 },
}

impl ThinkHeader {
    pub fn label(&self) -> String {
        match self {
            Self::Thinking => THINKING_LABEL.to_string(),
            Self::Completed { seconds } => format!("已深度思考（用时 {seconds} 秒）"),
        }
    }
}

#[derive(Debug)]
pub struct RenderState {
    pub(super) message_id: String,
    pub(super) current_content: String,
    pub(super) current_think: String,
    pub(super) think_started: Instant,
    pub(super) content_container_created: bool,
    pub(super) think_panel: Option<ThinkPanelHandle>,
    pub(super) reported_think_time: Option<f64>,
    pub(super) model_name: Option<String>,
    last_search: Option<String>,
    image_mode: ImageMode,
    records: u64,
}

impl RenderState {
    pub fn new(message_id: impl Into<String>, image_mode: ImageMode) -> Self {
        Self {
            message_id: message_id.into(),
            current_content: String::new(),
            current_think: String::new(),
            think_started: Instant::now(),
            content_container_created: false,
            think_panel: None,
            reported_think_time: None,
            model_name: None,
            last_search: None,
            image_mode,
            records: 0,
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn current_content(&self) -> &str {
        &self.current_content
    }

    pub fn current_think(&self) -> &str {
        &self.current_think
    }

    pub fn model_name(&self) -> Option<&str> {
        self.model_name.as_deref()
    }

    pub fn think_panel(&self) -> Option<ThinkPanelHandle> {
        self.think_panel
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    /// Think seconds announced by the server: the `<think time=N>` tag first, then `think_time`.
    pub fn reported_think_seconds(&self) -> Option<u64> {
        content::think_time_hint(&self.current_think)
            .filter(|s| *s > 0)
            .or_else(|| {
                self.reported_think_time
                    .filter(|t| t.is_finite() && *t > 0.0)
                    .map(|t| t.round() as u64)
            })
    }

    pub fn think_seconds(&self) -> u64 {
        self.reported_think_seconds()
            .unwrap_or_else(|| self.think_started.elapsed().as_secs())
    }

    /// Completed once answer text exists; reasoning alone keeps the panel in "thinking".
    pub fn header(&self) -> ThinkHeader {
        if self.current_content.trim().is_empty() {
            ThinkHeader::Thinking
        } else {
            ThinkHeader::Completed {
                seconds: self.think_seconds(),
            }
        }
    }

    /// Applies one record. Sink failures are logged and never abort the stream.
    pub fn apply(&mut self, record: &StreamRecord, sink: &mut dyn RenderSink) {
        self.records += 1;

        if record.heartbeat {
            tracing::trace!(message_id = %self.message_id, "收到心跳");
        }
        if record.error {
            tracing::warn!(message_id = %self.message_id, "服务端返回错误记录");
        }
        if let Some(think_time) = record.think_time {
            self.reported_think_time = Some(think_time);
        }
        if let Some(model_name) = record.model_name.as_deref() {
            self.model_name = Some(model_name.to_string());
        }
        if let Some(search) = record.search.as_deref() {
            self.push_search(search, sink);
        }

        if record.has_visible_text() && !self.content_container_created {
            self.content_container_created = true;
            if let Err(err) = sink.replace_with_content_container(&self.message_id) {
                tracing::warn!(message_id = %self.message_id, "替换加载占位失败: {}", err);
            }
        }

        // Sampled before this record grows the view.
        let near_bottom = sink.is_near_bottom();
        let mut changed = false;

        if let Some(content) = record.content.as_deref() {
            if content != self.current_content {
                self.current_content = content.to_string();
                self.render_content(sink);
                self.refresh_header(sink);
                changed = true;
            }
        }

        if let Some(think) = record.think.as_deref() {
            if think != self.current_think {
                self.current_think = think.to_string();
                self.render_think(sink);
                changed = true;
            }
        }

        if changed && near_bottom {
            sink.scroll_to_bottom();
        }
    }

    fn push_search(&mut self, raw: &str, sink: &mut dyn RenderSink) {
        if self.last_search.as_deref() == Some(raw) {
            return;
        }
        self.last_search = Some(raw.to_string());
        if let Err(err) = sink.show_search_results(&self.message_id, raw) {
            tracing::warn!(message_id = %self.message_id, "搜索结果渲染失败: {}", err);
        }
    }

    pub(super) fn rendered_content(&mut self, sink: &mut dyn RenderSink) -> RenderedContent {
        let display = content::prepare_display(&self.current_content, self.image_mode);
        for search in &display.search {
            self.push_search(search, sink);
        }
        RenderedContent {
            html: markup::render_markdown(&display.text),
            source: display.source,
        }
    }

    fn render_content(&mut self, sink: &mut dyn RenderSink) {
        let rendered = self.rendered_content(sink);
        if let Err(err) = sink.set_content(&self.message_id, &rendered) {
            tracing::warn!(message_id = %self.message_id, "消息内容渲染失败: {}", err);
            let fallback = RenderedContent {
                source: rendered.source,
                html: markup::processing_error_html(&err),
            };
            if let Err(err) = sink.set_content(&self.message_id, &fallback) {
                tracing::debug!(message_id = %self.message_id, "错误提示也无法渲染: {}", err);
            }
        }
    }

    fn render_think(&mut self, sink: &mut dyn RenderSink) {
        let Some(panel) = self.ensure_panel(sink) else {
            return;
        };
        let body = content::think_display_body(&self.current_think);
        let rendered = RenderedContent {
            html: markup::render_think_body(&body),
            source: body,
        };
        if let Err(err) = sink.set_think_body(panel, &rendered) {
            tracing::warn!(message_id = %self.message_id, "思考内容渲染失败: {}", err);
        }
        self.refresh_header(sink);
    }

    fn ensure_panel(&mut self, sink: &mut dyn RenderSink) -> Option<ThinkPanelHandle> {
        if let Some(panel) = self.think_panel {
            return Some(panel);
        }
        match sink.ensure_think_panel(&self.message_id) {
            Ok(panel) => {
                self.think_panel = Some(panel);
                Some(panel)
            }
            Err(err) => {
                tracing::warn!(message_id = %self.message_id, "创建思考面板失败: {}", err);
                None
            }
        }
    }

    pub(super) fn set_header(&self, header: ThinkHeader, sink: &mut dyn RenderSink) {
        let Some(panel) = self.think_panel else {
            return;
        };
        if let Err(err) = sink.set_think_header(panel, &header.label()) {
            tracing::warn!(message_id = %self.message_id, "思考标题更新失败: {}", err);
        }
    }

    fn refresh_header(&self, sink: &mut dyn RenderSink) {
        self.set_header(self.header(), sink);
    }
}
