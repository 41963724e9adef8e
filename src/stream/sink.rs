//! Usage: Render sink abstraction for assistant messages + an in-memory implementation.

use crate::chat_api::FreeUsageInfo;

pub const NEAR_BOTTOM_THRESHOLD_PX: u32 = 160;
/// Height one content update adds to the modelled view.
const UPDATE_GROWTH_PX: u32 = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThinkPanelHandle(u64);

impl ThinkPanelHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Source text plus the HTML rendered from it (the source is what "copy" copies).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderedContent {
    pub source: String,
    pub html: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccountInfo {
    pub points: Option<String>,
    pub free_usage: Option<FreeUsageInfo>,
}

/// Where a generation is drawn. Every mutating call can fail when its target node is gone
/// (e.g. the user deleted the message); callers log and keep streaming.
pub trait RenderSink: Send {
    /// Loading placeholder with the model header.
    fn create_placeholder(&mut self, message_id: &str, model: &str) -> Result<(), String>;

    /// Swaps the loading indicator for an empty content container; the model header stays.
    fn replace_with_content_container(&mut self, message_id: &str) -> Result<(), String>;

    fn set_content(&mut self, message_id: &str, content: &RenderedContent) -> Result<(), String>;

    /// Collapsible reasoning panel placed before the content, expanded when created.
    fn ensure_think_panel(&mut self, message_id: &str) -> Result<ThinkPanelHandle, String>;

    fn set_think_body(&mut self, panel: ThinkPanelHandle, body: &RenderedContent) -> Result<(), String>;

    fn set_think_header(&mut self, panel: ThinkPanelHandle, label: &str) -> Result<(), String>;

    /// Returns whether the panel is expanded afterwards.
    fn toggle_think_panel(&mut self, panel: ThinkPanelHandle) -> Result<bool, String>;

    fn is_near_bottom(&self) -> bool;

    fn scroll_to_bottom(&mut self);

    fn scroll_to_bottom_if_near(&mut self) {
        if self.is_near_bottom() {
            self.scroll_to_bottom();
        }
    }

    fn append_error_note(&mut self, message_id: &str, html: &str) -> Result<(), String>;

    fn show_search_results(&mut self, _message_id: &str, _raw: &str) -> Result<(), String> {
        Ok(())
    }

    fn show_account_info(&mut self, _info: &AccountInfo) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkOp {
    CreatePlaceholder(String),
    ReplaceWithContentContainer(String),
    SetContent(String),
    EnsureThinkPanel(String),
    SetThinkBody(ThinkPanelHandle),
    SetThinkHeader(ThinkPanelHandle, String),
    ToggleThinkPanel(ThinkPanelHandle),
    ScrollToBottom,
    AppendErrorNote(String),
    ShowSearchResults(String),
    ShowAccountInfo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThinkPanelView {
    pub handle: ThinkPanelHandle,
    pub header: String,
    pub body: RenderedContent,
    pub expanded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageView {
    pub message_id: String,
    pub model: String,
    pub loading: bool,
    pub think: Option<ThinkPanelView>,
    pub content: Option<RenderedContent>,
    pub error_notes: Vec<String>,
    pub search_results: Vec<String>,
}

/// Headless message list: what a DOM would show, plus a log of every sink call.
#[derive(Debug, Default)]
pub struct MemorySink {
    messages: Vec<MessageView>,
    ops: Vec<SinkOp>,
    next_panel_id: u64,
    distance_from_bottom_px: u32,
    account_info: Option<AccountInfo>,
}

fn missing(message_id: &str) -> String {
    format!("RENDER_TARGET_MISSING: message {message_id}")
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[MessageView] {
        &self.messages
    }

    pub fn message(&self, message_id: &str) -> Option<&MessageView> {
        self.messages.iter().find(|m| m.message_id == message_id)
    }

    pub fn ops(&self) -> &[SinkOp] {
        &self.ops
    }

    pub fn count_ops(&self, pred: impl Fn(&SinkOp) -> bool) -> usize {
        self.ops.iter().filter(|op| pred(op)).count()
    }

    pub fn account_info(&self) -> Option<&AccountInfo> {
        self.account_info.as_ref()
    }

    /// Simulates the user deleting the message node mid-stream.
    pub fn remove_message(&mut self, message_id: &str) -> bool {
        let before = self.messages.len();
        self.messages.retain(|m| m.message_id != message_id);
        before != self.messages.len()
    }

    /// Simulates the user scrolling away from (or back to) the bottom.
    pub fn set_distance_from_bottom(&mut self, px: u32) {
        self.distance_from_bottom_px = px;
    }

    fn message_mut(&mut self, message_id: &str) -> Result<&mut MessageView, String> {
        self.messages
            .iter_mut()
            .find(|m| m.message_id == message_id)
            .ok_or_else(|| missing(message_id))
    }

    fn panel_mut(&mut self, panel: ThinkPanelHandle) -> Result<&mut ThinkPanelView, String> {
        self.messages
            .iter_mut()
            .filter_map(|m| m.think.as_mut())
            .find(|p| p.handle == panel)
            .ok_or_else(|| format!("RENDER_TARGET_MISSING: think panel {}", panel.id()))
    }

    fn grow(&mut self) {
        self.distance_from_bottom_px = self.distance_from_bottom_px.saturating_add(UPDATE_GROWTH_PX);
    }
}

impl RenderSink for MemorySink {
    fn create_placeholder(&mut self, message_id: &str, model: &str) -> Result<(), String> {
        self.ops.push(SinkOp::CreatePlaceholder(message_id.to_string()));
        let view = MessageView {
            message_id: message_id.to_string(),
            model: model.to_string(),
            loading: true,
            think: None,
            content: None,
            error_notes: Vec::new(),
            search_results: Vec::new(),
        };
        match self.messages.iter_mut().find(|m| m.message_id == message_id) {
            Some(existing) => *existing = view,
            None => self.messages.push(view),
        }
        self.grow();
        Ok(())
    }

    fn replace_with_content_container(&mut self, message_id: &str) -> Result<(), String> {
        self.ops
            .push(SinkOp::ReplaceWithContentContainer(message_id.to_string()));
        let message = self.message_mut(message_id)?;
        message.loading = false;
        message.content = Some(RenderedContent::default());
        Ok(())
    }

    fn set_content(&mut self, message_id: &str, content: &RenderedContent) -> Result<(), String> {
        self.ops.push(SinkOp::SetContent(message_id.to_string()));
        let message = self.message_mut(message_id)?;
        message.loading = false;
        message.content = Some(content.clone());
        self.grow();
        Ok(())
    }

    fn ensure_think_panel(&mut self, message_id: &str) -> Result<ThinkPanelHandle, String> {
        self.ops.push(SinkOp::EnsureThinkPanel(message_id.to_string()));
        let next_id = self.next_panel_id + 1;
        let message = self.message_mut(message_id)?;
        if let Some(panel) = message.think.as_ref() {
            return Ok(panel.handle);
        }
        let handle = ThinkPanelHandle::new(next_id);
        message.think = Some(ThinkPanelView {
            handle,
            header: String::new(),
            body: RenderedContent::default(),
            expanded: true,
        });
        self.next_panel_id = next_id;
        Ok(handle)
    }

    fn set_think_body(&mut self, panel: ThinkPanelHandle, body: &RenderedContent) -> Result<(), String> {
        self.ops.push(SinkOp::SetThinkBody(panel));
        self.panel_mut(panel)?.body = body.clone();
        self.grow();
        Ok(())
    }

    fn set_think_header(&mut self, panel: ThinkPanelHandle, label: &str) -> Result<(), String> {
        self.ops
            .push(SinkOp::SetThinkHeader(panel, label.to_string()));
        self.panel_mut(panel)?.header = label.to_string();
        Ok(())
    }

    fn toggle_think_panel(&mut self, panel: ThinkPanelHandle) -> Result<bool, String> {
        self.ops.push(SinkOp::ToggleThinkPanel(panel));
        let view = self.panel_mut(panel)?;
        view.expanded = !view.expanded;
        Ok(view.expanded)
    }

    fn is_near_bottom(&self) -> bool {
        self.distance_from_bottom_px <= NEAR_BOTTOM_THRESHOLD_PX
    }

    fn scroll_to_bottom(&mut self) {
        self.ops.push(SinkOp::ScrollToBottom);
        self.distance_from_bottom_px = 0;
    }

    fn append_error_note(&mut self, message_id: &str, html: &str) -> Result<(), String> {
        self.ops
            .push(SinkOp::AppendErrorNote(message_id.to_string()));
        self.message_mut(message_id)?
            .error_notes
            .push(html.to_string());
        Ok(())
    }

    fn show_search_results(&mut self, message_id: &str, raw: &str) -> Result<(), String> {
        self.ops
            .push(SinkOp::ShowSearchResults(message_id.to_string()));
        let message = self.message_mut(message_id)?;
        if message.search_results.last().map(String::as_str) != Some(raw) {
            message.search_results.push(raw.to_string());
        }
        Ok(())
    }

    fn show_account_info(&mut self, info: &AccountInfo) {
        self.ops.push(SinkOp::ShowAccountInfo);
        self.account_info = Some(info.clone());
    }
}
