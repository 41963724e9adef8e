//! Usage: `RenderSink` for the terminal. Prints each message incrementally as plain text.

use crate::stream::sink::{AccountInfo, RenderSink, RenderedContent, ThinkPanelHandle};
use std::collections::HashMap;
use std::io::Write;

#[derive(Debug, Default)]
struct TerminalMessage {
    printed_content: String,
    printed_think: String,
    think_header: String,
    think_expanded: bool,
}

pub struct TerminalSink<W: Write + Send> {
    out: W,
    messages: HashMap<String, TerminalMessage>,
    panels: HashMap<ThinkPanelHandle, String>,
    next_panel_id: u64,
    show_think: bool,
}

fn io_error(err: std::io::Error) -> String {
    format!("IO_ERROR: terminal write failed: {err}")
}

/// Drops tags from a small HTML fragment (error notes only carry `<p>` wrappers).
fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

/// The part of `next` not printed yet. A rewrite (not an extension) prints everything again.
fn unprinted<'a>(printed: &str, next: &'a str) -> (bool, &'a str) {
    match next.strip_prefix(printed) {
        Some(rest) => (false, rest),
        None => (true, next),
    }
}

impl<W: Write + Send> TerminalSink<W> {
    pub fn new(out: W, show_think: bool) -> Self {
        Self {
            out,
            messages: HashMap::new(),
            panels: HashMap::new(),
            next_panel_id: 0,
            show_think,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn message_mut(&mut self, message_id: &str) -> Result<&mut TerminalMessage, String> {
        self.messages
            .get_mut(message_id)
            .ok_or_else(|| format!("RENDER_TARGET_MISSING: message {message_id}"))
    }

    fn panel_message(&self, panel: ThinkPanelHandle) -> Result<String, String> {
        self.panels
            .get(&panel)
            .cloned()
            .ok_or_else(|| format!("RENDER_TARGET_MISSING: think panel {}", panel.id()))
    }

    fn write_str(&mut self, s: &str) -> Result<(), String> {
        self.out.write_all(s.as_bytes()).map_err(io_error)
    }
}

impl<W: Write + Send> RenderSink for TerminalSink<W> {
    fn create_placeholder(&mut self, message_id: &str, model: &str) -> Result<(), String> {
        self.messages
            .insert(message_id.to_string(), TerminalMessage::default());
        self.write_str(&format!("\n[{model}]\n"))?;
        self.out.flush().map_err(io_error)
    }

    fn replace_with_content_container(&mut self, message_id: &str) -> Result<(), String> {
        self.message_mut(message_id).map(|_| ())
    }

    fn set_content(&mut self, message_id: &str, content: &RenderedContent) -> Result<(), String> {
        let message = self.message_mut(message_id)?;
        let (rewrite, rest) = unprinted(&message.printed_content, &content.source);
        let rest = rest.to_string();
        message.printed_content = content.source.clone();
        if rewrite && !rest.is_empty() {
            self.write_str("\n")?;
        }
        self.write_str(&rest)?;
        self.out.flush().map_err(io_error)
    }

    fn ensure_think_panel(&mut self, message_id: &str) -> Result<ThinkPanelHandle, String> {
        if let Some((handle, _)) = self.panels.iter().find(|(_, id)| id.as_str() == message_id) {
            return Ok(*handle);
        }
        let show_think = self.show_think;
        let message = self.message_mut(message_id)?;
        message.think_expanded = show_think;
        self.next_panel_id += 1;
        let handle = ThinkPanelHandle::new(self.next_panel_id);
        self.panels.insert(handle, message_id.to_string());
        Ok(handle)
    }

    fn set_think_body(&mut self, panel: ThinkPanelHandle, body: &RenderedContent) -> Result<(), String> {
        let message_id = self.panel_message(panel)?;
        let message = self.message_mut(&message_id)?;
        if !message.think_expanded {
            message.printed_think = body.source.clone();
            return Ok(());
        }
        let (_, rest) = unprinted(&message.printed_think, &body.source);
        let rest = rest.to_string();
        message.printed_think = body.source.clone();
        self.write_str(&rest)?;
        self.out.flush().map_err(io_error)
    }

    fn set_think_header(&mut self, panel: ThinkPanelHandle, label: &str) -> Result<(), String> {
        let message_id = self.panel_message(panel)?;
        let message = self.message_mut(&message_id)?;
        if message.think_header == label {
            return Ok(());
        }
        message.think_header = label.to_string();
        self.write_str(&format!("\n({label})\n"))
    }

    fn toggle_think_panel(&mut self, panel: ThinkPanelHandle) -> Result<bool, String> {
        let message_id = self.panel_message(panel)?;
        let message = self.message_mut(&message_id)?;
        message.think_expanded = !message.think_expanded;
        Ok(message.think_expanded)
    }

    fn is_near_bottom(&self) -> bool {
        true
    }

    fn scroll_to_bottom(&mut self) {
        if let Err(err) = self.out.flush() {
            tracing::debug!("终端刷新失败: {}", err);
        }
    }

    fn append_error_note(&mut self, message_id: &str, html: &str) -> Result<(), String> {
        self.message_mut(message_id)?;
        self.write_str(&format!("\n! {}\n", strip_tags(html)))
    }

    fn show_search_results(&mut self, message_id: &str, raw: &str) -> Result<(), String> {
        self.message_mut(message_id)?;
        self.write_str(&format!("\n[搜索结果]\n{}\n", raw.trim()))
    }

    fn show_account_info(&mut self, info: &AccountInfo) {
        let mut parts = Vec::new();
        if let Some(points) = info.points.as_deref() {
            parts.push(format!("积分: {points}"));
        }
        if let Some(usage) = info.free_usage.as_ref() {
            parts.push(format!("免费额度: {}/{}", usage.remaining, usage.limit));
        }
        if parts.is_empty() {
            return;
        }
        if let Err(err) = self.write_str(&format!("\n[{}]\n", parts.join(" · "))) {
            tracing::debug!("账户信息输出失败: {}", err);
        }
    }
}
