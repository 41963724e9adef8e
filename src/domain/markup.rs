//! Usage: HTML fragments for assistant messages (Markdown body, think body, images, notices).

use pulldown_cmark::{html, Event, Options, Parser};

pub const INTERRUPTED_MARKER: &str = "用户已中断此次响应";

fn markdown_options() -> Options {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options.insert(Options::ENABLE_TASKLISTS);
    // `$x$` / `$$x$$` come out as math spans for the LaTeX renderer to pick up.
    options.insert(Options::ENABLE_MATH);
    options
}

pub fn render_markdown(src: &str) -> String {
    let parser = Parser::new_ext(src, markdown_options());
    let mut out = String::with_capacity(src.len() + src.len() / 2);
    html::push_html(&mut out, parser);
    out
}

/// Think bodies keep their line structure: every newline becomes a line break.
pub fn render_think_body(src: &str) -> String {
    let parser = Parser::new_ext(src, markdown_options()).map(|event| match event {
        Event::SoftBreak => Event::HardBreak,
        other => other,
    });
    let mut out = String::with_capacity(src.len() + src.len() / 2);
    html::push_html(&mut out, parser);
    out
}

pub fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    // Writing into a `String` never fails.
    let _ = pulldown_cmark_escape::escape_html(&mut out, raw);
    out
}

/// `payload` must already be restricted to the base64 alphabet.
pub fn image_html(payload: &str) -> String {
    format!(
        "<img src=\"data:image/png;base64,{payload}\" alt=\"嵌入图片\" class=\"embedded-image\" />"
    )
}

pub fn interrupted_notice_html() -> String {
    format!("<div class=\"interrupted-notice\">{INTERRUPTED_MARKER}</div>")
}

pub fn processing_error_html(message: &str) -> String {
    format!("<p>消息处理错误: {}</p>", escape_html(message))
}

pub fn error_note_html(message: &str) -> String {
    format!("<p class=\"message-error\">{}</p>", escape_html(message))
}
