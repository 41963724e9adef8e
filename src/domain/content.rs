//! Usage: Tag micro-format for assistant messages (`<model>`, `<think>`, `<image>`, `<base64>`, `<search>`).
//!
//! Everything here is pure and fail-open: a malformed or unterminated tag leaves the input untouched.

use crate::domain::markup;
use regex::Regex;
use std::sync::OnceLock;

fn compile(pattern: &'static str) -> Option<Regex> {
    match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(err) => {
            tracing::error!(pattern = pattern, "标签正则编译失败: {}", err);
            None
        }
    }
}

macro_rules! cached_regex {
    ($name:ident, $pattern:expr) => {
        fn $name() -> Option<&'static Regex> {
            static RE: OnceLock<Option<Regex>> = OnceLock::new();
            RE.get_or_init(|| compile($pattern)).as_ref()
        }
    };
}

cached_regex!(think_block_re, r"<think time=(\d+)>([\s\S]*?)</think>");
cached_regex!(think_open_re, r"<think time=(\d+)>");
cached_regex!(model_tag_re, r#"^\s*<model="([^"]+)"/>"#);
cached_regex!(image_block_re, r"<image>[\s\S]*?</image>");
cached_regex!(base64_block_re, r"<base64>([\s\S]*?)</base64>");
cached_regex!(search_block_re, r"<search>([\s\S]*?)</search>");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThinkBlock {
    pub seconds: u64,
    pub body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageMode {
    /// `<base64>` payloads become `<img>` elements appended after the text.
    Inline,
    /// `<base64>` payloads are removed from the text; the caller shows `images` elsewhere.
    Separate,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisplayContent {
    /// Text the user copies: search blocks removed, image tags untouched.
    pub source: String,
    /// Markdown source ready for rendering (may contain inline `<img>` HTML in `Inline` mode).
    pub text: String,
    pub images: Vec<String>,
    pub search: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedMessage {
    pub model: Option<String>,
    pub think: Option<ThinkBlock>,
    pub text: String,
}

/// Splits off the first complete `<think time=N>...</think>` block; the remainder is trimmed.
pub fn extract_think(s: &str) -> (Option<ThinkBlock>, String) {
    let Some(re) = think_block_re() else {
        return (None, s.to_string());
    };
    let Some(caps) = re.captures(s) else {
        return (None, s.to_string());
    };
    let (Some(whole), Some(secs), Some(body)) = (caps.get(0), caps.get(1), caps.get(2)) else {
        return (None, s.to_string());
    };
    let Ok(seconds) = secs.as_str().parse::<u64>() else {
        return (None, s.to_string());
    };

    let mut rest = String::with_capacity(s.len() - whole.len());
    rest.push_str(&s[..whole.start()]);
    rest.push_str(&s[whole.end()..]);

    (
        Some(ThinkBlock {
            seconds,
            body: body.as_str().to_string(),
        }),
        rest.trim().to_string(),
    )
}

/// `N` from an opening `<think time=N>`, also while the block is still streaming.
pub fn think_time_hint(s: &str) -> Option<u64> {
    let caps = think_open_re()?.captures(s)?;
    caps.get(1)?.as_str().parse::<u64>().ok()
}

/// Think text without its wrapping tags, whether or not the closing tag has arrived yet.
pub fn think_display_body(s: &str) -> String {
    if let (Some(block), _) = extract_think(s) {
        return block.body;
    }
    let mut body = s;
    if let Some(m) = think_open_re().and_then(|re| re.find(body)) {
        if body[..m.start()].trim().is_empty() {
            body = &body[m.end()..];
        }
    }
    body.strip_suffix("</think>").unwrap_or(body).to_string()
}

/// Splits off a leading `<model="NAME"/>` tag. The remainder is returned verbatim.
pub fn extract_model(s: &str) -> (Option<String>, String) {
    let Some(caps) = model_tag_re().and_then(|re| re.captures(s)) else {
        return (None, s.to_string());
    };
    let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
        return (None, s.to_string());
    };
    (Some(name.as_str().to_string()), s[whole.end()..].to_string())
}

fn sanitize_base64(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '='))
        .collect()
}

pub fn prepare_display(s: &str, mode: ImageMode) -> DisplayContent {
    let mut out = DisplayContent::default();
    let mut text = s.to_string();

    if let Some(re) = search_block_re() {
        if re.is_match(&text) {
            for caps in re.captures_iter(&text) {
                if let Some(inner) = caps.get(1) {
                    let inner = inner.as_str().trim();
                    if !inner.is_empty() {
                        out.search.push(inner.to_string());
                    }
                }
            }
            text = re.replace_all(&text, "").trim().to_string();
        }
    }

    out.source = text.clone();

    if let Some(re) = image_block_re() {
        text = re.replace_all(&text, "").into_owned();
    }

    if let Some(re) = base64_block_re() {
        for caps in re.captures_iter(&text) {
            if let Some(inner) = caps.get(1) {
                let payload = sanitize_base64(inner.as_str());
                if !payload.is_empty() {
                    out.images.push(payload);
                }
            }
        }
        let stripped = re.replace_all(&text, "").into_owned();
        text = match mode {
            ImageMode::Inline if !out.images.is_empty() => {
                let mut inline = stripped.trim().to_string();
                inline.push_str("<br>");
                for payload in &out.images {
                    inline.push_str(&markup::image_html(payload));
                }
                inline
            }
            _ => stripped,
        };
    }

    out.text = text;
    out
}

pub fn parse_message(s: &str) -> ParsedMessage {
    let (model, rest) = extract_model(s);

    // A think block written by `compose_message` sits first, followed by exactly one newline.
    if let Some(caps) = think_block_re().and_then(|re| re.captures(&rest)) {
        if let (Some(whole), Some(secs), Some(body)) = (caps.get(0), caps.get(1), caps.get(2)) {
            if whole.start() == 0 {
                if let Ok(seconds) = secs.as_str().parse::<u64>() {
                    let tail = &rest[whole.end()..];
                    let text = tail.strip_prefix('\n').unwrap_or(tail).to_string();
                    return ParsedMessage {
                        model,
                        think: Some(ThinkBlock {
                            seconds,
                            body: body.as_str().to_string(),
                        }),
                        text,
                    };
                }
            }
        }
    }

    let (think, text) = extract_think(&rest);
    if think.is_some() {
        return ParsedMessage { model, think, text };
    }
    ParsedMessage {
        model,
        think: None,
        text: rest,
    }
}

pub fn compose_message(model: Option<&str>, think: Option<&ThinkBlock>, text: &str) -> String {
    let mut out = String::new();
    if let Some(model) = model.map(str::trim).filter(|m| !m.is_empty()) {
        out.push_str(&format!("<model=\"{model}\"/>"));
    }
    if let Some(think) = think.filter(|t| !t.body.is_empty()) {
        out.push_str(&format!("<think time={}>{}</think>\n", think.seconds, think.body));
    }
    out.push_str(text);
    out
}
