//! Usage: Incremental NDJSON decoder for the generate stream (chunk boundaries may split lines or UTF-8).

use crate::domain::generation::StreamRecord;

pub const DEFAULT_MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug)]
pub struct NdjsonDecoder {
    buffer: Vec<u8>,
    max_line_bytes: usize,
    /// Set after an over-long line; bytes are dropped until the next newline.
    discarding: bool,
    skipped_lines: u64,
}

impl Default for NdjsonDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_BYTES)
    }
}

impl NdjsonDecoder {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_line_bytes: max_line_bytes.max(1),
            discarding: false,
            skipped_lines: 0,
        }
    }

    /// Malformed or oversized lines dropped so far.
    pub fn skipped_lines(&self) -> u64 {
        self.skipped_lines
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamRecord> {
        let mut out = Vec::new();
        let mut rest = chunk;

        while !rest.is_empty() {
            let newline = rest.iter().position(|b| *b == b'\n');
            let (segment, terminated) = match newline {
                Some(idx) => (&rest[..idx], true),
                None => (rest, false),
            };
            rest = match newline {
                Some(idx) => &rest[idx + 1..],
                None => &[],
            };

            if self.discarding {
                if terminated {
                    self.discarding = false;
                }
                continue;
            }

            if self.buffer.len() + segment.len() > self.max_line_bytes {
                tracing::warn!(
                    max_line_bytes = self.max_line_bytes,
                    "生成流单行超长，已丢弃该行"
                );
                self.buffer.clear();
                self.skipped_lines += 1;
                self.discarding = !terminated;
                continue;
            }

            self.buffer.extend_from_slice(segment);
            if terminated {
                let line = std::mem::take(&mut self.buffer);
                if let Some(record) = self.decode_line(&line) {
                    out.push(record);
                }
            }
        }

        out
    }

    /// Decodes a trailing line that was not newline-terminated when the body ended.
    pub fn finish(&mut self) -> Option<StreamRecord> {
        let discarding = std::mem::replace(&mut self.discarding, false);
        let line = std::mem::take(&mut self.buffer);
        if discarding {
            return None;
        }
        self.decode_line(&line)
    }

    fn decode_line(&mut self, line: &[u8]) -> Option<StreamRecord> {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.iter().all(|b| b.is_ascii_whitespace()) {
            return None;
        }
        match StreamRecord::from_json_slice(line) {
            Ok(record) => Some(record),
            Err(err) => {
                self.skipped_lines += 1;
                let preview = String::from_utf8_lossy(&line[..line.len().min(200)]);
                tracing::warn!(line = %preview, "生成流记录解析失败，已跳过: {}", err);
                None
            }
        }
    }
}
