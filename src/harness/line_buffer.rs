use once_cell::sync::Lazy;
use regex::Regex;

static ANSI_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1B\[[0-?]*[ -/]*[@-~]").expect("valid ansi escape regex"));

/// Splits the byte stream of an instrumentation tool into loggable lines.
///
/// Tools like frida and objection redraw prompts with `\r` and colour their output, so
/// both line terminators are honoured and escape sequences are removed. A line that never
/// terminates is cut once `max_pending_bytes` accumulate.
#[derive(Debug)]
pub struct LineBuffer {
    pending: String,
    max_pending_bytes: usize,
    truncated_lines: usize,
}

impl LineBuffer {
    pub fn new(max_pending_bytes: usize) -> Self {
        Self {
            pending: String::new(),
            max_pending_bytes: max_pending_bytes.max(1),
            truncated_lines: 0,
        }
    }

    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        let mut lines = Vec::new();
        for ch in chunk.chars() {
            match ch {
                '\n' | '\r' => {
                    let line = std::mem::take(&mut self.pending);
                    push_clean(&mut lines, &line);
                }
                _ => {
                    self.pending.push(ch);
                    if self.pending.len() >= self.max_pending_bytes {
                        let line = std::mem::take(&mut self.pending);
                        self.truncated_lines = self.truncated_lines.saturating_add(1);
                        push_clean(&mut lines, &line);
                    }
                }
            }
        }
        lines
    }

    /// Remaining partial line once the stream closed.
    pub fn finish(&mut self) -> Option<String> {
        let line = std::mem::take(&mut self.pending);
        let mut lines = Vec::new();
        push_clean(&mut lines, &line);
        lines.pop()
    }

    pub fn truncated_lines(&self) -> usize {
        self.truncated_lines
    }
}

pub fn strip_ansi(value: &str) -> String {
    ANSI_ESCAPE_RE.replace_all(value, "").into_owned()
}

fn push_clean(lines: &mut Vec<String>, raw: &str) {
    let cleaned = strip_ansi(raw);
    let trimmed = cleaned.trim_end();
    if !trimmed.is_empty() {
        lines.push(trimmed.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::{strip_ansi, LineBuffer};

    #[test]
    fn splits_mixed_newlines_and_drops_blank_lines() {
        let mut buffer = LineBuffer::new(1024);
        let lines = buffer.push("a\nb\r\n\r\nc\rd");
        assert_eq!(lines, vec!["a", "b", "c"]);
        assert_eq!(buffer.finish().as_deref(), Some("d"));
        assert_eq!(buffer.finish(), None);
    }

    #[test]
    fn keeps_partial_lines_across_chunks() {
        let mut buffer = LineBuffer::new(1024);
        assert!(buffer.push("[Android Emulator::com.ex").is_empty());
        let lines = buffer.push("ample ]-> sslpinning disabled\n");
        assert_eq!(lines, vec!["[Android Emulator::com.example ]-> sslpinning disabled"]);
    }

    #[test]
    fn cuts_unterminated_lines_at_limit() {
        let mut buffer = LineBuffer::new(4);
        let lines = buffer.push("abcdef");
        assert_eq!(lines, vec!["abcd"]);
        assert_eq!(buffer.truncated_lines(), 1);
        assert_eq!(buffer.finish().as_deref(), Some("ef"));
    }

    #[test]
    fn removes_colour_codes() {
        assert_eq!(strip_ansi("\x1b[31mError:\x1b[0m license"), "Error: license");
    }
}
