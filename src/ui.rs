use crate::runner::StreamChunk;
use once_cell::sync::Lazy;
use regex::Regex;

static ANSI_ESCAPE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1B\[[0-?]*[ -/]*[@-~]").expect("valid ansi escape regex")
});

/// Strip ANSI escape sequences and carriage returns from terminal output.
pub fn sanitize_terminal_chunk(value: &str) -> String {
    let stripped = ANSI_ESCAPE_RE.replace_all(value, "");
    stripped.replace('\r', "")
}

/// Line-oriented echo of streamed chunks to the terminal. Chunks arrive at
/// arbitrary boundaries; partial lines are carried until their newline shows up.
#[derive(Debug, Default)]
pub struct StreamPrinter {
    stdout_pending: String,
    stderr_pending: String,
}

impl StreamPrinter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn print_chunk(&mut self, chunk: &StreamChunk) {
        match chunk {
            StreamChunk::Stdout(text) => {
                for line in drain_lines(&mut self.stdout_pending, text) {
                    println!("{line}");
                }
            }
            StreamChunk::Stderr(text) => {
                for line in drain_lines(&mut self.stderr_pending, text) {
                    eprintln!("! {line}");
                }
            }
        }
    }

    /// Emit any partial lines left after the stream closed.
    pub fn flush(&mut self) {
        if !self.stdout_pending.trim().is_empty() {
            println!("{}", std::mem::take(&mut self.stdout_pending));
        } else {
            self.stdout_pending.clear();
        }
        if !self.stderr_pending.trim().is_empty() {
            eprintln!("! {}", std::mem::take(&mut self.stderr_pending));
        } else {
            self.stderr_pending.clear();
        }
    }
}

/// Append a sanitized chunk to the pending buffer and split off every complete
/// line.
fn drain_lines(pending: &mut String, chunk: &str) -> Vec<String> {
    pending.push_str(&sanitize_terminal_chunk(chunk));
    let mut lines = Vec::new();
    while let Some(position) = pending.find('\n') {
        let line = pending[..position].to_string();
        pending.drain(..=position);
        lines.push(line);
    }
    lines
}
