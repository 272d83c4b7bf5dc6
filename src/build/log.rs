//! Build output shown to the user

use std::io::{self, IsTerminal, Write};
use std::sync::Mutex;

use taskpilot_api::LogLevel;

/// Prefix the service puts on lines emitted by the builder itself rather
/// than by the user's build steps
pub const BUILDER_MARKER: &str = "[builder] ";

/// Receives build output lines for a task
pub trait BuildLogSink: Send + Sync {
    fn log(&self, slug: &str, level: LogLevel, text: &str);
}

/// Writes `[build <slug>] <text>` to stderr
#[derive(Debug)]
pub struct ConsoleBuildLog {
    dim: bool,
}

impl ConsoleBuildLog {
    pub fn new() -> Self {
        Self {
            dim: io::stderr().is_terminal(),
        }
    }
}

impl Default for ConsoleBuildLog {
    fn default() -> Self {
        Self::new()
    }
}

impl BuildLogSink for ConsoleBuildLog {
    fn log(&self, slug: &str, level: LogLevel, text: &str) {
        let line = render(slug, level, text, self.dim);
        let mut stderr = io::stderr().lock();
        let _ = writeln!(stderr, "{line}");
    }
}

fn render(slug: &str, level: LogLevel, text: &str, dim: bool) -> String {
    let (from_builder, text) = match text.strip_prefix(BUILDER_MARKER) {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let text = match level {
        LogLevel::Debug => format!("[debug] {text}"),
        _ => text.to_string(),
    };
    if from_builder && dim {
        format!("[build {slug}] \x1b[2m{text}\x1b[0m")
    } else {
        format!("[build {slug}] {text}")
    }
}

/// Collects lines in memory
#[derive(Debug, Default)]
pub struct MemoryBuildLog {
    lines: Mutex<Vec<String>>,
}

impl MemoryBuildLog {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl BuildLogSink for MemoryBuildLog {
    fn log(&self, slug: &str, level: LogLevel, text: &str) {
        self.lines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(render(slug, level, text, false));
    }
}
