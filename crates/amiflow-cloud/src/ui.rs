//! Human-readable progress sink
//!
//! Steps never print directly. They report through a [`Ui`] so the CLI can
//! render progress and tests can assert on it.

use colored::Colorize;
use std::sync::Mutex;

pub trait Ui: Send + Sync {
    /// Headline progress ("==> amazon-ebs: Creating temporary keypair...")
    fn say(&self, message: &str);

    /// Detail line under the current headline
    fn message(&self, message: &str);

    fn error(&self, message: &str);
}

/// Console UI that also mirrors every line to `tracing`
pub struct TracingUi {
    prefix: String,
}

impl TracingUi {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Ui for TracingUi {
    fn say(&self, message: &str) {
        tracing::info!(builder = %self.prefix, "{}", message);
        println!("{}", format!("==> {}: {}", self.prefix, message).bold());
    }

    fn message(&self, message: &str) {
        tracing::debug!(builder = %self.prefix, "{}", message);
        println!("    {}: {}", self.prefix, message);
    }

    fn error(&self, message: &str) {
        tracing::error!(builder = %self.prefix, "{}", message);
        eprintln!("{}", format!("==> {}: {}", self.prefix, message).red());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiLevel {
    Say,
    Message,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UiLine {
    pub level: UiLevel,
    pub text: String,
}

/// Records every line; used by tests and by callers that render later
#[derive(Debug, Default)]
pub struct BufferUi {
    lines: Mutex<Vec<UiLine>>,
}

impl BufferUi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<UiLine> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn errors(&self) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter(|l| l.level == UiLevel::Error)
            .map(|l| l.text)
            .collect()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|l| l.text.contains(needle))
    }

    fn push(&self, level: UiLevel, text: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(UiLine {
                level,
                text: text.to_string(),
            });
        }
    }
}

impl Ui for BufferUi {
    fn say(&self, message: &str) {
        self.push(UiLevel::Say, message);
    }

    fn message(&self, message: &str) {
        self.push(UiLevel::Message, message);
    }

    fn error(&self, message: &str) {
        self.push(UiLevel::Error, message);
    }
}
