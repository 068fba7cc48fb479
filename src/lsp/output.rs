//! Named output channel for language-server output
//!
//! Collects the server's stderr and its `window/logMessage` and
//! `window/showMessage` notifications. Every line goes to `tracing` with a
//! `channel` field and is kept in a bounded in-memory buffer.

use crate::lsp::options::RevealOutputChannelOn;
use chrono::{DateTime, Utc};
use lsp_types::MessageType;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, warn};

/// Number of recent lines retained per channel
pub const DEFAULT_OUTPUT_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputLevel {
    Error,
    Warn,
    Info,
    Log,
}

impl OutputLevel {
    pub fn from_message_type(typ: MessageType) -> Self {
        if typ == MessageType::ERROR {
            OutputLevel::Error
        } else if typ == MessageType::WARNING {
            OutputLevel::Warn
        } else if typ == MessageType::INFO {
            OutputLevel::Info
        } else {
            OutputLevel::Log
        }
    }

    /// Severity used by the reveal policy; plain log lines never reveal
    fn severity(self) -> Option<RevealOutputChannelOn> {
        match self {
            OutputLevel::Error => Some(RevealOutputChannelOn::Error),
            OutputLevel::Warn => Some(RevealOutputChannelOn::Warn),
            OutputLevel::Info => Some(RevealOutputChannelOn::Info),
            OutputLevel::Log => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutputLine {
    pub timestamp: DateTime<Utc>,
    pub level: OutputLevel,
    pub text: String,
}

#[derive(Debug)]
struct OutputBuffer {
    lines: VecDeque<OutputLine>,
    capacity: usize,
    revealed: bool,
}

/// Cheaply cloneable handle; clones share one buffer
#[derive(Debug, Clone)]
pub struct OutputChannel {
    name: Arc<str>,
    reveal_on: RevealOutputChannelOn,
    buffer: Arc<Mutex<OutputBuffer>>,
}

impl OutputChannel {
    pub fn new(name: &str, reveal_on: RevealOutputChannelOn) -> Self {
        Self::with_capacity(name, reveal_on, DEFAULT_OUTPUT_CAPACITY)
    }

    pub fn with_capacity(name: &str, reveal_on: RevealOutputChannelOn, capacity: usize) -> Self {
        Self {
            name: Arc::from(name),
            reveal_on,
            buffer: Arc::new(Mutex::new(OutputBuffer {
                lines: VecDeque::with_capacity(capacity.min(DEFAULT_OUTPUT_CAPACITY)),
                capacity: capacity.max(1),
                revealed: false,
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn reveal_policy(&self) -> RevealOutputChannelOn {
        self.reveal_on
    }

    pub fn should_reveal(&self, level: OutputLevel) -> bool {
        level
            .severity()
            .is_some_and(|severity| self.reveal_on.reveals(severity))
    }

    pub fn append(&self, level: OutputLevel, text: impl Into<String>) {
        let text = text.into();
        let channel = self.name.as_ref();
        match level {
            OutputLevel::Error => error!(channel, "{}", text),
            OutputLevel::Warn => warn!(channel, "{}", text),
            OutputLevel::Info => info!(channel, "{}", text),
            OutputLevel::Log => debug!(channel, "{}", text),
        }

        let reveal = self.should_reveal(level);
        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        if buffer.lines.len() == buffer.capacity {
            buffer.lines.pop_front();
        }
        buffer.lines.push_back(OutputLine {
            timestamp: Utc::now(),
            level,
            text,
        });
        if reveal && !buffer.revealed {
            buffer.revealed = true;
            info!(channel, "Revealing output channel");
        }
    }

    /// A `window/logMessage` or `window/showMessage` from the server
    pub fn append_message(&self, typ: MessageType, message: impl Into<String>) {
        self.append(OutputLevel::from_message_type(typ), message);
    }

    pub fn lines(&self) -> Vec<OutputLine> {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .lines
            .iter()
            .cloned()
            .collect()
    }

    /// Whether any line so far would have brought the channel to the front
    pub fn was_revealed(&self) -> bool {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .revealed
    }
}
