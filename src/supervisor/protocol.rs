//! Worker → supervisor messages.
//!
//! Across a process boundary each message is one JSON object per line on
//! the worker's stdout:
//! `{"kind":"progress","page":3}`, `{"kind":"log","text":"..."}`.

use std::io::Write;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerMessage {
    Log { text: String },
    /// All rows of `page` are persisted.
    Progress { page: u32 },
    /// The worker finished its page range or stopped on request.
    Done { text: String },
    /// The worker run failed; the incarnation is over.
    Error { text: String },
}

impl WorkerMessage {
    pub fn log(text: impl Into<String>) -> Self {
        Self::Log { text: text.into() }
    }

    pub fn done(text: impl Into<String>) -> Self {
        Self::Done { text: text.into() }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::Error { text: text.into() }
    }

    /// DONE and ERROR end an incarnation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }

    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

/// Write one message as a JSON line and flush, so the supervisor sees it
/// before the next page starts.
pub fn write_message<W: Write>(out: &mut W, message: &WorkerMessage) -> std::io::Result<()> {
    let line = message.to_line().map_err(std::io::Error::other)?;
    writeln!(out, "{line}")?;
    out.flush()
}
