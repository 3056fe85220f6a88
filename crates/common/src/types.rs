// Core domain types shared across the Lumicast crates.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Maximum allowed stream id length in characters.
const MAX_STREAM_ID_CHARS: usize = 128;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamIdError {
    #[error("stream id is empty")]
    Empty,

    #[error("stream id exceeds maximum length of {MAX_STREAM_ID_CHARS} characters")]
    TooLong,

    #[error("stream id contains control characters")]
    ControlCharacters,
}

/// Opaque, externally-assigned identifier of a livestream.
///
/// Unique across all concurrently active channels; the same id becomes
/// available again as soon as its channel has been torn down.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct StreamId(pub String);

impl StreamId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The core does not interpret stream ids, but it does bound them:
    /// empty, oversized, and control-character ids are refused at the
    /// transport edge.
    pub fn validate(&self) -> Result<(), StreamIdError> {
        if self.0.is_empty() {
            return Err(StreamIdError::Empty);
        }
        if self.0.chars().count() > MAX_STREAM_ID_CHARS {
            return Err(StreamIdError::TooLong);
        }
        if self.0.chars().any(char::is_control) {
            return Err(StreamIdError::ControlCharacters);
        }
        Ok(())
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StreamId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Stable identifier of a single WebSocket connection.
///
/// Valid only for the lifetime of the connection; never persisted beyond
/// teardown. Peers address relay messages (offer/answer/candidate) to it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Descriptive metadata attached at broadcast-announce time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamInfo {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

/// Aggregate metrics computed when a channel is finalized.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamMetrics {
    /// Peak concurrent watchers observed during the session.
    pub peak_watchers: usize,
    /// Total watcher-join events, re-joins included.
    pub total_joins: u64,
}

/// Lifecycle status recorded against external stream metadata.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    Live,
    Ended,
}

impl StreamStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Ended => "ended",
        }
    }
}
