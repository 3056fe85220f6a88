// WebSocket message types for the lumicast-live.v1 signaling protocol.
//
// Inbound and outbound messages are separate enums because the `broadcaster`
// tag carries different payloads per direction. SDP, ICE candidate, document
// and chat payloads are relayed as opaque JSON — presence of the field is
// the only validation the core performs.

use serde::{Deserialize, Serialize};

use crate::types::{ConnectionId, StreamId, StreamInfo};

/// Messages a client sends to the signaling core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Announce (or re-announce) a stream. Creates the channel, or replaces
    /// the broadcaster handle last-writer-wins on reconnect.
    Broadcaster {
        stream_id: StreamId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        info: Option<StreamInfo>,
    },

    /// Request to join a stream as a viewer.
    Watcher { stream_id: StreamId },

    /// Relay a session description to a peer connection.
    Offer {
        to: ConnectionId,
        stream_id: StreamId,
        sdp: serde_json::Value,
    },

    /// Relay an answering session description to a peer connection.
    Answer {
        to: ConnectionId,
        stream_id: StreamId,
        sdp: serde_json::Value,
    },

    /// Relay an ICE candidate to a peer connection. Any number, either
    /// direction, no ordering relative to offer/answer.
    Candidate {
        to: ConnectionId,
        stream_id: StreamId,
        candidate: serde_json::Value,
    },

    /// Explicitly end the stream. `save_recording` defaults to true.
    StreamEnded {
        stream_id: StreamId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        save_recording: Option<bool>,
    },

    /// A base64-encoded recording segment from the broadcaster.
    VideoChunk {
        stream_id: StreamId,
        chunk: String,
        chunk_index: u64,
    },

    /// Broadcaster shares a document with all watchers.
    ShareDocument {
        stream_id: StreamId,
        document: serde_json::Value,
    },

    /// Broadcaster closes the currently shared document.
    CloseDocument { stream_id: StreamId },

    /// Full document list sync — broadcaster pushes to all watchers, or a
    /// watcher requests its own copy on join.
    SyncDocuments {
        stream_id: StreamId,
        documents: Vec<serde_json::Value>,
    },

    /// Chat message scoped to the stream.
    SendChatMessage {
        stream_id: StreamId,
        message: serde_json::Value,
    },
}

impl ClientMessage {
    /// Wire tag, used for metrics labels and logging.
    pub const fn event_name(&self) -> &'static str {
        match self {
            Self::Broadcaster { .. } => "broadcaster",
            Self::Watcher { .. } => "watcher",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Candidate { .. } => "candidate",
            Self::StreamEnded { .. } => "stream-ended",
            Self::VideoChunk { .. } => "video-chunk",
            Self::ShareDocument { .. } => "share-document",
            Self::CloseDocument { .. } => "close-document",
            Self::SyncDocuments { .. } => "sync-documents",
            Self::SendChatMessage { .. } => "send-chat-message",
        }
    }
}

/// Messages the signaling core sends to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// First frame after upgrade: the handle peers will address.
    Connected {
        connection_id: ConnectionId,
        heartbeat_interval_ms: u64,
    },

    /// Generic availability ping to every connection — a broadcaster just
    /// announced, clients waiting on a stream should re-request it.
    Broadcaster,

    /// To the broadcaster: a new watcher joined, addressed by handle.
    Watcher { id: ConnectionId },

    /// Updated watcher count for the channel.
    #[serde(rename = "viewerCount")]
    ViewerCount { count: usize },

    /// Channel metadata, sent to a watcher on join when present.
    LivestreamInfo { info: StreamInfo },

    /// The requested stream has no active channel.
    StreamNotFound { stream_id: StreamId },

    /// Relayed session description, annotated with the sender's handle.
    Offer {
        from: ConnectionId,
        sdp: serde_json::Value,
    },

    /// Relayed answering session description.
    Answer {
        from: ConnectionId,
        sdp: serde_json::Value,
    },

    /// Relayed ICE candidate.
    Candidate {
        from: ConnectionId,
        candidate: serde_json::Value,
    },

    /// To the broadcaster: a watcher left or disconnected.
    Bye { watcher_handle: ConnectionId },

    /// The channel was torn down.
    StreamEnded { stream_id: StreamId },

    /// Fan-out of a shared document to watchers.
    ShareDocument { document: serde_json::Value },

    /// Fan-out of a document close to watchers.
    CloseDocument,

    /// Document list sync.
    SyncDocuments { documents: Vec<serde_json::Value> },

    /// Chat fan-out to broadcaster and all watchers, sender included.
    ChatMessage {
        from: ConnectionId,
        message: serde_json::Value,
        sent_at: String,
    },

    /// To the sender only: chat message rejected by the sliding window.
    RateLimitExceeded { message: String },
}

impl ServerMessage {
    pub const fn event_name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Broadcaster => "broadcaster",
            Self::Watcher { .. } => "watcher",
            Self::ViewerCount { .. } => "viewerCount",
            Self::LivestreamInfo { .. } => "livestream-info",
            Self::StreamNotFound { .. } => "stream-not-found",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Candidate { .. } => "candidate",
            Self::Bye { .. } => "bye",
            Self::StreamEnded { .. } => "stream-ended",
            Self::ShareDocument { .. } => "share-document",
            Self::CloseDocument => "close-document",
            Self::SyncDocuments { .. } => "sync-documents",
            Self::ChatMessage { .. } => "chat-message",
            Self::RateLimitExceeded { .. } => "rate-limit-exceeded",
        }
    }
}
