// Fan-out dispatcher: routes chat, document, and recording-chunk events to
// the delivery set computed from current channel membership.

use base64::Engine as _;
use chrono::Utc;
use lumicast_common::protocol::ws::ServerMessage;
use lumicast_common::types::{ConnectionId, StreamId};
use tracing::{debug, warn};

use crate::ws::AppState;

/// Chat goes to the broadcaster and every watcher, sender included, after
/// the sliding-window check. A rejected message reaches nobody but the
/// sender, who gets a `rate-limit-exceeded` notice.
pub(crate) async fn handle_chat(
    state: &AppState,
    sender: ConnectionId,
    stream_id: StreamId,
    message: serde_json::Value,
) {
    if !state.registry.is_participant(&stream_id, sender).await {
        debug!(%stream_id, connection_id = %sender, "chat from non-participant dropped");
        return;
    }

    let admitted = match state.presence.check_chat_rate_limit(&stream_id, sender).await {
        Ok(admitted) => admitted,
        Err(error) => {
            // Fail open: a broken rate-limit backend must not mute the room.
            warn!(%error, %stream_id, "chat rate-limit check failed");
            true
        }
    };

    if !admitted {
        state
            .registry
            .send_to(
                sender,
                ServerMessage::RateLimitExceeded {
                    message: "chat rate limit exceeded, slow down".to_string(),
                },
            )
            .await;
        debug!(%stream_id, connection_id = %sender, "chat rate limited");
        return;
    }

    let targets = participant_targets(state, &stream_id).await;
    state
        .registry
        .send_to_many(
            &targets,
            ServerMessage::ChatMessage { from: sender, message, sent_at: Utc::now().to_rfc3339() },
        )
        .await;
}

/// Broadcaster shares a document with all watchers. Ignored from anyone
/// else.
pub(crate) async fn handle_share_document(
    state: &AppState,
    sender: ConnectionId,
    stream_id: StreamId,
    document: serde_json::Value,
) {
    if !state.registry.push_document(&stream_id, sender, document.clone()).await {
        debug!(%stream_id, connection_id = %sender, "share-document from non-broadcaster dropped");
        return;
    }

    let watchers = state.registry.watchers_of(&stream_id).await;
    state.registry.send_to_many(&watchers, ServerMessage::ShareDocument { document }).await;
}

pub(crate) async fn handle_close_document(
    state: &AppState,
    sender: ConnectionId,
    stream_id: StreamId,
) {
    if !state.registry.clear_documents(&stream_id, sender).await {
        debug!(%stream_id, connection_id = %sender, "close-document from non-broadcaster dropped");
        return;
    }

    let watchers = state.registry.watchers_of(&stream_id).await;
    state.registry.send_to_many(&watchers, ServerMessage::CloseDocument).await;
}

/// Broadcaster-initiated sync replaces the channel's document list and fans
/// it out to every watcher. A watcher-initiated sync answers that watcher
/// alone with the current list (its own payload is ignored).
pub(crate) async fn handle_sync_documents(
    state: &AppState,
    sender: ConnectionId,
    stream_id: StreamId,
    documents: Vec<serde_json::Value>,
) {
    if state.registry.is_broadcaster(&stream_id, sender).await {
        state.registry.set_documents(&stream_id, sender, documents.clone()).await;
        let watchers = state.registry.watchers_of(&stream_id).await;
        state.registry.send_to_many(&watchers, ServerMessage::SyncDocuments { documents }).await;
        return;
    }

    if state.registry.is_participant(&stream_id, sender).await {
        let documents = state.registry.documents(&stream_id).await;
        state.registry.send_to(sender, ServerMessage::SyncDocuments { documents }).await;
    } else {
        debug!(%stream_id, connection_id = %sender, "sync-documents from non-participant dropped");
    }
}

/// Recording chunks never fan out; they are decoded at the boundary and
/// appended to the channel's segment buffer in arrival order. `chunk_index`
/// is diagnostic only.
pub(crate) async fn handle_video_chunk(
    state: &AppState,
    sender: ConnectionId,
    stream_id: StreamId,
    chunk: String,
    chunk_index: u64,
) {
    let bytes = match base64::engine::general_purpose::STANDARD.decode(chunk.as_bytes()) {
        Ok(bytes) => bytes,
        Err(error) => {
            warn!(%error, %stream_id, chunk_index, "undecodable recording chunk ignored");
            return;
        }
    };

    if !state.registry.append_segment(&stream_id, sender, bytes).await {
        debug!(%stream_id, connection_id = %sender, chunk_index, "video-chunk from non-broadcaster dropped");
    }
}

/// Broadcaster plus all current watchers.
pub(crate) async fn participant_targets(
    state: &AppState,
    stream_id: &StreamId,
) -> Vec<ConnectionId> {
    let mut targets = state.registry.watchers_of(stream_id).await;
    if let Some(broadcaster) = state.registry.broadcaster_of(stream_id).await {
        targets.push(broadcaster);
    }
    targets
}
