// Signaling broker: announce, watcher join, and opaque offer/answer/candidate
// relay. Mutates the registry synchronously; every collaborator side effect
// is spawned and never awaited before answering the triggering client.

use lumicast_common::protocol::ws::ServerMessage;
use lumicast_common::types::{ConnectionId, StreamId, StreamInfo, StreamStatus};
use tracing::{debug, info, warn};

use crate::metrics;
use crate::registry::Announce;
use crate::ws::AppState;

/// ABSENT → LIVE (or LIVE re-announce). Watchers waiting on this stream are
/// not retried automatically; the availability ping tells every client a
/// broadcaster just appeared so they can re-request.
pub(crate) async fn handle_announce(
    state: &AppState,
    sender: ConnectionId,
    stream_id: StreamId,
    stream_info: Option<StreamInfo>,
) {
    let outcome = state.registry.announce(&stream_id, sender, stream_info).await;
    metrics::set_active_streams(state.registry.active_stream_count().await as u64);

    info!(
        %stream_id,
        connection_id = %sender,
        reannounce = matches!(outcome, Announce::Reannounced),
        "broadcaster announced"
    );

    let metadata = state.metadata.clone();
    let status_stream = stream_id.clone();
    tokio::spawn(async move {
        if let Err(error) = metadata.update_status(&status_stream, StreamStatus::Live).await {
            warn!(%error, stream_id = %status_stream, "failed to persist live status");
        }
    });

    state.registry.broadcast_all(ServerMessage::Broadcaster).await;
}

/// Watcher join. Unknown stream ids get exactly one `stream-not-found` back
/// and nothing else changes; joins are idempotent per connection.
pub(crate) async fn handle_watcher_request(
    state: &AppState,
    sender: ConnectionId,
    stream_id: StreamId,
) {
    let Some(join) = state.registry.add_watcher(&stream_id, sender).await else {
        if state.registry.channel_exists(&stream_id).await {
            // Only reachable when the broadcaster asked to watch its own
            // stream; membership is unchanged.
            debug!(%stream_id, connection_id = %sender, "ignoring self-watch request");
        } else {
            info!(%stream_id, connection_id = %sender, "watcher requested unknown stream");
            state
                .registry
                .send_to(sender, ServerMessage::StreamNotFound { stream_id })
                .await;
        }
        return;
    };

    state.registry.send_to(join.broadcaster, ServerMessage::Watcher { id: sender }).await;

    let mut count_targets = state.registry.watchers_of(&stream_id).await;
    count_targets.push(join.broadcaster);
    state
        .registry
        .send_to_many(&count_targets, ServerMessage::ViewerCount { count: join.watcher_count })
        .await;

    if let Some(info) = join.info {
        state.registry.send_to(sender, ServerMessage::LivestreamInfo { info }).await;
    }

    metrics::set_viewer_count(&stream_id, join.watcher_count as u64);

    if join.newly_joined {
        let presence = state.presence.clone();
        let presence_stream = stream_id.clone();
        tokio::spawn(async move {
            if let Err(error) = presence.add_viewer(&presence_stream, sender).await {
                warn!(%error, stream_id = %presence_stream, "failed to register viewer presence");
            }
        });
    }

    info!(%stream_id, connection_id = %sender, count = join.watcher_count, "watcher joined");
}

/// The three relayed negotiation payloads. The broker forwards them verbatim
/// and stores nothing.
pub(crate) enum RelayPayload {
    Offer(serde_json::Value),
    Answer(serde_json::Value),
    Candidate(serde_json::Value),
}

impl RelayPayload {
    const fn event_name(&self) -> &'static str {
        match self {
            Self::Offer(_) => "offer",
            Self::Answer(_) => "answer",
            Self::Candidate(_) => "candidate",
        }
    }
}

/// Forward a negotiation message to its addressed peer, annotated with the
/// sender's handle. A missing or closed destination is a logged no-op —
/// never an error back through the signaling path.
pub(crate) async fn handle_relay(
    state: &AppState,
    sender: ConnectionId,
    to: ConnectionId,
    payload: RelayPayload,
) {
    let event = payload.event_name();
    let message = match payload {
        RelayPayload::Offer(sdp) => ServerMessage::Offer { from: sender, sdp },
        RelayPayload::Answer(sdp) => ServerMessage::Answer { from: sender, sdp },
        RelayPayload::Candidate(candidate) => {
            ServerMessage::Candidate { from: sender, candidate }
        }
    };

    if !state.registry.send_to(to, message).await {
        metrics::increment_relay_dropped();
        debug!(event, from = %sender, to = %to, "relay target no longer connected");
    }
}
