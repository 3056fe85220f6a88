// Channel lifecycle: explicit end-of-stream, watcher departure, and
// disconnection-triggered cleanup. Finalization takes the channel out of the
// registry first, so the stream id is reusable before any slow collaborator
// work starts.

use lumicast_common::protocol::ws::ServerMessage;
use lumicast_common::types::{ConnectionId, StreamId, StreamStatus};
use tracing::{debug, info, warn};

use crate::metrics;
use crate::ws::AppState;

/// LIVE → FINALIZED. Watchers are told the stream ended, the recording (if
/// requested and non-empty) is assembled and shipped to storage, final
/// metrics and the ended status are persisted. All collaborator calls are
/// spawned; none of them delays the caller.
pub(crate) async fn finalize_stream(state: &AppState, stream_id: StreamId, save_recording: bool) {
    let Some(channel) = state.registry.take_channel(&stream_id).await else {
        debug!(%stream_id, "finalize requested for unknown stream");
        return;
    };

    metrics::increment_finalize_jobs("started");
    metrics::clear_viewer_count(&stream_id);
    metrics::set_active_streams(state.registry.active_stream_count().await as u64);

    info!(
        %stream_id,
        watchers = channel.watchers.len(),
        segments = channel.segments.len(),
        save_recording,
        "finalizing stream"
    );

    // Best-effort per watcher; a closed transport never blocks the rest.
    state
        .registry
        .send_to_many(
            &channel.watchers,
            ServerMessage::StreamEnded { stream_id: stream_id.clone() },
        )
        .await;

    let presence = state.presence.clone();
    let presence_stream = stream_id.clone();
    tokio::spawn(async move {
        if let Err(error) = presence.release_stream(&presence_stream).await {
            warn!(%error, stream_id = %presence_stream, "failed to release stream presence");
        }
    });

    if save_recording && !channel.segments.is_empty() {
        let total: usize = channel.segments.iter().map(Vec::len).sum();
        let mut blob = Vec::with_capacity(total);
        for segment in &channel.segments {
            blob.extend_from_slice(segment);
        }

        let storage = state.storage.clone();
        let metadata = state.metadata.clone();
        let upload_stream = stream_id.clone();
        tokio::spawn(async move {
            match storage.upload_blob(&upload_stream, blob).await {
                Ok(url) => {
                    if let Err(error) = metadata.record_recording_url(&upload_stream, url).await {
                        warn!(%error, stream_id = %upload_stream, "failed to persist recording url");
                        metrics::increment_finalize_jobs("failed");
                    } else {
                        metrics::increment_finalize_jobs("completed");
                    }
                }
                Err(error) => {
                    warn!(%error, stream_id = %upload_stream, "recording upload failed");
                    metrics::increment_finalize_jobs("failed");
                }
            }
        });
    } else {
        metrics::increment_finalize_jobs("completed");
    }

    let metadata = state.metadata.clone();
    let metrics_stream = stream_id.clone();
    let final_metrics = channel.metrics;
    tokio::spawn(async move {
        if let Err(error) = metadata.record_final_metrics(&metrics_stream, final_metrics).await {
            warn!(%error, stream_id = %metrics_stream, "failed to persist final metrics");
        }
    });

    let metadata = state.metadata.clone();
    let status_stream = stream_id.clone();
    tokio::spawn(async move {
        if let Err(error) = metadata.update_status(&status_stream, StreamStatus::Ended).await {
            warn!(%error, stream_id = %status_stream, "failed to persist ended status");
        }
    });
}

/// A watcher left one channel: tell the broadcaster who, tell everyone the
/// new count, release presence.
pub(crate) async fn handle_watcher_leave(
    state: &AppState,
    watcher: ConnectionId,
    stream_id: StreamId,
) {
    let Some((broadcaster, count)) = state.registry.remove_watcher(&stream_id, watcher).await
    else {
        return;
    };

    state.registry.send_to(broadcaster, ServerMessage::Bye { watcher_handle: watcher }).await;

    let mut count_targets = state.registry.watchers_of(&stream_id).await;
    count_targets.push(broadcaster);
    state.registry.send_to_many(&count_targets, ServerMessage::ViewerCount { count }).await;

    metrics::set_viewer_count(&stream_id, count as u64);

    let presence = state.presence.clone();
    let presence_stream = stream_id.clone();
    tokio::spawn(async move {
        if let Err(error) = presence.remove_viewer(&presence_stream, watcher).await {
            warn!(%error, stream_id = %presence_stream, "failed to release viewer presence");
        }
    });

    debug!(%stream_id, connection_id = %watcher, count, "watcher left");
}

/// Socket teardown: finalize every channel this connection broadcast, leave
/// every channel it watched, then drop the connection handle. A broadcaster
/// disconnect implies saving whatever was recorded.
pub(crate) async fn handle_disconnect(state: &AppState, connection: ConnectionId) {
    for stream_id in state.registry.channels_broadcast_by(connection).await {
        finalize_stream(state, stream_id, true).await;
    }

    for stream_id in state.registry.channels_watched_by(connection).await {
        handle_watcher_leave(state, connection, stream_id).await;
    }

    state.registry.deregister_connection(connection).await;
    info!(connection_id = %connection, "connection cleaned up");
}
