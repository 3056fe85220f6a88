// Session registry: the single shared mutable structure of the core.
//
// Two maps behind one RwLock — connection handles to their outbound
// channels, and live streams to their channel records. Holding both under
// one lock keeps every registry mutation atomic with respect to the others,
// which is the atomicity the event-driven design relies on.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use lumicast_common::protocol::ws::ServerMessage;
use lumicast_common::types::{ConnectionId, StreamId, StreamInfo, StreamMetrics};
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

/// One active livestream: exactly one broadcaster, any number of watchers.
#[derive(Debug)]
struct Channel {
    broadcaster: ConnectionId,
    watchers: HashSet<ConnectionId>,
    info: Option<StreamInfo>,
    /// Recording segments in append order. Append-only while live; taken
    /// wholesale when finalization begins.
    segments: Vec<Vec<u8>>,
    /// Documents currently shared by the broadcaster, served to watchers
    /// that request a sync after joining.
    documents: Vec<serde_json::Value>,
    peak_watchers: usize,
    total_joins: u64,
}

impl Channel {
    fn new(broadcaster: ConnectionId, info: Option<StreamInfo>) -> Self {
        Self {
            broadcaster,
            watchers: HashSet::new(),
            info,
            segments: Vec::new(),
            documents: Vec::new(),
            peak_watchers: 0,
            total_joins: 0,
        }
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    connections: HashMap<ConnectionId, mpsc::UnboundedSender<ServerMessage>>,
    channels: HashMap<StreamId, Channel>,
}

/// Outcome of a broadcaster announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Announce {
    Created,
    /// Channel already existed; broadcaster handle replaced last-writer-wins,
    /// existing watchers untouched.
    Reannounced,
}

/// Snapshot handed to the broker after a successful watcher join.
#[derive(Debug, Clone)]
pub struct WatcherJoin {
    pub broadcaster: ConnectionId,
    pub watcher_count: usize,
    pub info: Option<StreamInfo>,
    /// False when the connection was already a member (idempotent re-join).
    pub newly_joined: bool,
}

/// Everything needed to finalize a channel, taken out of the registry in one
/// move so the stream id is immediately reusable and the segment buffer can
/// no longer be appended to.
#[derive(Debug)]
pub struct FinalizedChannel {
    pub broadcaster: ConnectionId,
    pub watchers: Vec<ConnectionId>,
    pub segments: Vec<Vec<u8>>,
    pub metrics: StreamMetrics,
}

/// In-memory table of active channels and connected sockets.
///
/// Explicitly owned and constructor-injected; lifecycle is tied to the
/// process instance. A multi-instance deployment needs an external presence
/// store instead — this registry is deliberately single-process.
#[derive(Debug, Clone, Default)]
pub struct StreamRegistry {
    state: Arc<RwLock<RegistryState>>,
}

impl StreamRegistry {
    // ── Connection table ────────────────────────────────────────────

    pub async fn register_connection(
        &self,
        connection: ConnectionId,
        sender: mpsc::UnboundedSender<ServerMessage>,
    ) {
        self.state.write().await.connections.insert(connection, sender);
    }

    pub async fn deregister_connection(&self, connection: ConnectionId) {
        self.state.write().await.connections.remove(&connection);
    }

    /// Deliver a message to one connection. Returns false when the target is
    /// gone or its transport is closed — callers treat that as a no-op.
    pub async fn send_to(&self, target: ConnectionId, message: ServerMessage) -> bool {
        let sender = {
            let guard = self.state.read().await;
            guard.connections.get(&target).cloned()
        };
        match sender {
            Some(sender) => sender.send(message).is_ok(),
            None => false,
        }
    }

    /// Deliver a message to each target, skipping closed transports.
    pub async fn send_to_many(&self, targets: &[ConnectionId], message: ServerMessage) -> usize {
        let mut recipients = Vec::with_capacity(targets.len());
        {
            let guard = self.state.read().await;
            for target in targets {
                if let Some(sender) = guard.connections.get(target) {
                    recipients.push(sender.clone());
                }
            }
        }

        let mut sent = 0;
        for recipient in recipients {
            if recipient.send(message.clone()).is_ok() {
                sent += 1;
            }
        }
        sent
    }

    /// Deliver a message to every connected socket (broadcaster availability
    /// ping).
    pub async fn broadcast_all(&self, message: ServerMessage) -> usize {
        let recipients: Vec<_> = {
            let guard = self.state.read().await;
            guard.connections.values().cloned().collect()
        };

        let mut sent = 0;
        for recipient in recipients {
            if recipient.send(message.clone()).is_ok() {
                sent += 1;
            }
        }
        sent
    }

    // ── Channel table ───────────────────────────────────────────────

    /// Create a channel, or replace the broadcaster handle if one already
    /// exists for the stream id. A re-announce never evicts watchers; info
    /// is replaced only when the announce carries one. The new broadcaster
    /// handle is dropped from the watcher set if it was ever there.
    pub async fn announce(
        &self,
        stream_id: &StreamId,
        broadcaster: ConnectionId,
        info: Option<StreamInfo>,
    ) -> Announce {
        let mut guard = self.state.write().await;
        match guard.channels.get_mut(stream_id) {
            Some(channel) => {
                channel.broadcaster = broadcaster;
                channel.watchers.remove(&broadcaster);
                if info.is_some() {
                    channel.info = info;
                }
                Announce::Reannounced
            }
            None => {
                guard.channels.insert(stream_id.clone(), Channel::new(broadcaster, info));
                Announce::Created
            }
        }
    }

    /// Add a watcher to a channel. Returns `None` when no channel exists for
    /// the stream id, or when the connection is the channel's broadcaster
    /// (a broadcaster never watches its own stream).
    pub async fn add_watcher(
        &self,
        stream_id: &StreamId,
        watcher: ConnectionId,
    ) -> Option<WatcherJoin> {
        let mut guard = self.state.write().await;
        let channel = guard.channels.get_mut(stream_id)?;
        if channel.broadcaster == watcher {
            debug!(%stream_id, connection_id = %watcher, "broadcaster tried to watch own stream");
            return None;
        }

        let newly_joined = channel.watchers.insert(watcher);
        if newly_joined {
            channel.total_joins += 1;
            channel.peak_watchers = channel.peak_watchers.max(channel.watchers.len());
        }

        Some(WatcherJoin {
            broadcaster: channel.broadcaster,
            watcher_count: channel.watchers.len(),
            info: channel.info.clone(),
            newly_joined,
        })
    }

    /// Remove a watcher. Returns the broadcaster handle and the updated
    /// count when the watcher was a member.
    pub async fn remove_watcher(
        &self,
        stream_id: &StreamId,
        watcher: ConnectionId,
    ) -> Option<(ConnectionId, usize)> {
        let mut guard = self.state.write().await;
        let channel = guard.channels.get_mut(stream_id)?;
        if !channel.watchers.remove(&watcher) {
            return None;
        }
        Some((channel.broadcaster, channel.watchers.len()))
    }

    /// Append a recording segment; only the current broadcaster may append.
    pub async fn append_segment(
        &self,
        stream_id: &StreamId,
        sender: ConnectionId,
        segment: Vec<u8>,
    ) -> bool {
        let mut guard = self.state.write().await;
        match guard.channels.get_mut(stream_id) {
            Some(channel) if channel.broadcaster == sender => {
                channel.segments.push(segment);
                true
            }
            _ => false,
        }
    }

    /// Replace the shared document list (broadcaster sync push).
    pub async fn set_documents(
        &self,
        stream_id: &StreamId,
        sender: ConnectionId,
        documents: Vec<serde_json::Value>,
    ) -> bool {
        let mut guard = self.state.write().await;
        match guard.channels.get_mut(stream_id) {
            Some(channel) if channel.broadcaster == sender => {
                channel.documents = documents;
                true
            }
            _ => false,
        }
    }

    /// Record a newly shared document.
    pub async fn push_document(
        &self,
        stream_id: &StreamId,
        sender: ConnectionId,
        document: serde_json::Value,
    ) -> bool {
        let mut guard = self.state.write().await;
        match guard.channels.get_mut(stream_id) {
            Some(channel) if channel.broadcaster == sender => {
                channel.documents.push(document);
                true
            }
            _ => false,
        }
    }

    /// Clear shared documents (broadcaster closed the document).
    pub async fn clear_documents(&self, stream_id: &StreamId, sender: ConnectionId) -> bool {
        let mut guard = self.state.write().await;
        match guard.channels.get_mut(stream_id) {
            Some(channel) if channel.broadcaster == sender => {
                channel.documents.clear();
                true
            }
            _ => false,
        }
    }

    pub async fn documents(&self, stream_id: &StreamId) -> Vec<serde_json::Value> {
        let guard = self.state.read().await;
        guard.channels.get(stream_id).map(|c| c.documents.clone()).unwrap_or_default()
    }

    /// Remove the channel and hand back everything finalization needs. The
    /// stream id is available for a fresh announce as soon as this returns.
    pub async fn take_channel(&self, stream_id: &StreamId) -> Option<FinalizedChannel> {
        let mut guard = self.state.write().await;
        let channel = guard.channels.remove(stream_id)?;
        Some(FinalizedChannel {
            broadcaster: channel.broadcaster,
            watchers: channel.watchers.into_iter().collect(),
            segments: channel.segments,
            metrics: StreamMetrics {
                peak_watchers: channel.peak_watchers,
                total_joins: channel.total_joins,
            },
        })
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub async fn channel_exists(&self, stream_id: &StreamId) -> bool {
        self.state.read().await.channels.contains_key(stream_id)
    }

    pub async fn broadcaster_of(&self, stream_id: &StreamId) -> Option<ConnectionId> {
        self.state.read().await.channels.get(stream_id).map(|c| c.broadcaster)
    }

    pub async fn watchers_of(&self, stream_id: &StreamId) -> Vec<ConnectionId> {
        self.state
            .read()
            .await
            .channels
            .get(stream_id)
            .map(|c| c.watchers.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn watcher_count(&self, stream_id: &StreamId) -> usize {
        self.state.read().await.channels.get(stream_id).map(|c| c.watchers.len()).unwrap_or(0)
    }

    /// True when the connection is the channel's broadcaster or a registered
    /// watcher.
    pub async fn is_participant(&self, stream_id: &StreamId, connection: ConnectionId) -> bool {
        let guard = self.state.read().await;
        guard
            .channels
            .get(stream_id)
            .map(|c| c.broadcaster == connection || c.watchers.contains(&connection))
            .unwrap_or(false)
    }

    pub async fn is_broadcaster(&self, stream_id: &StreamId, connection: ConnectionId) -> bool {
        let guard = self.state.read().await;
        guard.channels.get(stream_id).map(|c| c.broadcaster == connection).unwrap_or(false)
    }

    /// Channels owned by a dropped connection handle; disconnection-triggered
    /// cleanup scans for these.
    pub async fn channels_broadcast_by(&self, connection: ConnectionId) -> Vec<StreamId> {
        let guard = self.state.read().await;
        guard
            .channels
            .iter()
            .filter(|(_, channel)| channel.broadcaster == connection)
            .map(|(stream_id, _)| stream_id.clone())
            .collect()
    }

    /// Channels the connection is watching.
    pub async fn channels_watched_by(&self, connection: ConnectionId) -> Vec<StreamId> {
        let guard = self.state.read().await;
        guard
            .channels
            .iter()
            .filter(|(_, channel)| channel.watchers.contains(&connection))
            .map(|(stream_id, _)| stream_id.clone())
            .collect()
    }

    pub async fn active_stream_count(&self) -> usize {
        self.state.read().await.channels.len()
    }
}
