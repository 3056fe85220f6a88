// Viewer presence tracker collaborator.
//
// The core consumes this as an interface: per-stream active viewer sets and
// the sliding-window chat rate limiter live behind it. Production deploys
// back it with a shared key-value store with key expiry; the in-process
// variant prunes timestamps itself to keep the same window semantics.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use lumicast_common::types::{ConnectionId, StreamId};
use tokio::sync::RwLock;
use tokio::time::Instant;

#[derive(Debug, Default)]
pub struct MemoryPresence {
    viewers: HashMap<StreamId, HashSet<ConnectionId>>,
    chat_windows: HashMap<(ConnectionId, StreamId), VecDeque<Instant>>,
}

/// Per-stream viewer membership and chat rate counters.
#[derive(Debug, Clone)]
pub enum PresenceStore {
    Memory {
        state: Arc<RwLock<MemoryPresence>>,
        chat_rate_limit: u32,
        chat_rate_window: Duration,
    },
}

impl PresenceStore {
    pub fn memory(chat_rate_limit: u32, chat_rate_window: Duration) -> Self {
        Self::Memory { state: Arc::new(RwLock::new(MemoryPresence::default())), chat_rate_limit, chat_rate_window }
    }

    /// Register an active viewer. Returns the stream's viewer count.
    pub async fn add_viewer(
        &self,
        stream_id: &StreamId,
        viewer: ConnectionId,
    ) -> anyhow::Result<usize> {
        match self {
            Self::Memory { state, .. } => {
                let mut guard = state.write().await;
                let viewers = guard.viewers.entry(stream_id.clone()).or_default();
                viewers.insert(viewer);
                Ok(viewers.len())
            }
        }
    }

    /// Deregister a viewer. Returns the stream's remaining viewer count.
    pub async fn remove_viewer(
        &self,
        stream_id: &StreamId,
        viewer: ConnectionId,
    ) -> anyhow::Result<usize> {
        match self {
            Self::Memory { state, .. } => {
                let mut guard = state.write().await;
                let Some(viewers) = guard.viewers.get_mut(stream_id) else {
                    return Ok(0);
                };
                viewers.remove(&viewer);
                let remaining = viewers.len();
                if remaining == 0 {
                    guard.viewers.remove(stream_id);
                }
                guard.chat_windows.remove(&(viewer, stream_id.clone()));
                Ok(remaining)
            }
        }
    }

    /// Sliding-window chat admission keyed by `(sender, stream)`. Returns
    /// true when the message is within the window budget; an admitted
    /// message is counted against the window immediately.
    pub async fn check_chat_rate_limit(
        &self,
        stream_id: &StreamId,
        sender: ConnectionId,
    ) -> anyhow::Result<bool> {
        match self {
            Self::Memory { state, chat_rate_limit, chat_rate_window } => {
                let now = Instant::now();
                let mut guard = state.write().await;
                let window =
                    guard.chat_windows.entry((sender, stream_id.clone())).or_default();

                while let Some(oldest) = window.front() {
                    if now.duration_since(*oldest) >= *chat_rate_window {
                        window.pop_front();
                    } else {
                        break;
                    }
                }

                if window.len() >= *chat_rate_limit as usize {
                    return Ok(false);
                }
                window.push_back(now);
                Ok(true)
            }
        }
    }

    /// Drop all presence state for a stream whose channel was finalized:
    /// the viewer set and every participant's chat window.
    pub async fn release_stream(&self, stream_id: &StreamId) -> anyhow::Result<()> {
        match self {
            Self::Memory { state, .. } => {
                let mut guard = state.write().await;
                guard.viewers.remove(stream_id);
                guard.chat_windows.retain(|(_, stream), _| stream != stream_id);
                Ok(())
            }
        }
    }

    /// Active viewer count for a stream.
    pub async fn viewer_count(&self, stream_id: &StreamId) -> anyhow::Result<usize> {
        match self {
            Self::Memory { state, .. } => {
                Ok(state.read().await.viewers.get(stream_id).map(HashSet::len).unwrap_or(0))
            }
        }
    }
}
