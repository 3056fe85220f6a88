// External collaborator seams: stream metadata persistence and recording
// storage. The signaling path never awaits these on the critical path —
// callers spawn the calls and log failures.

use std::collections::HashMap;
use std::sync::Arc;

use lumicast_common::types::{StreamId, StreamMetrics, StreamStatus};
use tokio::sync::RwLock;

/// Persisted view of a stream held by the metadata collaborator.
#[derive(Debug, Clone, Default)]
pub struct StreamRecord {
    pub status: Option<StreamStatus>,
    pub recording_url: Option<String>,
    pub final_metrics: Option<StreamMetrics>,
}

/// Stream metadata persistence (databases in a real deployment).
#[derive(Debug, Clone)]
pub enum MetadataStore {
    Memory(Arc<RwLock<HashMap<StreamId, StreamRecord>>>),
}

impl MetadataStore {
    pub fn memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(HashMap::new())))
    }

    pub async fn find_stream(&self, stream_id: &StreamId) -> anyhow::Result<Option<StreamRecord>> {
        match self {
            Self::Memory(state) => Ok(state.read().await.get(stream_id).cloned()),
        }
    }

    pub async fn update_status(
        &self,
        stream_id: &StreamId,
        status: StreamStatus,
    ) -> anyhow::Result<()> {
        match self {
            Self::Memory(state) => {
                state.write().await.entry(stream_id.clone()).or_default().status = Some(status);
                Ok(())
            }
        }
    }

    pub async fn record_recording_url(
        &self,
        stream_id: &StreamId,
        url: String,
    ) -> anyhow::Result<()> {
        match self {
            Self::Memory(state) => {
                state.write().await.entry(stream_id.clone()).or_default().recording_url =
                    Some(url);
                Ok(())
            }
        }
    }

    pub async fn record_final_metrics(
        &self,
        stream_id: &StreamId,
        metrics: StreamMetrics,
    ) -> anyhow::Result<()> {
        match self {
            Self::Memory(state) => {
                state.write().await.entry(stream_id.clone()).or_default().final_metrics =
                    Some(metrics);
                Ok(())
            }
        }
    }
}

/// Object storage sink for assembled recordings.
#[derive(Debug, Clone)]
pub enum RecordingStorage {
    Memory(Arc<RwLock<HashMap<StreamId, Vec<u8>>>>),
}

impl RecordingStorage {
    pub fn memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(HashMap::new())))
    }

    /// Upload an assembled recording blob; returns its reference URL.
    pub async fn upload_blob(
        &self,
        stream_id: &StreamId,
        bytes: Vec<u8>,
    ) -> anyhow::Result<String> {
        match self {
            Self::Memory(state) => {
                state.write().await.insert(stream_id.clone(), bytes);
                Ok(format!("memory://recordings/{stream_id}"))
            }
        }
    }

    /// Stored blob for a stream, if any (memory variant only, used by tests
    /// and local inspection).
    pub async fn stored_blob(&self, stream_id: &StreamId) -> Option<Vec<u8>> {
        match self {
            Self::Memory(state) => state.read().await.get(stream_id).cloned(),
        }
    }
}
