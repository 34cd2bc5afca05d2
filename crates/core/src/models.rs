use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMetadata {
    pub source_path: String,
    pub chunk_index: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    pub ingested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub content: String,
    pub metadata: ChunkMetadata,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedChunk {
    pub content: String,
    pub metadata: ChunkMetadata,
    pub score: f32,
}

#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    pub chunk_chars: usize,
    pub overlap_chars: usize,
    pub top_k: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            chunk_chars: 1_000,
            overlap_chars: 200,
            top_k: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Initializing,
    Ready,
    Processing,
    Stopped,
}
