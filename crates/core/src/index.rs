use crate::error::EngineError;
use crate::models::{ChunkMetadata, DocumentChunk, RetrievedChunk};
use crate::traits::VectorIndex;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;
use tracing::info;

const INDEX_FILE: &str = "index.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    embedding: Vec<f32>,
    content: String,
    metadata: ChunkMetadata,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexSnapshot {
    entries: Vec<IndexEntry>,
}

pub struct DiskVectorIndex {
    directory: PathBuf,
    entries: Vec<IndexEntry>,
}

impl DiskVectorIndex {
    pub async fn open(directory: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let directory = directory.into();
        fs::create_dir_all(&directory)
            .await
            .map_err(|error| EngineError::Initialization(format!(
                "cannot create persistence directory {}: {error}",
                directory.display()
            )))?;

        let file = directory.join(INDEX_FILE);
        let entries = match fs::read(&file).await {
            Ok(bytes) => {
                serde_json::from_slice::<IndexSnapshot>(&bytes)
                    .map_err(|error| {
                        EngineError::Initialization(format!(
                            "corrupt index file {}: {error}",
                            file.display()
                        ))
                    })?
                    .entries
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(error) => {
                return Err(EngineError::Initialization(format!(
                    "cannot read index file {}: {error}",
                    file.display()
                )))
            }
        };

        info!(directory = %directory.display(), entries = entries.len(), "vector index opened");
        Ok(Self { directory, entries })
    }
}

fn cosine_similarity(left: &[f32], right: &[f32]) -> f32 {
    if left.len() != right.len() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut left_norm = 0.0f32;
    let mut right_norm = 0.0f32;
    for (a, b) in left.iter().zip(right.iter()) {
        dot += a * b;
        left_norm += a * a;
        right_norm += b * b;
    }

    let denominator = left_norm.sqrt() * right_norm.sqrt();
    if denominator > 0.0 {
        dot / denominator
    } else {
        0.0
    }
}

#[async_trait]
impl VectorIndex for DiskVectorIndex {
    async fn add_chunks(
        &mut self,
        chunks: &[DocumentChunk],
        embeddings: &[Vec<f32>],
    ) -> Result<(), EngineError> {
        if chunks.len() != embeddings.len() {
            return Err(EngineError::Retrieval(format!(
                "embedding count {} does not match chunk count {}",
                embeddings.len(),
                chunks.len()
            )));
        }

        // repeat loads are not deduplicated; the index strictly grows
        for (chunk, embedding) in chunks.iter().zip(embeddings.iter()) {
            self.entries.push(IndexEntry {
                embedding: embedding.clone(),
                content: chunk.content.clone(),
                metadata: chunk.metadata.clone(),
            });
        }

        Ok(())
    }

    async fn search(
        &self,
        query_vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<RetrievedChunk>, EngineError> {
        let mut hits: Vec<RetrievedChunk> = self
            .entries
            .iter()
            .map(|entry| RetrievedChunk {
                content: entry.content.clone(),
                metadata: entry.metadata.clone(),
                score: cosine_similarity(&entry.embedding, query_vector),
            })
            .collect();

        hits.sort_by(|left, right| right.score.total_cmp(&left.score));
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn persist(&mut self) -> Result<(), EngineError> {
        let snapshot = IndexSnapshot {
            entries: self.entries.clone(),
        };
        let bytes = serde_json::to_vec(&snapshot)?;

        // write-then-rename so a crash mid-persist never truncates the index
        let target = self.directory.join(INDEX_FILE);
        let staging = self.directory.join(format!("{INDEX_FILE}.tmp"));
        fs::write(&staging, &bytes)
            .await
            .map_err(|error| EngineError::Retrieval(format!("cannot persist index: {error}")))?;
        fs::rename(&staging, &target)
            .await
            .map_err(|error| EngineError::Retrieval(format!("cannot persist index: {error}")))?;

        Ok(())
    }

    fn chunk_count(&self) -> usize {
        self.entries.len()
    }
}
