use crate::error::EngineError;
use crate::models::{DocumentChunk, RetrievedChunk};
use crate::protocol::Response;
use async_trait::async_trait;

// Single writer: one worker process owns a persistence directory at a time.
#[async_trait]
pub trait VectorIndex: Send {
    async fn add_chunks(
        &mut self,
        chunks: &[DocumentChunk],
        embeddings: &[Vec<f32>],
    ) -> Result<(), EngineError>;

    async fn search(
        &self,
        query_vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<RetrievedChunk>, EngineError>;

    async fn persist(&mut self) -> Result<(), EngineError>;

    fn chunk_count(&self) -> usize;
}

#[async_trait]
pub trait TokenSink: Send {
    async fn on_token(&mut self, fragment: &str) -> Result<(), EngineError>;
}

#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        tokens: &mut dyn TokenSink,
    ) -> Result<String, EngineError>;
}

#[async_trait]
pub trait ResponseSink: Send {
    async fn send(&mut self, response: Response) -> Result<(), EngineError>;
}
