pub mod chunking;
pub mod embeddings;
pub mod engine;
pub mod error;
pub mod extractor;
pub mod generator;
pub mod index;
pub mod models;
pub mod protocol;
pub mod supervisor;
pub mod traits;

pub use chunking::{split_fixed, split_markdown, SplitPiece};
pub use embeddings::{Embedder, HashingEmbedder, DEFAULT_EMBEDDING_DIMENSIONS};
pub use engine::{RagEngine, WriterSink};
pub use error::{EngineError, ProtocolError, SupervisorError};
pub use extractor::{extract_text, DocumentKind};
pub use generator::OllamaGenerator;
pub use index::DiskVectorIndex;
pub use models::{ChunkMetadata, DocumentChunk, EngineOptions, RetrievedChunk, WorkerState};
pub use protocol::{LineCodec, Request, Response, SourceDocument};
pub use supervisor::{SupervisorConfig, SupervisorStatus, WorkerSupervisor};
pub use traits::{Generator, ResponseSink, TokenSink, VectorIndex};
