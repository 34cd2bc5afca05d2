use crate::chunking;
use crate::embeddings::Embedder;
use crate::error::EngineError;
use crate::extractor::{self, DocumentKind};
use crate::models::{ChunkMetadata, DocumentChunk, EngineOptions, RetrievedChunk, WorkerState};
use crate::protocol::{LineCodec, Request, Response, SourceDocument};
use crate::traits::{Generator, ResponseSink, TokenSink, VectorIndex};
use async_trait::async_trait;
use chrono::Utc;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{info, warn};

const ANSWER_PROMPT: &str = "Use the following pieces of context to answer the question at the end.\n\
If you don't know the answer, just say that you don't know, don't try to make up an answer.\n\
\n\
{context}\n\
\n\
Question: {question}\n\
Helpful Answer:";

// Requests are handled strictly in order: request n + 1 is not decoded until
// request n has emitted its terminal response.
pub struct RagEngine<E, V, G> {
    embedder: E,
    index: V,
    generator: G,
    options: EngineOptions,
    state: WorkerState,
}

impl<E, V, G> RagEngine<E, V, G>
where
    E: Embedder,
    V: VectorIndex,
    G: Generator,
{
    pub fn new(embedder: E, index: V, generator: G, options: EngineOptions) -> Self {
        Self {
            embedder,
            index,
            generator,
            options,
            state: WorkerState::Initializing,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    // Per-request failures become an Error response here; the engine stays
    // Ready. Only a failure to write the response itself propagates.
    pub async fn handle(
        &mut self,
        request: Request,
        sink: &mut dyn ResponseSink,
    ) -> Result<(), EngineError> {
        self.state = WorkerState::Processing;

        let outcome = match request {
            Request::LoadDocument { file_path } => self.load_document(&file_path, sink).await,
            Request::Query { question } => self.answer(&question, sink).await,
        };

        if let Err(error) = outcome {
            warn!(error = %error, "request failed");
            sink.send(Response::error(error.to_string())).await?;
        }

        self.state = WorkerState::Ready;
        Ok(())
    }

    pub async fn run<R, W>(&mut self, mut input: R, output: W) -> Result<(), EngineError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send,
    {
        let mut sink = WriterSink::new(output);
        let mut codec = LineCodec::new();
        let mut buffer = [0u8; 8192];
        self.state = WorkerState::Ready;

        loop {
            let read = input.read(&mut buffer).await?;
            if read == 0 {
                break;
            }

            for item in codec.feed::<Request>(&buffer[..read]) {
                match item {
                    Ok(request) => self.handle(request, &mut sink).await?,
                    Err(error) => {
                        sink.send(Response::error(format!("invalid request: {error}")))
                            .await?
                    }
                }
            }
        }

        self.state = WorkerState::Stopped;
        Ok(())
    }

    async fn load_document(
        &mut self,
        file_path: &str,
        sink: &mut dyn ResponseSink,
    ) -> Result<(), EngineError> {
        let (kind, text) = extractor::extract_text(Path::new(file_path))?;

        let pieces = match kind {
            DocumentKind::Markdown => chunking::split_markdown(&text, &self.options)?,
            _ => chunking::split_fixed(&text, &self.options),
        };

        // indices continue from the current size: repeat loads are not
        // deduplicated and the index strictly grows
        let base_index = self.index.chunk_count() as u64;
        let ingested_at = Utc::now();
        let chunks: Vec<DocumentChunk> = pieces
            .into_iter()
            .enumerate()
            .map(|(position, piece)| DocumentChunk {
                content: piece.content,
                metadata: ChunkMetadata {
                    source_path: file_path.to_string(),
                    chunk_index: base_index + position as u64,
                    section: piece.section,
                    ingested_at,
                },
            })
            .collect();

        let embeddings: Vec<Vec<f32>> = chunks
            .iter()
            .map(|chunk| self.embedder.embed(&chunk.content))
            .collect();

        self.index.add_chunks(&chunks, &embeddings).await?;
        self.index.persist().await?;

        info!(file = file_path, chunks = chunks.len(), "document ingested");
        sink.send(Response::DocumentLoaded {
            file_path: file_path.to_string(),
            num_chunks: chunks.len(),
        })
        .await
    }

    async fn answer(
        &mut self,
        question: &str,
        sink: &mut dyn ResponseSink,
    ) -> Result<(), EngineError> {
        let query_vector = self.embedder.embed(question);
        let hits = self.index.search(&query_vector, self.options.top_k).await?;

        let prompt = build_prompt(question, &hits);
        let answer = {
            let mut forwarder = TokenForwarder { sink: &mut *sink };
            self.generator.generate(&prompt, &mut forwarder).await?
        };

        let sources = hits
            .into_iter()
            .map(|hit| SourceDocument {
                content: hit.content,
                metadata: hit.metadata,
            })
            .collect();

        sink.send(Response::FinalAnswer { answer, sources }).await
    }
}

fn build_prompt(question: &str, hits: &[RetrievedChunk]) -> String {
    let context = hits
        .iter()
        .map(|hit| hit.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");

    ANSWER_PROMPT
        .replace("{context}", &context)
        .replace("{question}", question)
}

struct TokenForwarder<'a> {
    sink: &'a mut dyn ResponseSink,
}

#[async_trait]
impl TokenSink for TokenForwarder<'_> {
    async fn on_token(&mut self, fragment: &str) -> Result<(), EngineError> {
        self.sink.send(Response::token(fragment)).await
    }
}

pub struct WriterSink<W> {
    writer: W,
}

impl<W> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> ResponseSink for WriterSink<W> {
    async fn send(&mut self, response: Response) -> Result<(), EngineError> {
        let line = LineCodec::encode(&response)?;
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        Ok(())
    }
}
