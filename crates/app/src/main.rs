use anyhow::Context;
use clap::{Parser, Subcommand};
use doc_qa_core::{
    DiskVectorIndex, EngineOptions, HashingEmbedder, LineCodec, OllamaGenerator, RagEngine,
    Request, Response, SupervisorConfig, WorkerSupervisor,
};
use std::io::Write as _;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "doc-qa", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Directory holding the persisted vector index.
    #[arg(long, default_value = "db")]
    persist_dir: String,

    /// Base URL of the Ollama-compatible generation endpoint.
    #[arg(long, default_value = "http://localhost:11434")]
    ollama_url: String,

    /// Generation model name.
    #[arg(long, default_value = "llama3.2")]
    model: String,

    /// Embedding vector dimensions.
    #[arg(long, default_value = "256")]
    embedding_dims: usize,

    /// Maximum automatic worker restarts after abnormal exits.
    #[arg(long, default_value = "3")]
    max_restarts: u32,

    /// Seconds to wait for a terminal response before treating the request
    /// as failed.
    #[arg(long, default_value = "120")]
    request_timeout_secs: u64,
}

#[derive(Subcommand)]
enum Command {
    /// Run as the inference worker, speaking line-delimited JSON on stdio.
    Worker,
    /// Load a document into the index through a supervised worker.
    Load {
        /// Path of the document (pdf, txt, md, docx).
        #[arg(long)]
        file: String,
    },
    /// Ask a question about the loaded documents, streaming the answer.
    Ask {
        /// Natural-language question.
        #[arg(long)]
        question: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout is the wire in worker mode; all logging goes to stderr
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Command::Worker => run_worker(&cli).await,
        Command::Load { file } => {
            let file = file.clone();
            let supervisor = start_supervisor(&cli).await?;
            let outcome = run_load(&supervisor, &cli, &file).await;
            supervisor.stop().await;
            outcome
        }
        Command::Ask { question } => {
            let question = question.clone();
            let supervisor = start_supervisor(&cli).await?;
            let outcome = run_ask(&supervisor, &cli, &question).await;
            supervisor.stop().await;
            outcome
        }
    }
}

/// Worker mode: construct the engine components and serve stdio until EOF.
/// A component failure during initialization is fatal; the worker reports it
/// as an `error` response and exits non-zero instead of serving requests
/// against half-initialized state.
async fn run_worker(cli: &Cli) -> anyhow::Result<()> {
    let embedder = HashingEmbedder {
        dimensions: cli.embedding_dims,
    };
    let generator = OllamaGenerator::new(&cli.ollama_url, &cli.model);

    let index = match DiskVectorIndex::open(&cli.persist_dir).await {
        Ok(index) => index,
        Err(init_error) => {
            let line = LineCodec::encode(&Response::error(format!(
                "failed to initialize components: {init_error}"
            )))?;
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&line).await?;
            stdout.flush().await?;
            std::process::exit(1);
        }
    };

    info!(persist_dir = %cli.persist_dir, model = %cli.model, "worker ready");

    let mut engine = RagEngine::new(embedder, index, generator, EngineOptions::default());
    engine
        .run(tokio::io::stdin(), tokio::io::stdout())
        .await
        .context("worker stdio loop failed")?;
    Ok(())
}

/// Host mode: supervise our own executable re-invoked as `worker`.
async fn start_supervisor(cli: &Cli) -> anyhow::Result<WorkerSupervisor> {
    let exe = std::env::current_exe().context("cannot locate own executable")?;

    let config = SupervisorConfig::new(exe.to_string_lossy())
        .arg("--persist-dir")
        .arg(&cli.persist_dir)
        .arg("--ollama-url")
        .arg(&cli.ollama_url)
        .arg("--model")
        .arg(&cli.model)
        .arg("--embedding-dims")
        .arg(cli.embedding_dims.to_string())
        .arg("worker")
        .with_max_restarts(cli.max_restarts);

    let supervisor = WorkerSupervisor::new(config);
    supervisor.start().await?;

    let mut diagnostics = supervisor.subscribe_diagnostics();
    tokio::spawn(async move {
        while let Ok(chunk) = diagnostics.recv().await {
            debug!(target: "worker", "{}", chunk.trim_end());
        }
    });

    Ok(supervisor)
}

async fn run_load(supervisor: &WorkerSupervisor, cli: &Cli, file: &str) -> anyhow::Result<()> {
    let mut responses = supervisor.subscribe();
    supervisor
        .submit(&Request::LoadDocument {
            file_path: file.to_string(),
        })
        .await?;

    let deadline = Duration::from_secs(cli.request_timeout_secs);
    loop {
        let response = tokio::time::timeout(deadline, responses.recv())
            .await
            .context("request timed out, please retry")??;

        match response {
            Response::DocumentLoaded {
                file_path,
                num_chunks,
            } => {
                println!("loaded {file_path}: {num_chunks} chunks");
                return Ok(());
            }
            Response::Error { error, .. } => anyhow::bail!("load failed: {error}"),
            _ => continue,
        }
    }
}

async fn run_ask(supervisor: &WorkerSupervisor, cli: &Cli, question: &str) -> anyhow::Result<()> {
    let mut responses = supervisor.subscribe();
    supervisor
        .submit(&Request::Query {
            question: question.to_string(),
        })
        .await?;

    let deadline = Duration::from_secs(cli.request_timeout_secs);
    let mut streamed = false;
    loop {
        let response = tokio::time::timeout(deadline, responses.recv())
            .await
            .context("request timed out, please retry")??;

        match response {
            Response::Token { content, .. } => {
                streamed = true;
                print!("{content}");
                std::io::stdout().flush()?;
            }
            Response::FinalAnswer { answer, sources } => {
                if streamed {
                    println!();
                } else {
                    println!("{answer}");
                }
                for source in sources {
                    println!(
                        "source: {} (chunk {})",
                        source.metadata.source_path, source.metadata.chunk_index
                    );
                }
                return Ok(());
            }
            Response::Error { error, .. } => {
                // streamed fragments for this request are void once an error
                // arrives for the same logical request
                if streamed {
                    println!();
                }
                anyhow::bail!("query failed: {error}");
            }
            Response::DocumentLoaded { .. } => continue,
        }
    }
}
