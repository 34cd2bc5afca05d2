use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("initialization failed: {0}")]
    Initialization(String),

    #[error("unsupported file type: {0}")]
    UnsupportedFileType(String),

    #[error("extraction failed: {0}")]
    Extraction(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("retrieval failed: {0}")]
    Retrieval(String),

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("undecodable message line: {0}")]
    Decode(String),

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn worker process: {0}")]
    Spawn(std::io::Error),

    #[error("worker is already running")]
    AlreadyRunning,

    #[error("worker not ready: {0}")]
    NotReady(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
