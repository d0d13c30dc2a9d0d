use thiserror::Error;

/// Failure decoding a structured payload out of LLM text
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("cleaned text is not valid UTF-8: {preview}")]
    EncodingError { preview: String },

    #[error("failed to decode LLM response: {source} - raw: {preview}")]
    DecodeError {
        preview: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Persistence plumbing errors. Stores log these and carry on.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Orchestrator-internal failures, flattened to a message at the public boundary
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("skill not found: {0}")]
    SkillNotFound(String),

    #[error("LLM call failed: {0}")]
    Llm(String),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("persistence failed: {0}")]
    Persist(#[from] StoreError),

    #[error("profiling has not completed yet")]
    ProfilingRequired,

    #[error("daily calibration limit reached")]
    DailyLimitReached,

    #[error("invalid answer: {0}")]
    InvalidAnswer(String),

    #[error("no calibration challenge is in progress")]
    NoActiveChallenge,

    #[error("another calibration request is in flight")]
    Busy,

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
