//! Error taxonomy for the storage engine.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("arena growth failed: {0}")]
    ArenaGrowthFailed(String),

    #[error("invalid file format: {0}")]
    InvalidFileFormat(String),

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("schema mismatch: expected {expected}, found {found}")]
    SchemaMismatch { expected: String, found: String },

    #[error("logic error: {0}")]
    LogicError(String),

    #[error("commit log corrupt: {0}")]
    CommitLogCorrupt(String),

    #[error("observer error: {0}")]
    ObserverError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Stable identifier for embedders that classify failures without
    /// matching on the enum directly.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::ArenaGrowthFailed(_) => "ARENA_GROWTH_FAILED",
            EngineError::InvalidFileFormat(_) => "INVALID_FILE_FORMAT",
            EngineError::DecryptionFailed(_) => "DECRYPTION_FAILED",
            EngineError::SchemaMismatch { .. } => "SCHEMA_MISMATCH",
            EngineError::LogicError(_) => "LOGIC_ERROR",
            EngineError::CommitLogCorrupt(_) => "COMMIT_LOG_CORRUPT",
            EngineError::ObserverError(_) => "OBSERVER_ERROR",
            EngineError::Io(_) => "IO_ERROR",
        }
    }
}
