use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Transport error on chunk {chunk_index}: {message}")]
    Transport { chunk_index: u32, message: String },

    #[error("Throttle configuration error: {0}")]
    Throttle(String),

    #[error("Resume store error: {0}")]
    Store(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Upload was cancelled")]
    Cancelled,

    #[error("Engine shutdown")]
    Shutdown,
}

impl EngineError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn transport(chunk_index: u32, message: impl Into<String>) -> Self {
        Self::Transport {
            chunk_index,
            message: message.into(),
        }
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

/// Error alias
pub type Result<T, E = EngineError> = std::result::Result<T, E>;
