use thiserror::Error;

pub type Result<T> = std::result::Result<T, AnalystError>;

#[derive(Error, Debug)]
pub enum AnalystError {
    #[error("Python not installed or not found in PATH")]
    PythonNotFound,

    #[error("Unknown security tier: {0}")]
    UnknownTier(String),

    #[error("Isolation provider error: {0}")]
    Isolation(String),

    #[error("Upstream model error: {0}")]
    Upstream(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    InternalError(String),
}
