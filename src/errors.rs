use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Worker failed to start: {0}")]
    StartupError(String),

    #[error("Worker is already computing; wait for the current cell to finish")]
    AlreadyComputing,

    #[error("Worker has not been started")]
    NotStarted,

    #[error("Python not installed or not found in PATH")]
    PythonNotFound,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl EngineError {
    /// Caller-side misuse, as opposed to a failure of the execution context.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            EngineError::AlreadyComputing
                | EngineError::NotStarted
                | EngineError::InvalidConfiguration(_)
        )
    }
}
