use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("CONFIG_INVALID: {0}")]
    Config(String),
    #[error("TOOL_MISSING: {0}")]
    ToolMissing(String),
    #[error("TOOL_FAILED: {0}")]
    Tool(String),
    #[error("DEVICE_FAILURE: {0}")]
    Device(String),
    #[error("INVARIANT_VIOLATED: {0}")]
    Invariant(String),
    #[error("TIMEOUT: {0}")]
    Timeout(String),
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl AppError {
    /// Errors that make every following cell fail the same way.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_) | Self::ToolMissing(_) | Self::Invariant(_))
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Config(value.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
