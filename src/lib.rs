use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error in {operation} for {target}: {message}")]
    Validation {
        operation: String,
        target: String,
        message: String,
    },

    #[error("Not found during {operation}: {target}")]
    NotFound { operation: String, target: String },

    #[error("Conflict during {operation} on {target}: {message}")]
    Conflict {
        operation: String,
        target: String,
        message: String,
    },

    #[error("Corrupt data during {operation} at {target}: {message}")]
    CorruptData {
        operation: String,
        target: String,
        message: String,
    },

    #[error("Transient failure during {operation} on {target}: {message}")]
    Transient {
        operation: String,
        target: String,
        message: String,
    },

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl StoreError {
    #[inline]
    pub fn validation(
        operation: impl Into<String>,
        target: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Validation {
            operation: operation.into(),
            target: target.into(),
            message: message.into(),
        }
    }

    #[inline]
    pub fn not_found(operation: impl Into<String>, target: impl Into<String>) -> Self {
        Self::NotFound {
            operation: operation.into(),
            target: target.into(),
        }
    }

    #[inline]
    pub fn conflict(
        operation: impl Into<String>,
        target: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Conflict {
            operation: operation.into(),
            target: target.into(),
            message: message.into(),
        }
    }

    #[inline]
    pub fn corrupt(
        operation: impl Into<String>,
        target: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::CorruptData {
            operation: operation.into(),
            target: target.into(),
            message: message.into(),
        }
    }

    #[inline]
    pub fn transient(
        operation: impl Into<String>,
        target: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Transient {
            operation: operation.into(),
            target: target.into(),
            message: message.into(),
        }
    }

    /// Whether the retry helper should attempt the operation again
    #[inline]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transient { .. } => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    /// Wraps an I/O error with the operation and location it happened on
    #[inline]
    pub fn io(operation: &str, target: &str, error: std::io::Error) -> Self {
        if matches!(
            error.kind(),
            std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::Interrupted
                | std::io::ErrorKind::WouldBlock
        ) {
            Self::transient(operation, target, error.to_string())
        } else {
            Self::Other(
                anyhow::Error::new(error).context(format!("{} failed for {}", operation, target)),
            )
        }
    }
}

pub mod commands;
pub mod config;
pub mod model;
pub mod repository;
pub mod retry;
pub mod storage;
pub mod vector;
