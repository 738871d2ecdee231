use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid duration '{input}': {reason}")]
    InvalidDuration { input: String, reason: String },

    /// `lock_at_least_for` must not exceed `lock_at_most_for`, and the upper
    /// bound must be non-zero.
    #[error("Invalid hold durations for task '{task}': {reason}")]
    InvalidHoldDurations { task: String, reason: String },

    #[error("Duplicate task name: {name}")]
    DuplicateTask { name: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Short machine-readable code, used in log fields.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Config(_) => "CONFIG_ERROR",
            CoreError::InvalidDuration { .. } => "INVALID_DURATION",
            CoreError::InvalidHoldDurations { .. } => "INVALID_HOLD_DURATIONS",
            CoreError::DuplicateTask { .. } => "DUPLICATE_TASK",
            CoreError::Io(_) => "IO_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
