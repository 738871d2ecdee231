use thiserror::Error;

/// Errors that can occur within the lease subsystem.
#[derive(Debug, Error)]
pub enum LeaseError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The store could not be reached or is in an unusable state.
    #[error("Lease store unavailable: {0}")]
    StoreUnavailable(String),

    /// A stored timestamp could not be parsed back.
    #[error("Invalid timestamp in lease row: {0}")]
    InvalidTimestamp(String),

    #[error("Invalid lock configuration for '{name}': {reason}")]
    InvalidConfiguration { name: String, reason: String },

    /// The holder's extension was rejected: the lease expired or changed hands.
    #[error("Lease '{name}' could not be extended")]
    NotExtended { name: String },

    /// `assert_locked` was called outside a lease-guarded task body.
    #[error("Not running under a held lease")]
    NotLocked,
}

impl LeaseError {
    /// True for transient infrastructure failures. Acquire treats these as
    /// Busy, release logs them and lets the row self-expire.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, LeaseError::Database(_) | LeaseError::StoreUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, LeaseError>;
