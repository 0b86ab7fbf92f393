//! Store error type.

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Failures surfaced by the store. Concurrency conflicts are NOT errors —
/// they come back as [`crate::PublishOutcome`] variants.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Connection pool exhausted or broken.
    #[error("connection pool: {0}")]
    Pool(#[from] r2d2::Error),

    /// Underlying `SQLite` failure.
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A migration failed to apply.
    #[error("migration v{version} failed: {message}")]
    Migration {
        /// Version that failed.
        version: u32,
        /// What went wrong.
        message: String,
    },

    /// Referenced row does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Row kind (account / machine / session).
        kind: &'static str,
        /// Requested id.
        id: String,
    },
}
