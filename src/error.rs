use thiserror::Error;

/// Errors surfaced by queue, reporter and enqueue operations.
///
/// Storage errors are raised synchronously to the caller; send failures are
/// never represented here because the dispatcher records them on the row
/// itself instead of propagating them.
#[derive(Debug, Error)]
pub enum Error {
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("invalid payload: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
