use thiserror::Error;

/// Crate-wide error type. Tree operations never produce one (see `Tree`);
/// it surfaces at the WAL, page-store and engine boundaries.
#[derive(Debug, Error)]
pub enum Error {
    #[error("key not found")]
    NotFound,

    #[error("corruption: {0}")]
    Corruption(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct StorageError(pub String);

pub type Result<T> = std::result::Result<T, Error>;
