//! The crate-wide error type.
//!
//! One `thiserror`-derived enum, one alias. Library code returns
//! `WardenResult<T>` throughout rather than mixing in `anyhow`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WardenError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("management socket error: {0}")]
    Management(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type WardenResult<T> = Result<T, WardenError>;
