//! Error taxonomy shared by every component of the VFS.

use thiserror::Error;

/// Errors returned by the public VFS operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("exhausted: {0}")]
    Exhausted(&'static str),

    #[error("bad mode: {0}")]
    BadMode(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
