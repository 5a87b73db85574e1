use std::path::PathBuf;

use thiserror::Error;

/// Crate-wide error type for infrastructure failures.
///
/// This is distinct from [`crate::status::Status`]: `Status` carries
/// ordinary map outcomes (`NotFound`, `InsertKeyExists`, ...) as values,
/// while `Error` covers conditions the engine cannot proceed past, such
/// as a non-persistent backing file or an exhausted arena.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0:?} does not look like a persistent-memory mapping")]
    NotPersistent(PathBuf),

    #[error("{region} arena exhausted")]
    OutOfMemory { region: &'static str },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("lock poisoned: {0}")]
    PoisonedLock(String),

    #[error("key too large for scratch buffer: {0} bytes")]
    KeyTooLarge(usize),
}

pub type Result<T> = std::result::Result<T, Error>;
