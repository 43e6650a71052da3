use std::path::PathBuf;

/// Errors produced by the transfer engine.
///
/// Every component operation surfaces its error to its immediate caller; the
/// orchestrator aborts the remaining steps of the failing operation and
/// propagates. There are no retries at this layer.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("file/folder '{}' does not exist", .0.display())]
    NotFound(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed ciphertext or authentication failure")]
    Crypto,

    #[error("key exchange has not produced a session key")]
    KeyExchangeIncomplete,

    #[error("hashes do not match, {expected} != {actual}")]
    Integrity { expected: String, actual: String },

    #[error("invalid archive: {0}")]
    Format(String),
}
