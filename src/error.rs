//! Unified error taxonomy for the vault core (spec §7).
//!
//! Every fallible core operation returns [`VaultError`]. Decrypt failures of
//! any kind collapse into [`VaultError::CryptoFailure`] — callers must not
//! branch on finer-grained reasons, to avoid oracle behavior.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, VaultError>;

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// Any authenticated-decrypt failure or PIN-hash mismatch, collapsed to
    /// one opaque variant.
    #[error("cryptographic operation failed")]
    CryptoFailure,

    #[error("{what} not found")]
    NotFound { what: String },

    /// Metadata row exists but the blob file is absent — repository corruption.
    #[error("block {hash} has no blob at {path}")]
    MissingBlob { hash: String, path: PathBuf },

    #[error("a sibling named {name:?} already exists")]
    NameCollision { name: String },

    #[error("a repository at {path} already exists")]
    PathCollision { path: PathBuf },

    #[error("operation would exceed quota ({used} + {needed} > {quota} bytes)")]
    QuotaExceeded { used: u64, needed: u64, quota: u64 },

    #[error("I/O failure: {reason}")]
    IoFailure { reason: String },

    #[error("operation interrupted")]
    Interrupted,
}

impl From<std::io::Error> for VaultError {
    fn from(e: std::io::Error) -> Self {
        VaultError::IoFailure { reason: e.to_string() }
    }
}

impl From<rusqlite::Error> for VaultError {
    fn from(e: rusqlite::Error) -> Self {
        VaultError::IoFailure { reason: format!("database error: {e}") }
    }
}

impl From<serde_json::Error> for VaultError {
    fn from(e: serde_json::Error) -> Self {
        VaultError::IoFailure { reason: format!("serialization error: {e}") }
    }
}
