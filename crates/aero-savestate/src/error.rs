use std::io;

use thiserror::Error;

use crate::memory::MemoryError;

pub type Result<T> = std::result::Result<T, SaveError>;

#[derive(Debug, Error)]
pub enum SaveError {
    /// Two siblings registered under the same non-empty name.
    #[error("duplicate save state registration '{0}'")]
    DuplicateName(String),

    #[error("attempt to register '{0}' after state registration is closed")]
    RegistrationClosed(String),

    #[error("duplicate save state callback '{0}'")]
    DuplicateCallback(String),

    #[error("invalid save state registration '{name}': {reason}")]
    InvalidRegistration { name: String, reason: &'static str },

    #[error("save state registration has already been sealed")]
    AlreadySealed,

    #[error("save state registration has not been sealed yet")]
    NotSealed,

    #[error("state write size mismatch (expected {expected} bytes, produced {produced} bytes)")]
    WriteError { expected: u64, produced: u64 },

    #[error("state read size mismatch (expected {expected} bytes, consumed {consumed} bytes)")]
    ReadError { expected: u64, consumed: u64 },

    #[error("invalid state header: {0}")]
    InvalidHeader(&'static str),

    #[error("corrupt state archive: {0}")]
    Corrupt(&'static str),

    #[error("cannot import '{path}': {reason}")]
    Import { path: String, reason: String },

    #[error("live state access failed: {0}")]
    Memory(#[from] MemoryError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("lz4 decompression failed: {0}")]
    Lz4(#[from] lz4_flex::block::DecompressError),

    #[error("deflate failed: {0}")]
    Deflate(#[from] flate2::CompressError),
}

impl SaveError {
    /// Registration errors indicate a bug in the registering component and are never recoverable.
    pub fn is_registration_error(&self) -> bool {
        matches!(
            self,
            SaveError::DuplicateName(_)
                | SaveError::RegistrationClosed(_)
                | SaveError::DuplicateCallback(_)
                | SaveError::InvalidRegistration { .. }
                | SaveError::AlreadySealed
        )
    }

    pub(crate) fn import(path: &str, reason: impl Into<String>) -> Self {
        SaveError::Import {
            path: if path.is_empty() {
                "<root>".to_string()
            } else {
                path.to_string()
            },
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RewindError {
    #[error("rewind is disabled")]
    Disabled,

    #[error("no rewind state to load")]
    NotFound,

    #[error(transparent)]
    Save(#[from] SaveError),
}
