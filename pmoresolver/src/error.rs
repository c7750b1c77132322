//! Gestion des erreurs du protocole de résolution

use std::io;

use pmostream::StreamError;

#[derive(thiserror::Error, Debug)]
pub enum ResolverError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid JSON message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame of {0} bytes exceeds the size limit")]
    FrameTooLarge(u32),
    #[error("search failed: {0}")]
    Search(#[from] StreamError),
}

/// Type Result personnalisé pour pmoresolver
pub type Result<T> = std::result::Result<T, ResolverError>;
