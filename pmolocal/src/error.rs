//! Gestion des erreurs de la bibliothèque locale

use std::io;

use pmostream::StreamError;

#[derive(thiserror::Error, Debug)]
pub enum LocalError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
    #[error("unsupported audio format in {path}: {details}")]
    UnsupportedFormat { path: String, details: String },
    #[error("unknown track {0}")]
    UnknownTrack(String),
    #[error("library directory {0} does not exist")]
    MissingLibrary(String),
}

impl From<LocalError> for StreamError {
    fn from(err: LocalError) -> Self {
        StreamError::Session(err.to_string())
    }
}

/// Type Result personnalisé pour pmolocal
pub type Result<T> = std::result::Result<T, LocalError>;
