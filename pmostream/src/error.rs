//! Erreurs du pipeline de diffusion

use std::io;

/// Erreurs d'une requête de diffusion ou du cycle de vie du serveur
///
/// Toutes les erreurs de requête sont confinées au handler qui les produit :
/// aucune ne remonte jusqu'à la boucle d'acceptation.
#[derive(thiserror::Error, Debug)]
pub enum StreamError {
    #[error("request rejected: {0}")]
    RequestRejected(String),
    #[error("resource {sid} still not ready after {attempts} attempts")]
    ResolutionTimeout { sid: String, attempts: u32 },
    #[error("no request received after {attempts} attempts")]
    ReceiveTimeout { attempts: u32 },
    #[error("could not send {pending} bytes within {timeout_ms} ms")]
    TransferTimeout { pending: usize, timeout_ms: u64 },
    #[error("client disconnected")]
    ClientDisconnected,
    #[error("encoder failure: {0}")]
    SubprocessFailure(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("session error: {0}")]
    Session(String),
    #[error("request cancelled")]
    Cancelled,
    #[error("streaming server already started")]
    AlreadyStarted,
    #[error("{role} task failed: {details}")]
    TaskJoin { role: &'static str, details: String },
}

impl StreamError {
    /// Vrai si la requête doit recevoir la réponse `403 Forbidden`
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            StreamError::RequestRejected(_) | StreamError::ResolutionTimeout { .. }
        )
    }

    pub(crate) fn rejected(reason: impl Into<String>) -> Self {
        StreamError::RequestRejected(reason.into())
    }
}

/// Type Result personnalisé pour pmostream
pub type Result<T> = std::result::Result<T, StreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_validation_and_resolution_are_rejections() {
        assert!(StreamError::rejected("bad method").is_rejection());
        assert!(
            StreamError::ResolutionTimeout {
                sid: "X".into(),
                attempts: 10
            }
            .is_rejection()
        );
        assert!(!StreamError::ClientDisconnected.is_rejection());
        assert!(
            !StreamError::TransferTimeout {
                pending: 10,
                timeout_ms: 1
            }
            .is_rejection()
        );
        assert!(!StreamError::SubprocessFailure("exit 1".into()).is_rejection());
        assert!(!StreamError::Cancelled.is_rejection());
    }
}
