//! Contrat du collaborateur de session
//!
//! La session (authentification, recherche, livraison de l'audio brut) est
//! extérieure au pipeline. Le serveur ne fait que résoudre des pistes, démarrer
//! une livraison vers un [`PcmSink`] et l'annuler.

use async_trait::async_trait;

use crate::error::Result;
pub use crate::transcoder::PcmSink;

/// Piste telle que décrite par le backend
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Track {
    /// Référence opaque du backend (ex. `spotify:track:...`, chemin local)
    pub reference: String,
    pub name: String,
    pub artists: Vec<String>,
    pub album: String,
    /// Durée en millisecondes ; `0` tant que le backend n'a pas fini de charger la piste
    pub duration_ms: u64,
}

impl Track {
    pub fn is_ready(&self) -> bool {
        self.duration_ms > 0
    }

    /// Artistes séparés par des virgules
    pub fn artist_line(&self) -> String {
        self.artists.join(", ")
    }
}

#[async_trait]
pub trait PlaybackSession: Send + Sync {
    /// Recherche libre ; l'ordre des résultats est celui du backend
    async fn search(&self, query: &str) -> Result<Vec<Track>>;

    /// Matérialise une piste à partir de sa référence
    ///
    /// Peut retourner une piste de durée nulle tant que la ressource n'est pas
    /// prête : l'appelant réessaie.
    async fn load_track(&self, reference: &str) -> Result<Track>;

    /// Démarre la livraison du PCM vers `sink` et retourne sans attendre la fin
    ///
    /// La session appelle [`PcmSink::finish`] en fin de piste.
    async fn stream_track(&self, track: &Track, sink: PcmSink) -> Result<()>;

    /// Arrête la livraison en cours, s'il y en a une
    async fn cancel_playback(&self);
}
