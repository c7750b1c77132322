//! File ordonnée des morceaux encodés
//!
//! Un seul producteur (la tâche qui vide la sortie de l'encodeur) et un seul
//! consommateur (le handler de requête) par travail. Chaque requête crée une
//! file neuve via [`output_queue`].

use bytes::Bytes;
use tokio::sync::mpsc;

/// Unité transportée par la file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioChunk {
    Data(Bytes),
    EndOfStream,
}

impl AudioChunk {
    pub fn len(&self) -> usize {
        match self {
            AudioChunk::Data(bytes) => bytes.len(),
            AudioChunk::EndOfStream => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Crée une paire producteur/consommateur vide
pub fn output_queue() -> (ChunkSender, OutputQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChunkSender { tx }, OutputQueue { rx, ended: false })
}

/// Côté producteur
///
/// [`ChunkSender::finish`] consomme l'émetteur : la sentinelle ne peut être
/// envoyée qu'une fois et rien ne peut la suivre.
#[derive(Debug)]
pub struct ChunkSender {
    tx: mpsc::UnboundedSender<AudioChunk>,
}

impl ChunkSender {
    /// Retourne `false` si le consommateur a disparu
    pub fn send(&self, data: Bytes) -> bool {
        self.tx.send(AudioChunk::Data(data)).is_ok()
    }

    pub fn finish(self) -> bool {
        self.tx.send(AudioChunk::EndOfStream).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Côté consommateur
#[derive(Debug)]
pub struct OutputQueue {
    rx: mpsc::UnboundedReceiver<AudioChunk>,
    ended: bool,
}

impl OutputQueue {
    /// Attend le morceau suivant
    ///
    /// Retourne `None` après la sentinelle, ou si le producteur a disparu sans
    /// l'envoyer. Annulable sans perte.
    pub async fn next(&mut self) -> Option<AudioChunk> {
        if self.ended {
            return None;
        }
        let chunk = self.rx.recv().await;
        if matches!(chunk, Some(AudioChunk::EndOfStream)) {
            self.ended = true;
            self.rx.close();
        }
        chunk
    }

    /// Vrai une fois la sentinelle reçue
    pub fn is_ended(&self) -> bool {
        self.ended
    }
}
