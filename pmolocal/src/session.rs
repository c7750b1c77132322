//! Session de lecture adossée à un répertoire de fichiers WAV

use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use hound::WavReader;
use pmostream::{PcmSink, PlaybackSession, Track, async_trait};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{LocalError, Result};
use crate::library::{self, PcmLayout};

/// Taux attendu par l'encodeur en mode brut
pub const ENCODER_SAMPLE_RATE: u32 = 44_100;

/// Trames stéréo par bloc transmis au sink
const FRAMES_PER_BLOCK: usize = 4096;

/// Blocs en attente entre le lecteur bloquant et le transfert asynchrone
const BLOCK_QUEUE_DEPTH: usize = 8;

pub struct LocalSession {
    root: PathBuf,
    tracks: RwLock<Vec<Track>>,
    current: Mutex<Option<CancellationToken>>,
}

impl LocalSession {
    /// Ouvre la bibliothèque et indexe ses fichiers
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let tracks = library::scan(&root)?;
        info!("📚 Local library {} : {} tracks", root.display(), tracks.len());
        Ok(Self {
            root,
            tracks: RwLock::new(tracks),
            current: Mutex::new(None),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn track_count(&self) -> usize {
        self.tracks.read().map(|t| t.len()).unwrap_or(0)
    }

    /// Relit le répertoire ; retourne le nouveau nombre de pistes
    pub fn rescan(&self) -> Result<usize> {
        let tracks = library::scan(&self.root)?;
        let count = tracks.len();
        match self.tracks.write() {
            Ok(mut guard) => *guard = tracks,
            Err(poisoned) => *poisoned.into_inner() = tracks,
        }
        Ok(count)
    }

    fn known(&self, reference: &str) -> Option<Track> {
        let tracks = match self.tracks.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        tracks.iter().find(|t| t.reference == reference).cloned()
    }

    fn replace_current(&self, token: Option<CancellationToken>) -> Option<CancellationToken> {
        let mut current = match self.current.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::replace(&mut *current, token)
    }
}

#[async_trait]
impl PlaybackSession for LocalSession {
    async fn search(&self, query: &str) -> pmostream::Result<Vec<Track>> {
        let tracks = match self.tracks.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(tracks
            .iter()
            .filter(|track| library::matches(track, query))
            .cloned()
            .collect())
    }

    async fn load_track(&self, reference: &str) -> pmostream::Result<Track> {
        let known = self
            .known(reference)
            .ok_or_else(|| LocalError::UnknownTrack(reference.to_string()))?;
        let path = library::as_path(reference);
        let layout = tokio::task::spawn_blocking(move || library::probe(&path))
            .await
            .map_err(|e| pmostream::StreamError::TaskJoin {
                role: "wav-probe",
                details: e.to_string(),
            })??;
        Ok(Track {
            duration_ms: layout.duration_ms(),
            ..known
        })
    }

    async fn stream_track(&self, track: &Track, sink: PcmSink) -> pmostream::Result<()> {
        let path = library::as_path(&track.reference);
        let layout = library::probe(&path)?;
        if layout.sample_rate != ENCODER_SAMPLE_RATE {
            warn!(
                "{} is sampled at {} Hz, the encoder expects {} Hz",
                path.display(),
                layout.sample_rate,
                ENCODER_SAMPLE_RATE
            );
        }

        let token = CancellationToken::new();
        if let Some(previous) = self.replace_current(Some(token.clone())) {
            previous.cancel();
        }

        let (tx, rx) = mpsc::channel(BLOCK_QUEUE_DEPTH);
        let reader_token = token.clone();
        let reader_path = path.clone();
        let reader = tokio::task::spawn_blocking(move || {
            read_pcm(&reader_path, layout, &tx, &reader_token)
        });

        debug!(path = %path.display(), "Starting local delivery");
        tokio::spawn(async move {
            let delivered = forward(rx, &sink, &token).await;
            match reader.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Reading {} failed: {}", path.display(), e),
                Err(e) => error!("WAV reader task failed: {}", e),
            }
            if delivered && !token.is_cancelled() {
                sink.finish().await;
                debug!(path = %path.display(), "Local delivery complete");
            }
        });
        Ok(())
    }

    async fn cancel_playback(&self) {
        if let Some(token) = self.replace_current(None) {
            debug!("Cancelling local delivery");
            token.cancel();
        }
    }
}

/// Transfère les blocs vers le sink ; `false` si le transfert a été interrompu
async fn forward(
    mut rx: mpsc::Receiver<Vec<u8>>,
    sink: &PcmSink,
    token: &CancellationToken,
) -> bool {
    loop {
        let block = tokio::select! {
            _ = token.cancelled() => return false,
            block = rx.recv() => block,
        };
        let Some(block) = block else {
            return true;
        };
        tokio::select! {
            _ = token.cancelled() => return false,
            written = sink.write(&block) => {
                if written.is_err() {
                    token.cancel();
                    return false;
                }
            }
        }
    }
}

/// Lit les échantillons et les pousse en PCM 16 bits little-endian stéréo
fn read_pcm(
    path: &Path,
    layout: PcmLayout,
    tx: &mpsc::Sender<Vec<u8>>,
    token: &CancellationToken,
) -> Result<()> {
    let mut reader = WavReader::open(path)?;
    let upmix = layout.channels == 1;
    let block_bytes = FRAMES_PER_BLOCK * 4;
    let mut block = Vec::with_capacity(block_bytes);

    for sample in reader.samples::<i16>() {
        let bytes = sample?.to_le_bytes();
        block.extend_from_slice(&bytes);
        if upmix {
            block.extend_from_slice(&bytes);
        }
        if block.len() >= block_bytes {
            if token.is_cancelled() {
                return Ok(());
            }
            let full = std::mem::replace(&mut block, Vec::with_capacity(block_bytes));
            if tx.blocking_send(full).is_err() {
                return Ok(());
            }
        }
    }

    if !block.is_empty() && !token.is_cancelled() {
        let _ = tx.blocking_send(block);
    }
    Ok(())
}
