//! Catalogue de fichiers WAV
//!
//! Convention de nommage : `<album>/<artiste> - <titre>.wav`. Un fichier placé
//! directement à la racine n'a pas d'album ; un nom sans ` - ` a un artiste
//! inconnu.

use std::path::{Path, PathBuf};

use hound::{SampleFormat, WavReader};
use pmostream::Track;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{LocalError, Result};

pub const UNKNOWN_ARTIST: &str = "Unknown Artist";

/// Format PCM d'un fichier accepté
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmLayout {
    pub sample_rate: u32,
    pub channels: u16,
    pub frames: u32,
}

impl PcmLayout {
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        u64::from(self.frames) * 1000 / u64::from(self.sample_rate)
    }
}

/// Lit l'en-tête et vérifie qu'il s'agit de PCM entier 16 bits
pub fn probe(path: &Path) -> Result<PcmLayout> {
    let reader = WavReader::open(path)?;
    let spec = reader.spec();
    if spec.sample_format != SampleFormat::Int || spec.bits_per_sample != 16 {
        return Err(LocalError::UnsupportedFormat {
            path: path.display().to_string(),
            details: format!("{:?} {} bits", spec.sample_format, spec.bits_per_sample),
        });
    }
    if spec.channels == 0 || spec.channels > 2 {
        return Err(LocalError::UnsupportedFormat {
            path: path.display().to_string(),
            details: format!("{} channels", spec.channels),
        });
    }
    Ok(PcmLayout {
        sample_rate: spec.sample_rate,
        channels: spec.channels,
        frames: reader.duration(),
    })
}

/// Décrit un fichier du catalogue
pub fn describe(root: &Path, path: &Path) -> Result<Track> {
    let layout = probe(path)?;
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let (artist, name) = match stem.split_once(" - ") {
        Some((artist, title)) => (artist.trim().to_string(), title.trim().to_string()),
        None => (UNKNOWN_ARTIST.to_string(), stem.trim().to_string()),
    };

    let album = path
        .parent()
        .filter(|parent| *parent != root)
        .and_then(Path::file_name)
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    Ok(Track {
        reference: path.to_string_lossy().into_owned(),
        name,
        artists: vec![artist],
        album,
        duration_ms: layout.duration_ms(),
    })
}

/// Parcourt `root` et décrit chaque fichier `.wav` lisible
///
/// Les fichiers illisibles ou d'un format non supporté sont ignorés avec un
/// avertissement.
pub fn scan(root: &Path) -> Result<Vec<Track>> {
    if !root.is_dir() {
        return Err(LocalError::MissingLibrary(root.display().to_string()));
    }

    let mut tracks = Vec::new();
    for entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable library entry: {}", e);
                continue;
            }
        };
        let path = entry.path();
        let is_wav = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("wav"));
        if !entry.file_type().is_file() || !is_wav {
            continue;
        }

        match describe(root, path) {
            Ok(track) => {
                debug!(path = %path.display(), duration_ms = track.duration_ms, "Track found");
                tracks.push(track);
            }
            Err(e) => warn!("Skipping {}: {}", path.display(), e),
        }
    }
    Ok(tracks)
}

/// Vrai si chaque mot de la requête apparaît dans l'artiste, le titre ou l'album
pub fn matches(track: &Track, query: &str) -> bool {
    let haystack = format!("{} {} {}", track.artist_line(), track.name, track.album).to_lowercase();
    query
        .split_whitespace()
        .all(|word| haystack.contains(&word.to_lowercase()))
}

pub(crate) fn as_path(reference: &str) -> PathBuf {
    PathBuf::from(reference)
}
