//! # pmolocal
//!
//! Implémentation de [`pmostream::PlaybackSession`] sur un répertoire de
//! fichiers WAV (PCM 16 bits), pour servir des pistes sans compte distant.
//!
//! ```no_run
//! use pmolocal::LocalSession;
//!
//! let session = LocalSession::open("/srv/music")?;
//! println!("{} tracks", session.track_count());
//! # Ok::<(), pmolocal::LocalError>(())
//! ```

pub mod config_ext;
pub mod error;
pub mod library;
pub mod session;

pub use config_ext::LibraryConfigExt;
pub use error::{LocalError, Result};
pub use library::{PcmLayout, UNKNOWN_ARTIST};
pub use session::{ENCODER_SAMPLE_RATE, LocalSession};
