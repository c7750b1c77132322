//! # pmostream
//!
//! Serveur HTTP minimal qui diffuse une piste à la fois, encodée en MP3 à la
//! volée par un sous-processus.
//!
//! ## Architecture
//!
//! ```text
//! accept ─▶ RequestGate ─▶ StreamRequestHandler ─▶ LinkLookup::resolve
//!              │                   │
//!        (préemption)              ├─▶ PlaybackSession::stream_track(PcmSink)
//!                                  │          │
//!                                  │          ▼
//!                                  │   TranscodeBridge (stdin → encodeur → stdout)
//!                                  │          │
//!                                  └◀── OutputQueue (AudioChunk::Data… EndOfStream)
//! ```
//!
//! - [`LinkLookup`] : jetons éphémères bornés, éviction FIFO
//! - [`TranscodeBridge`] : supervision de l'encodeur, découpage, bourrage
//! - [`OutputQueue`] : file ordonnée producteur/consommateur
//! - [`StreamRequestHandler`] : validation, résolution, diffusion
//! - [`RequestGate`] / [`StreamingServer`] : une requête active, arrêt ordonné
//!
//! L'annulation est coopérative : chaque requête possède un
//! `CancellationToken` enfant de celui du serveur, observé par toutes les
//! attentes (lecture, écriture, file, encodeur).

pub mod chunk;
pub mod config_ext;
pub mod error;
pub mod gate;
pub mod handler;
pub mod http;
pub mod lookup;
pub mod options;
pub mod server;
pub mod session;
pub mod transcoder;

pub use chunk::{AudioChunk, ChunkSender, OutputQueue, output_queue};
pub use config_ext::StreamConfigExt;
pub use error::{Result, StreamError};
pub use gate::{ActiveRequestFlag, ActiveRequestGuard, RequestGate};
pub use handler::{HandlerContext, HandlerState, StreamRequestHandler};
pub use lookup::{DEFAULT_MAX_ENTRIES, LinkLookup, TOKEN_LEN};
pub use options::{ForeignPeerPolicy, StreamOptions};
pub use server::{PeerDecision, StreamingServer, screen_peer};
pub use session::{PcmSink, PlaybackSession, Track};
pub use transcoder::{
    BridgeState, EncoderOptions, TranscodeBridge, expected_payload_size, lame_args,
};

/// Ré-export pour les implémentations de [`PlaybackSession`]
pub use async_trait::async_trait;
