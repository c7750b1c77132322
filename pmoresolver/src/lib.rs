//! # pmoresolver
//!
//! Protocole de résolution sur entrée/sortie standard : l'hôte envoie des
//! requêtes `artist/track/album`, le résolveur répond avec des pistes
//! candidates dont l'URL pointe vers le serveur [`pmostream::StreamingServer`].
//!
//! ```text
//! hôte ──[len][{"_msgtype":"rq",...}]──▶ Resolver ──search──▶ PlaybackSession
//!      ◀──[len][{"_msgtype":"results",...}]──┘ └──insert──▶ LinkLookup
//! ```

pub mod config_ext;
pub mod error;
pub mod framing;
pub mod matching;
pub mod messages;
pub mod resolver;

pub use config_ext::ResolverConfigExt;
pub use error::{ResolverError, Result};
pub use framing::{read_frame, write_frame, write_message};
pub use matching::{build_query, filter_query, score, similarity, soundex};
pub use messages::{Incoming, Query, Results, Settings, TrackResult};
pub use resolver::{Resolver, ResolverOptions};
