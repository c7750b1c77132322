//! Boucle requête/réponse du résolveur

use std::sync::Arc;

use pmostream::{StreamingServer, Track};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::framing::{read_frame, write_message};
use crate::matching::{build_query, score};
use crate::messages::{Incoming, Query, Results, Settings, TrackResult};

pub const MIME_TYPE: &str = "audio/mpeg";

#[derive(Debug, Clone, PartialEq)]
pub struct ResolverOptions {
    pub name: String,
    pub weight: u32,
    pub target_time_ms: u64,
    pub local_only: bool,
    /// Valeur du champ `source` des résultats
    pub source: String,
    pub max_results: usize,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            name: "Spotify Resolver".to_string(),
            weight: 90,
            target_time_ms: 15_000,
            local_only: true,
            source: "Spotify".to_string(),
            max_results: 40,
        }
    }
}

impl ResolverOptions {
    pub fn settings(&self) -> Settings {
        Settings {
            msgtype: "settings",
            name: self.name.clone(),
            weight: self.weight,
            targettime: self.target_time_ms,
            localonly: self.local_only,
        }
    }
}

/// Répond aux requêtes de recherche en publiant des URL vers le serveur de diffusion
pub struct Resolver {
    server: Arc<StreamingServer>,
    options: ResolverOptions,
}

impl Resolver {
    pub fn new(server: Arc<StreamingServer>, options: ResolverOptions) -> Self {
        Self { server, options }
    }

    pub fn options(&self) -> &ResolverOptions {
        &self.options
    }

    /// Annonce le résolveur puis traite les requêtes jusqu'à la fin de la conversation
    ///
    /// Retourne le nombre de requêtes traitées.
    pub async fn run<R, W>(&self, reader: &mut R, writer: &mut W) -> Result<usize>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        write_message(writer, &self.options.settings()).await?;

        let mut answered = 0;
        loop {
            let Some(json) = read_frame(reader).await? else {
                info!("Input closed, leaving resolver loop");
                break;
            };
            debug!(%json, "Message received");

            let query = match Incoming::parse(&json)? {
                Incoming::Query(query) => query,
                Incoming::Stop(reason) => {
                    info!("Leaving resolver loop: {}", reason);
                    break;
                }
            };

            let results = self.resolve(&query).await;
            info!(
                qid = %query.qid,
                results = results.results.len(),
                "Answering query"
            );
            write_message(writer, &results).await?;
            answered += 1;
        }
        Ok(answered)
    }

    /// Construit la réponse à une requête ; un échec de recherche donne une liste vide
    pub async fn resolve(&self, query: &Query) -> Results {
        let tracks = match self.search(query).await {
            Ok(tracks) => tracks,
            Err(e) => {
                warn!(qid = %query.qid, "Search failed: {}", e);
                Vec::new()
            }
        };

        if tracks.len() > self.options.max_results {
            warn!(
                "Only returning first {} of {} results",
                self.options.max_results,
                tracks.len()
            );
        }

        let results = tracks
            .iter()
            .take(self.options.max_results)
            .map(|track| self.describe(track, query))
            .collect();
        Results::new(query.qid.clone(), results)
    }

    async fn search(&self, query: &Query) -> Result<Vec<Track>> {
        let session = self.server.session();

        if let Some(album) = query.album() {
            let full = build_query(&query.artist, &query.track, Some(album));
            debug!(query = %full, "Searching");
            let tracks = session.search(&full).await?;
            if !tracks.is_empty() {
                return Ok(tracks);
            }
            debug!("No results, trying search without album name");
        }

        let short = build_query(&query.artist, &query.track, None);
        debug!(query = %short, "Searching");
        Ok(session.search(&short).await?)
    }

    fn describe(&self, track: &Track, query: &Query) -> TrackResult {
        let sid = self.server.lookup().insert(track.reference.clone());
        let url = self.server.track_url(&sid);
        debug!(%url, reference = %track.reference, "Stream URL");

        TrackResult {
            artist: track.artists.first().cloned().unwrap_or_default(),
            track: track.name.clone(),
            album: track.album.clone(),
            mimetype: MIME_TYPE,
            source: self.options.source.clone(),
            url,
            duration: track.duration_ms / 1000,
            score: score(track, query),
            bitrate: self.server.options().encoder.bitrate_kbps,
        }
    }
}
