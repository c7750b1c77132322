use std::sync::Arc;

use anyhow::Context;
use pmoconfig::get_config;
use pmolocal::{LibraryConfigExt, LocalSession};
use pmoresolver::{Resolver, ResolverConfigExt};
use pmostream::{LinkLookup, PlaybackSession, StreamConfigExt, StreamingServer};
use tracing::{info, warn};

mod logs;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = get_config();
    logs::init_logging(&config);
    info!("🎵 PMOSpot {} starting", env!("CARGO_PKG_VERSION"));

    // ========== PHASE 1 : Session ==========
    let library = config.get_library_directory();
    let session: Arc<dyn PlaybackSession> = Arc::new(
        LocalSession::open(&library)
            .with_context(|| format!("cannot open music library {library}"))?,
    );

    // ========== PHASE 2 : Serveur de flux ==========
    let options = config.get_stream_options();
    let lookup = Arc::new(LinkLookup::new(options.max_entries));
    let server = Arc::new(StreamingServer::new(options, session, lookup));
    let addr = server.start().await.context("cannot start streaming server")?;
    info!("✅ Streaming server listening on {}", addr);

    // ========== PHASE 3 : Protocole du résolveur ==========
    let resolver = Resolver::new(server.clone(), config.get_resolver_options());
    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();

    let outcome = tokio::select! {
        res = resolver.run(&mut stdin, &mut stdout) => {
            res.map(|answered| info!("Resolver channel closed after {} queries", answered))
                .map_err(anyhow::Error::from)
        }
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                warn!("Cannot listen for Ctrl+C: {}", e);
            }
            info!("Interrupted");
            Ok(())
        }
    };

    server.shutdown().await;
    info!("👋 PMOSpot stopped");
    outcome
}
