//! Cycle de vie du serveur de diffusion

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use pmoutils::{TransportProtocol, find_process_using_port, is_loopback_peer};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Result, StreamError};
use crate::gate::RequestGate;
use crate::handler::HandlerContext;
use crate::lookup::LinkLookup;
use crate::options::{ForeignPeerPolicy, StreamOptions};
use crate::session::PlaybackSession;

/// Sort réservé à une connexion entrante
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerDecision {
    Serve,
    Refuse,
    RefuseAndStop,
}

/// Seul `127.0.0.1` est servi ; les autres pairs sont fermés sans réponse
pub fn screen_peer(peer: &SocketAddr, policy: ForeignPeerPolicy) -> PeerDecision {
    if is_loopback_peer(peer) {
        PeerDecision::Serve
    } else {
        match policy {
            ForeignPeerPolicy::Stop => PeerDecision::RefuseAndStop,
            ForeignPeerPolicy::Skip => PeerDecision::Refuse,
        }
    }
}

#[derive(Default)]
struct ServerState {
    local_addr: Option<SocketAddr>,
    acceptor: Option<JoinHandle<()>>,
    started: bool,
}

/// Serveur HTTP de diffusion d'une piste à la fois
///
/// ```rust,ignore
/// let server = StreamingServer::new(options, session, lookup);
/// server.start().await?;
/// let url = server.track_url(&server.lookup().insert("spotify:track:..."));
/// // ...
/// server.shutdown().await;
/// ```
pub struct StreamingServer {
    ctx: Arc<HandlerContext>,
    gate: Arc<RequestGate>,
    stop_token: CancellationToken,
    state: Mutex<ServerState>,
    shut_down: AtomicBool,
}

impl StreamingServer {
    pub fn new(
        options: StreamOptions,
        session: Arc<dyn PlaybackSession>,
        lookup: Arc<LinkLookup>,
    ) -> Self {
        let ctx = Arc::new(HandlerContext {
            options: Arc::new(options),
            session,
            lookup,
        });
        Self {
            gate: Arc::new(RequestGate::new(ctx.clone())),
            ctx,
            stop_token: CancellationToken::new(),
            state: Mutex::new(ServerState::default()),
            shut_down: AtomicBool::new(false),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn options(&self) -> &StreamOptions {
        &self.ctx.options
    }

    pub fn lookup(&self) -> &Arc<LinkLookup> {
        &self.ctx.lookup
    }

    pub fn session(&self) -> &Arc<dyn PlaybackSession> {
        &self.ctx.session
    }

    /// Adresse effective d'écoute, une fois démarré
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state().local_addr
    }

    /// Vrai tant qu'une requête est en cours de traitement
    pub fn is_streaming(&self) -> bool {
        self.gate.is_active()
    }

    /// URL publiée pour un jeton
    ///
    /// Utilise le port effectif si le serveur écoute sur un port éphémère.
    pub fn track_url(&self, token: &str) -> String {
        let options = &self.ctx.options;
        let port = self.local_addr().map_or(options.port, |addr| addr.port());
        format!(
            "http://{}:{}{}{}",
            options.public_host, port, options.base_path, token
        )
    }

    /// Ouvre le socket d'écoute et lance la boucle d'acceptation
    pub async fn start(&self) -> Result<SocketAddr> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(StreamError::Cancelled);
        }
        {
            let mut state = self.state();
            if state.started {
                return Err(StreamError::AlreadyStarted);
            }
            state.started = true;
        }

        let options = &self.ctx.options;
        let listener = match TcpListener::bind((options.bind_address.as_str(), options.port)).await {
            Ok(listener) => listener,
            Err(e) => {
                if e.kind() == io::ErrorKind::AddrInUse {
                    match find_process_using_port(options.port, TransportProtocol::Tcp) {
                        Some(owner) => error!("Port {} already used by {}", options.port, owner),
                        None => error!("Port {} already in use", options.port),
                    }
                }
                self.state().started = false;
                return Err(e.into());
            }
        };

        let local_addr = listener.local_addr()?;
        let acceptor = tokio::spawn(accept_loop(
            listener,
            self.gate.clone(),
            self.stop_token.clone(),
            options.foreign_peer_policy,
        ));

        {
            let mut state = self.state();
            state.local_addr = Some(local_addr);
            state.acceptor = Some(acceptor);
        }

        info!(address = %local_addr, base_path = %options.base_path, "Streaming server listening");
        Ok(local_addr)
    }

    /// Arrête le handler actif, la session et la boucle d'acceptation
    ///
    /// Idempotent ; sans effet particulier si le serveur n'a jamais démarré.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down streaming server");

        self.stop_token.cancel();
        self.ctx.session.cancel_playback().await;
        self.gate.shutdown().await;

        let acceptor = self.state().acceptor.take();
        if let Some(mut acceptor) = acceptor {
            let wait = self.ctx.options.stop_wait();
            if timeout(wait, &mut acceptor).await.is_err() {
                warn!("Acceptor did not stop in time, aborting it");
                acceptor.abort();
                let _ = acceptor.await;
            }
        }
        self.state().local_addr = None;
        info!("Streaming server stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    gate: Arc<RequestGate>,
    stop_token: CancellationToken,
    policy: ForeignPeerPolicy,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = stop_token.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((socket, peer)) => match screen_peer(&peer, policy) {
                PeerDecision::Serve => {
                    debug!(peer = %peer, "Connection accepted");
                    gate.dispatch(socket, peer, &stop_token).await;
                }
                PeerDecision::Refuse => {
                    warn!(peer = %peer, "Refusing non-local connection");
                    drop(socket);
                }
                PeerDecision::RefuseAndStop => {
                    error!(peer = %peer, "Non-local connection, stopping acceptor");
                    drop(socket);
                    break;
                }
            },
            Err(e) => {
                warn!("Accept failed: {}", e);
                sleep(std::time::Duration::from_millis(50)).await;
            }
        }
    }
    debug!("Acceptor loop ended");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_screen_peer() {
        let local: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let remote: SocketAddr = "192.168.1.20:40000".parse().unwrap();

        assert_eq!(screen_peer(&local, ForeignPeerPolicy::Stop), PeerDecision::Serve);
        assert_eq!(
            screen_peer(&remote, ForeignPeerPolicy::Stop),
            PeerDecision::RefuseAndStop
        );
        assert_eq!(
            screen_peer(&remote, ForeignPeerPolicy::Skip),
            PeerDecision::Refuse
        );
    }
}
