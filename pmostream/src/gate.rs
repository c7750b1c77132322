//! Exclusion mutuelle des requêtes de diffusion
//!
//! Une seule requête est active à un instant donné. Une nouvelle connexion
//! préempte la précédente : la session est annulée, le handler est prié de
//! s'arrêter, puis interrompu s'il ne l'a pas fait dans le délai imparti. Le
//! nouveau handler ne démarre qu'une fois le précédent terminé.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::handler::{HandlerContext, StreamRequestHandler};

/// Drapeau « une requête est en cours »
///
/// L'acquisition est un compare-and-swap : deux handlers ne peuvent jamais se
/// croire seuls propriétaires.
#[derive(Debug, Clone, Default)]
pub struct ActiveRequestFlag(Arc<AtomicBool>);

impl ActiveRequestFlag {
    pub fn try_acquire(&self) -> Option<ActiveRequestGuard> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ActiveRequestGuard(self.0.clone()))
    }

    pub fn is_active(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Libère le drapeau quand il est abandonné, quelle que soit l'issue du handler
#[derive(Debug)]
pub struct ActiveRequestGuard(Arc<AtomicBool>);

impl Drop for ActiveRequestGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct ActiveRequest {
    peer: SocketAddr,
    stop_token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct RequestGate {
    ctx: Arc<HandlerContext>,
    flag: ActiveRequestFlag,
    slot: Mutex<Option<ActiveRequest>>,
}

impl RequestGate {
    pub fn new(ctx: Arc<HandlerContext>) -> Self {
        Self {
            ctx,
            flag: ActiveRequestFlag::default(),
            slot: Mutex::new(None),
        }
    }

    pub fn flag(&self) -> &ActiveRequestFlag {
        &self.flag
    }

    pub fn is_active(&self) -> bool {
        self.flag.is_active()
    }

    /// Démarre un handler pour `socket`, après avoir arrêté le précédent
    ///
    /// `parent` est le jeton du serveur : son annulation arrête aussi le handler.
    pub async fn dispatch(&self, socket: TcpStream, peer: SocketAddr, parent: &CancellationToken) {
        let mut slot = self.slot.lock().await;

        if let Some(previous) = slot.take() {
            if !previous.handle.is_finished() {
                warn!(
                    previous = %previous.peer,
                    next = %peer,
                    "New request while another is streaming, pre-empting it"
                );
                self.ctx.session.cancel_playback().await;
                self.stop(previous).await;
            }
        }

        let Some(guard) = self.flag.try_acquire() else {
            error!(peer = %peer, "Active request flag still set, refusing connection");
            return;
        };

        let stop_token = parent.child_token();
        let handler = StreamRequestHandler::new(self.ctx.clone(), peer, stop_token.clone());
        let handle = tokio::spawn(async move {
            let _guard = guard;
            let _ = handler.run(socket).await;
        });

        *slot = Some(ActiveRequest {
            peer,
            stop_token,
            handle,
        });
    }

    /// Arrête le handler actif, s'il y en a un
    pub async fn shutdown(&self) {
        let previous = self.slot.lock().await.take();
        if let Some(previous) = previous {
            self.stop(previous).await;
        }
    }

    async fn stop(&self, mut request: ActiveRequest) {
        request.stop_token.cancel();

        let wait = self.ctx.options.stop_wait();
        match timeout(wait, &mut request.handle).await {
            Ok(Ok(())) => debug!(peer = %request.peer, "Handler stopped"),
            Ok(Err(e)) => warn!(peer = %request.peer, "Handler task failed: {}", e),
            Err(_) => {
                warn!(
                    peer = %request.peer,
                    wait_ms = wait.as_millis() as u64,
                    "Handler did not stop in time, aborting it"
                );
                request.handle.abort();
                // l'abandon de la tâche libère le drapeau et ferme le socket
                let _ = request.handle.await;
            }
        }
        info!(peer = %request.peer, "Previous request terminated");
    }
}
