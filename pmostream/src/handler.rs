//! Traitement d'une requête de diffusion
//!
//! `Accepted → Validating → Resolving → AwaitingSession → Streaming → {Completed | Aborted}`
//!
//! Le handler lit la requête, vérifie méthode et chemin, résout le jeton, lance
//! l'encodeur, envoie l'en-tête puis recopie la file de sortie sur le socket.
//! Quelle que soit l'issue, l'encodeur est arrêté et le socket fermé ; le
//! drapeau d'activité est libéré par l'appelant à la fin de la tâche.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pmoutils::human_bytes;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::chunk::{AudioChunk, OutputQueue};
use crate::error::{Result, StreamError};
use crate::http::{FORBIDDEN_RESPONSE, extract_token, head_end, ok_header, parse_request};
use crate::lookup::LinkLookup;
use crate::options::StreamOptions;
use crate::session::{PlaybackSession, Track};
use crate::transcoder::TranscodeBridge;

const RECEIVE_BUFFER_SIZE: usize = 1025;
const MAX_HEAD_SIZE: usize = 16 * 1024;

/// Ce que partagent tous les handlers d'un serveur
pub struct HandlerContext {
    pub options: Arc<StreamOptions>,
    pub session: Arc<dyn PlaybackSession>,
    pub lookup: Arc<LinkLookup>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Accepted,
    Validating,
    Resolving,
    AwaitingSession,
    Streaming,
    Completed,
    Aborted,
}

pub struct StreamRequestHandler {
    ctx: Arc<HandlerContext>,
    peer: SocketAddr,
    stop_token: CancellationToken,
    state: HandlerState,
    sid: Option<String>,
    /// Une fois l'en-tête 200 parti, plus aucune réponse 403 n'est écrite
    header_sent: bool,
}

impl StreamRequestHandler {
    pub fn new(ctx: Arc<HandlerContext>, peer: SocketAddr, stop_token: CancellationToken) -> Self {
        Self {
            ctx,
            peer,
            stop_token,
            state: HandlerState::Accepted,
            sid: None,
            header_sent: false,
        }
    }

    pub fn state(&self) -> HandlerState {
        self.state
    }

    fn enter(&mut self, state: HandlerState) {
        trace!(peer = %self.peer, from = ?self.state, to = ?state, "Handler state");
        self.state = state;
    }

    /// Traite la connexion jusqu'au bout et retourne le nombre d'octets de corps envoyés
    pub async fn run(mut self, mut socket: TcpStream) -> Result<u64> {
        let result = self.serve(&mut socket).await;
        let sid = self.sid.clone().unwrap_or_default();

        match &result {
            Ok(sent) => {
                self.enter(HandlerState::Completed);
                info!(peer = %self.peer, sid = %sid, bytes = sent, "Transfer complete ({})", human_bytes(*sent));
            }
            Err(err) => {
                self.enter(HandlerState::Aborted);
                let forbidden = err.is_rejection() || matches!(err, StreamError::ClientDisconnected);
                if forbidden && !self.header_sent {
                    let _ = timeout(
                        self.ctx.options.send_timeout,
                        socket.write_all(FORBIDDEN_RESPONSE),
                    )
                    .await;
                }
                match err {
                    e if e.is_rejection() => warn!(peer = %self.peer, sid = %sid, "Forbidden: {}", e),
                    StreamError::Cancelled => info!(peer = %self.peer, sid = %sid, "Request pre-empted"),
                    StreamError::ClientDisconnected => {
                        info!(peer = %self.peer, sid = %sid, "Client disconnected")
                    }
                    e => error!(peer = %self.peer, sid = %sid, "Request failed: {}", e),
                }
            }
        }

        if let Err(e) = socket.shutdown().await {
            trace!(peer = %self.peer, "Socket shutdown: {}", e);
        }
        result
    }

    async fn serve(&mut self, socket: &mut TcpStream) -> Result<u64> {
        let ctx = self.ctx.clone();
        let options = &ctx.options;

        let raw = self.read_request(socket).await?;

        self.enter(HandlerState::Validating);
        let head = parse_request(&raw)?;
        debug!(
            peer = %self.peer,
            method = %head.method,
            path = %head.path,
            agent = head.agent().unwrap_or("-"),
            "Request received"
        );
        if head.method != "GET" {
            return Err(StreamError::rejected(format!("method {} not allowed", head.method)));
        }
        if !options.accepts_agent(head.agent()) {
            return Err(StreamError::rejected(format!(
                "agent {:?} not allowed",
                head.agent().unwrap_or_default()
            )));
        }
        let token = extract_token(&head.path, &options.base_path)?.to_string();
        self.sid = Some(token.clone());

        self.enter(HandlerState::Resolving);
        let reference = ctx
            .lookup
            .resolve(&token)
            .ok_or_else(|| StreamError::rejected(format!("unknown token {token}")))?;
        let track = self.load_track(&token, &reference).await?;

        self.enter(HandlerState::AwaitingSession);
        let expected = options.encoder.expected_payload_size(track.duration_ms);
        let (bridge, mut queue) = TranscodeBridge::spawn(&options.encoder, expected)?;

        let outcome = self
            .deliver(socket, &bridge, &mut queue, &track, expected)
            .await;

        if let Err(err) = &outcome {
            // une préemption a déjà annulé la session
            if !matches!(err, StreamError::Cancelled) {
                ctx.session.cancel_playback().await;
            }
        }
        bridge.close().await;
        outcome
    }

    async fn deliver(
        &mut self,
        socket: &mut TcpStream,
        bridge: &TranscodeBridge,
        queue: &mut OutputQueue,
        track: &Track,
        expected: u64,
    ) -> Result<u64> {
        let header = ok_header(expected, Utc::now());
        send_with_timeout(
            socket,
            header.as_bytes(),
            self.ctx.options.send_timeout,
            &self.stop_token,
        )
        .await?;
        self.header_sent = true;

        info!(
            peer = %self.peer,
            track = %track.name,
            artist = %track.artist_line(),
            content_length = expected,
            "Streaming track"
        );
        self.ctx.session.stream_track(track, bridge.sink()).await?;

        self.enter(HandlerState::Streaming);
        self.pump(socket, queue).await
    }

    async fn read_request(&self, socket: &mut TcpStream) -> Result<String> {
        let options = &self.ctx.options;
        let mut buf = Vec::with_capacity(RECEIVE_BUFFER_SIZE);
        let mut chunk = [0u8; RECEIVE_BUFFER_SIZE];
        let mut idle = 0u32;

        loop {
            let read = tokio::select! {
                biased;
                _ = self.stop_token.cancelled() => return Err(StreamError::Cancelled),
                read = timeout(options.receive_retry_delay, socket.read(&mut chunk)) => read,
            };

            match read {
                Ok(Ok(0)) if buf.is_empty() => return Err(StreamError::ClientDisconnected),
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => {
                    buf.extend_from_slice(&chunk[..n]);
                    if head_end(&buf).is_some() {
                        break;
                    }
                    if buf.len() > MAX_HEAD_SIZE {
                        return Err(StreamError::rejected("request head too large"));
                    }
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    idle += 1;
                    if idle >= options.receive_retry_limit.max(1) {
                        if buf.is_empty() {
                            return Err(StreamError::ReceiveTimeout { attempts: idle });
                        }
                        break;
                    }
                }
            }
        }

        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    async fn load_track(&self, sid: &str, reference: &str) -> Result<Track> {
        let options = &self.ctx.options;
        let attempts = options.resolve_retry_limit.max(1);

        for attempt in 1..=attempts {
            let loaded = tokio::select! {
                biased;
                _ = self.stop_token.cancelled() => return Err(StreamError::Cancelled),
                loaded = self.ctx.session.load_track(reference) => loaded,
            };
            match loaded {
                Ok(track) if track.is_ready() => {
                    debug!(sid, attempt, duration_ms = track.duration_ms, "Track ready");
                    return Ok(track);
                }
                Ok(_) => trace!(sid, attempt, "Track not ready yet"),
                Err(e) => debug!(sid, attempt, "Loading track failed: {}", e),
            }

            if attempt < attempts {
                tokio::select! {
                    biased;
                    _ = self.stop_token.cancelled() => return Err(StreamError::Cancelled),
                    _ = sleep(options.resolve_retry_delay) => {}
                }
            }
        }

        Err(StreamError::ResolutionTimeout {
            sid: sid.to_string(),
            attempts,
        })
    }

    async fn pump(&self, socket: &mut TcpStream, queue: &mut OutputQueue) -> Result<u64> {
        let (mut reader, mut writer) = socket.split();
        let mut inbound = [0u8; 256];
        let mut sent = 0u64;
        let mut client_sending = true;

        loop {
            tokio::select! {
                biased;
                _ = self.stop_token.cancelled() => return Err(StreamError::Cancelled),
                read = reader.read(&mut inbound), if client_sending => match read {
                    // demi-fermeture : le client lit encore, seule l'écriture détecte la déconnexion
                    Ok(0) => {
                        debug!(peer = %self.peer, "Client finished sending");
                        client_sending = false;
                    }
                    Ok(n) => trace!(peer = %self.peer, "Ignoring {} bytes from client", n),
                    Err(e) => {
                        debug!(peer = %self.peer, "Client socket error: {}", e);
                        return Err(StreamError::ClientDisconnected);
                    }
                },
                chunk = queue.next() => match chunk {
                    Some(AudioChunk::Data(bytes)) => {
                        send_with_timeout(&mut writer, &bytes, self.ctx.options.send_timeout, &self.stop_token).await?;
                        sent += bytes.len() as u64;
                        trace!(peer = %self.peer, sent, "Chunk sent ({} bytes)", bytes.len());
                    }
                    Some(AudioChunk::EndOfStream) => return Ok(sent),
                    None => {
                        return Err(StreamError::SubprocessFailure(
                            "encoder output ended without end of stream".to_string(),
                        ));
                    }
                },
            }
        }
    }
}

/// Écrit tout le tampon avant l'échéance, ou échoue
pub(crate) async fn send_with_timeout<W>(
    writer: &mut W,
    bytes: &[u8],
    limit: Duration,
    stop_token: &CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    tokio::select! {
        biased;
        _ = stop_token.cancelled() => Err(StreamError::Cancelled),
        res = timeout(limit, writer.write_all(bytes)) => match res {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if is_disconnect(&e) => Err(StreamError::ClientDisconnected),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(StreamError::TransferTimeout {
                pending: bytes.len(),
                timeout_ms: limit.as_millis() as u64,
            }),
        },
    }
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::WriteZero
    )
}
