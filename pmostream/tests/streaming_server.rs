#![cfg(unix)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pmostream::{
    EncoderOptions, ForeignPeerPolicy, LinkLookup, PcmSink, PlaybackSession, Result, StreamError, StreamOptions,
    StreamingServer, Track, async_trait,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
#[cfg(target_os = "linux")]
use tokio::net::TcpSocket;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

const FORBIDDEN: &[u8] = b"HTTP/1.1 403 Forbidden\r\n\r\n";

/// Session de test : livre `payload` puis termine la piste, ou la garde
/// ouverte jusqu'à annulation quand `hold` est vrai.
#[derive(Default)]
struct ScriptedSession {
    tracks: Mutex<HashMap<String, Track>>,
    not_ready_loads: AtomicU32,
    payload: Vec<u8>,
    hold: bool,
    loads: AtomicU32,
    streams: AtomicU32,
    cancels: AtomicU32,
    delivery: Mutex<Option<CancellationToken>>,
}

impl ScriptedSession {
    fn new(payload: Vec<u8>, hold: bool) -> Self {
        Self {
            payload,
            hold,
            ..Default::default()
        }
    }

    fn with_track(self, reference: &str, duration_ms: u64) -> Self {
        self.tracks.lock().unwrap().insert(
            reference.to_string(),
            Track {
                reference: reference.to_string(),
                name: "Harder Better Faster Stronger".to_string(),
                artists: vec!["Daft Punk".to_string()],
                album: "Discovery".to_string(),
                duration_ms,
            },
        );
        self
    }

    fn not_ready_for(self, loads: u32) -> Self {
        self.not_ready_loads.store(loads, Ordering::SeqCst);
        self
    }

    fn cancels(&self) -> u32 {
        self.cancels.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlaybackSession for ScriptedSession {
    async fn search(&self, _query: &str) -> Result<Vec<Track>> {
        Ok(self.tracks.lock().unwrap().values().cloned().collect())
    }

    async fn load_track(&self, reference: &str) -> Result<Track> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let track = self
            .tracks
            .lock()
            .unwrap()
            .get(reference)
            .cloned()
            .ok_or_else(|| StreamError::Session(format!("unknown reference {reference}")))?;

        let pending = self.not_ready_loads.load(Ordering::SeqCst);
        if pending > 0 {
            self.not_ready_loads.store(pending - 1, Ordering::SeqCst);
            return Ok(Track {
                duration_ms: 0,
                ..track
            });
        }
        Ok(track)
    }

    async fn stream_track(&self, _track: &Track, sink: PcmSink) -> Result<()> {
        self.streams.fetch_add(1, Ordering::SeqCst);
        let token = CancellationToken::new();
        *self.delivery.lock().unwrap() = Some(token.clone());

        let payload = self.payload.clone();
        let hold = self.hold;
        tokio::spawn(async move {
            if sink.write(&payload).await.is_err() {
                return;
            }
            if hold {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = sink.closed() => {}
                }
            } else {
                sink.finish().await;
            }
        });
        Ok(())
    }

    async fn cancel_playback(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        if let Some(token) = self.delivery.lock().unwrap().take() {
            token.cancel();
        }
    }
}

fn options(chunk_size: usize) -> StreamOptions {
    StreamOptions {
        bind_address: "127.0.0.1".to_string(),
        port: 0,
        resolve_retry_delay: Duration::from_millis(5),
        stop_wait_interval: Duration::from_millis(200),
        encoder: EncoderOptions::with_program("cat", Vec::new())
            .with_chunk_size(chunk_size)
            .with_exit_grace(Duration::from_secs(2)),
        ..StreamOptions::default()
    }
}

async fn start(session: Arc<ScriptedSession>, options: StreamOptions) -> StreamingServer {
    let server = StreamingServer::new(options, session, Arc::new(LinkLookup::default()));
    server.start().await.unwrap();
    server
}

fn addr(server: &StreamingServer) -> SocketAddr {
    server.local_addr().unwrap()
}

async fn request(addr: SocketAddr, raw: &str) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    timeout(Duration::from_secs(20), stream.read_to_end(&mut response))
        .await
        .expect("response not terminated")
        .unwrap();
    response
}

/// Lit jusqu'à la fin des en-têtes et retourne l'en-tête
async fn read_header(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = timeout(Duration::from_secs(10), stream.read(&mut byte))
            .await
            .expect("header not received")
            .unwrap();
        assert_eq!(n, 1, "connection closed before end of header");
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

fn split_response(response: &[u8]) -> (String, &[u8]) {
    let end = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("no header")
        + 4;
    (
        String::from_utf8_lossy(&response[..end]).into_owned(),
        &response[end..],
    )
}

fn content_length(header: &str) -> usize {
    header
        .lines()
        .find_map(|line| line.strip_prefix("Content-Length: "))
        .expect("no Content-Length")
        .parse()
        .unwrap()
}

async fn wait_idle(server: &StreamingServer) {
    for _ in 0..200 {
        if !server.is_streaming() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("active request flag still set");
}

#[tokio::test]
async fn streams_padded_body_matching_content_length() {
    let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8 + 1).collect();
    let session = Arc::new(ScriptedSession::new(payload.clone(), false).with_track("spotify:track:1", 180_000));
    let server = start(session.clone(), options(4096)).await;
    let token = server.lookup().insert("spotify:track:1");

    let response = request(addr(&server), &format!("GET /sid/{token} HTTP/1.1\r\n\r\n")).await;
    let (header, body) = split_response(&response);

    assert!(header.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(header.contains("Content-Type: audio/mpeg\r\n"));
    assert!(header.contains("Server: SpotifyResolver\r\n"));
    assert!(header.contains("Keep-Alive: timeout=1, max=1\r\n"));
    assert_eq!(content_length(&header), 2_949_120);
    assert_eq!(body.len(), 2_949_120);
    assert_eq!(&body[..1000], payload.as_slice());
    assert!(body[1000..].iter().all(|&b| b == 0));

    wait_idle(&server).await;
    assert_eq!(session.cancels(), 0);
    server.shutdown().await;
}

#[tokio::test]
async fn rejections_answer_forbidden_and_clear_flag() {
    let session = Arc::new(ScriptedSession::new(vec![1; 16], false).with_track("ref", 10_000));
    let server = start(session.clone(), options(1024)).await;
    let token = server.lookup().insert("ref");

    let cases = [
        format!("POST /sid/{token} HTTP/1.1\r\n\r\n"),
        format!("GET /sid/{token}X HTTP/1.1\r\n\r\n"),
        "GET /sid/short HTTP/1.1\r\n\r\n".to_string(),
        format!("GET /abc/{token} HTTP/1.1\r\n\r\n"),
        "GET /sid/AAAAAAAA-AAAA-AAAA-AAAA-AAAAAAAAAAAA HTTP/1.1\r\n\r\n".to_string(),
    ];
    for raw in &cases {
        let response = request(addr(&server), raw).await;
        assert_eq!(response, FORBIDDEN, "request {raw:?}");
        wait_idle(&server).await;
    }

    assert_eq!(session.streams.load(Ordering::SeqCst), 0);
    server.shutdown().await;
}

#[tokio::test]
async fn agent_allow_list_rejects_unknown_clients() {
    let session = Arc::new(ScriptedSession::new(vec![1; 16], false).with_track("ref", 2_000));
    let mut opts = options(1024);
    opts.allowed_agents = vec!["Playdar".to_string()];
    let server = start(session, opts).await;
    let token = server.lookup().insert("ref");

    let refused = request(
        addr(&server),
        &format!("GET /sid/{token} HTTP/1.1\r\nUser-Agent: curl/8.0\r\n\r\n"),
    )
    .await;
    assert_eq!(refused, FORBIDDEN);
    wait_idle(&server).await;

    let served = request(
        addr(&server),
        &format!("GET /sid/{token} HTTP/1.1\r\nUser-Agent: Playdar/0.1\r\n\r\n"),
    )
    .await;
    let (header, body) = split_response(&served);
    assert!(header.starts_with("HTTP/1.1 200 OK"));
    assert_eq!(body.len(), 32_768);
    server.shutdown().await;
}

#[tokio::test]
async fn track_that_never_becomes_ready_is_forbidden() {
    let session = Arc::new(
        ScriptedSession::new(vec![1; 16], false)
            .with_track("slow", 5_000)
            .not_ready_for(u32::MAX),
    );
    let server = start(session.clone(), options(1024)).await;
    let token = server.lookup().insert("slow");

    let response = request(addr(&server), &format!("GET /sid/{token} HTTP/1.1\r\n\r\n")).await;
    assert_eq!(response, FORBIDDEN);
    assert_eq!(session.loads.load(Ordering::SeqCst), 10);
    wait_idle(&server).await;
    server.shutdown().await;
}

#[tokio::test]
async fn transiently_unready_track_is_retried() {
    let session = Arc::new(
        ScriptedSession::new(vec![7; 100], false)
            .with_track("warming", 1_000)
            .not_ready_for(3),
    );
    let server = start(session.clone(), options(1024)).await;
    let token = server.lookup().insert("warming");

    let response = request(addr(&server), &format!("GET /sid/{token} HTTP/1.1\r\n\r\n")).await;
    let (header, body) = split_response(&response);
    assert_eq!(content_length(&header), 16_384);
    assert_eq!(body.len(), 16_384);
    assert_eq!(session.loads.load(Ordering::SeqCst), 4);
    server.shutdown().await;
}

#[tokio::test]
async fn new_request_preempts_the_active_one() {
    let session = Arc::new(ScriptedSession::new(vec![9; 64], true).with_track("ref", 60_000));
    let server = start(session.clone(), options(16)).await;
    let token = server.lookup().insert("ref");
    let raw = format!("GET /sid/{token} HTTP/1.1\r\n\r\n");

    let mut first = TcpStream::connect(addr(&server)).await.unwrap();
    first.write_all(raw.as_bytes()).await.unwrap();
    let first_header = read_header(&mut first).await;
    assert!(first_header.starts_with("HTTP/1.1 200 OK"));
    assert!(server.is_streaming());

    let mut second = TcpStream::connect(addr(&server)).await.unwrap();
    second.write_all(raw.as_bytes()).await.unwrap();
    let second_header = read_header(&mut second).await;
    assert!(second_header.starts_with("HTTP/1.1 200 OK"));

    // le premier handler était terminé avant que le second ne réponde
    let mut rest = Vec::new();
    timeout(Duration::from_millis(500), first.read_to_end(&mut rest))
        .await
        .expect("first connection still open")
        .unwrap();
    assert!(rest.len() < content_length(&first_header));
    assert_eq!(session.cancels(), 1);
    assert_eq!(session.streams.load(Ordering::SeqCst), 2);
    assert!(server.is_streaming());

    server.shutdown().await;
    let mut tail = Vec::new();
    timeout(Duration::from_secs(5), second.read_to_end(&mut tail))
        .await
        .expect("second connection still open after shutdown")
        .unwrap();
    assert!(!server.is_streaming());
}

#[tokio::test]
async fn client_disconnect_cancels_playback() {
    // plus que ce que les tampons du socket absorbent sans lecture côté client
    let session = Arc::new(ScriptedSession::new(vec![3; 2 << 20], true).with_track("ref", 600_000));
    let server = start(session.clone(), options(65_536)).await;
    let token = server.lookup().insert("ref");

    let mut client = TcpStream::connect(addr(&server)).await.unwrap();
    client
        .write_all(format!("GET /sid/{token} HTTP/1.1\r\n\r\n").as_bytes())
        .await
        .unwrap();
    read_header(&mut client).await;
    drop(client);

    wait_idle(&server).await;
    assert_eq!(session.cancels(), 1);
    server.shutdown().await;
}

#[tokio::test]
async fn half_closed_client_still_receives_the_whole_body() {
    let payload: Vec<u8> = (0..1000u32).map(|i| (i % 13) as u8 + 1).collect();
    let session = Arc::new(ScriptedSession::new(payload.clone(), false).with_track("ref", 4_000));
    let server = start(session.clone(), options(256)).await;
    let token = server.lookup().insert("ref");

    let mut client = TcpStream::connect(addr(&server)).await.unwrap();
    client
        .write_all(format!("GET /sid/{token} HTTP/1.1\r\n\r\n").as_bytes())
        .await
        .unwrap();
    client.shutdown().await.unwrap();

    let mut response = Vec::new();
    timeout(Duration::from_secs(20), client.read_to_end(&mut response))
        .await
        .expect("response not terminated")
        .unwrap();
    let (header, body) = split_response(&response);

    assert!(header.starts_with("HTTP/1.1 200 OK"));
    assert_eq!(content_length(&header), 65_536);
    assert_eq!(body.len(), 65_536);
    assert_eq!(&body[..1000], payload.as_slice());
    assert!(body[1000..].iter().all(|&b| b == 0));
    assert!(!body.windows(FORBIDDEN.len()).any(|w| w == FORBIDDEN));

    wait_idle(&server).await;
    assert_eq!(session.cancels(), 0);
    server.shutdown().await;
}

#[tokio::test]
async fn encoder_crash_aborts_the_transfer() {
    let session = Arc::new(ScriptedSession::new(vec![1; 8], false).with_track("ref", 4_000));
    let mut opts = options(1024);
    opts.encoder = EncoderOptions::with_program("sh", vec!["-c".to_string(), "exit 3".to_string()]);
    let server = start(session.clone(), opts).await;
    let token = server.lookup().insert("ref");

    let response = request(addr(&server), &format!("GET /sid/{token} HTTP/1.1\r\n\r\n")).await;
    let (header, body) = split_response(&response);
    assert!(header.starts_with("HTTP/1.1 200 OK"));
    assert!(body.len() < content_length(&header));

    wait_idle(&server).await;
    assert_eq!(session.cancels(), 1);
    server.shutdown().await;
}

#[tokio::test]
async fn missing_encoder_closes_without_response() {
    let session = Arc::new(ScriptedSession::new(vec![1; 8], false).with_track("ref", 4_000));
    let mut opts = options(1024);
    opts.encoder = EncoderOptions::with_program("/nonexistent/pmospot-lame", Vec::new());
    let server = start(session.clone(), opts).await;
    let token = server.lookup().insert("ref");

    let response = request(addr(&server), &format!("GET /sid/{token} HTTP/1.1\r\n\r\n")).await;
    assert!(response.is_empty());
    assert_eq!(session.streams.load(Ordering::SeqCst), 0);
    wait_idle(&server).await;
    server.shutdown().await;
}

#[tokio::test]
async fn lifecycle_is_idempotent() {
    let session = Arc::new(ScriptedSession::new(Vec::new(), false));
    let never_started =
        StreamingServer::new(options(16), session.clone(), Arc::new(LinkLookup::default()));
    never_started.shutdown().await;
    never_started.shutdown().await;
    assert!(matches!(
        never_started.start().await,
        Err(StreamError::Cancelled)
    ));

    let server = start(session, options(16)).await;
    assert!(matches!(server.start().await, Err(StreamError::AlreadyStarted)));

    let port = addr(&server).port();
    assert_eq!(
        server.track_url("AAAAAAAA-AAAA-AAAA-AAAA-AAAAAAAAAAAA"),
        format!("http://localhost:{port}/sid/AAAAAAAA-AAAA-AAAA-AAAA-AAAAAAAAAAAA")
    );

    server.shutdown().await;
    server.shutdown().await;
    assert!(server.local_addr().is_none());
}

/// Client partant de 127.0.0.2 : routé par lo, mais pas une adresse de bouclage acceptée
#[cfg(target_os = "linux")]
async fn connect_from_foreign(addr: SocketAddr) -> TcpStream {
    let socket = TcpSocket::new_v4().unwrap();
    socket.bind("127.0.0.2:0".parse().unwrap()).unwrap();
    socket.connect(addr).await.unwrap()
}

#[cfg(target_os = "linux")]
async fn closed_without_bytes(mut stream: TcpStream) -> bool {
    let mut received = Vec::new();
    match timeout(Duration::from_secs(5), stream.read_to_end(&mut received)).await {
        Ok(_) => received.is_empty(),
        Err(_) => false,
    }
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn foreign_peer_stops_the_server_by_default() {
    let session = Arc::new(ScriptedSession::new(vec![1; 16], false).with_track("ref", 2_000));
    let mut opts = options(1024);
    opts.foreign_peer_policy = ForeignPeerPolicy::Stop;
    let server = start(session.clone(), opts).await;
    let address = addr(&server);

    let foreign = connect_from_foreign(address).await;
    assert!(closed_without_bytes(foreign).await);

    let mut refused = false;
    for _ in 0..100 {
        if TcpStream::connect(address).await.is_err() {
            refused = true;
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert!(refused, "listener still accepting after a foreign peer");
    assert_eq!(session.streams.load(Ordering::SeqCst), 0);
    server.shutdown().await;
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn foreign_peer_is_skipped_when_configured() {
    let session = Arc::new(ScriptedSession::new(vec![1; 16], false).with_track("ref", 2_000));
    let mut opts = options(1024);
    opts.foreign_peer_policy = ForeignPeerPolicy::Skip;
    let server = start(session.clone(), opts).await;
    let token = server.lookup().insert("ref");

    let foreign = connect_from_foreign(addr(&server)).await;
    assert!(closed_without_bytes(foreign).await);

    let served = request(addr(&server), &format!("GET /sid/{token} HTTP/1.1\r\n\r\n")).await;
    let (header, body) = split_response(&served);
    assert!(header.starts_with("HTTP/1.1 200 OK"));
    assert_eq!(body.len(), 32_768);
    server.shutdown().await;
}
