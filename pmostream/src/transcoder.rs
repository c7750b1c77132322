//! Pont vers le sous-processus d'encodage
//!
//! Le pont lance l'encodeur (LAME par défaut), lui transmet le PCM brut sur son
//! entrée standard et découpe sa sortie en morceaux de taille fixe publiés
//! dans une [`OutputQueue`]. La taille totale est ajustée à la longueur
//! annoncée au client : un manque est complété par des zéros, un excédent est
//! seulement signalé.
//!
//! Cycle de vie : `Starting → Running → Draining → Closed`.
//!
//! ```text
//! session ──PcmSink::write──▶ stdin [encodeur] stdout ──drain──▶ OutputQueue ──▶ handler
//!                                             stderr ──▶ tracing (debug)
//! ```

use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::chunk::{ChunkSender, OutputQueue, output_queue};
use crate::error::{Result, StreamError};

pub const DEFAULT_ENCODER: &str = "lame";
pub const DEFAULT_BITRATE_KBPS: u32 = 128;
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
pub const DEFAULT_EXIT_GRACE: Duration = Duration::from_secs(5);

/// Taille annoncée dans `Content-Length` pour une durée donnée
///
/// `floor(ms / 1000) * kbps / 8 * 1024`, en arithmétique entière et dans cet
/// ordre, pour rester compatible avec les clients existants.
pub fn expected_payload_size(duration_ms: u64, bitrate_kbps: u32) -> u64 {
    (duration_ms / 1000) * u64::from(bitrate_kbps) / 8 * 1024
}

/// Paramètres de lancement de l'encodeur
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderOptions {
    pub program: String,
    pub args: Vec<String>,
    pub bitrate_kbps: u32,
    pub chunk_size: usize,
    pub exit_grace: Duration,
}

impl EncoderOptions {
    /// LAME en débit constant, PCM brut sur stdin, MP3 sur stdout
    pub fn lame(bitrate_kbps: u32) -> Self {
        Self::with_program(DEFAULT_ENCODER, lame_args(bitrate_kbps)).with_bitrate(bitrate_kbps)
    }

    /// Encodeur arbitraire, les autres paramètres gardant leur valeur par défaut
    pub fn with_program(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            bitrate_kbps: DEFAULT_BITRATE_KBPS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            exit_grace: DEFAULT_EXIT_GRACE,
        }
    }

    pub fn with_bitrate(mut self, bitrate_kbps: u32) -> Self {
        self.bitrate_kbps = bitrate_kbps;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_exit_grace(mut self, grace: Duration) -> Self {
        self.exit_grace = grace;
        self
    }

    pub fn expected_payload_size(&self, duration_ms: u64) -> u64 {
        expected_payload_size(duration_ms, self.bitrate_kbps)
    }
}

impl Default for EncoderOptions {
    fn default() -> Self {
        Self::lame(DEFAULT_BITRATE_KBPS)
    }
}

/// Arguments LAME : entrée brute, CBR, stdin vers stdout
pub fn lame_args(bitrate_kbps: u32) -> Vec<String> {
    vec![
        "-r".to_string(),
        "--cbr".to_string(),
        "-b".to_string(),
        bitrate_kbps.to_string(),
        "-".to_string(),
        "-".to_string(),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Starting,
    Running,
    Draining,
    Closed,
}

struct BridgeInner {
    program: String,
    stdin: Mutex<Option<ChildStdin>>,
    child: Arc<Mutex<Option<Child>>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    state: StdMutex<BridgeState>,
    close_lock: Mutex<()>,
    stop_token: CancellationToken,
    grace: Duration,
}

impl BridgeInner {
    fn state(&self) -> BridgeState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn advance(&self, next: BridgeState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let allowed = matches!(
            (*state, next),
            (BridgeState::Starting, BridgeState::Running)
                | (BridgeState::Starting | BridgeState::Running, BridgeState::Draining)
                | (_, BridgeState::Closed)
        );
        if allowed {
            *state = next;
        }
    }

    async fn write(&self, pcm: &[u8]) -> Result<()> {
        if self.stop_token.is_cancelled() {
            return Err(StreamError::Cancelled);
        }

        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or_else(|| {
            StreamError::SubprocessFailure(format!("{} input already closed", self.program))
        })?;

        let io = async {
            stdin.write_all(pcm).await?;
            stdin.flush().await
        };

        tokio::select! {
            _ = self.stop_token.cancelled() => Err(StreamError::Cancelled),
            res = io => {
                res.map_err(|e| {
                    StreamError::SubprocessFailure(format!("write to {} failed: {e}", self.program))
                })?;
                self.advance(BridgeState::Running);
                Ok(())
            }
        }
    }

    async fn finish_input(&self) {
        if let Some(mut stdin) = self.stdin.lock().await.take() {
            if let Err(e) = stdin.shutdown().await {
                trace!("Closing {} input: {}", self.program, e);
            }
            self.advance(BridgeState::Draining);
            debug!(program = %self.program, "Encoder input closed");
        }
    }

    async fn close(&self) {
        let _closing = self.close_lock.lock().await;
        if self.state() == BridgeState::Closed {
            return;
        }

        // 1. la tâche de drainage s'arrête, les écritures en cours sont libérées
        self.stop_token.cancel();
        self.advance(BridgeState::Draining);

        // 2. fermeture de l'entrée
        self.stdin.lock().await.take();

        // 3. attente bornée de la fin naturelle, sinon kill
        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            match timeout(self.grace, child.wait()).await {
                Ok(Ok(status)) => debug!(program = %self.program, %status, "Encoder exited"),
                Ok(Err(e)) => warn!(program = %self.program, "Cannot wait for encoder: {}", e),
                Err(_) => {
                    warn!(
                        program = %self.program,
                        grace_ms = self.grace.as_millis() as u64,
                        "Encoder still running after grace period, killing it"
                    );
                    if let Err(e) = child.kill().await {
                        error!(program = %self.program, "Failed to kill encoder: {}", e);
                    }
                }
            }
        }

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for mut task in tasks {
            if timeout(self.grace, &mut task).await.is_err() {
                task.abort();
            }
        }

        self.advance(BridgeState::Closed);
        debug!(program = %self.program, "Transcode bridge closed");
    }
}

impl Drop for BridgeInner {
    fn drop(&mut self) {
        self.stop_token.cancel();
        let tasks = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

/// Encodeur en cours d'exécution pour une requête
///
/// Le processus est tué si le pont est abandonné sans [`TranscodeBridge::close`].
pub struct TranscodeBridge {
    inner: Arc<BridgeInner>,
}

impl TranscodeBridge {
    /// Lance l'encodeur et la tâche qui vide sa sortie
    ///
    /// Doit être appelé dans un runtime Tokio. Un échec de lancement est
    /// rapporté comme [`StreamError::SubprocessFailure`].
    pub fn spawn(options: &EncoderOptions, expected_size: u64) -> Result<(Self, OutputQueue)> {
        let mut child = Command::new(&options.program)
            .args(&options.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                StreamError::SubprocessFailure(format!("cannot launch {}: {e}", options.program))
            })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take().ok_or_else(|| {
            StreamError::SubprocessFailure(format!("{} has no output pipe", options.program))
        })?;
        let stderr = child.stderr.take();

        let child = Arc::new(Mutex::new(Some(child)));
        let stop_token = CancellationToken::new();
        let (sender, queue) = output_queue();

        let drain = OutputDrain {
            program: options.program.clone(),
            chunk_size: options.chunk_size.max(1),
            expected_size,
            grace: options.exit_grace,
            child: child.clone(),
            stop_token: stop_token.clone(),
        };

        let mut tasks = vec![tokio::spawn(drain.run(stdout, sender))];
        if let Some(stderr) = stderr {
            tasks.push(tokio::spawn(log_diagnostics(options.program.clone(), stderr)));
        }

        debug!(
            program = %options.program,
            args = ?options.args,
            expected_size,
            "Encoder started"
        );

        let inner = BridgeInner {
            program: options.program.clone(),
            stdin: Mutex::new(stdin),
            child,
            tasks: StdMutex::new(tasks),
            state: StdMutex::new(BridgeState::Starting),
            close_lock: Mutex::new(()),
            stop_token,
            grace: options.exit_grace,
        };

        Ok((
            Self {
                inner: Arc::new(inner),
            },
            queue,
        ))
    }

    /// Transmet du PCM brut à l'encodeur, avec flush
    pub async fn write(&self, pcm: &[u8]) -> Result<()> {
        self.inner.write(pcm).await
    }

    /// Ferme l'entrée : l'encodeur termine et la sortie se vide
    pub async fn finish_input(&self) {
        self.inner.finish_input().await
    }

    /// Arrête le pont : entrée fermée, attente bornée, kill si nécessaire
    ///
    /// Idempotent, utilisable depuis n'importe quelle tâche.
    pub async fn close(&self) {
        self.inner.close().await
    }

    /// Poignée d'écriture remise à la session
    pub fn sink(&self) -> PcmSink {
        PcmSink {
            bridge: Arc::downgrade(&self.inner),
        }
    }

    pub fn state(&self) -> BridgeState {
        self.inner.state()
    }
}

/// Entrée PCM d'un pont d'encodage, remise à la session
///
/// La poignée ne maintient pas le pont en vie : une fois la requête terminée,
/// toute écriture échoue avec [`StreamError::Cancelled`].
#[derive(Debug, Clone)]
pub struct PcmSink {
    bridge: Weak<BridgeInner>,
}

impl PcmSink {
    /// Écrit des échantillons PCM 16 bits little-endian, 44,1 kHz stéréo
    pub async fn write(&self, pcm: &[u8]) -> Result<()> {
        let bridge = self.bridge.upgrade().ok_or(StreamError::Cancelled)?;
        bridge.write(pcm).await
    }

    /// Signale la fin de la piste
    pub async fn finish(&self) {
        if let Some(bridge) = self.bridge.upgrade() {
            bridge.finish_input().await;
        }
    }

    /// Vrai si la requête a été arrêtée ou terminée
    pub fn is_closed(&self) -> bool {
        self.bridge
            .upgrade()
            .is_none_or(|bridge| bridge.stop_token.is_cancelled())
    }

    /// Se résout quand le pont est arrêté
    pub async fn closed(&self) {
        let token = match self.bridge.upgrade() {
            Some(bridge) => bridge.stop_token.clone(),
            None => return,
        };
        token.cancelled().await
    }
}

struct OutputDrain {
    program: String,
    chunk_size: usize,
    expected_size: u64,
    grace: Duration,
    child: Arc<Mutex<Option<Child>>>,
    stop_token: CancellationToken,
}

impl OutputDrain {
    async fn run(self, mut stdout: ChildStdout, sender: ChunkSender) {
        let mut buffer = vec![0u8; self.chunk_size];
        let mut filled = 0usize;
        let mut produced = 0u64;

        loop {
            let read = tokio::select! {
                biased;
                _ = self.stop_token.cancelled() => {
                    trace!(program = %self.program, produced, "Output drain stopped");
                    return;
                }
                read = stdout.read(&mut buffer[filled..]) => read,
            };

            match read {
                Ok(0) => break,
                Ok(n) => {
                    filled += n;
                    produced += n as u64;
                    if filled == buffer.len() {
                        let full = std::mem::replace(&mut buffer, vec![0u8; self.chunk_size]);
                        filled = 0;
                        if !sender.send(Bytes::from(full)) {
                            debug!(program = %self.program, "Output queue dropped, stopping drain");
                            return;
                        }
                    }
                }
                Err(e) => {
                    error!(program = %self.program, "Reading encoder output failed: {}", e);
                    return;
                }
            }
        }

        if filled > 0 {
            buffer.truncate(filled);
            sender.send(Bytes::from(buffer));
        }

        if let Err(reason) = self.check_exit().await {
            // pas de sentinelle : le consommateur verra la file se fermer
            error!(program = %self.program, produced, "{}", reason);
            return;
        }

        if produced < self.expected_size {
            let shortfall = self.expected_size - produced;
            debug!(
                program = %self.program,
                produced,
                expected = self.expected_size,
                "Padding encoder output with {} zero bytes",
                shortfall
            );
            sender.send(Bytes::from(vec![0u8; shortfall as usize]));
        } else if produced > self.expected_size {
            warn!(
                program = %self.program,
                produced,
                expected = self.expected_size,
                "Encoder produced more bytes than the declared length"
            );
        }

        sender.finish();
    }

    async fn check_exit(&self) -> std::result::Result<(), String> {
        let mut guard = self.child.lock().await;
        let Some(child) = guard.as_mut() else {
            return Ok(());
        };

        match timeout(self.grace, child.wait()).await {
            Ok(Ok(status)) if status.success() => Ok(()),
            Ok(Ok(status)) => Err(format!("{} exited abnormally: {status}", self.program)),
            Ok(Err(e)) => Err(format!("cannot wait for {}: {e}", self.program)),
            Err(_) => {
                warn!(program = %self.program, "Output closed but encoder still running");
                Ok(())
            }
        }
    }
}

async fn log_diagnostics(program: String, stderr: ChildStderr) {
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim();
                if !text.is_empty() {
                    debug!(target: "pmostream::encoder", program = %program, "{}", text);
                }
            }
            Err(e) => {
                trace!(program = %program, "Encoder diagnostics closed: {}", e);
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::chunk::AudioChunk;
    use std::time::Instant;

    fn cat(chunk_size: usize) -> EncoderOptions {
        EncoderOptions::with_program("cat", Vec::new()).with_chunk_size(chunk_size)
    }

    async fn collect(queue: &mut OutputQueue) -> (Vec<Bytes>, bool) {
        let mut chunks = Vec::new();
        while let Some(chunk) = queue.next().await {
            match chunk {
                AudioChunk::Data(bytes) => chunks.push(bytes),
                AudioChunk::EndOfStream => return (chunks, true),
            }
        }
        (chunks, false)
    }

    #[test]
    fn test_expected_payload_size() {
        assert_eq!(expected_payload_size(180_000, 128), 2_949_120);
        assert_eq!(expected_payload_size(1_999, 128), 16_384);
        assert_eq!(expected_payload_size(999, 128), 0);
        assert_eq!(EncoderOptions::lame(320).expected_payload_size(10_000), 409_600);
    }

    #[test]
    fn test_lame_arguments() {
        let options = EncoderOptions::lame(192);
        assert_eq!(options.program, "lame");
        assert_eq!(options.args, vec!["-r", "--cbr", "-b", "192", "-", "-"]);
        assert_eq!(options.bitrate_kbps, 192);
    }

    #[tokio::test]
    async fn test_output_is_chunked_and_padded() {
        let (bridge, mut queue) = TranscodeBridge::spawn(&cat(3), 10).unwrap();
        let sink = bridge.sink();

        sink.write(b"abcd").await.unwrap();
        sink.finish().await;
        assert_eq!(bridge.state(), BridgeState::Draining);

        let (chunks, ended) = collect(&mut queue).await;
        assert!(ended);
        assert_eq!(chunks[0], Bytes::from_static(b"abc"));
        assert_eq!(chunks[1], Bytes::from_static(b"d"));
        assert_eq!(chunks[2], Bytes::from(vec![0u8; 6]));
        assert_eq!(chunks.len(), 3);

        bridge.close().await;
        assert_eq!(bridge.state(), BridgeState::Closed);
    }

    #[tokio::test]
    async fn test_oversized_output_is_not_truncated() {
        let (bridge, mut queue) = TranscodeBridge::spawn(&cat(64), 2).unwrap();
        bridge.write(b"hello").await.unwrap();
        bridge.finish_input().await;

        let (chunks, ended) = collect(&mut queue).await;
        assert!(ended);
        assert_eq!(chunks, vec![Bytes::from_static(b"hello")]);
        bridge.close().await;
    }

    #[tokio::test]
    async fn test_launch_failure_is_subprocess_failure() {
        let options = EncoderOptions::with_program("/nonexistent/pmospot-encoder", Vec::new());
        let err = TranscodeBridge::spawn(&options, 0).err().unwrap();
        assert!(matches!(err, StreamError::SubprocessFailure(_)));
    }

    #[tokio::test]
    async fn test_abnormal_exit_has_no_end_of_stream() {
        let options =
            EncoderOptions::with_program("sh", vec!["-c".to_string(), "exit 3".to_string()]);
        let (bridge, mut queue) = TranscodeBridge::spawn(&options, 1024).unwrap();

        let (chunks, ended) = collect(&mut queue).await;
        assert!(!ended);
        assert!(chunks.is_empty());
        bridge.close().await;
    }

    #[tokio::test]
    async fn test_close_kills_stuck_encoder_and_is_idempotent() {
        let options = EncoderOptions::with_program("sleep", vec!["30".to_string()])
            .with_exit_grace(Duration::from_millis(100));
        let (bridge, _queue) = TranscodeBridge::spawn(&options, 0).unwrap();
        let sink = bridge.sink();

        let started = Instant::now();
        bridge.close().await;
        bridge.close().await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(bridge.state(), BridgeState::Closed);

        assert!(sink.is_closed());
        assert!(matches!(
            sink.write(b"late").await,
            Err(StreamError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_sink_outliving_bridge_is_closed() {
        let (bridge, _queue) = TranscodeBridge::spawn(&cat(16), 0).unwrap();
        let sink = bridge.sink();
        bridge.close().await;
        drop(bridge);

        assert!(sink.is_closed());
        sink.closed().await;
        assert!(matches!(sink.write(b"x").await, Err(StreamError::Cancelled)));
    }
}
