//! Extension pour lire les paramètres de diffusion depuis pmoconfig
//!
//! Ce module fournit le trait `StreamConfigExt` qui construit un
//! [`StreamOptions`] à partir des clés `host.stream.*`, `host.encoder.*` et
//! `host.lookup.*`. Les clés absentes prennent les valeurs par défaut de
//! [`StreamOptions::default`].

use std::time::Duration;

use anyhow::Result;
use pmoconfig::Config;
use serde_yaml::Value;
use tracing::warn;

use crate::options::{ForeignPeerPolicy, StreamOptions};
use crate::transcoder::{EncoderOptions, lame_args};

const STREAM: &str = "stream";
const ENCODER: &str = "encoder";

/// Trait d'extension pour la configuration du serveur de diffusion
///
/// # Exemple
///
/// ```rust,ignore
/// use pmoconfig::get_config;
/// use pmostream::StreamConfigExt;
///
/// let options = get_config().get_stream_options();
/// println!("Streaming on port {}", options.port);
/// ```
pub trait StreamConfigExt {
    /// Construit les options du serveur depuis la configuration
    fn get_stream_options(&self) -> StreamOptions;

    /// Définit le port d'écoute
    fn set_stream_port(&self, port: u16) -> Result<()>;

    /// Définit le programme d'encodage (les arguments LAME sont conservés)
    fn set_encoder_program(&self, program: &str) -> Result<()>;
}

fn millis(config: &Config, section: &str, key: &str, default: Duration) -> Duration {
    Duration::from_millis(config.get_u64(&["host", section, key], default.as_millis() as u64))
}

fn count(config: &Config, key: &str, default: u32) -> u32 {
    u32::try_from(config.get_u64(&["host", STREAM, key], u64::from(default))).unwrap_or(default)
}

impl StreamConfigExt for Config {
    fn get_stream_options(&self) -> StreamOptions {
        let defaults = StreamOptions::default();

        let port = u16::try_from(self.get_u64(&["host", STREAM, "port"], u64::from(defaults.port)))
            .unwrap_or_else(|_| {
                warn!("Invalid host.stream.port, using {}", defaults.port);
                defaults.port
            });

        let public_host = match self.get_string(&["host", STREAM, "public_host"], &defaults.public_host) {
            host if host.eq_ignore_ascii_case("auto") => pmoutils::guess_local_ip(),
            host => host,
        };

        let policy_name = self.get_string(&["host", STREAM, "foreign_peer_policy"], "stop");
        let foreign_peer_policy = policy_name.parse().unwrap_or_else(|e| {
            warn!("{}, using 'stop'", e);
            ForeignPeerPolicy::Stop
        });

        let encoder_defaults = EncoderOptions::default();
        let bitrate_kbps = u32::try_from(self.get_u64(
            &["host", ENCODER, "bitrate_kbps"],
            u64::from(encoder_defaults.bitrate_kbps),
        ))
        .unwrap_or(encoder_defaults.bitrate_kbps);

        // Des arguments explicites remplacent ceux de LAME (encodeur alternatif)
        let args = match self.get_value(&["host", ENCODER, "args"]) {
            Ok(Value::Sequence(_)) => self.get_string_list(&["host", ENCODER, "args"]),
            _ => lame_args(bitrate_kbps),
        };

        let encoder = EncoderOptions::with_program(
            self.get_string(&["host", ENCODER, "program"], &encoder_defaults.program),
            args,
        )
        .with_bitrate(bitrate_kbps)
        .with_chunk_size(
            self.get_usize(&["host", ENCODER, "chunk_size"], encoder_defaults.chunk_size)
                .max(1),
        )
        .with_exit_grace(millis(self, ENCODER, "exit_grace_ms", encoder_defaults.exit_grace));

        StreamOptions {
            bind_address: self.get_string(&["host", STREAM, "bind_address"], &defaults.bind_address),
            port,
            public_host,
            base_path: self.get_string(&["host", STREAM, "base_path"], &defaults.base_path),
            send_timeout: millis(self, STREAM, "send_timeout_ms", defaults.send_timeout),
            receive_retry_limit: count(self, "receive_retry_limit", defaults.receive_retry_limit),
            receive_retry_delay: millis(self, STREAM, "receive_retry_delay_ms", defaults.receive_retry_delay),
            resolve_retry_limit: count(self, "resolve_retry_limit", defaults.resolve_retry_limit),
            resolve_retry_delay: millis(self, STREAM, "resolve_retry_delay_ms", defaults.resolve_retry_delay),
            stop_wait_times: count(self, "stop_wait_times", defaults.stop_wait_times),
            stop_wait_interval: millis(self, STREAM, "stop_wait_interval_ms", defaults.stop_wait_interval),
            foreign_peer_policy,
            allowed_agents: self.get_string_list(&["host", STREAM, "allowed_agents"]),
            max_entries: self.get_usize(&["host", "lookup", "max_entries"], defaults.max_entries),
            encoder,
        }
    }

    fn set_stream_port(&self, port: u16) -> Result<()> {
        self.set_u64(&["host", STREAM, "port"], u64::from(port))
    }

    fn set_encoder_program(&self, program: &str) -> Result<()> {
        self.set_string(&["host", ENCODER, "program"], program)
    }
}
