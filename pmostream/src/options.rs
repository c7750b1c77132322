//! Paramètres du serveur de diffusion

use std::str::FromStr;
use std::time::Duration;

use crate::lookup::DEFAULT_MAX_ENTRIES;
use crate::transcoder::EncoderOptions;

pub const DEFAULT_PORT: u16 = 60218;
pub const DEFAULT_BASE_PATH: &str = "/sid/";

/// Conduite à tenir face à une connexion qui ne vient pas de `127.0.0.1`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForeignPeerPolicy {
    /// Ferme la connexion et arrête la boucle d'acceptation
    #[default]
    Stop,
    /// Ferme la connexion et continue d'écouter
    Skip,
}

impl FromStr for ForeignPeerPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stop" => Ok(ForeignPeerPolicy::Stop),
            "skip" => Ok(ForeignPeerPolicy::Skip),
            other => Err(format!("unknown foreign peer policy '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub bind_address: String,
    pub port: u16,
    /// Hôte utilisé dans les URL publiées
    pub public_host: String,
    pub base_path: String,
    pub send_timeout: Duration,
    pub receive_retry_limit: u32,
    pub receive_retry_delay: Duration,
    pub resolve_retry_limit: u32,
    pub resolve_retry_delay: Duration,
    pub stop_wait_times: u32,
    pub stop_wait_interval: Duration,
    pub foreign_peer_policy: ForeignPeerPolicy,
    /// Produits `User-Agent` acceptés ; vide = tous
    pub allowed_agents: Vec<String>,
    pub max_entries: usize,
    pub encoder: EncoderOptions,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            public_host: "localhost".to_string(),
            base_path: DEFAULT_BASE_PATH.to_string(),
            send_timeout: Duration::from_millis(10_000),
            receive_retry_limit: 100,
            receive_retry_delay: Duration::from_millis(10),
            resolve_retry_limit: 10,
            resolve_retry_delay: Duration::from_millis(50),
            stop_wait_times: 6,
            stop_wait_interval: Duration::from_millis(500),
            foreign_peer_policy: ForeignPeerPolicy::Stop,
            allowed_agents: Vec::new(),
            max_entries: DEFAULT_MAX_ENTRIES,
            encoder: EncoderOptions::default(),
        }
    }
}

impl StreamOptions {
    /// Délai maximal accordé à une tâche pour s'arrêter d'elle-même
    pub fn stop_wait(&self) -> Duration {
        self.stop_wait_interval * self.stop_wait_times
    }

    /// Vrai si `agent` est accepté par la liste blanche
    ///
    /// Un client sans `User-Agent` n'est jamais refusé.
    pub fn accepts_agent(&self, agent: Option<&str>) -> bool {
        match agent {
            Some(agent) if !self.allowed_agents.is_empty() => self
                .allowed_agents
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(agent)),
            _ => true,
        }
    }
}
