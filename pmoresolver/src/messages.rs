//! Messages échangés avec l'hôte

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Annonce envoyée une fois au démarrage
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Settings {
    #[serde(rename = "_msgtype")]
    pub msgtype: &'static str,
    pub name: String,
    pub weight: u32,
    pub targettime: u64,
    pub localonly: bool,
}

/// Requête de recherche (`_msgtype: "rq"`)
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Query {
    /// Identifiant de requête, renvoyé tel quel
    #[serde(default)]
    pub qid: Value,
    #[serde(default)]
    pub artist: String,
    #[serde(default)]
    pub track: String,
    #[serde(default)]
    pub album: Option<String>,
}

impl Query {
    /// Album non vide, s'il y en a un
    pub fn album(&self) -> Option<&str> {
        self.album.as_deref().filter(|album| !album.trim().is_empty())
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TrackResult {
    pub artist: String,
    pub track: String,
    pub album: String,
    pub mimetype: &'static str,
    pub source: String,
    pub url: String,
    /// Durée en secondes entières
    pub duration: u64,
    pub score: f64,
    pub bitrate: u32,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Results {
    #[serde(rename = "_msgtype")]
    pub msgtype: &'static str,
    pub qid: Value,
    pub results: Vec<TrackResult>,
}

impl Results {
    pub fn new(qid: Value, results: Vec<TrackResult>) -> Self {
        Self {
            msgtype: "results",
            qid,
            results,
        }
    }
}

/// Message entrant après classification
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Query(Query),
    /// Message vide, sans type ou de type inconnu : fin de la boucle
    Stop(String),
}

impl Incoming {
    pub fn parse(json: &str) -> Result<Self> {
        let trimmed = json.trim();
        if trimmed.is_empty() || trimmed == "{}" {
            return Ok(Incoming::Stop("empty message".to_string()));
        }

        let value: Value = serde_json::from_str(trimmed)?;
        match value.get("_msgtype").and_then(Value::as_str) {
            None | Some("") => Ok(Incoming::Stop("no message type".to_string())),
            Some("rq") => Ok(Incoming::Query(serde_json::from_value(value)?)),
            Some(other) => Ok(Incoming::Stop(format!("unexpected message type '{other}'"))),
        }
    }
}
